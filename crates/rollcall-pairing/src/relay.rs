//! Realtime relay channel between the proctor view and the mobile camera.
//!
//! One link per capture token, with at most one endpoint per side. Each
//! endpoint owns an unbounded inbox, so messages arrive in send order. A
//! send with no peer attached is dropped and reported as undelivered.

use crate::broker::{Retirement, SessionBroker};
use crate::error::PairingError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Proctor,
    Mobile,
}

impl Side {
    pub fn peer(self) -> Side {
        match self {
            Side::Proctor => Side::Mobile,
            Side::Mobile => Side::Proctor,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Proctor => f.write_str("proctor"),
            Side::Mobile => f.write_str("mobile"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Opened,
    Frame(Vec<u8>),
    Error(String),
    Closed,
}

struct Endpoint {
    id: u64,
    inbox: mpsc::UnboundedSender<RelayMessage>,
}

#[derive(Default)]
struct Link {
    proctor: Option<Endpoint>,
    mobile: Option<Endpoint>,
}

impl Link {
    fn side(&self, side: Side) -> &Option<Endpoint> {
        match side {
            Side::Proctor => &self.proctor,
            Side::Mobile => &self.mobile,
        }
    }

    fn side_mut(&mut self, side: Side) -> &mut Option<Endpoint> {
        match side {
            Side::Proctor => &mut self.proctor,
            Side::Mobile => &mut self.mobile,
        }
    }

    fn owns(&self, side: Side, id: u64) -> bool {
        self.side(side).as_ref().is_some_and(|e| e.id == id)
    }

    fn deliver(&self, to: Side, message: RelayMessage) -> bool {
        self.side(to)
            .as_ref()
            .is_some_and(|e| e.inbox.send(message).is_ok())
    }

    fn shut(self) {
        for endpoint in [self.proctor, self.mobile].into_iter().flatten() {
            let _ = endpoint.inbox.send(RelayMessage::Closed);
        }
    }
}

pub struct RelayHub {
    broker: Arc<SessionBroker>,
    links: Mutex<HashMap<String, Link>>,
    next_id: AtomicU64,
}

impl RelayHub {
    /// Create the hub and start releasing links of retired tokens.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(broker: Arc<SessionBroker>) -> Arc<Self> {
        let retirements = broker.subscribe();
        let hub = Arc::new(Self {
            broker,
            links: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        tokio::spawn(watch_retirements(Arc::downgrade(&hub), retirements));
        hub
    }

    fn links(&self) -> std::sync::MutexGuard<'_, HashMap<String, Link>> {
        self.links.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Bind one side of the token's link.
    pub async fn open(self: &Arc<Self>, token: &str, side: Side) -> Result<ChannelHandle, PairingError> {
        self.broker.connect(token).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut links = self.links();
            let link = links.entry(token.to_string()).or_default();
            if link.side(side).is_some() {
                return Err(PairingError::ChannelAlreadyBound { side });
            }
            let _ = tx.send(RelayMessage::Opened);
            link.deliver(side.peer(), RelayMessage::Opened);
            *link.side_mut(side) = Some(Endpoint { id, inbox: tx });
        }
        tracing::debug!(%side, "relay endpoint opened");

        // The token may have retired between connect and bind.
        if !self.broker.validate(token).await.valid {
            self.release(token);
        }

        Ok(ChannelHandle {
            closer: ChannelCloser {
                hub: self.clone(),
                token: token.to_string(),
                side,
                id,
            },
            inbox: rx,
            finished: false,
        })
    }

    /// Tear down the token's link; both sides receive `Closed`.
    pub fn release(&self, token: &str) -> bool {
        let link = self.links().remove(token);
        match link {
            Some(link) => {
                link.shut();
                tracing::debug!("relay link released");
                true
            }
            None => false,
        }
    }

    /// Deliver a frame to the proctor side as if the mobile side sent it.
    ///
    /// Used by the upload path when the camera has no socket of its own.
    pub async fn relay_frame(&self, token: &str, frame: Vec<u8>) -> Result<bool, PairingError> {
        if let Err(err) = self.broker.connect(token).await {
            self.release(token);
            return Err(err);
        }
        let delivered = self
            .links()
            .get(token)
            .is_some_and(|link| link.deliver(Side::Proctor, RelayMessage::Frame(frame)));
        if delivered {
            self.finish(token).await;
        }
        Ok(delivered)
    }

    async fn finish(&self, token: &str) {
        if let Err(err) = self.broker.complete(token).await {
            tracing::debug!(error = %err, "token retired before frame completion");
        }
        self.release(token);
    }

    /// Refuse relay traffic once the token is no longer live.
    async fn ensure_live(&self, token: &str) -> Result<(), PairingError> {
        if self.broker.validate(token).await.valid {
            return Ok(());
        }
        self.release(token);
        Err(PairingError::TokenInvalid)
    }

    fn send_from(&self, token: &str, side: Side, id: u64, message: RelayMessage) -> Result<bool, PairingError> {
        let links = self.links();
        match links.get(token) {
            Some(link) if link.owns(side, id) => Ok(link.deliver(side.peer(), message)),
            _ => Err(PairingError::ChannelClosed),
        }
    }

    fn close_endpoint(&self, token: &str, side: Side, id: u64) {
        let link = {
            let mut links = self.links();
            match links.get(token) {
                Some(link) if link.owns(side, id) => links.remove(token),
                _ => None,
            }
        };
        if let Some(link) = link {
            link.shut();
            tracing::debug!(%side, "relay endpoint closed");
        }
    }

    pub fn link_count(&self) -> usize {
        self.links().len()
    }

    async fn prune(&self) {
        let tokens: Vec<String> = self.links().keys().cloned().collect();
        for token in tokens {
            if !self.broker.validate(&token).await.valid {
                self.release(&token);
            }
        }
    }
}

async fn watch_retirements(hub: Weak<RelayHub>, mut retirements: broadcast::Receiver<Retirement>) {
    loop {
        let event = retirements.recv().await;
        let Some(relay) = hub.upgrade() else { break };
        match event {
            Ok(retired) => {
                relay.release(&retired.token);
            }
            Err(RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "relay fell behind on token retirements; pruning links");
                relay.prune().await;
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Closes a relay endpoint from another task.
#[derive(Clone)]
pub struct ChannelCloser {
    hub: Arc<RelayHub>,
    token: String,
    side: Side,
    id: u64,
}

impl ChannelCloser {
    pub fn close(&self) {
        self.hub.close_endpoint(&self.token, self.side, self.id);
    }
}

/// One side of a relay link. Dropping it closes the link.
pub struct ChannelHandle {
    closer: ChannelCloser,
    inbox: mpsc::UnboundedReceiver<RelayMessage>,
    finished: bool,
}

impl ChannelHandle {
    pub fn side(&self) -> Side {
        self.closer.side
    }

    pub fn token(&self) -> &str {
        &self.closer.token
    }

    pub fn closer(&self) -> ChannelCloser {
        self.closer.clone()
    }

    /// Send to the peer. `Ok(false)` means no peer was attached and the
    /// message was dropped.
    ///
    /// A frame delivered from the mobile side completes the token and
    /// releases the link. Fails with `TokenInvalid` once the token has
    /// expired or been closed.
    pub async fn send(&self, message: RelayMessage) -> Result<bool, PairingError> {
        let ChannelCloser { hub, token, side, id } = &self.closer;
        hub.ensure_live(token).await?;
        let completes = *side == Side::Mobile && matches!(message, RelayMessage::Frame(_));
        let delivered = hub.send_from(token, *side, *id, message)?;
        if delivered && completes {
            hub.finish(token).await;
        }
        Ok(delivered)
    }

    /// Next message from the peer or the hub. Yields `Closed` once, then
    /// `None` forever.
    pub async fn recv(&mut self) -> Option<RelayMessage> {
        if self.finished {
            return None;
        }
        let message = self.inbox.recv().await.unwrap_or(RelayMessage::Closed);
        if message == RelayMessage::Closed {
            self.finished = true;
        }
        Some(message)
    }

    pub fn close(&self) {
        self.closer.close();
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.closer.close();
    }
}
