//! Session pairing broker: issues capture tokens and drives their lifecycle.
//!
//! ```text
//! ISSUED ──connect──▶ CONNECTED ──complete/close──▶ CLOSED
//!    │                    │
//!    └──── now >= expires_at ────▶ EXPIRED
//! ```
//!
//! Expiry is checked lazily on every access and by [`SessionBroker::sweep`].
//! Every transition into a terminal state is published as a [`Retirement`].

use crate::clock::{Clock, SystemClock};
use crate::error::PairingError;
use crate::token::{CaptureToken, TokenState};
use chrono::{DateTime, Utc};
use rollcall_core::SessionContext;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};

const RETIREMENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy)]
pub struct BrokerConfig {
    pub token_ttl: Duration,
    /// How long terminal records linger before [`SessionBroker::sweep`] drops them.
    pub grace: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            token_ttl: Duration::from_secs(300),
            grace: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub expires_in: u64,
    pub pairing_code: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TokenStatus {
    pub valid: bool,
    pub expires_in: u64,
}

impl TokenStatus {
    const INVALID: TokenStatus = TokenStatus {
        valid: false,
        expires_in: 0,
    };
}

/// A token reached `Closed` or `Expired`.
#[derive(Debug, Clone, PartialEq)]
pub struct Retirement {
    pub token: String,
    pub session_id: String,
    pub state: TokenState,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub expired: usize,
    pub evicted: usize,
}

struct TokenRecord {
    session: Arc<SessionContext>,
    expires_at: DateTime<Utc>,
    state: TokenState,
    retired_at: Option<DateTime<Utc>>,
}

type Record = Arc<Mutex<TokenRecord>>;

pub struct SessionBroker {
    tokens: RwLock<HashMap<String, Record>>,
    clock: Arc<dyn Clock>,
    config: BrokerConfig,
    retirements: broadcast::Sender<Retirement>,
}

impl SessionBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: BrokerConfig, clock: Arc<dyn Clock>) -> Self {
        let (retirements, _) = broadcast::channel(RETIREMENT_CAPACITY);
        Self {
            tokens: RwLock::new(HashMap::new()),
            clock,
            config,
            retirements,
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Receive every future token retirement.
    pub fn subscribe(&self) -> broadcast::Receiver<Retirement> {
        self.retirements.subscribe()
    }

    /// Issue a fresh token bound to `session`.
    pub fn issue(&self, session: SessionContext) -> Result<IssuedToken, PairingError> {
        if session.class_id.trim().is_empty() {
            return Err(PairingError::InvalidSession("class identifier is empty".into()));
        }
        if session.session_id.trim().is_empty() {
            return Err(PairingError::InvalidSession("session identifier is empty".into()));
        }

        let now = self.clock.now();
        let expires_at = now + chrono::Duration::milliseconds(self.config.token_ttl.as_millis() as i64);
        let session_id = session.session_id.clone();
        let record = TokenRecord {
            session: Arc::new(session),
            expires_at,
            state: TokenState::Issued,
            retired_at: None,
        };

        let token = {
            let mut tokens = self.tokens.write().unwrap_or_else(|p| p.into_inner());
            let token = loop {
                let candidate = CaptureToken::generate();
                if !tokens.contains_key(candidate.as_str()) {
                    break candidate;
                }
                tracing::warn!("capture token collision; regenerating");
            };
            tokens.insert(token.to_string(), Arc::new(Mutex::new(record)));
            token
        };

        tracing::info!(session_id = %session_id, %expires_at, "capture token issued");
        Ok(IssuedToken {
            pairing_code: token.pairing_code(),
            token: token.into_string(),
            expires_at,
            expires_in: self.config.token_ttl.as_secs(),
        })
    }

    fn record(&self, token: &str) -> Option<Record> {
        self.tokens
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(token)
            .cloned()
    }

    fn retire(&self, token: &str, record: &mut TokenRecord, state: TokenState) {
        record.state = state;
        record.retired_at = Some(self.clock.now());
        tracing::info!(session_id = %record.session.session_id, ?state, "capture token retired");
        // No subscribers is fine.
        let _ = self.retirements.send(Retirement {
            token: token.to_string(),
            session_id: record.session.session_id.clone(),
            state,
        });
    }

    /// Apply lazy expiry. Returns true if the token just expired.
    fn refresh(&self, token: &str, record: &mut TokenRecord) -> bool {
        if record.state.is_live() && self.clock.now() >= record.expires_at {
            self.retire(token, record, TokenState::Expired);
            return true;
        }
        false
    }

    pub async fn validate(&self, token: &str) -> TokenStatus {
        let Some(record) = self.record(token) else {
            return TokenStatus::INVALID;
        };
        let mut record = record.lock().await;
        self.refresh(token, &mut record);
        if !record.state.is_live() {
            return TokenStatus::INVALID;
        }
        let remaining = (record.expires_at - self.clock.now()).num_seconds().max(0);
        TokenStatus {
            valid: true,
            expires_in: remaining as u64,
        }
    }

    /// [`validate`](Self::validate) under a caller deadline.
    pub async fn validate_within(&self, token: &str, timeout: Duration) -> Result<TokenStatus, PairingError> {
        tokio::time::timeout(timeout, self.validate(token))
            .await
            .map_err(|_| PairingError::Timeout(timeout))
    }

    /// Session bound to a live token.
    pub async fn resolve(&self, token: &str) -> Result<SessionContext, PairingError> {
        let record = self.record(token).ok_or(PairingError::TokenInvalid)?;
        let mut record = record.lock().await;
        self.refresh(token, &mut record);
        if !record.state.is_live() {
            return Err(PairingError::TokenInvalid);
        }
        Ok(record.session.as_ref().clone())
    }

    /// `Issued -> Connected`. Idempotent while connected.
    pub async fn connect(&self, token: &str) -> Result<Arc<SessionContext>, PairingError> {
        let record = self.record(token).ok_or(PairingError::TokenInvalid)?;
        let mut record = record.lock().await;
        self.refresh(token, &mut record);
        match record.state {
            TokenState::Issued => {
                record.state = TokenState::Connected;
                tracing::debug!(session_id = %record.session.session_id, "capture token connected");
                Ok(record.session.clone())
            }
            TokenState::Connected => Ok(record.session.clone()),
            TokenState::Closed | TokenState::Expired => Err(PairingError::TokenInvalid),
        }
    }

    /// Terminal use: the first frame was processed.
    pub async fn complete(&self, token: &str) -> Result<(), PairingError> {
        let record = self.record(token).ok_or(PairingError::TokenInvalid)?;
        let mut record = record.lock().await;
        self.refresh(token, &mut record);
        if !record.state.is_live() {
            return Err(PairingError::TokenInvalid);
        }
        self.retire(token, &mut record, TokenState::Closed);
        Ok(())
    }

    /// Close a token. Unknown and already terminal tokens are left alone.
    pub async fn close(&self, token: &str) {
        let Some(record) = self.record(token) else {
            return;
        };
        let mut record = record.lock().await;
        if self.refresh(token, &mut record) {
            return;
        }
        if record.state.is_live() {
            self.retire(token, &mut record, TokenState::Closed);
        }
    }

    /// Expire overdue tokens and drop terminal records past the grace period.
    pub async fn sweep(&self) -> SweepStats {
        let snapshot: Vec<(String, Record)> = self
            .tokens
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(t, r)| (t.clone(), r.clone()))
            .collect();

        let grace = chrono::Duration::milliseconds(self.config.grace.as_millis() as i64);
        let mut stats = SweepStats::default();
        let mut stale = Vec::new();
        for (token, record) in snapshot {
            let mut record = record.lock().await;
            if self.refresh(&token, &mut record) {
                stats.expired += 1;
            }
            if let Some(retired_at) = record.retired_at {
                if self.clock.now() - retired_at >= grace {
                    stale.push(token);
                }
            }
        }

        if !stale.is_empty() {
            let mut tokens = self.tokens.write().unwrap_or_else(|p| p.into_inner());
            for token in &stale {
                tokens.remove(token);
            }
            stats.evicted = stale.len();
        }
        if stats != SweepStats::default() {
            tracing::debug!(expired = stats.expired, evicted = stats.evicted, "token sweep");
        }
        stats
    }

    async fn live_records(&self) -> Vec<Arc<SessionContext>> {
        let snapshot: Vec<(String, Record)> = self
            .tokens
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .map(|(t, r)| (t.clone(), r.clone()))
            .collect();
        let mut live = Vec::new();
        for (token, record) in snapshot {
            let mut record = record.lock().await;
            self.refresh(&token, &mut record);
            if record.state.is_live() {
                live.push(record.session.clone());
            }
        }
        live
    }

    pub async fn live_tokens(&self) -> usize {
        self.live_records().await.len()
    }

    /// Whether any live token still refers to `session_id`.
    pub async fn has_live_session(&self, session_id: &str) -> bool {
        self.live_records()
            .await
            .iter()
            .any(|s| s.session_id == session_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::collections::HashSet;

    fn session(id: &str) -> SessionContext {
        SessionContext::new(id, "Algorithms", "GI-2", Some("2024-05-02"), None).unwrap()
    }

    fn broker() -> (Arc<SessionBroker>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        let broker = SessionBroker::with_clock(BrokerConfig::default(), clock.clone());
        (Arc::new(broker), clock)
    }

    #[tokio::test]
    async fn test_issue_then_validate() {
        let (broker, _) = broker();
        let issued = broker.issue(session("s1")).unwrap();
        assert_eq!(issued.expires_in, 300);
        assert_eq!(issued.pairing_code.len(), 6);

        let status = broker.validate(&issued.token).await;
        assert!(status.valid);
        assert_eq!(status.expires_in, 300);
        assert_eq!(broker.resolve(&issued.token).await.unwrap().session_id, "s1");
    }

    #[tokio::test]
    async fn test_issue_rejects_empty_class() {
        let (broker, _) = broker();
        let mut ctx = session("s1");
        ctx.class_id = String::new();
        assert!(matches!(broker.issue(ctx), Err(PairingError::InvalidSession(_))));
    }

    #[tokio::test]
    async fn test_expiry_after_ttl() {
        let (broker, clock) = broker();
        let mut retired = broker.subscribe();
        let issued = broker.issue(session("s1")).unwrap();

        clock.advance(Duration::from_secs(299));
        assert!(broker.validate(&issued.token).await.valid);

        clock.advance(Duration::from_secs(2));
        assert_eq!(broker.validate(&issued.token).await, TokenStatus::INVALID);
        assert_eq!(broker.resolve(&issued.token).await, Err(PairingError::TokenInvalid));
        assert_eq!(broker.connect(&issued.token).await.err(), Some(PairingError::TokenInvalid));

        let event = retired.recv().await.unwrap();
        assert_eq!(event.state, TokenState::Expired);
        assert_eq!(event.session_id, "s1");
    }

    #[tokio::test]
    async fn test_lifecycle_connect_complete() {
        let (broker, _) = broker();
        let issued = broker.issue(session("s1")).unwrap();
        broker.connect(&issued.token).await.unwrap();
        broker.connect(&issued.token).await.unwrap();
        broker.complete(&issued.token).await.unwrap();

        assert!(!broker.validate(&issued.token).await.valid);
        assert_eq!(broker.complete(&issued.token).await, Err(PairingError::TokenInvalid));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (broker, _) = broker();
        let mut retired = broker.subscribe();
        let issued = broker.issue(session("s1")).unwrap();

        broker.close(&issued.token).await;
        broker.close(&issued.token).await;
        broker.close("never-issued").await;

        assert!(!broker.validate(&issued.token).await.valid);
        assert_eq!(retired.recv().await.unwrap().state, TokenState::Closed);
        assert!(retired.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_concurrent_issue_is_unique() {
        let (broker, _) = broker();
        let mut handles = Vec::new();
        for i in 0..50 {
            let broker = broker.clone();
            handles.push(tokio::spawn(async move {
                broker.issue(session(&format!("s{i}"))).unwrap().token
            }));
        }
        let mut tokens = HashSet::new();
        for h in handles {
            tokens.insert(h.await.unwrap());
        }
        assert_eq!(tokens.len(), 50);
        assert_eq!(broker.live_tokens().await, 50);
    }

    #[tokio::test]
    async fn test_validate_within_times_out_on_held_lock() {
        let (broker, _) = broker();
        let issued = broker.issue(session("s1")).unwrap();
        let record = broker.record(&issued.token).unwrap();
        let _held = record.lock().await;

        let err = broker
            .validate_within(&issued.token, Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(err, PairingError::Timeout(Duration::from_millis(20)));
    }

    #[tokio::test]
    async fn test_sweep_expires_then_evicts_after_grace() {
        let (broker, clock) = broker();
        let issued = broker.issue(session("s1")).unwrap();
        let kept = broker.issue(session("s2")).unwrap();
        broker.connect(&kept.token).await.unwrap();

        clock.advance(Duration::from_secs(301));
        let stats = broker.sweep().await;
        assert_eq!(stats.expired, 2);
        assert_eq!(stats.evicted, 0);

        clock.advance(Duration::from_secs(60));
        let stats = broker.sweep().await;
        assert_eq!(stats.evicted, 2);
        assert!(broker.record(&issued.token).is_none());
    }

    #[tokio::test]
    async fn test_has_live_session() {
        let (broker, _) = broker();
        let a = broker.issue(session("s1")).unwrap();
        let b = broker.issue(session("s1")).unwrap();

        broker.close(&a.token).await;
        assert!(broker.has_live_session("s1").await);
        broker.close(&b.token).await;
        assert!(!broker.has_live_session("s1").await);
    }
}
