use crate::relay::Side;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PairingError {
    #[error("invalid session: {0}")]
    InvalidSession(String),
    #[error("capture token is unknown, expired or closed")]
    TokenInvalid,
    #[error("{side} side of the relay channel is already bound")]
    ChannelAlreadyBound { side: Side },
    #[error("relay channel closed")]
    ChannelClosed,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}
