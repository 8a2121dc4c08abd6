//! rollcall-pairing: Hands a live capture session from the proctor view to a
//! mobile camera through short-lived capture tokens and a relay channel.

pub mod broker;
pub mod clock;
pub mod error;
pub mod relay;
pub mod token;

pub use broker::{BrokerConfig, IssuedToken, Retirement, SessionBroker, SweepStats, TokenStatus};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::PairingError;
pub use relay::{ChannelCloser, ChannelHandle, RelayHub, RelayMessage, Side};
pub use token::{pairing_code, CaptureToken, TokenState};
