//! avail-msg: what travels between controllers and into the daemon.
//!
//! # Architecture
//!
//! - [`message`]: the binary node/service-domain protocol with an explicit
//!   big-endian codec and HMAC-SHA512 authentication
//! - [`session`]: per-peer sequence sessions (strictly increasing, bounded
//!   gap, re-established only by a hello)
//! - [`heartbeat`]: the small alive messages sent every interval
//! - [`control`]: the comma-delimited control and notify socket protocols
//! - [`stats`]: counters for everything received, sent or dropped
//!
//! Nothing in this crate touches a socket; transports live in the daemon.

mod codec;
pub mod control;
pub mod error;
pub mod heartbeat;
pub mod message;
pub mod session;
pub mod stats;

pub use control::{ControlRequest, NotifyEvent, SetNode, SyncEvent};
pub use error::{MsgError, MsgResult};
pub use heartbeat::{HeartbeatMsg, HeartbeatPayload};
pub use message::{decode, encode, parse_auth_key, Envelope, MsgType, Payload};
pub use session::{PeerSessions, SeqVerdict};
pub use stats::MsgStats;
