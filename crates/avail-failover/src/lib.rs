//! avail-failover: controller failover for duplex systems.
//!
//! # Architecture
//!
//! ```text
//!  link up/down ──▶ InterfaceSet ──┐
//!                  (settle window)  │ fault flags
//!  heartbeats ───▶ HeartbeatTracker ┼──────────────▶ FailoverFsm ──▶ FailoverAction
//!                  (missing/lost)   │   snapshot      │
//!  timers ──────────────────────────┘                 └─ get_survivor()
//! ```
//!
//! [`FailoverEngine`] owns the three pieces and turns every input into zero
//! or more [`FailoverAction`]s. Nothing in this crate performs I/O except
//! the [`FileMarker`], so the whole decision path runs against a virtual
//! clock in tests.

pub mod engine;
pub mod error;
pub mod fsm;
pub mod heartbeat;
pub mod interface;
pub mod marker;
pub mod survivor;

pub use engine::FailoverEngine;
pub use error::{FailoverError, FailoverResult};
pub use fsm::{
    FailoverAction, FailoverContext, FailoverFsm, FailoverSettings, FailoverTimer, Snapshot,
    CLUSTER_INFO_QUERY_LEAD,
};
pub use heartbeat::{HeartbeatEvent, HeartbeatTracker};
pub use interface::{comm_fault, down_flag, FailoverInterface, InterfaceSet, INTERFACE_SETTLE};
pub use marker::{FileMarker, MemoryMarker, StayFailedMarker};
pub use survivor::{get_survivor, health_score, HeartbeatState, NodeStatus, SystemFailoverStatus, SystemStatus};
