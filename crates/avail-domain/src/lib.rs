//! avail-domain: service domains: who leads, who knows what, who runs what.
//!
//! # Architecture
//!
//! - [`election`]: per-domain leader election over domain hellos.
//! - [`neighbor`]: per-neighbor exchange FSM that synchronises assignment
//!   tables and keeps them in sync with member updates once full.
//! - [`scheduler`]: the leader's active/standby selection pass.
//! - [`node`]: node records, SET_NODE commands and peer node updates.
//! - [`engine`]: the [`DomainEngine`] that routes messages and timers to
//!   the above.
//!
//! Like the service layer, nothing here owns tables or timers. Each call
//! gets a [`DomainContext`] and leaves outbound messages and local group
//! requests in its [`DomainOutput`].

pub mod context;
pub mod election;
pub mod engine;
pub mod neighbor;
pub mod node;
pub mod scheduler;

pub use context::{DomainContext, DomainOutput, DomainSettings, DomainTimer, GroupRequest, Outbound};
pub use election::{DomainChange, DomainFsm};
pub use engine::{DomainEngine, LocalGroupState};
pub use neighbor::{is_exchange_master, ExchangeSide, NeighborFsm};
pub use node::{node_schedule_state, NodeApi, NodeChange};
pub use scheduler::{should_schedule, FilterCounts, Scheduler, ACTION_FLAG_RECOVER};
