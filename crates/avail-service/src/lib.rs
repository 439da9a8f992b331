//! avail-service: services, service groups and the plugins that drive them.
//!
//! # Architecture
//!
//! - [`service_fsm`]: one state machine per service. Actions run as child
//!   processes through a [`ProcessLauncher`]; their exit codes come back as
//!   result events with retry budgets and a fatal-failure debounce.
//! - [`group_fsm`]: one state machine per service group. It aggregates member
//!   status, condition and health, and runs the group notification script.
//! - [`engine`]: the [`ServiceEngine`] work queue that couples the two.
//!
//! Neither FSM owns its tables or timers. Every call receives a
//! [`ServiceContext`] borrowed from the daemon's engine, so the whole crate is
//! synchronous and deterministic under a manual clock.

pub mod context;
pub mod engine;
pub mod group_fsm;
pub mod process;
pub mod service_fsm;

pub use context::{ServiceContext, ServiceSettings, ServiceTimer};
pub use engine::ServiceEngine;
pub use group_fsm::{GroupChange, GroupFsm, GroupOutcome};
pub use process::{
    classify_exit, ProcessLauncher, ProcessSpec, RecordingLauncher, EXIT_FORCE_SUCCESS, EXIT_PLUGIN_FAILURE,
    EXIT_PLUGIN_TIMEOUT, EXIT_PROCESS_FAILED,
};
pub use service_fsm::{ServiceChange, ServiceFsm};
