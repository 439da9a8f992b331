//! avail-core: shared foundation for the cluster availability manager.
//!
//! # Architecture
//!
//! Everything in the daemon above this crate is a set of state machines
//! driven from a single engine task. This crate supplies the pieces those
//! machines share:
//!
//! - closed state/status/event enums with canonical text names
//! - the `AvailError` taxonomy (not-found, no-msg, not-implemented, failed)
//! - the TOML configuration and provisioning lists
//! - a generation-tagged [`Arena`] that backs bounded tables
//! - a [`TimerRegistry`] whose ids can never fire after being disarmed
//! - [`Observers`] callback lists with explicit deregistration
//! - the [`WorkerThread`] for slow calls that must not block the engine
//! - an [`AlarmManager`] publishing X.733-style records to a sink

pub mod alarm;
pub mod arena;
pub mod config;
pub mod error;
pub mod observer;
pub mod timer;
pub mod types;
pub mod worker;

pub use alarm::{Alarm, AlarmId, AlarmManager, AlarmSink, TracingAlarmSink};
pub use arena::{Arena, Key};
pub use config::AvailConfig;
pub use error::{log_not_implemented, AvailError, AvailResult, ErrorKind};
pub use observer::{ObserverId, Observers};
pub use timer::{TimerId, TimerRegistry};
pub use types::*;
pub use worker::WorkerThread;
