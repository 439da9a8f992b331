//! avail-state: entity tables for the availability manager.
//!
//! Backed by [redb](https://docs.rs/redb), provides the in-memory tables
//! (nodes, services, service groups, domains, neighbors, assignments and
//! interfaces) that every state machine reads and writes.
//!
//! # Architecture
//!
//! All rows are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{domain}/{node}/{group}`) keep related rows adjacent.
//!
//! [`Tables`] is owned by the engine task and writes through to the
//! `StateStore` on each mutation. The `StateStore` is `Clone` + `Send` +
//! `Sync` (backed by `Arc<Database>`).

pub mod error;
pub mod provision;
pub mod store;
pub mod table;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use table::{Table, Tables};
pub use types::*;
