//! What the domain state machines are handed on every call, and what they
//! hand back.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use avail_core::{AvailConfig, GroupAction, TimerRegistry};
use avail_msg::Payload;
use avail_state::Tables;

/// Minimum spacing between EXCHANGE_START resends to one neighbor.
pub const MIN_EXCHANGE_START_INTERVAL: Duration = Duration::from_millis(100);

/// Node hello period.
pub const NODE_HELLO_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainTimer {
    Hello(String),
    Wait(String),
    Dead { domain: String, node: String },
    Exchange { domain: String, node: String },
    Scheduler,
    NodeHello,
}

#[derive(Debug, Clone)]
pub struct DomainSettings {
    pub local_node: String,
    /// A peer controller is provisioned. Without one every domain is
    /// scheduled locally regardless of election state.
    pub has_peer: bool,
    pub scheduler_interval: Duration,
    pub min_exchange_start_interval: Duration,
}

impl DomainSettings {
    pub fn new(local_node: impl Into<String>) -> Self {
        Self {
            local_node: local_node.into(),
            has_peer: true,
            scheduler_interval: Duration::from_millis(3000),
            min_exchange_start_interval: MIN_EXCHANGE_START_INTERVAL,
        }
    }

    pub fn from_config(config: &AvailConfig) -> Self {
        Self {
            local_node: config.node.name.clone(),
            has_peer: config.node.peer.is_some(),
            scheduler_interval: config.timers.scheduler_interval(),
            min_exchange_start_interval: MIN_EXCHANGE_START_INTERVAL,
        }
    }
}

/// A message to send. `to: None` goes to every peer on the domain's
/// interfaces.
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: Option<String>,
    pub payload: Payload,
}

/// A scheduler or peer request for a group hosted on this node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupRequest {
    pub domain: String,
    pub group: String,
    pub action: GroupAction,
}

#[derive(Debug, Default)]
pub struct DomainOutput {
    pub messages: Vec<Outbound>,
    pub group_requests: Vec<GroupRequest>,
}

impl DomainOutput {
    pub fn send(&mut self, to: Option<&str>, payload: Payload) {
        self.messages.push(Outbound {
            to: to.map(str::to_string),
            payload,
        });
    }

    pub fn take(&mut self) -> DomainOutput {
        std::mem::take(self)
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.group_requests.is_empty()
    }
}

pub struct DomainContext<'a, T> {
    pub tables: &'a mut Tables,
    pub timers: &'a mut TimerRegistry<T>,
    pub settings: &'a DomainSettings,
    pub out: &'a mut DomainOutput,
}

impl<'a, T> DomainContext<'a, T> {
    pub fn new(
        tables: &'a mut Tables,
        timers: &'a mut TimerRegistry<T>,
        settings: &'a DomainSettings,
        out: &'a mut DomainOutput,
    ) -> Self {
        Self {
            tables,
            timers,
            settings,
            out,
        }
    }
}

/// Wall-clock milliseconds, recorded on assignment state changes.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
