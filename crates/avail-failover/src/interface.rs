//! Per-interface health with a settle window.
//!
//! A new state is trusted only once it has held for the settle time, so
//! an interface flapping faster than that keeps reporting its last settled
//! fault. Degradations are trusted immediately.

use std::time::{Duration, Instant};

use avail_core::{FailoverInterfaceState, InterfaceKind};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{FailoverError, FailoverResult};

pub const INTERFACE_SETTLE: Duration = Duration::from_millis(2000);

/// Communication-fault bit flags. The lower three bits double as the
/// heartbeat `if_state` bitmap.
pub mod comm_fault {
    pub const CLUSTER_HOST_DOWN: u32 = 0x1;
    pub const MGMT_DOWN: u32 = 0x2;
    pub const OAM_DOWN: u32 = 0x4;
    pub const HEARTBEAT_ALIVE: u32 = 0x8;
    pub const HELLO_MSG_ALIVE: u32 = 0x10;
    pub const PEER_DISABLED: u32 = 0x4000;
    pub const INTERFACE_MASK: u32 = CLUSTER_HOST_DOWN | MGMT_DOWN | OAM_DOWN;
}

pub fn down_flag(kind: InterfaceKind) -> u32 {
    match kind {
        InterfaceKind::ClusterHost => comm_fault::CLUSTER_HOST_DOWN,
        InterfaceKind::Mgmt => comm_fault::MGMT_DOWN,
        InterfaceKind::Oam => comm_fault::OAM_DOWN,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailoverInterface {
    pub kind: InterfaceKind,
    pub state: FailoverInterfaceState,
    #[serde(skip)]
    pub changed_at: Option<Instant>,
    pub prior: FailoverInterfaceState,
}

impl FailoverInterface {
    pub fn new(kind: InterfaceKind) -> Self {
        Self {
            kind,
            state: FailoverInterfaceState::Unknown,
            changed_at: None,
            prior: FailoverInterfaceState::Unknown,
        }
    }

    /// Returns whether the state actually changed.
    pub fn set_state(&mut self, state: FailoverInterfaceState, now: Instant) -> bool {
        if self.state == state {
            return false;
        }
        info!(interface = %self.kind, from = %self.state, to = %state, "failover interface state change");
        self.prior = self.state;
        self.state = state;
        self.changed_at = Some(now);
        true
    }

    pub fn state_in_transition(&self, now: Instant, settle: Duration) -> bool {
        self.changed_at
            .is_some_and(|at| now.saturating_duration_since(at) < settle)
    }

    pub fn settled_state(&self, now: Instant, settle: Duration) -> FailoverInterfaceState {
        let in_transition = self.state_in_transition(now, settle);
        if in_transition && self.state.badness() < self.prior.badness() {
            return self.prior;
        }
        if !in_transition && self.state == FailoverInterfaceState::Recovering {
            return FailoverInterfaceState::MissingHeartbeat;
        }
        self.state
    }
}

/// The monitored interfaces of the local node.
#[derive(Debug, Clone)]
pub struct InterfaceSet {
    interfaces: Vec<FailoverInterface>,
    settle: Duration,
}

impl InterfaceSet {
    pub fn new(kinds: &[InterfaceKind], settle: Duration) -> Self {
        let mut interfaces: Vec<FailoverInterface> = Vec::new();
        for kind in kinds {
            if !interfaces.iter().any(|i| i.kind == *kind) {
                interfaces.push(FailoverInterface::new(*kind));
            }
        }
        Self { interfaces, settle }
    }

    pub fn is_monitored(&self, kind: InterfaceKind) -> bool {
        self.interfaces.iter().any(|i| i.kind == kind)
    }

    pub fn get(&self, kind: InterfaceKind) -> Option<&FailoverInterface> {
        self.interfaces.iter().find(|i| i.kind == kind)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FailoverInterface> {
        self.interfaces.iter()
    }

    fn get_mut(&mut self, kind: InterfaceKind) -> FailoverResult<&mut FailoverInterface> {
        self.interfaces
            .iter_mut()
            .find(|i| i.kind == kind)
            .ok_or_else(|| FailoverError::UnknownInterface(kind.to_string()))
    }

    /// Link up starts recovery; only a heartbeat confirms it.
    pub fn link_up(&mut self, kind: InterfaceKind, now: Instant) -> FailoverResult<bool> {
        let iface = self.get_mut(kind)?;
        if iface.state == FailoverInterfaceState::Ok {
            return Ok(false);
        }
        Ok(iface.set_state(FailoverInterfaceState::Recovering, now))
    }

    pub fn link_down(&mut self, kind: InterfaceKind, now: Instant) -> FailoverResult<bool> {
        Ok(self.get_mut(kind)?.set_state(FailoverInterfaceState::Down, now))
    }

    pub fn heartbeat_seen(&mut self, kind: InterfaceKind, now: Instant) -> FailoverResult<bool> {
        let iface = self.get_mut(kind)?;
        if iface.state == FailoverInterfaceState::Down {
            debug!(interface = %kind, "heartbeat on a down interface ignored");
            return Ok(false);
        }
        Ok(iface.set_state(FailoverInterfaceState::Ok, now))
    }

    pub fn heartbeat_missing(&mut self, kind: InterfaceKind, now: Instant) -> FailoverResult<bool> {
        let iface = self.get_mut(kind)?;
        if iface.state != FailoverInterfaceState::Ok {
            return Ok(false);
        }
        Ok(iface.set_state(FailoverInterfaceState::MissingHeartbeat, now))
    }

    /// Interface fault bits computed from settled states.
    pub fn fault_flags(&self, now: Instant) -> u32 {
        self.interfaces
            .iter()
            .filter(|i| i.settled_state(now, self.settle).is_fault())
            .fold(0, |flags, i| flags | down_flag(i.kind))
    }

    /// Whether every monitored interface among `kinds` has a settled link
    /// that is up, heartbeat or not.
    pub fn links_up(&self, kinds: &[InterfaceKind], now: Instant) -> bool {
        kinds
            .iter()
            .filter_map(|k| self.get(*k))
            .all(|i| {
                !matches!(
                    i.settled_state(now, self.settle),
                    FailoverInterfaceState::Down | FailoverInterfaceState::Unknown
                )
            })
    }

    pub fn any_in_transition(&self, now: Instant) -> bool {
        self.interfaces
            .iter()
            .any(|i| i.state_in_transition(now, self.settle))
    }
}
