//! Peer heartbeat bookkeeping, one link per monitored interface.

use std::time::{Duration, Instant};

use avail_core::InterfaceKind;
use serde::Serialize;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HeartbeatEvent {
    /// First alive ever received from the peer.
    Enabled,
    InterfaceAlive(InterfaceKind),
    InterfaceMissing(InterfaceKind),
    /// Every link is missing.
    Lost,
    /// An alive arrived after a loss.
    Restored,
}

#[derive(Debug, Clone)]
struct PeerLink {
    kind: InterfaceKind,
    last_alive: Option<Instant>,
    peer_if_state: u32,
    missing: bool,
}

#[derive(Debug, Clone)]
pub struct HeartbeatTracker {
    links: Vec<PeerLink>,
    interval: Duration,
    missing_threshold: u32,
    enabled: bool,
    lost: bool,
}

impl HeartbeatTracker {
    pub fn new(kinds: &[InterfaceKind], interval: Duration, missing_threshold: u32) -> Self {
        Self {
            links: kinds
                .iter()
                .map(|&kind| PeerLink {
                    kind,
                    last_alive: None,
                    peer_if_state: 0,
                    missing: true,
                })
                .collect(),
            interval,
            missing_threshold: missing_threshold.max(1),
            enabled: false,
            lost: false,
        }
    }

    fn missing_after(&self) -> Duration {
        self.interval * self.missing_threshold
    }

    pub fn alive_received(&mut self, kind: InterfaceKind, peer_if_state: u32, now: Instant) -> Vec<HeartbeatEvent> {
        let mut events = Vec::new();
        let Some(link) = self.links.iter_mut().find(|l| l.kind == kind) else {
            debug!(interface = %kind, "heartbeat on unmonitored interface");
            return events;
        };
        link.last_alive = Some(now);
        link.peer_if_state = peer_if_state;
        if link.missing {
            link.missing = false;
            events.push(HeartbeatEvent::InterfaceAlive(kind));
        }
        if !self.enabled {
            self.enabled = true;
            info!(interface = %kind, "peer heartbeat enabled");
            events.push(HeartbeatEvent::Enabled);
        } else if self.lost {
            self.lost = false;
            info!(interface = %kind, "peer heartbeat restored");
            events.push(HeartbeatEvent::Restored);
        }
        events
    }

    /// Periodic check for links that went quiet.
    pub fn check(&mut self, now: Instant) -> Vec<HeartbeatEvent> {
        let mut events = Vec::new();
        if !self.enabled {
            return events;
        }
        let window = self.missing_after();
        for link in &mut self.links {
            let quiet = link
                .last_alive
                .is_none_or(|at| now.saturating_duration_since(at) >= window);
            if quiet && !link.missing {
                link.missing = true;
                warn!(interface = %link.kind, "peer heartbeat missing");
                events.push(HeartbeatEvent::InterfaceMissing(link.kind));
            }
        }
        if !self.lost && self.links.iter().all(|l| l.missing) {
            self.lost = true;
            warn!("peer heartbeat lost on every interface");
            events.push(HeartbeatEvent::Lost);
        }
        events
    }

    pub fn is_alive(&self, kind: InterfaceKind) -> bool {
        self.links.iter().any(|l| l.kind == kind && !l.missing)
    }

    pub fn any_alive(&self) -> bool {
        self.links.iter().any(|l| !l.missing)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn is_lost(&self) -> bool {
        self.lost
    }

    /// The peer's interface bitmap from its most recent alive.
    pub fn peer_if_state(&self) -> u32 {
        self.links
            .iter()
            .filter(|l| !l.missing)
            .max_by_key(|l| l.last_alive)
            .map(|l| l.peer_if_state)
            .unwrap_or(0)
    }
}
