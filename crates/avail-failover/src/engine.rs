//! Glue between interface health, heartbeat tracking and the failover FSM.
//!
//! The daemon feeds link changes, received heartbeats and timer expiries in,
//! and carries out the [`FailoverAction`]s that come back.

use avail_core::*;
use avail_msg::HeartbeatMsg;
use tracing::{debug, info};

use crate::fsm::{FailoverAction, FailoverContext, FailoverFsm, FailoverSettings, FailoverTimer, Snapshot};
use crate::heartbeat::{HeartbeatEvent, HeartbeatTracker};
use crate::interface::{comm_fault, InterfaceSet};

pub struct FailoverEngine {
    interfaces: InterfaceSet,
    heartbeat: HeartbeatTracker,
    fsm: FailoverFsm,
    required: &'static [InterfaceKind],
    flags: u32,
    hello_alive: bool,
    host: NodeScheduleState,
    peer: NodeScheduleState,
    tick: Option<TimerId>,
}

impl FailoverEngine {
    pub fn new(settings: &FailoverSettings, kinds: &[InterfaceKind]) -> Self {
        Self {
            interfaces: InterfaceSet::new(kinds, settings.settle),
            heartbeat: HeartbeatTracker::new(kinds, settings.heartbeat_interval, settings.missing_threshold),
            fsm: FailoverFsm::new(),
            required: settings.required_interfaces(),
            flags: 0,
            hello_alive: false,
            host: NodeScheduleState::Unknown,
            peer: NodeScheduleState::Unknown,
            tick: None,
        }
    }

    pub fn state(&self) -> FailoverState {
        self.fsm.state()
    }

    pub fn fsm(&self) -> &FailoverFsm {
        &self.fsm
    }

    pub fn interfaces(&self) -> &InterfaceSet {
        &self.interfaces
    }

    /// Last published communication-fault bitmap.
    pub fn comm_fault_flags(&self) -> u32 {
        self.flags
    }

    pub fn start<T>(&mut self, cx: &mut FailoverContext<'_, T>) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        cx.timers.disarm_slot(&mut self.tick);
        let every = cx.settings.heartbeat_interval;
        self.tick = Some(cx.timers.arm_periodic("heartbeat-tick", every, FailoverTimer::HeartbeatTick)?);
        info!(interfaces = self.interfaces.iter().count(), "failover engine started");
        Ok(())
    }

    /// Latest schedule states of the two controllers, as the domain sees them.
    pub fn set_schedule_states(&mut self, host: NodeScheduleState, peer: NodeScheduleState) {
        self.host = host;
        self.peer = peer;
    }

    pub fn link_changed<T>(&mut self, cx: &mut FailoverContext<'_, T>, kind: InterfaceKind, up: bool) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        if !self.interfaces.is_monitored(kind) {
            debug!(interface = %kind, up, "link change on unmonitored interface");
            return Ok(());
        }
        let now = cx.timers.now();
        if up {
            if self.interfaces.link_up(kind, now)? {
                self.refresh(cx, FailoverEvent::InterfaceStateChanged)?;
            }
        } else if self.interfaces.link_down(kind, now)? {
            self.refresh(cx, FailoverEvent::InterfaceDown)?;
        }
        Ok(())
    }

    pub fn heartbeat_received<T>(
        &mut self,
        cx: &mut FailoverContext<'_, T>,
        kind: InterfaceKind,
        msg: &HeartbeatMsg,
    ) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        let now = cx.timers.now();
        let events = self.heartbeat.alive_received(kind, msg.if_state(), now);
        let changed = self.interfaces.is_monitored(kind) && self.interfaces.heartbeat_seen(kind, now)?;
        for event in events {
            match event {
                HeartbeatEvent::Enabled => self.fsm_event(cx, FailoverEvent::HeartbeatEnabled)?,
                HeartbeatEvent::Restored => self.fsm_event(cx, FailoverEvent::HeartbeatRestored)?,
                _ => {}
            }
        }
        if changed {
            self.refresh(cx, FailoverEvent::InterfaceStateChanged)?;
        }
        Ok(())
    }

    pub fn timer_fired<T>(&mut self, cx: &mut FailoverContext<'_, T>, id: TimerId, tag: &FailoverTimer) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        if *tag != FailoverTimer::HeartbeatTick {
            let snap = self.snapshot(cx.timers.now());
            self.fsm.timer_fired(cx, id, tag, &snap)?;
            self.publish_flags(cx);
            return Ok(());
        }

        let now = cx.timers.now();
        let mut lost = false;
        let mut changed = false;
        for event in self.heartbeat.check(now) {
            match event {
                HeartbeatEvent::InterfaceMissing(kind) if self.interfaces.is_monitored(kind) => {
                    changed |= self.interfaces.heartbeat_missing(kind, now)?;
                }
                HeartbeatEvent::Lost => lost = true,
                _ => {}
            }
        }
        if lost {
            self.fsm_event(cx, FailoverEvent::HeartbeatLost)?;
        }
        // Settle windows expire without any event, so re-derive every tick.
        let settled = self.current_flags(now) & comm_fault::INTERFACE_MASK;
        if changed || settled != self.flags & comm_fault::INTERFACE_MASK {
            self.refresh(cx, FailoverEvent::InterfaceStateChanged)?;
        } else {
            self.publish_flags(cx);
        }
        cx.actions.push(FailoverAction::SendHeartbeat {
            if_state: self.flags & comm_fault::INTERFACE_MASK,
        });
        Ok(())
    }

    pub fn node_enabled<T>(&mut self, cx: &mut FailoverContext<'_, T>) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        self.fsm_event(cx, FailoverEvent::NodeEnabled)
    }

    pub fn cluster_info_received(&mut self, peer_reachable: Option<bool>) {
        self.fsm.cluster_info_received(peer_reachable);
    }

    pub fn set_hello_alive<T>(&mut self, cx: &mut FailoverContext<'_, T>, alive: bool) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        if self.hello_alive == alive {
            return Ok(());
        }
        self.hello_alive = alive;
        self.publish_flags(cx);
        Ok(())
    }

    fn fsm_event<T>(&mut self, cx: &mut FailoverContext<'_, T>, event: FailoverEvent) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        let snap = self.snapshot(cx.timers.now());
        self.fsm.handle(cx, event, &snap)?;
        self.publish_flags(cx);
        Ok(())
    }

    fn refresh<T>(&mut self, cx: &mut FailoverContext<'_, T>, event: FailoverEvent) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        self.publish_flags(cx);
        self.fsm_event(cx, event)
    }

    fn current_flags(&self, now: std::time::Instant) -> u32 {
        let mut flags = self.interfaces.fault_flags(now);
        if self.heartbeat.any_alive() {
            flags |= comm_fault::HEARTBEAT_ALIVE;
        }
        if self.hello_alive {
            flags |= comm_fault::HELLO_MSG_ALIVE;
        }
        if self.fsm.peer_disabled() {
            flags |= comm_fault::PEER_DISABLED;
        }
        flags
    }

    fn publish_flags<T: Clone>(&mut self, cx: &mut FailoverContext<'_, T>) {
        let flags = self.current_flags(cx.timers.now());
        if flags != self.flags {
            debug!(from = format_args!("{:#x}", self.flags), to = format_args!("{flags:#x}"), "comm fault flags");
            self.flags = flags;
            cx.actions.push(FailoverAction::SetDegraded(flags));
        }
    }

    fn snapshot(&self, now: std::time::Instant) -> Snapshot {
        let direct = if self.interfaces.is_monitored(InterfaceKind::ClusterHost) {
            InterfaceKind::ClusterHost
        } else {
            InterfaceKind::Mgmt
        };
        Snapshot {
            host_flags: self.interfaces.fault_flags(now),
            peer_flags: self.heartbeat.peer_if_state(),
            heartbeat_alive: self.heartbeat.any_alive(),
            direct_heartbeat_alive: self.heartbeat.is_alive(direct),
            required_links_up: self.interfaces.links_up(self.required, now),
            cluster_host_configured: self.interfaces.is_monitored(InterfaceKind::ClusterHost),
            host: self.host,
            peer: self.peer,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::marker::{MemoryMarker, StayFailedMarker};

    const KINDS: &[InterfaceKind] = &[InterfaceKind::Mgmt, InterfaceKind::ClusterHost, InterfaceKind::Oam];

    struct Harness {
        engine: FailoverEngine,
        timers: TimerRegistry<FailoverTimer>,
        marker: MemoryMarker,
        settings: FailoverSettings,
        actions: Vec<FailoverAction>,
    }

    impl Harness {
        fn new() -> Self {
            let settings = FailoverSettings::new(SystemMode::CpeDuplex);
            let mut h = Self {
                engine: FailoverEngine::new(&settings, KINDS),
                timers: TimerRegistry::new(),
                marker: MemoryMarker::default(),
                settings,
                actions: Vec::new(),
            };
            h.engine
                .set_schedule_states(NodeScheduleState::Standby, NodeScheduleState::Active);
            h.with_cx(|engine, cx| engine.start(cx));
            h
        }

        fn with_cx(&mut self, f: impl FnOnce(&mut FailoverEngine, &mut FailoverContext<'_, FailoverTimer>) -> AvailResult<()>) {
            let mut cx = FailoverContext::new(&mut self.timers, &mut self.marker, &self.settings, &mut self.actions);
            f(&mut self.engine, &mut cx).unwrap();
        }

        fn heartbeat_all(&mut self, peer_if_state: u32) {
            let msg = HeartbeatMsg::alive("controller-1", peer_if_state);
            for kind in KINDS {
                self.with_cx(|engine, cx| engine.heartbeat_received(cx, *kind, &msg));
            }
        }

        /// Advance in heartbeat-sized steps, delivering due timers.
        fn run_for(&mut self, total: Duration, with_heartbeats: bool) {
            let step = self.settings.heartbeat_interval;
            let mut elapsed = Duration::ZERO;
            while elapsed < total {
                self.timers.advance(step);
                elapsed += step;
                if with_heartbeats {
                    self.heartbeat_all(0);
                }
                while let Some((id, tag)) = self.timers.pop_due() {
                    self.with_cx(|engine, cx| engine.timer_fired(cx, id, &tag));
                }
            }
        }
    }

    #[test]
    fn first_heartbeat_starts_normal_operation() {
        let mut h = Harness::new();
        assert_eq!(h.engine.state(), FailoverState::Initial);
        h.heartbeat_all(0);
        assert_eq!(h.engine.state(), FailoverState::Normal);
        assert!(h.engine.comm_fault_flags() & comm_fault::HEARTBEAT_ALIVE != 0);
        assert!(h
            .actions
            .iter()
            .any(|a| matches!(a, FailoverAction::SetDegraded(f) if f & comm_fault::HEARTBEAT_ALIVE != 0)));
    }

    #[test]
    fn tick_sends_local_interface_state() {
        let mut h = Harness::new();
        h.heartbeat_all(0);
        h.with_cx(|engine, cx| engine.link_changed(cx, InterfaceKind::Oam, false));
        h.actions.clear();
        h.run_for(Duration::from_millis(100), true);
        assert!(h.actions.contains(&FailoverAction::SendHeartbeat {
            if_state: comm_fault::OAM_DOWN
        }));
    }

    #[test]
    fn link_down_enters_fail_pending_and_flap_stays_degraded() {
        let mut h = Harness::new();
        h.heartbeat_all(0);
        h.run_for(Duration::from_secs(3), true);

        h.with_cx(|engine, cx| engine.link_changed(cx, InterfaceKind::Mgmt, false));
        assert_eq!(h.engine.state(), FailoverState::FailPending);

        h.run_for(Duration::from_millis(200), true);
        h.with_cx(|engine, cx| engine.link_changed(cx, InterfaceKind::Mgmt, true));
        h.run_for(Duration::from_millis(300), true);
        h.with_cx(|engine, cx| engine.link_changed(cx, InterfaceKind::Mgmt, false));
        assert!(h.engine.comm_fault_flags() & comm_fault::MGMT_DOWN != 0);

        // Heartbeats still flow on cluster-host, so no guess is taken.
        h.run_for(Duration::from_secs(3), true);
        assert!(!h.engine.fsm().blind_guess_pending());
        assert!(!h.marker.is_set());
    }

    #[test]
    fn silent_peer_triggers_blind_guess_on_standby() {
        let mut h = Harness::new();
        for kind in KINDS {
            h.with_cx(|engine, cx| engine.link_changed(cx, *kind, true));
        }
        h.heartbeat_all(0);
        h.run_for(Duration::from_secs(3), true);
        assert_eq!(h.engine.state(), FailoverState::Normal);

        // Missing after 1s, then the 2s fail-pending window.
        h.run_for(Duration::from_millis(3500), false);
        assert!(h.engine.fsm().blind_guess_pending());
        assert!(h.marker.is_set());
        assert!(h.actions.contains(&FailoverAction::ActivateHost));
        assert!(h.actions.contains(&FailoverAction::DisablePeer));
        assert!(h.engine.comm_fault_flags() & comm_fault::PEER_DISABLED != 0);
    }

    #[test]
    fn hello_alive_is_reported_in_flags() {
        let mut h = Harness::new();
        h.with_cx(|engine, cx| engine.set_hello_alive(cx, true));
        assert!(h.engine.comm_fault_flags() & comm_fault::HELLO_MSG_ALIVE != 0);
        h.actions.clear();
        h.with_cx(|engine, cx| engine.set_hello_alive(cx, true));
        assert!(h.actions.is_empty());
    }
}
