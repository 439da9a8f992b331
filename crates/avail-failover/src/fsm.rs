//! The controller failover state machine.
//!
//! ```text
//! Initial ──hb enabled──▶ Normal ──hb lost / if down──▶ FailPending
//!                           ▲                            │ timeout
//!                           │      ┌─────────────────────┼──────────────┐
//!                           │      ▼                     ▼              ▼
//!                           └── Failed ◀─(blind guess)─ stay ──▶ Survived
//! ```
//!
//! Entry and exit hooks own every timer. A timer id that no longer matches
//! its slot is stale and ignored.

use std::time::Duration;

use avail_core::*;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::interface::{comm_fault, INTERFACE_SETTLE};
use crate::marker::StayFailedMarker;
use crate::survivor::{get_survivor, HeartbeatState, NodeStatus, SystemStatus};

/// How long before the fail-pending deadline cluster info is requested.
pub const CLUSTER_INFO_QUERY_LEAD: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailoverTimer {
    FailPending,
    ClusterInfoQuery,
    BlindGuess,
    HeartbeatTick,
}

/// Side effects for the daemon to carry out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FailoverAction {
    ActivateHost,
    /// Runs on the worker thread at priority.
    DisablePeer,
    DisableHost,
    SwactToPeer,
    SetDegraded(u32),
    QueryClusterInfo,
    SendHeartbeat { if_state: u32 },
    RaiseAlarm { reason: String },
    ClearAlarm,
}

#[derive(Debug, Clone)]
pub struct FailoverSettings {
    pub system_mode: SystemMode,
    pub settle: Duration,
    pub fail_pending_timeout: Duration,
    pub blind_guess_reset_timeout: Duration,
    pub blind_guess_go_active_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub missing_threshold: u32,
}

impl FailoverSettings {
    pub fn new(system_mode: SystemMode) -> Self {
        Self {
            system_mode,
            settle: INTERFACE_SETTLE,
            fail_pending_timeout: Duration::from_millis(2000),
            blind_guess_reset_timeout: Duration::from_secs(10),
            blind_guess_go_active_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_millis(100),
            missing_threshold: 10,
        }
    }

    pub fn from_config(config: &AvailConfig) -> Self {
        Self {
            system_mode: config.node.system_mode,
            settle: config.timers.interface_settle(),
            fail_pending_timeout: config.timers.fail_pending_timeout(),
            blind_guess_reset_timeout: config.timers.blind_guess_reset_timeout(),
            blind_guess_go_active_timeout: config.timers.blind_guess_go_active_timeout(),
            heartbeat_interval: config.heartbeat.interval(),
            missing_threshold: config.heartbeat.missing_threshold,
        }
    }

    /// Interfaces whose links must be up before a blind guess.
    pub fn required_interfaces(&self) -> &'static [InterfaceKind] {
        match self.system_mode {
            SystemMode::CpeDuplexDc => &[InterfaceKind::Oam],
            _ => &[InterfaceKind::Mgmt, InterfaceKind::ClusterHost],
        }
    }
}

pub struct FailoverContext<'a, T> {
    pub timers: &'a mut TimerRegistry<T>,
    pub marker: &'a mut dyn StayFailedMarker,
    pub settings: &'a FailoverSettings,
    pub actions: &'a mut Vec<FailoverAction>,
}

impl<'a, T> FailoverContext<'a, T> {
    pub fn new(
        timers: &'a mut TimerRegistry<T>,
        marker: &'a mut dyn StayFailedMarker,
        settings: &'a FailoverSettings,
        actions: &'a mut Vec<FailoverAction>,
    ) -> Self {
        Self {
            timers,
            marker,
            settings,
            actions,
        }
    }
}

/// What the FSM knows about the world when an event arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub host_flags: u32,
    pub peer_flags: u32,
    pub heartbeat_alive: bool,
    /// Heartbeat on the cluster-host link, or mgmt where there is none.
    pub direct_heartbeat_alive: bool,
    pub required_links_up: bool,
    pub cluster_host_configured: bool,
    pub host: NodeScheduleState,
    pub peer: NodeScheduleState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
enum BlindGuess {
    /// Host was active: disable the peer and wait out its reset.
    HoldActive,
    /// Host was standby: take over and wait for activity to settle here.
    TakeOver,
}

#[derive(Debug)]
pub struct FailoverFsm {
    state: FailoverState,
    pre_failure_host: NodeScheduleState,
    pre_failure_peer: NodeScheduleState,
    fail_pending_timer: Option<TimerId>,
    cluster_query_timer: Option<TimerId>,
    blind_guess_timer: Option<TimerId>,
    blind_guess: Option<BlindGuess>,
    cluster_info: Option<bool>,
    peer_disabled: bool,
}

impl Default for FailoverFsm {
    fn default() -> Self {
        Self::new()
    }
}

impl FailoverFsm {
    pub fn new() -> Self {
        Self {
            state: FailoverState::Initial,
            pre_failure_host: NodeScheduleState::Unknown,
            pre_failure_peer: NodeScheduleState::Unknown,
            fail_pending_timer: None,
            cluster_query_timer: None,
            blind_guess_timer: None,
            blind_guess: None,
            cluster_info: None,
            peer_disabled: false,
        }
    }

    pub fn state(&self) -> FailoverState {
        self.state
    }

    pub fn peer_disabled(&self) -> bool {
        self.peer_disabled
    }

    pub fn pre_failure(&self) -> (NodeScheduleState, NodeScheduleState) {
        (self.pre_failure_host, self.pre_failure_peer)
    }

    pub fn blind_guess_pending(&self) -> bool {
        self.blind_guess.is_some()
    }

    /// Answer to a [`FailoverAction::QueryClusterInfo`]: `None` when the
    /// cluster has no opinion.
    pub fn cluster_info_received(&mut self, peer_reachable: Option<bool>) {
        debug!(?peer_reachable, "cluster info");
        self.cluster_info = peer_reachable;
    }

    pub fn handle<T>(&mut self, cx: &mut FailoverContext<'_, T>, event: FailoverEvent, snap: &Snapshot) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        use FailoverEvent as E;
        use FailoverState as S;

        match (self.state, event) {
            (S::Initial, E::HeartbeatEnabled) => self.set_state(cx, S::Normal, snap)?,
            (S::Initial, _) => debug!(%event, "failover not started, event ignored"),

            (S::Normal, E::HeartbeatLost | E::InterfaceDown) => self.set_state(cx, S::FailPending, snap)?,
            (S::Normal, E::InterfaceStateChanged) => {
                if snap.host_flags & comm_fault::INTERFACE_MASK != 0 {
                    self.set_state(cx, S::FailPending, snap)?;
                }
            }
            (S::Normal, E::HeartbeatEnabled | E::HeartbeatRestored | E::NodeEnabled) => {
                debug!(%event, "normal operation, event ignored");
            }

            (
                S::FailPending,
                E::HeartbeatLost
                | E::InterfaceDown
                | E::InterfaceStateChanged
                | E::HeartbeatEnabled
                | E::HeartbeatRestored,
            ) => {
                if let Some(guess) = self.blind_guess {
                    debug!(%event, ?guess, "blind guess pending, deadline kept");
                } else {
                    debug!(%event, "fail pending, deadline extended");
                    self.arm_fail_pending(cx)?;
                }
            }
            (S::FailPending, E::FailPendingTimeout) => self.fail_pending_timeout(cx, snap)?,
            (S::FailPending, E::BlindGuessTimeout) => self.blind_guess_timeout(cx, snap)?,
            (S::FailPending, E::NodeEnabled) => debug!("fail pending, node enabled ignored"),

            (S::Failed, E::InterfaceStateChanged | E::HeartbeatEnabled | E::HeartbeatRestored) => {
                let selection = get_survivor(&self.system_status(snap));
                if selection.host_schedule_state == NodeScheduleState::Standby
                    && selection.peer_schedule_state == NodeScheduleState::Active
                {
                    self.set_state(cx, S::Normal, snap)?;
                } else {
                    debug!(host = %selection.host_schedule_state, "failed node stays failed");
                }
            }
            (S::Failed, E::HeartbeatLost | E::InterfaceDown | E::NodeEnabled) => {
                debug!(%event, "failed, recovery needs the peer heartbeat");
            }

            (S::Survived, E::NodeEnabled | E::HeartbeatEnabled | E::HeartbeatRestored) => {
                let selection = get_survivor(&self.system_status(snap));
                if selection.host_schedule_state == NodeScheduleState::Active
                    && selection.peer_schedule_state == NodeScheduleState::Standby
                {
                    self.set_state(cx, S::Normal, snap)?;
                } else {
                    debug!(peer = %selection.peer_schedule_state, "peer not back as standby yet");
                }
            }
            (S::Survived, E::HeartbeatLost | E::InterfaceDown | E::InterfaceStateChanged) => {
                debug!(%event, "survived, recovery needs the peer back");
            }

            (state, event) => {
                error!(%state, %event, "runtime error, unexpected failover event");
                return Err(AvailError::invalid_transition("failover", state, event));
            }
        }
        Ok(())
    }

    pub fn timer_fired<T>(
        &mut self,
        cx: &mut FailoverContext<'_, T>,
        id: TimerId,
        tag: &FailoverTimer,
        snap: &Snapshot,
    ) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        match tag {
            FailoverTimer::FailPending => {
                if self.fail_pending_timer != Some(id) {
                    debug!(timer = %id, "stale fail pending timer");
                    return Ok(());
                }
                self.fail_pending_timer = None;
                self.handle(cx, FailoverEvent::FailPendingTimeout, snap)
            }
            FailoverTimer::ClusterInfoQuery => {
                if self.cluster_query_timer != Some(id) {
                    debug!(timer = %id, "stale cluster info timer");
                    return Ok(());
                }
                self.cluster_query_timer = None;
                cx.actions.push(FailoverAction::QueryClusterInfo);
                Ok(())
            }
            FailoverTimer::BlindGuess => {
                if self.blind_guess_timer != Some(id) {
                    debug!(timer = %id, "stale blind guess timer");
                    return Ok(());
                }
                self.blind_guess_timer = None;
                self.handle(cx, FailoverEvent::BlindGuessTimeout, snap)
            }
            FailoverTimer::HeartbeatTick => Ok(()),
        }
    }

    fn system_status(&self, snap: &Snapshot) -> SystemStatus {
        SystemStatus {
            host: NodeStatus {
                schedule_state: snap.host,
                interface_flags: snap.host_flags,
            },
            peer: NodeStatus {
                schedule_state: snap.peer,
                interface_flags: snap.peer_flags,
            },
            heartbeat: if snap.heartbeat_alive {
                HeartbeatState::Ok
            } else {
                HeartbeatState::Fail
            },
            cluster_host_configured: snap.cluster_host_configured,
            peer_reachable_by_cluster: self.cluster_info.unwrap_or(false),
        }
    }

    // ── Fail pending ──────────────────────────────────────────────

    fn arm_fail_pending<T>(&mut self, cx: &mut FailoverContext<'_, T>) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        cx.timers.disarm_slot(&mut self.fail_pending_timer);
        cx.timers.disarm_slot(&mut self.cluster_query_timer);
        let timeout = cx.settings.fail_pending_timeout;
        self.fail_pending_timer = Some(cx.timers.arm("fail-pending", timeout, FailoverTimer::FailPending)?);
        let lead = timeout.saturating_sub(CLUSTER_INFO_QUERY_LEAD);
        self.cluster_query_timer =
            Some(cx.timers.arm("cluster-info-query", lead, FailoverTimer::ClusterInfoQuery)?);
        Ok(())
    }

    fn fail_pending_timeout<T>(&mut self, cx: &mut FailoverContext<'_, T>, snap: &Snapshot) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        if let Some(guess) = self.blind_guess {
            debug!(?guess, "blind guess pending, waiting for its timeout");
            return Ok(());
        }
        let duplex = cx.settings.system_mode.is_duplex();
        if duplex && !snap.direct_heartbeat_alive && self.cluster_info.is_none() {
            let marker_set = cx.marker.is_set();
            if snap.required_links_up && !marker_set {
                if self.blind_guess_start(cx)? {
                    return Ok(());
                }
            } else {
                info!(
                    links_up = snap.required_links_up,
                    stay_failed = marker_set,
                    "blind guess not eligible"
                );
            }
        }

        let selection = get_survivor(&self.system_status(snap));
        match (selection.host_schedule_state, selection.peer_schedule_state) {
            (NodeScheduleState::Failed, _) => self.set_state(cx, FailoverState::Failed, snap),
            (NodeScheduleState::Active, NodeScheduleState::Failed) => {
                self.set_state(cx, FailoverState::Survived, snap)
            }
            (NodeScheduleState::Active, _) => {
                if snap.host != NodeScheduleState::Active {
                    cx.actions.push(FailoverAction::ActivateHost);
                }
                self.set_state(cx, FailoverState::Normal, snap)
            }
            (NodeScheduleState::Standby, _) => {
                if snap.host == NodeScheduleState::Active {
                    cx.actions.push(FailoverAction::SwactToPeer);
                }
                self.set_state(cx, FailoverState::Normal, snap)
            }
            (host, _) => {
                error!(%host, "runtime error, unexpected survivor schedule state");
                self.arm_fail_pending(cx)?;
                Err(AvailError::invalid_transition(
                    "failover",
                    self.state,
                    format!("survivor host {host}"),
                ))
            }
        }
    }

    /// Returns whether a guess is in progress, new or not.
    fn blind_guess_start<T>(&mut self, cx: &mut FailoverContext<'_, T>) -> AvailResult<bool>
    where
        T: From<FailoverTimer> + Clone,
    {
        if let Some(guess) = self.blind_guess {
            warn!(?guess, "blind guess already in progress, ignored");
            return Ok(true);
        }
        let (guess, wait) = match self.pre_failure_host {
            NodeScheduleState::Active => {
                cx.actions.push(FailoverAction::DisablePeer);
                self.peer_disabled = true;
                (BlindGuess::HoldActive, cx.settings.blind_guess_reset_timeout)
            }
            NodeScheduleState::Standby => {
                cx.marker.set()?;
                cx.actions.push(FailoverAction::ActivateHost);
                cx.actions.push(FailoverAction::DisablePeer);
                self.peer_disabled = true;
                (
                    BlindGuess::TakeOver,
                    cx.settings.blind_guess_reset_timeout + cx.settings.blind_guess_go_active_timeout,
                )
            }
            other => {
                info!(pre_failure = %other, "no pre-failure role to guess from");
                return Ok(false);
            }
        };
        warn!(?guess, wait_ms = wait.as_millis() as u64, "blind guess started");
        self.blind_guess = Some(guess);
        self.blind_guess_timer = Some(cx.timers.arm("blind-guess", wait, FailoverTimer::BlindGuess)?);
        Ok(true)
    }

    fn blind_guess_timeout<T>(&mut self, cx: &mut FailoverContext<'_, T>, snap: &Snapshot) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        match self.blind_guess {
            Some(BlindGuess::HoldActive) => self.set_state(cx, FailoverState::Survived, snap),
            Some(BlindGuess::TakeOver) if snap.host == NodeScheduleState::Active => {
                cx.marker.clear()?;
                self.set_state(cx, FailoverState::Survived, snap)
            }
            Some(BlindGuess::TakeOver) => {
                warn!(host = %snap.host, "take-over never went active, staying failed");
                self.set_state(cx, FailoverState::Failed, snap)
            }
            None => {
                debug!("blind guess timeout without a guess");
                Ok(())
            }
        }
    }

    // ── Entry / exit ──────────────────────────────────────────────

    fn set_state<T>(&mut self, cx: &mut FailoverContext<'_, T>, next: FailoverState, snap: &Snapshot) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        let prev = self.state;
        self.exit(cx, snap);
        self.state = next;
        info!(from = %prev, to = %next, "failover state change");
        self.enter(cx, prev, snap)
    }

    fn exit<T>(&mut self, cx: &mut FailoverContext<'_, T>, snap: &Snapshot) {
        match self.state {
            FailoverState::Normal => {
                self.pre_failure_host = snap.host;
                self.pre_failure_peer = snap.peer;
                debug!(host = %snap.host, peer = %snap.peer, "pre-failure roles recorded");
            }
            FailoverState::FailPending => {
                cx.timers.disarm_slot(&mut self.fail_pending_timer);
                cx.timers.disarm_slot(&mut self.cluster_query_timer);
                cx.timers.disarm_slot(&mut self.blind_guess_timer);
                self.blind_guess = None;
                self.cluster_info = None;
            }
            _ => {}
        }
    }

    fn enter<T>(&mut self, cx: &mut FailoverContext<'_, T>, prev: FailoverState, snap: &Snapshot) -> AvailResult<()>
    where
        T: From<FailoverTimer> + Clone,
    {
        match self.state {
            FailoverState::FailPending => self.arm_fail_pending(cx)?,
            FailoverState::Failed => {
                cx.actions.push(FailoverAction::DisableHost);
                cx.actions.push(FailoverAction::RaiseAlarm {
                    reason: "controller failed over to peer".to_string(),
                });
            }
            FailoverState::Survived => {
                if snap.host != NodeScheduleState::Active {
                    cx.actions.push(FailoverAction::ActivateHost);
                }
                if !self.peer_disabled {
                    cx.actions.push(FailoverAction::DisablePeer);
                    self.peer_disabled = true;
                }
                cx.actions.push(FailoverAction::RaiseAlarm {
                    reason: "peer controller failed, running simplex".to_string(),
                });
            }
            FailoverState::Normal => {
                if matches!(prev, FailoverState::Failed | FailoverState::Survived) {
                    cx.actions.push(FailoverAction::ClearAlarm);
                }
                self.peer_disabled = false;
            }
            FailoverState::Initial => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::MemoryMarker;

    struct Harness {
        fsm: FailoverFsm,
        timers: TimerRegistry<FailoverTimer>,
        marker: MemoryMarker,
        settings: FailoverSettings,
        actions: Vec<FailoverAction>,
        snap: Snapshot,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                fsm: FailoverFsm::new(),
                timers: TimerRegistry::new(),
                marker: MemoryMarker::default(),
                settings: FailoverSettings::new(SystemMode::CpeDuplex),
                actions: Vec::new(),
                snap: Snapshot {
                    host_flags: 0,
                    peer_flags: 0,
                    heartbeat_alive: true,
                    direct_heartbeat_alive: true,
                    required_links_up: true,
                    cluster_host_configured: true,
                    host: NodeScheduleState::Standby,
                    peer: NodeScheduleState::Active,
                },
            }
        }

        fn event(&mut self, event: FailoverEvent) {
            let mut cx = FailoverContext::new(&mut self.timers, &mut self.marker, &self.settings, &mut self.actions);
            self.fsm.handle(&mut cx, event, &self.snap).unwrap();
        }

        fn advance(&mut self, by: Duration) {
            self.timers.advance(by);
            while let Some((id, tag)) = self.timers.pop_due() {
                let mut cx =
                    FailoverContext::new(&mut self.timers, &mut self.marker, &self.settings, &mut self.actions);
                self.fsm.timer_fired(&mut cx, id, &tag, &self.snap).unwrap();
            }
        }

        /// Normal operation, then total heartbeat loss with links still up.
        fn lose_peer(&mut self) {
            self.event(FailoverEvent::HeartbeatEnabled);
            self.event(FailoverEvent::HeartbeatLost);
            self.snap.heartbeat_alive = false;
            self.snap.direct_heartbeat_alive = false;
        }
    }

    #[test]
    fn initial_ignores_everything_but_heartbeat_enabled() {
        let mut h = Harness::new();
        for event in [
            FailoverEvent::HeartbeatLost,
            FailoverEvent::InterfaceDown,
            FailoverEvent::FailPendingTimeout,
            FailoverEvent::NodeEnabled,
        ] {
            h.event(event);
            assert_eq!(h.fsm.state(), FailoverState::Initial);
        }
        h.event(FailoverEvent::HeartbeatEnabled);
        assert_eq!(h.fsm.state(), FailoverState::Normal);
    }

    #[test]
    fn fail_pending_records_pre_failure_roles_and_arms_timers() {
        let mut h = Harness::new();
        h.event(FailoverEvent::HeartbeatEnabled);
        h.event(FailoverEvent::InterfaceDown);
        assert_eq!(h.fsm.state(), FailoverState::FailPending);
        assert_eq!(
            h.fsm.pre_failure(),
            (NodeScheduleState::Standby, NodeScheduleState::Active)
        );
        assert_eq!(h.timers.len(), 2);

        h.advance(Duration::from_millis(1800));
        assert_eq!(h.actions, vec![FailoverAction::QueryClusterInfo]);
    }

    #[test]
    fn heartbeat_back_before_deadline_returns_to_normal() {
        let mut h = Harness::new();
        h.event(FailoverEvent::HeartbeatEnabled);
        h.event(FailoverEvent::HeartbeatLost);
        h.event(FailoverEvent::HeartbeatRestored);
        h.advance(Duration::from_millis(2000));
        assert_eq!(h.fsm.state(), FailoverState::Normal);
        assert!(h.timers.is_empty());
    }

    #[test]
    fn standby_blind_guess_takes_over_and_sets_marker() {
        let mut h = Harness::new();
        h.lose_peer();
        h.advance(Duration::from_millis(2000));

        assert_eq!(h.fsm.state(), FailoverState::FailPending);
        assert!(h.fsm.blind_guess_pending());
        assert!(h.marker.is_set());
        assert!(h.actions.contains(&FailoverAction::ActivateHost));
        assert!(h.actions.contains(&FailoverAction::DisablePeer));

        // Still pending just before the combined reset and go-active wait.
        h.advance(Duration::from_secs(39));
        assert_eq!(h.fsm.state(), FailoverState::FailPending);

        h.snap.host = NodeScheduleState::Active;
        h.advance(Duration::from_secs(1));
        assert_eq!(h.fsm.state(), FailoverState::Survived);
        assert!(!h.marker.is_set());
        assert!(h.timers.is_empty());
    }

    #[test]
    fn standby_blind_guess_that_never_activates_stays_failed() {
        let mut h = Harness::new();
        h.lose_peer();
        h.advance(Duration::from_millis(2000));
        h.advance(Duration::from_secs(40));
        assert_eq!(h.fsm.state(), FailoverState::Failed);
        assert!(h.marker.is_set());
        assert!(h.actions.contains(&FailoverAction::DisableHost));
    }

    #[test]
    fn active_blind_guess_survives_after_reset_timeout() {
        let mut h = Harness::new();
        h.snap.host = NodeScheduleState::Active;
        h.snap.peer = NodeScheduleState::Standby;
        h.lose_peer();
        h.advance(Duration::from_millis(2000));
        assert!(!h.marker.is_set());
        assert_eq!(
            h.actions.iter().filter(|a| **a == FailoverAction::DisablePeer).count(),
            1
        );

        h.advance(Duration::from_secs(10));
        assert_eq!(h.fsm.state(), FailoverState::Survived);
        // The peer was disabled once, by the guess.
        assert_eq!(
            h.actions.iter().filter(|a| **a == FailoverAction::DisablePeer).count(),
            1
        );
    }

    #[test]
    fn blind_guess_is_single_shot() {
        let mut h = Harness::new();
        h.lose_peer();
        h.advance(Duration::from_millis(2000));
        let activations = h.actions.iter().filter(|a| **a == FailoverAction::ActivateHost).count();

        // A new loss re-arms the deadline; the second timeout must not guess again.
        h.event(FailoverEvent::HeartbeatLost);
        h.advance(Duration::from_millis(2000));
        assert_eq!(
            h.actions.iter().filter(|a| **a == FailoverAction::ActivateHost).count(),
            activations
        );
        assert_eq!(h.fsm.state(), FailoverState::FailPending);
    }

    #[test]
    fn stay_failed_marker_blocks_the_guess() {
        let mut h = Harness::new();
        h.marker.set().unwrap();
        h.lose_peer();
        h.advance(Duration::from_millis(2000));
        assert!(!h.fsm.blind_guess_pending());
        // Healthy host, silent peer: survivor selection keeps this node.
        assert_eq!(h.fsm.state(), FailoverState::Survived);
    }

    #[test]
    fn isolated_host_fails_without_guessing() {
        let mut h = Harness::new();
        h.lose_peer();
        h.snap.required_links_up = false;
        h.snap.host_flags = comm_fault::MGMT_DOWN | comm_fault::CLUSTER_HOST_DOWN;
        h.advance(Duration::from_millis(2000));
        assert_eq!(h.fsm.state(), FailoverState::Failed);
        assert!(!h.marker.is_set());
    }

    #[test]
    fn failed_recovers_only_as_standby() {
        let mut h = Harness::new();
        h.lose_peer();
        h.snap.required_links_up = false;
        h.snap.host_flags = comm_fault::MGMT_DOWN | comm_fault::CLUSTER_HOST_DOWN;
        h.advance(Duration::from_millis(2000));
        assert_eq!(h.fsm.state(), FailoverState::Failed);

        h.snap.host_flags = 0;
        h.snap.heartbeat_alive = true;
        h.snap.host = NodeScheduleState::Standby;
        h.snap.peer = NodeScheduleState::Active;
        h.event(FailoverEvent::HeartbeatRestored);
        assert_eq!(h.fsm.state(), FailoverState::Normal);
        assert_eq!(h.actions.last(), Some(&FailoverAction::ClearAlarm));
    }

    #[test]
    fn simplex_never_blind_guesses() {
        let mut h = Harness::new();
        h.settings = FailoverSettings::new(SystemMode::CpeSimplex);
        h.lose_peer();
        h.advance(Duration::from_millis(2000));
        assert!(!h.fsm.blind_guess_pending());
    }

    #[test]
    fn take_over_waits_out_its_timeout_despite_new_failure_events() {
        let mut h = Harness::new();
        h.lose_peer();
        h.advance(Duration::from_millis(2000));
        assert!(h.fsm.blind_guess_pending());

        for _ in 0..7 {
            h.event(FailoverEvent::HeartbeatLost);
            h.event(FailoverEvent::InterfaceStateChanged);
            h.advance(Duration::from_secs(5));
            assert_eq!(h.fsm.state(), FailoverState::FailPending);
            assert!(h.marker.is_set());
        }
        let activations = h.actions.iter().filter(|a| **a == FailoverAction::ActivateHost).count();
        assert_eq!(activations, 1);
        assert!(!h.actions.iter().any(|a| matches!(a, FailoverAction::RaiseAlarm { .. })));

        h.snap.host = NodeScheduleState::Active;
        h.advance(Duration::from_secs(5));
        assert_eq!(h.fsm.state(), FailoverState::Survived);
        assert!(!h.marker.is_set());
        assert_eq!(
            h.actions.iter().filter(|a| **a == FailoverAction::ActivateHost).count(),
            1
        );
    }

    #[test]
    fn every_state_event_pair_is_handled_or_rejected() {
        for &state in FailoverState::ALL {
            for &event in FailoverEvent::ALL {
                let mut h = Harness::new();
                h.fsm.state = state;
                let mut cx =
                    FailoverContext::new(&mut h.timers, &mut h.marker, &h.settings, &mut h.actions);
                match h.fsm.handle(&mut cx, event, &h.snap) {
                    Ok(()) => {}
                    Err(e) => {
                        assert_eq!(e.kind(), ErrorKind::Failed, "{state} + {event}");
                        assert!(matches!(e, AvailError::InvalidTransition { .. }), "{state} + {event}: {e}");
                    }
                }
            }
        }

        let mut h = Harness::new();
        h.event(FailoverEvent::HeartbeatEnabled);
        for event in [FailoverEvent::FailPendingTimeout, FailoverEvent::BlindGuessTimeout] {
            let mut cx = FailoverContext::new(&mut h.timers, &mut h.marker, &h.settings, &mut h.actions);
            let err = h.fsm.handle(&mut cx, event, &h.snap).unwrap_err();
            assert!(matches!(err, AvailError::InvalidTransition { .. }));
        }
        assert_eq!(h.fsm.state(), FailoverState::Normal);
    }
}
