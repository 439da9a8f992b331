//! Service-group state machine.
//!
//! A group fans go-active, go-standby and disable requests out to its member
//! services and completes the transition only once every member reports the
//! matching service state. Member reports arrive as `service-scn` events; the
//! group never blocks waiting for them. A per-group transition timer marks a
//! transition that never completes as failed without changing the state.
//!
//! On entering most states the group runs the notification script. Failed or
//! timed-out notifications flag the group for audit; they never revert it.

use std::collections::VecDeque;

use avail_core::*;
use avail_state::{GroupMemberRecord, ServiceGroupRecord, ServiceRecord};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::context::{ServiceContext, ServiceTimer};
use crate::process::ProcessSpec;

pub const TRANSITION_TIMEOUT_REASON: &str = "transition timeout";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupChange {
    pub group: String,
    pub prev_state: GroupState,
    pub state: GroupState,
    pub desired_state: GroupState,
    pub status: GroupStatus,
    pub condition: GroupCondition,
    pub health: i64,
    /// Fatal failure in a group provisioned to reboot the node.
    pub reboot_requested: bool,
}

/// What one group input produced: at most one change, plus requests for
/// member services the caller must deliver.
#[derive(Debug, Default)]
pub struct GroupOutcome {
    pub change: Option<GroupChange>,
    pub requests: Vec<(String, ServiceEvent)>,
}

type Snapshot = (GroupState, GroupStatus, GroupCondition, i64);

fn snapshot(group: &ServiceGroupRecord) -> Snapshot {
    (group.state, group.status, group.condition, group.health)
}

/// Member status, condition and health folded into the group's view.
///
/// Status is the most severe member status, condition the worst member
/// condition, and health the summed failure impact of failed members.
pub fn aggregate(members: &[GroupMemberRecord]) -> (GroupStatus, GroupCondition, i64) {
    let status = members
        .iter()
        .map(|m| GroupStatus::from(m.service_status))
        .max()
        .unwrap_or(GroupStatus::None)
        .max(GroupStatus::None);
    let condition = members
        .iter()
        .map(|m| GroupCondition::from(m.service_condition))
        .max()
        .unwrap_or(GroupCondition::None)
        .max(GroupCondition::None);
    let health = members
        .iter()
        .filter(|m| m.service_status == ServiceStatus::Failed)
        .map(|m| m.failure_impact.weight())
        .sum::<i64>()
        .max(0);
    (status, condition, health)
}

fn go_state(target: GroupState) -> GroupState {
    match target {
        GroupState::Active => GroupState::GoActive,
        GroupState::Standby => GroupState::GoStandby,
        _ => GroupState::Disabling,
    }
}

fn target_of(go: GroupState) -> Option<GroupState> {
    match go {
        GroupState::GoActive => Some(GroupState::Active),
        GroupState::GoStandby => Some(GroupState::Standby),
        GroupState::Disabling => Some(GroupState::Disabled),
        _ => None,
    }
}

fn member_target(target: GroupState) -> ServiceState {
    match target {
        GroupState::Active => ServiceState::EnabledActive,
        GroupState::Standby => ServiceState::EnabledStandby,
        _ => ServiceState::Disabled,
    }
}

/// Next request for a member so it moves toward the group's target.
fn member_step(target: GroupState, svc: &ServiceRecord, auto_recover: bool) -> Option<ServiceEvent> {
    use ServiceState as S;
    let may_enable = svc.condition != ServiceCondition::FatalFailure
        && (svc.status != ServiceStatus::Failed || auto_recover);
    match (target, svc.state) {
        (
            GroupState::Disabled,
            S::Initial
            | S::Enabling
            | S::EnablingThrottle
            | S::EnabledStandby
            | S::EnabledGoActive
            | S::EnabledActive
            | S::EnabledGoStandby,
        ) => Some(ServiceEvent::Disable),
        (GroupState::Disabled, _) => None,
        (_, S::Initial | S::Disabled) if may_enable => Some(ServiceEvent::Enable),
        (GroupState::Active, S::EnabledStandby) => Some(ServiceEvent::GoActive),
        (GroupState::Standby, S::EnabledActive) => Some(ServiceEvent::GoStandby),
        _ => None,
    }
}

fn notifies(state: GroupState) -> bool {
    !matches!(state, GroupState::Initial | GroupState::Unknown)
}

#[derive(Default)]
struct Pending {
    events: VecDeque<GroupEvent>,
    requests: Vec<(String, ServiceEvent)>,
}

#[derive(Default)]
pub struct GroupFsm {
    observers: Observers<GroupChange>,
}

impl GroupFsm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observers(&mut self) -> &mut Observers<GroupChange> {
        &mut self.observers
    }

    pub fn event_handler<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        event: GroupEvent,
    ) -> AvailResult<GroupOutcome>
    where
        T: From<ServiceTimer> + Clone,
    {
        let before = cx.tables.service_groups.get(name)?.clone();
        let mut pending = Pending::default();
        pending.events.push_back(event);
        self.drain(cx, name, &before, pending)
    }

    /// Exit status of this group's notification script.
    pub fn notification_exit<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        pid: u32,
        code: i32,
    ) -> AvailResult<GroupOutcome>
    where
        T: From<ServiceTimer> + Clone,
    {
        let before = cx.tables.service_groups.get(name)?.clone();
        if before.notification_pid != Some(pid) {
            debug!(group = %name, pid, "exit of a notification no longer tracked");
            return Ok(GroupOutcome::default());
        }
        if let Some(id) = before.notification_timer {
            cx.timers.disarm(id);
        }
        cx.tables.service_groups.update(name, |g| {
            g.notification_pid = None;
            g.notification_timer = None;
        })?;

        let mut pending = Pending::default();
        if code == 0 {
            pending.events.push_back(GroupEvent::NotificationSuccess);
        } else if before.notification_attempts <= cx.settings.notification_max_retries {
            debug!(group = %name, code, attempt = before.notification_attempts, "notification failed, retrying");
            if let Some(ev) = self.spawn_notification(cx, name)? {
                pending.events.push_back(ev);
            }
        } else {
            pending.events.push_back(GroupEvent::NotificationFailed);
        }
        self.drain(cx, name, &before, pending)
    }

    pub fn timer_fired<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        id: TimerId,
        tag: &ServiceTimer,
    ) -> AvailResult<GroupOutcome>
    where
        T: From<ServiceTimer> + Clone,
    {
        let (name, transition) = match tag {
            ServiceTimer::GroupTransition(n) => (n.as_str(), true),
            ServiceTimer::Notification(n) => (n.as_str(), false),
            _ => return Ok(GroupOutcome::default()),
        };
        let Some(before) = cx.tables.service_groups.read(name).cloned() else {
            return Ok(GroupOutcome::default());
        };
        let mut pending = Pending::default();

        if transition {
            if before.transition_timer != Some(id) {
                return Ok(GroupOutcome::default());
            }
            cx.tables.service_groups.update(name, |g| g.transition_timer = None)?;
            pending.events.push_back(GroupEvent::TransitionTimeout);
        } else {
            if before.notification_timer != Some(id) {
                return Ok(GroupOutcome::default());
            }
            if let Some(pid) = before.notification_pid {
                warn!(group = %name, pid, "notification timed out, killing");
                cx.launcher.kill(pid);
            }
            cx.tables.service_groups.update(name, |g| {
                g.notification_pid = None;
                g.notification_timer = None;
            })?;
            if before.notification_attempts <= cx.settings.notification_max_retries {
                if let Some(ev) = self.spawn_notification(cx, name)? {
                    pending.events.push_back(ev);
                }
            } else {
                pending.events.push_back(GroupEvent::NotificationTimeout);
            }
        }
        self.drain(cx, name, &before, pending)
    }

    /// Group whose notification script has `pid`, if any.
    pub fn owner_of<T>(&self, cx: &ServiceContext<'_, T>, pid: u32) -> Option<String> {
        cx.tables
            .service_groups
            .iter()
            .find(|g| g.notification_pid == Some(pid))
            .map(|g| g.name.clone())
    }

    // ── Dispatch ──────────────────────────────────────────────────

    fn drain<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        before: &ServiceGroupRecord,
        mut pending: Pending,
    ) -> AvailResult<GroupOutcome>
    where
        T: From<ServiceTimer> + Clone,
    {
        while let Some(event) = pending.events.pop_front() {
            let state = cx.tables.service_groups.get(name)?.state;
            if let Err(e) = self.handle(cx, name, event, &mut pending) {
                if matches!(e, AvailError::InvalidTransition { .. }) {
                    error!(group = %name, %state, %event, "runtime error: unhandled event");
                }
                return Err(e);
            }
        }
        Ok(GroupOutcome {
            change: self.changed(cx, name, before),
            requests: pending.requests,
        })
    }

    fn handle<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        event: GroupEvent,
        pending: &mut Pending,
    ) -> AvailResult<()>
    where
        T: From<ServiceTimer> + Clone,
    {
        use GroupEvent as E;
        use GroupState as S;

        let group = cx.tables.service_groups.get(name)?.clone();
        let state = group.state;
        if state == S::Shutdown {
            debug!(group = %name, %event, "group shut down, event ignored");
            return Ok(());
        }

        match event {
            E::GoActive => self.request(cx, name, S::Active, pending),
            E::GoStandby => self.request(cx, name, S::Standby, pending),
            E::Disable => self.request(cx, name, S::Disabled, pending),
            E::ServiceScn => self.reevaluate(cx, name, pending),
            E::Audit => {
                if group.needs_audit {
                    info!(group = %name, "audit after notification problem");
                }
                cx.tables.service_groups.update(name, |g| g.needs_audit = false)?;
                self.reevaluate(cx, name, pending)
            }
            E::TransitionTimeout => match state {
                S::GoActive | S::GoStandby | S::Disabling => {
                    warn!(group = %name, %state, desired = %group.desired_state, "transition timed out");
                    cx.tables.service_groups.update(name, |g| {
                        g.transition_failed = true;
                        g.status = GroupStatus::Failed;
                        g.condition = g.condition.max(GroupCondition::ActionFailure);
                        g.reason_text = TRANSITION_TIMEOUT_REASON.to_string();
                    })?;
                    Ok(())
                }
                _ => Err(AvailError::invalid_transition("service-group", state, event)),
            },
            E::NotificationSuccess => {
                cx.tables.service_groups.update(name, |g| {
                    g.notification_failed = false;
                    g.notification_timeout = false;
                })?;
                Ok(())
            }
            E::NotificationFailed => {
                warn!(group = %name, %state, "notification failed, audit required");
                cx.tables.service_groups.update(name, |g| {
                    g.notification_failed = true;
                    g.needs_audit = true;
                })?;
                Ok(())
            }
            E::NotificationTimeout => {
                warn!(group = %name, %state, "notification timed out, audit required");
                cx.tables.service_groups.update(name, |g| {
                    g.notification_timeout = true;
                    g.needs_audit = true;
                })?;
                Ok(())
            }
            E::Shutdown => {
                for service in cx.tables.group_services(name) {
                    pending.requests.push((service, ServiceEvent::Shutdown));
                }
                self.change_state(cx, name, S::Shutdown, pending)
            }
        }
    }

    fn request<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        target: GroupState,
        pending: &mut Pending,
    ) -> AvailResult<()>
    where
        T: From<ServiceTimer> + Clone,
    {
        let group = cx.tables.service_groups.get(name)?.clone();
        cx.tables.service_groups.update(name, |g| g.desired_state = target)?;

        if group.state == target && self.members_at(cx, name, member_target(target)) {
            debug!(group = %name, state = %target, "already in requested state");
            return Ok(());
        }

        let go = go_state(target);
        if group.state != go {
            if let Some(id) = group.transition_timer {
                cx.timers.disarm(id);
            }
            let id = cx.timers.arm(
                format!("{name} transition"),
                cx.settings.group_transition_timeout,
                ServiceTimer::GroupTransition(name.to_string()),
            )?;
            cx.tables.service_groups.update(name, |g| {
                g.transition_timer = Some(id);
                g.transition_failed = false;
            })?;
            self.change_state(cx, name, go, pending)?;
        }
        self.issue_steps(cx, name, target, pending);
        self.check_completion(cx, name, pending)
    }

    fn reevaluate<T>(&mut self, cx: &mut ServiceContext<'_, T>, name: &str, pending: &mut Pending) -> AvailResult<()>
    where
        T: From<ServiceTimer> + Clone,
    {
        self.refresh_members(cx, name)?;
        self.recompute(cx, name)?;

        let group = cx.tables.service_groups.get(name)?.clone();
        match group.state {
            GroupState::GoActive | GroupState::GoStandby | GroupState::Disabling => {
                if let Some(target) = target_of(group.state) {
                    self.issue_steps(cx, name, target, pending);
                }
                self.check_completion(cx, name, pending)
            }
            GroupState::Active | GroupState::Standby | GroupState::Disabled
                if group.desired_state == group.state =>
            {
                if !self.members_at(cx, name, member_target(group.state)) {
                    self.issue_steps(cx, name, group.state, pending);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn refresh_members<T>(&mut self, cx: &mut ServiceContext<'_, T>, name: &str) -> AvailResult<()> {
        for member in cx.tables.group_members(name) {
            let Some(svc) = cx.tables.services.read(&member.service) else {
                warn!(group = %name, service = %member.service, "member service not provisioned");
                continue;
            };
            let (state, status, condition) = (svc.state, svc.status, svc.condition);
            let key = format!("{}/{}", member.group, member.service);
            cx.tables.service_group_members.update(&key, |m| {
                m.service_state = state;
                m.service_status = status;
                m.service_condition = condition;
            })?;
        }
        Ok(())
    }

    fn recompute<T>(&mut self, cx: &mut ServiceContext<'_, T>, name: &str) -> AvailResult<()> {
        let members = cx.tables.group_members(name);
        let (mut status, mut condition, health) = aggregate(&members);
        let group = cx.tables.service_groups.get(name)?;
        let forced = group.transition_failed;
        if forced {
            status = GroupStatus::Failed;
            condition = condition.max(GroupCondition::ActionFailure);
        }
        cx.tables.service_groups.update(name, |g| {
            g.status = status;
            g.condition = condition;
            g.health = health;
            if !forced && g.reason_text == TRANSITION_TIMEOUT_REASON {
                g.reason_text.clear();
            }
        })?;
        Ok(())
    }

    fn members_at<T>(&self, cx: &ServiceContext<'_, T>, name: &str, target: ServiceState) -> bool {
        cx.tables.group_services(name).iter().all(|s| {
            cx.tables
                .services
                .read(s)
                .is_some_and(|svc| svc.state == target)
        })
    }

    fn issue_steps<T>(&self, cx: &ServiceContext<'_, T>, name: &str, target: GroupState, pending: &mut Pending) {
        let auto_recover = cx
            .tables
            .service_groups
            .read(name)
            .is_some_and(|g| g.auto_recover);
        for service in cx.tables.group_services(name) {
            let Some(svc) = cx.tables.services.read(&service) else {
                continue;
            };
            if let Some(event) = member_step(target, svc, auto_recover) {
                debug!(group = %name, %service, %event, "member request");
                pending.requests.push((service, event));
            }
        }
    }

    fn check_completion<T>(&mut self, cx: &mut ServiceContext<'_, T>, name: &str, pending: &mut Pending) -> AvailResult<()>
    where
        T: From<ServiceTimer> + Clone,
    {
        let group = cx.tables.service_groups.get(name)?.clone();
        let Some(target) = target_of(group.state) else {
            return Ok(());
        };
        if !self.members_at(cx, name, member_target(target)) {
            return Ok(());
        }
        if let Some(id) = group.transition_timer {
            cx.timers.disarm(id);
        }
        cx.tables.service_groups.update(name, |g| {
            g.transition_timer = None;
            g.transition_failed = false;
        })?;
        self.change_state(cx, name, target, pending)?;
        self.refresh_members(cx, name)?;
        self.recompute(cx, name)
    }

    fn change_state<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        to: GroupState,
        pending: &mut Pending,
    ) -> AvailResult<()>
    where
        T: From<ServiceTimer> + Clone,
    {
        let from = cx.tables.service_groups.get(name)?.state;
        if from == to {
            return Ok(());
        }
        if to == GroupState::Shutdown {
            let timer = cx.tables.service_groups.get(name)?.transition_timer;
            if let Some(id) = timer {
                cx.timers.disarm(id);
            }
            cx.tables.service_groups.update(name, |g| g.transition_timer = None)?;
        }
        cx.tables.service_groups.update(name, |g| g.state = to)?;
        info!(group = %name, %from, %to, "service group state change");

        if notifies(to) {
            if let Some(event) = self.start_notification(cx, name)? {
                pending.events.push_back(event);
            }
        }
        Ok(())
    }

    // ── Notification ─────────────────────────────────────────────

    fn start_notification<T>(&mut self, cx: &mut ServiceContext<'_, T>, name: &str) -> AvailResult<Option<GroupEvent>>
    where
        T: From<ServiceTimer> + Clone,
    {
        if cx.settings.notification_script.is_none() {
            return Ok(None);
        }
        let group = cx.tables.service_groups.get(name)?;
        let (pid, timer) = (group.notification_pid, group.notification_timer);
        if let Some(id) = timer {
            cx.timers.disarm(id);
        }
        if let Some(pid) = pid {
            debug!(group = %name, pid, "superseding running notification");
            cx.launcher.kill(pid);
        }
        cx.tables.service_groups.update(name, |g| {
            g.notification_pid = None;
            g.notification_timer = None;
            g.notification_attempts = 0;
            g.notification_seq += 1;
        })?;
        self.spawn_notification(cx, name)
    }

    fn spawn_notification<T>(&mut self, cx: &mut ServiceContext<'_, T>, name: &str) -> AvailResult<Option<GroupEvent>>
    where
        T: From<ServiceTimer> + Clone,
    {
        let Some(script) = cx.settings.notification_script.as_ref() else {
            return Ok(None);
        };
        let group = cx.tables.service_groups.get(name)?.clone();
        let spec = ProcessSpec::new(script.to_string_lossy(), format!("{name}:notify"))
            .env("SERVICE_GROUP_NAME", name)
            .env("SERVICE_GROUP_NOTIFICATION", group.state.as_str())
            .env("SERVICE_GROUP_DESIRED_STATE", group.desired_state.as_str())
            .env("SERVICE_GROUP_STATE", group.state.as_str())
            .env("NOTIFICATION_SEQNUM", group.notification_seq.to_string());

        let mut attempts = group.notification_attempts;
        loop {
            attempts += 1;
            match cx.launcher.spawn(&spec) {
                Ok(pid) => {
                    let id = cx.timers.arm(
                        format!("{name} notification"),
                        cx.settings.notification_timeout,
                        ServiceTimer::Notification(name.to_string()),
                    )?;
                    cx.tables.service_groups.update(name, |g| {
                        g.notification_pid = Some(pid);
                        g.notification_timer = Some(id);
                        g.notification_attempts = attempts;
                    })?;
                    debug!(group = %name, pid, seq = group.notification_seq, state = %group.state, "notification started");
                    return Ok(None);
                }
                Err(e) => {
                    warn!(group = %name, attempt = attempts, error = %e, "notification spawn failed");
                    if attempts > cx.settings.notification_max_retries {
                        cx.tables.service_groups.update(name, |g| g.notification_attempts = attempts)?;
                        return Ok(Some(GroupEvent::NotificationFailed));
                    }
                }
            }
        }
    }

    fn changed<T>(&self, cx: &ServiceContext<'_, T>, name: &str, before: &ServiceGroupRecord) -> Option<GroupChange> {
        let group = cx.tables.service_groups.read(name)?;
        if snapshot(group) == snapshot(before) {
            return None;
        }
        let change = GroupChange {
            group: name.to_string(),
            prev_state: before.state,
            state: group.state,
            desired_state: group.desired_state,
            status: group.status,
            condition: group.condition,
            health: group.health,
            reboot_requested: group.fatal_error_reboot
                && group.condition == GroupCondition::FatalFailure
                && before.condition != GroupCondition::FatalFailure,
        };
        self.observers.notify(&change);
        Some(change)
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use avail_state::Tables;

    use super::*;
    use crate::context::ServiceSettings;
    use crate::process::RecordingLauncher;

    fn member(service: &str, status: ServiceStatus, condition: ServiceCondition, impact: ServiceSeverity) -> GroupMemberRecord {
        let mut m = GroupMemberRecord::new("g", service, impact);
        m.service_status = status;
        m.service_condition = condition;
        m
    }

    #[test]
    fn aggregate_takes_worst_member() {
        let members = vec![
            member("a", ServiceStatus::None, ServiceCondition::None, ServiceSeverity::Critical),
            member("b", ServiceStatus::Degraded, ServiceCondition::DataSyncing, ServiceSeverity::Minor),
            member("c", ServiceStatus::Failed, ServiceCondition::ActionFailure, ServiceSeverity::Major),
        ];
        let (status, condition, health) = aggregate(&members);
        assert_eq!(status, GroupStatus::Failed);
        assert_eq!(condition, GroupCondition::ActionFailure);
        assert_eq!(health, 2);
        assert_eq!(aggregate(&[]), (GroupStatus::None, GroupCondition::None, 0));
    }

    #[test]
    fn aggregate_status_is_max_over_every_subset() {
        let statuses = [
            ServiceStatus::None,
            ServiceStatus::Warn,
            ServiceStatus::Degraded,
            ServiceStatus::Failed,
        ];
        for mask in 0u32..(1 << 8) {
            let members: Vec<_> = (0usize..8)
                .filter(|bit| mask & (1u32 << bit) != 0)
                .map(|bit| {
                    member(
                        &format!("s{bit}"),
                        statuses[bit % 4],
                        ServiceCondition::None,
                        ServiceSeverity::Minor,
                    )
                })
                .collect();
            let expected = members
                .iter()
                .map(|m| m.service_status)
                .max()
                .map(GroupStatus::from)
                .unwrap_or(GroupStatus::None);
            let failed = members.iter().filter(|m| m.service_status == ServiceStatus::Failed).count();
            let (status, _, health) = aggregate(&members);
            assert_eq!(status, expected, "mask {mask:#b}");
            assert_eq!(health, failed as i64);
        }
    }

    struct Fixture {
        tables: Tables,
        timers: TimerRegistry<ServiceTimer>,
        launcher: RecordingLauncher,
        settings: ServiceSettings,
        fsm: GroupFsm,
    }

    impl Fixture {
        fn new(services: &[&str]) -> Self {
            let mut tables = Tables::in_memory();
            tables.service_groups.insert(ServiceGroupRecord::new("g")).unwrap();
            for s in services {
                tables.services.insert(ServiceRecord::new(*s)).unwrap();
                tables
                    .service_group_members
                    .insert(GroupMemberRecord::new("g", *s, ServiceSeverity::Major))
                    .unwrap();
            }
            let mut settings = ServiceSettings::default();
            settings.notification_script = Some(PathBuf::from("/etc/sm/notify"));
            Self {
                tables,
                timers: TimerRegistry::new(),
                launcher: RecordingLauncher::new(),
                settings,
                fsm: GroupFsm::new(),
            }
        }

        fn event(&mut self, event: GroupEvent) -> AvailResult<GroupOutcome> {
            let mut cx = ServiceContext::new(&mut self.tables, &mut self.timers, &self.launcher, &self.settings);
            self.fsm.event_handler(&mut cx, "g", event)
        }

        fn set_service(&mut self, name: &str, state: ServiceState, status: ServiceStatus) {
            self.tables
                .services
                .update(name, |s| {
                    s.state = state;
                    s.status = status;
                })
                .unwrap();
        }

        fn group(&self) -> &ServiceGroupRecord {
            self.tables.service_groups.read("g").unwrap()
        }
    }

    #[test]
    fn go_active_fans_out_and_waits_for_all_members() {
        let mut fx = Fixture::new(&["a", "b"]);
        let out = fx.event(GroupEvent::GoActive).unwrap();
        assert_eq!(out.change.unwrap().state, GroupState::GoActive);
        assert_eq!(
            out.requests,
            vec![("a".to_string(), ServiceEvent::Enable), ("b".to_string(), ServiceEvent::Enable)]
        );
        assert!(fx.group().transition_timer.is_some());

        fx.set_service("a", ServiceState::EnabledActive, ServiceStatus::None);
        fx.set_service("b", ServiceState::EnabledStandby, ServiceStatus::None);
        let out = fx.event(GroupEvent::ServiceScn).unwrap();
        assert!(out.change.is_none());
        assert_eq!(out.requests, vec![("b".to_string(), ServiceEvent::GoActive)]);

        fx.set_service("b", ServiceState::EnabledActive, ServiceStatus::None);
        let out = fx.event(GroupEvent::ServiceScn).unwrap();
        let change = out.change.unwrap();
        assert_eq!(change.prev_state, GroupState::GoActive);
        assert_eq!(change.state, GroupState::Active);
        assert!(fx.group().transition_timer.is_none());
    }

    #[test]
    fn failed_member_degrades_status_not_state() {
        let mut fx = Fixture::new(&["a", "b"]);
        fx.set_service("a", ServiceState::EnabledActive, ServiceStatus::None);
        fx.set_service("b", ServiceState::EnabledActive, ServiceStatus::None);
        fx.event(GroupEvent::GoActive).unwrap();
        assert_eq!(fx.group().state, GroupState::Active);

        fx.set_service("b", ServiceState::Disabled, ServiceStatus::Failed);
        let out = fx.event(GroupEvent::ServiceScn).unwrap();
        let change = out.change.unwrap();
        assert_eq!(change.state, GroupState::Active);
        assert_eq!(change.status, GroupStatus::Failed);
        assert_eq!(change.health, ServiceSeverity::Major.weight());
        // Failed members are only re-enabled for auto-recovering groups.
        assert!(out.requests.is_empty());
    }

    #[test]
    fn transition_timeout_fails_without_reverting() {
        let mut fx = Fixture::new(&["a"]);
        fx.settings.notification_script = None;
        fx.event(GroupEvent::GoActive).unwrap();
        fx.timers.advance(fx.settings.group_transition_timeout);
        let (id, tag) = fx.timers.pop_due().unwrap();
        assert_eq!(tag, ServiceTimer::GroupTransition("g".into()));

        let mut cx = ServiceContext::new(&mut fx.tables, &mut fx.timers, &fx.launcher, &fx.settings);
        let change = fx.fsm.timer_fired(&mut cx, id, &tag).unwrap().change.unwrap();
        assert_eq!(change.state, GroupState::GoActive);
        assert_eq!(change.status, GroupStatus::Failed);
        assert_eq!(change.condition, GroupCondition::ActionFailure);
        assert_eq!(fx.group().reason_text, TRANSITION_TIMEOUT_REASON);

        // The forced failure survives member reports until completion.
        fx.event(GroupEvent::ServiceScn).unwrap();
        assert_eq!(fx.group().status, GroupStatus::Failed);
        fx.set_service("a", ServiceState::EnabledActive, ServiceStatus::None);
        fx.event(GroupEvent::ServiceScn).unwrap();
        assert_eq!(fx.group().state, GroupState::Active);
        assert_eq!(fx.group().status, GroupStatus::None);
        assert!(fx.group().reason_text.is_empty());
    }

    #[test]
    fn notification_carries_environment_and_retries() {
        let mut fx = Fixture::new(&["a"]);
        fx.event(GroupEvent::Disable).unwrap();
        let (pid, spec) = fx.launcher.spawned()[0].clone();
        assert!(spec.env.contains(&("SERVICE_GROUP_NAME".into(), "g".into())));
        assert!(spec.env.contains(&("SERVICE_GROUP_NOTIFICATION".into(), "disabling".into())));
        assert!(spec.env.contains(&("NOTIFICATION_SEQNUM".into(), "1".into())));

        let mut pid = pid;
        for _ in 0..fx.settings.notification_max_retries {
            let mut cx = ServiceContext::new(&mut fx.tables, &mut fx.timers, &fx.launcher, &fx.settings);
            fx.fsm.notification_exit(&mut cx, "g", pid, 1).unwrap();
            pid = fx.group().notification_pid.unwrap();
        }
        let mut cx = ServiceContext::new(&mut fx.tables, &mut fx.timers, &fx.launcher, &fx.settings);
        fx.fsm.notification_exit(&mut cx, "g", pid, 1).unwrap();

        let group = fx.group();
        let expected = fx.settings.notification_max_retries as usize + 1;
        assert_eq!(fx.launcher.counts()["g:notify"], expected);
        assert!(group.notification_failed);
        assert!(group.needs_audit);
        assert_eq!(group.state, GroupState::Disabling);
    }

    #[test]
    fn notification_timeout_flags_audit() {
        let mut fx = Fixture::new(&["a"]);
        fx.settings.notification_max_retries = 0;
        fx.event(GroupEvent::Disable).unwrap();
        let pid = fx.group().notification_pid.unwrap();
        fx.timers.advance(fx.settings.notification_timeout);
        let (id, tag) = fx.timers.pop_due().unwrap();
        assert_eq!(tag, ServiceTimer::Notification("g".into()));
        let mut cx = ServiceContext::new(&mut fx.tables, &mut fx.timers, &fx.launcher, &fx.settings);
        fx.fsm.timer_fired(&mut cx, id, &tag).unwrap();
        assert!(fx.launcher.killed().contains(&pid));
        assert!(fx.group().notification_timeout);
        assert!(fx.group().needs_audit);

        fx.event(GroupEvent::Audit).unwrap();
        assert!(!fx.group().needs_audit);
    }

    #[test]
    fn fatal_member_requests_reboot_when_provisioned() {
        let mut fx = Fixture::new(&["a"]);
        fx.tables
            .service_groups
            .update("g", |g| g.fatal_error_reboot = true)
            .unwrap();
        fx.tables
            .services
            .update("a", |s| s.condition = ServiceCondition::FatalFailure)
            .unwrap();
        let change = fx.event(GroupEvent::ServiceScn).unwrap().change.unwrap();
        assert!(change.reboot_requested);
        assert_eq!(change.condition, GroupCondition::FatalFailure);
    }

    #[test]
    fn every_state_event_pair_is_handled_or_rejected() {
        for &state in GroupState::ALL {
            for &event in GroupEvent::ALL {
                let mut fx = Fixture::new(&["a"]);
                fx.tables.service_groups.update("g", |g| g.state = state).unwrap();
                if let Err(e) = fx.event(event) {
                    assert!(matches!(e, AvailError::InvalidTransition { .. }), "{state} + {event}: {e}");
                }
            }
        }
    }
}
