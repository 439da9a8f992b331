//! Per-service state machine.
//!
//! Each event is dispatched by a pure `(state, event) -> Step` function over
//! a copy of the row. The step is then applied: a state change runs the
//! exit and enter hooks (with rollback when entering fails), and hooks may
//! yield one follow-up event, e.g. a success for an action that has no
//! plugin. Follow-ups are drained in the same call so a caller always sees
//! the settled result.

use std::collections::{HashSet, VecDeque};
use std::time::Duration;

use avail_core::*;
use avail_msg::SyncEvent;
use avail_state::{ServiceActionDef, ServiceRecord};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::context::{ServiceContext, ServiceTimer};
use crate::process::{classify_exit, ProcessSpec};

/// Bound on follow-up events drained for one input.
const MAX_FOLLOW_UPS: usize = 64;

/// Emitted when a service's `(state, status, condition)` actually changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceChange {
    pub service: String,
    pub prev_state: ServiceState,
    pub state: ServiceState,
    pub prev_status: ServiceStatus,
    pub status: ServiceStatus,
    pub prev_condition: ServiceCondition,
    pub condition: ServiceCondition,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Goto(ServiceState),
    Stay,
    Ignore,
    RunAudit(ServiceAction),
    RetryThrottle,
}

type Snapshot = (ServiceState, ServiceStatus, ServiceCondition);

fn snapshot(svc: &ServiceRecord) -> Snapshot {
    (svc.state, svc.status, svc.condition)
}

#[derive(Default)]
pub struct ServiceFsm {
    observers: Observers<ServiceChange>,
    /// Services whose next disable does not wait for dependents.
    skip_dependents: HashSet<String>,
}

impl ServiceFsm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observers(&mut self) -> &mut Observers<ServiceChange> {
        &mut self.observers
    }

    // ── Entry points ──────────────────────────────────────────────

    /// Dispatch `event` to the service's current state.
    pub fn event_handler<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        event: ServiceEvent,
    ) -> AvailResult<Option<ServiceChange>>
    where
        T: From<ServiceTimer> + Clone,
    {
        let before = snapshot(cx.tables.services.get(name)?);
        self.drain(cx, name, before, Some(event))
    }

    /// Exit status of a child started for this service.
    pub fn action_exit<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        pid: u32,
        code: i32,
    ) -> AvailResult<Option<ServiceChange>>
    where
        T: From<ServiceTimer> + Clone,
    {
        let svc = cx.tables.services.get(name)?;
        if svc.action_pid != Some(pid) {
            debug!(service = %name, pid, "exit of a process no longer tracked");
            return Ok(None);
        }
        let before = snapshot(svc);
        let result = match svc.action_running.and_then(|a| svc.action(a)) {
            Some(def) => classify_exit(def, code),
            None if code == 0 => ServiceActionResult::Success,
            None => ServiceActionResult::Failed,
        };
        debug!(service = %name, pid, code, %result, "action exited");
        let follow = self.complete_action(cx, name, result)?;
        self.drain(cx, name, before, follow)
    }

    pub fn timer_fired<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        id: TimerId,
        tag: &ServiceTimer,
    ) -> AvailResult<Option<ServiceChange>>
    where
        T: From<ServiceTimer> + Clone,
    {
        let name = match tag {
            ServiceTimer::Action(n)
            | ServiceTimer::Audit(n)
            | ServiceTimer::State(n)
            | ServiceTimer::FailCountdown(n) => n.as_str(),
            ServiceTimer::GroupTransition(_) | ServiceTimer::Notification(_) => return Ok(None),
        };
        let Some(svc) = cx.tables.services.read(name) else {
            return Ok(None);
        };
        let before = snapshot(svc);

        let follow = match tag {
            ServiceTimer::Action(_) => {
                if svc.action_timer != Some(id) {
                    return Ok(None);
                }
                let pid = svc.action_pid;
                cx.tables.services.update(name, |r| r.action_timer = None)?;
                if let Some(pid) = pid {
                    warn!(service = %name, pid, "action timed out, killing");
                    cx.launcher.kill(pid);
                }
                self.complete_action(cx, name, ServiceActionResult::Timeout)?
            }
            ServiceTimer::Audit(_) => {
                if svc.audit_timer != Some(id) || svc.action_running.is_some() {
                    return Ok(None);
                }
                Some(ServiceEvent::Audit)
            }
            ServiceTimer::State(_) => {
                if svc.state_timer != Some(id) {
                    return Ok(None);
                }
                let state = svc.state;
                cx.tables.services.update(name, |r| r.state_timer = None)?;
                match state {
                    ServiceState::Enabling => Some(ServiceEvent::EnableTimeout),
                    ServiceState::EnablingThrottle => Some(ServiceEvent::EnableThrottle),
                    _ => None,
                }
            }
            ServiceTimer::FailCountdown(_) => {
                if svc.fail_countdown_timer != Some(id) {
                    return Ok(None);
                }
                self.fail_countdown(cx, name)?;
                None
            }
            _ => None,
        };
        self.drain(cx, name, before, follow)
    }

    /// Re-try services parked on unmet dependencies.
    pub fn kick_waiting<T>(&mut self, cx: &mut ServiceContext<'_, T>) -> AvailResult<Vec<ServiceChange>>
    where
        T: From<ServiceTimer> + Clone,
    {
        let waiting: Vec<(String, ServiceAction)> = cx
            .tables
            .services
            .iter()
            .filter(|s| s.action_running.is_none())
            .filter_map(|s| state_action(s.state).map(|a| (s.name.clone(), a)))
            .collect();

        let mut changes = Vec::new();
        for (name, action) in waiting {
            if !self.dependencies_ready(cx, &name, action) {
                continue;
            }
            debug!(service = %name, %action, "dependencies met, starting action");
            let before = snapshot(cx.tables.services.get(&name)?);
            let follow = self.run_action(cx, &name, action)?;
            if let Some(change) = self.drain(cx, &name, before, follow)? {
                changes.push(change);
            }
        }
        Ok(changes)
    }

    /// Apply a sync-start/sync-end report from the notify socket.
    pub fn sync_event<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        event: SyncEvent,
    ) -> AvailResult<Option<ServiceChange>> {
        let svc = cx.tables.services.get(name)?;
        let before = snapshot(svc);
        if svc.condition >= ServiceCondition::RecoveryFailure {
            debug!(service = %name, condition = %svc.condition, "sync event ignored while failed");
            return Ok(None);
        }
        let condition = match event {
            SyncEvent::SyncStart => ServiceCondition::DataSyncing,
            SyncEvent::SyncEnd => ServiceCondition::DataConsistent,
        };
        cx.tables.services.update(name, |r| r.condition = condition)?;
        Ok(self.changed(cx, name, before))
    }

    /// Clear failure bookkeeping ahead of an operator restart.
    pub fn reset_failures<T>(&mut self, cx: &mut ServiceContext<'_, T>, name: &str) -> AvailResult<()> {
        let timer = cx.tables.services.get(name)?.fail_countdown_timer;
        if let Some(id) = timer {
            cx.timers.disarm(id);
        }
        cx.tables.services.update(name, |r| {
            r.fail_count = 0;
            r.fail_countdown_timer = None;
            if r.condition >= ServiceCondition::RecoveryFailure {
                r.condition = ServiceCondition::None;
                r.condition_reason.clear();
            }
            if r.status == ServiceStatus::Failed {
                r.status = ServiceStatus::None;
            }
        })?;
        Ok(())
    }

    /// The next disable of `name` does not wait for its dependents.
    pub fn skip_dependents_once(&mut self, name: &str) {
        self.skip_dependents.insert(name.to_string());
    }

    /// Service whose running action has `pid`, if any.
    pub fn owner_of<T>(&self, cx: &ServiceContext<'_, T>, pid: u32) -> Option<String> {
        cx.tables
            .services
            .iter()
            .find(|s| s.action_pid == Some(pid))
            .map(|s| s.name.clone())
    }

    // ── Dispatch ──────────────────────────────────────────────────

    fn drain<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        before: Snapshot,
        first: Option<ServiceEvent>,
    ) -> AvailResult<Option<ServiceChange>>
    where
        T: From<ServiceTimer> + Clone,
    {
        let mut pending: VecDeque<ServiceEvent> = first.into_iter().collect();
        let mut handled = 0;
        while let Some(event) = pending.pop_front() {
            handled += 1;
            if handled > MAX_FOLLOW_UPS {
                error!(service = %name, %event, "runtime error: follow-up events do not settle");
                return Err(AvailError::failed(format!("service '{name}' events do not settle")));
            }
            if let Some(next) = self.handle_one(cx, name, event)? {
                pending.push_back(next);
            }
        }
        Ok(self.changed(cx, name, before))
    }

    fn handle_one<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        event: ServiceEvent,
    ) -> AvailResult<Option<ServiceEvent>>
    where
        T: From<ServiceTimer> + Clone,
    {
        let throttle_full = cx
            .tables
            .services
            .count(|s| s.state == ServiceState::Enabling)
            >= cx.settings.max_concurrent_enables;
        let mut svc = cx.tables.services.get(name)?.clone();
        let state = svc.state;

        let step = match dispatch(&mut svc, event, throttle_full) {
            Ok(step) => step,
            Err(e) => {
                error!(service = %name, %state, %event, "runtime error: unhandled event");
                return Err(e);
            }
        };
        cx.tables.services.update(name, move |r| *r = svc)?;
        self.ensure_countdown(cx, name)?;

        match step {
            Step::Goto(to) if to != state => self.change_state(cx, name, to),
            Step::Goto(_) | Step::Stay => Ok(None),
            Step::Ignore => {
                debug!(service = %name, %state, %event, "event ignored");
                Ok(None)
            }
            Step::RunAudit(action) => {
                if cx.tables.services.get(name)?.action_running.is_some() {
                    return Ok(None);
                }
                self.run_action(cx, name, action)
            }
            Step::RetryThrottle => {
                let id = cx.timers.arm(
                    format!("{name} throttle"),
                    cx.settings.throttle_retry,
                    ServiceTimer::State(name.to_string()),
                )?;
                cx.tables.services.update(name, |r| r.state_timer = Some(id))?;
                Ok(None)
            }
        }
    }

    fn changed<T>(&self, cx: &ServiceContext<'_, T>, name: &str, before: Snapshot) -> Option<ServiceChange> {
        let svc = cx.tables.services.read(name)?;
        let after = snapshot(svc);
        if after == before {
            return None;
        }
        let change = ServiceChange {
            service: name.to_string(),
            prev_state: before.0,
            state: after.0,
            prev_status: before.1,
            status: after.1,
            prev_condition: before.2,
            condition: after.2,
        };
        self.observers.notify(&change);
        Some(change)
    }

    // ── State change ──────────────────────────────────────────────

    fn change_state<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        to: ServiceState,
    ) -> AvailResult<Option<ServiceEvent>>
    where
        T: From<ServiceTimer> + Clone,
    {
        let from = cx.tables.services.get(name)?.state;
        self.exit(cx, name)?;
        cx.tables.services.update(name, |r| r.state = to)?;
        info!(service = %name, %from, %to, "service state change");

        match self.enter(cx, name, to) {
            Ok(follow) => Ok(follow),
            Err(e) => {
                error!(service = %name, %from, %to, error = %e, "enter failed, restoring previous state");
                self.exit(cx, name)?;
                cx.tables.services.update(name, |r| r.state = from)?;
                if let Err(e) = self.enter(cx, name, from) {
                    error!(service = %name, state = %from, error = %e, "re-entering previous state failed");
                }
                Err(e)
            }
        }
    }

    fn exit<T>(&mut self, cx: &mut ServiceContext<'_, T>, name: &str) -> AvailResult<()> {
        self.abort_action(cx, name)?;
        let svc = cx.tables.services.get(name)?;
        let (state_timer, audit_timer) = (svc.state_timer, svc.audit_timer);
        for id in [state_timer, audit_timer].into_iter().flatten() {
            cx.timers.disarm(id);
        }
        cx.tables.services.update(name, |r| {
            r.state_timer = None;
            r.audit_timer = None;
            r.action_attempts = 0;
        })?;
        Ok(())
    }

    fn enter<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        state: ServiceState,
    ) -> AvailResult<Option<ServiceEvent>>
    where
        T: From<ServiceTimer> + Clone,
    {
        match state {
            ServiceState::Enabling => {
                let id = cx.timers.arm(
                    format!("{name} enabling"),
                    cx.settings.enabling_timeout,
                    ServiceTimer::State(name.to_string()),
                )?;
                cx.tables.services.update(name, |r| r.state_timer = Some(id))?;
                self.start_if_ready(cx, name, ServiceAction::Enable)
            }
            ServiceState::EnablingThrottle => {
                let id = cx.timers.arm(
                    format!("{name} throttle"),
                    cx.settings.throttle_retry,
                    ServiceTimer::State(name.to_string()),
                )?;
                cx.tables.services.update(name, |r| r.state_timer = Some(id))?;
                Ok(None)
            }
            ServiceState::EnabledGoActive => self.start_if_ready(cx, name, ServiceAction::GoActive),
            ServiceState::EnabledGoStandby => self.start_if_ready(cx, name, ServiceAction::GoStandby),
            ServiceState::Disabling => self.start_if_ready(cx, name, ServiceAction::Disable),
            ServiceState::EnabledStandby | ServiceState::EnabledActive => {
                self.arm_audit(cx, name, ServiceAction::AuditEnabled)?;
                Ok(None)
            }
            ServiceState::Disabled => {
                self.skip_dependents.remove(name);
                self.arm_audit(cx, name, ServiceAction::AuditDisabled)?;
                Ok(None)
            }
            ServiceState::Shutdown => {
                let timer = cx.tables.services.get(name)?.fail_countdown_timer;
                if let Some(id) = timer {
                    cx.timers.disarm(id);
                }
                cx.tables.services.update(name, |r| r.fail_countdown_timer = None)?;
                Ok(None)
            }
            ServiceState::Initial | ServiceState::Unknown => Ok(None),
        }
    }

    fn arm_audit<T>(&mut self, cx: &mut ServiceContext<'_, T>, name: &str, action: ServiceAction) -> AvailResult<()>
    where
        T: From<ServiceTimer> + Clone,
    {
        let interval = cx
            .tables
            .services
            .get(name)?
            .action(action)
            .map(|d| d.interval_secs)
            .unwrap_or(0);
        if interval == 0 {
            return Ok(());
        }
        let id = cx.timers.arm_periodic(
            format!("{name} {action}"),
            Duration::from_secs(interval),
            ServiceTimer::Audit(name.to_string()),
        )?;
        cx.tables.services.update(name, |r| r.audit_timer = Some(id))?;
        Ok(())
    }

    // ── Actions ───────────────────────────────────────────────────

    fn start_if_ready<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        action: ServiceAction,
    ) -> AvailResult<Option<ServiceEvent>>
    where
        T: From<ServiceTimer> + Clone,
    {
        if !self.dependencies_ready(cx, name, action) {
            debug!(service = %name, %action, "waiting for dependencies");
            return Ok(None);
        }
        self.run_action(cx, name, action)
    }

    fn dependencies_ready<T>(&self, cx: &ServiceContext<'_, T>, name: &str, action: ServiceAction) -> bool {
        let Some(svc) = cx.tables.services.read(name) else {
            return false;
        };
        let state_of = |dep: &str| cx.tables.services.read(dep).map(|d| d.state);
        match action {
            ServiceAction::Enable => svc
                .dependencies
                .iter()
                .all(|d| state_of(d).is_none_or(|s| s.is_enabled())),
            ServiceAction::GoActive => svc
                .dependencies
                .iter()
                .all(|d| state_of(d).is_none_or(|s| s == ServiceState::EnabledActive)),
            ServiceAction::Disable => {
                self.skip_dependents.contains(name)
                    || cx.tables.service_dependents(name).iter().all(|d| {
                        state_of(d).is_none_or(|s| {
                            matches!(
                                s,
                                ServiceState::Disabled | ServiceState::Initial | ServiceState::Shutdown
                            )
                        })
                    })
            }
            _ => true,
        }
    }

    /// Start the plugin for `action`. Spawn failures count as failed
    /// attempts and are retried within the same budget.
    fn run_action<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        action: ServiceAction,
    ) -> AvailResult<Option<ServiceEvent>>
    where
        T: From<ServiceTimer> + Clone,
    {
        let Some(def) = cx.tables.services.get(name)?.action(action).cloned() else {
            debug!(service = %name, %action, "no plugin for action, treating as success");
            return Ok(Some(result_event(action, ServiceActionResult::Success)));
        };
        self.abort_action(cx, name)?;

        let mut spec = ProcessSpec::new(&def.plugin, format!("{name}:{action}")).arg(action.as_str());
        for p in &def.params {
            spec = spec.arg(p);
        }

        loop {
            let attempts = cx.tables.services.get(name)?.action_attempts + 1;
            cx.tables.services.update(name, |r| r.action_attempts = attempts)?;
            match cx.launcher.spawn(&spec) {
                Ok(pid) => {
                    let timer = cx.timers.arm(
                        format!("{name} {action}"),
                        Duration::from_secs(def.timeout_secs.max(1)),
                        ServiceTimer::Action(name.to_string()),
                    )?;
                    cx.tables.services.update(name, |r| {
                        r.action_running = Some(action);
                        r.action_pid = Some(pid);
                        r.action_timer = Some(timer);
                    })?;
                    debug!(service = %name, %action, pid, attempt = attempts, "action started");
                    return Ok(None);
                }
                Err(e) => {
                    warn!(service = %name, %action, attempt = attempts, error = %e, "action spawn failed");
                    if !retry_allowed(&def, attempts, ServiceActionResult::Failed) {
                        cx.tables.services.update(name, |r| r.action_attempts = 0)?;
                        return Ok(Some(result_event(action, ServiceActionResult::Failed)));
                    }
                }
            }
        }
    }

    fn complete_action<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        result: ServiceActionResult,
    ) -> AvailResult<Option<ServiceEvent>>
    where
        T: From<ServiceTimer> + Clone,
    {
        let svc = cx.tables.services.get(name)?.clone();
        let Some(action) = svc.action_running else {
            return Ok(None);
        };
        if let Some(id) = svc.action_timer {
            cx.timers.disarm(id);
        }
        cx.tables.services.update(name, |r| {
            r.action_running = None;
            r.action_pid = None;
            r.action_timer = None;
        })?;

        if matches!(action, ServiceAction::AuditEnabled | ServiceAction::AuditDisabled) {
            cx.tables.services.update(name, |r| r.action_attempts = 0)?;
            return Ok(Some(result_event(action, result)));
        }

        match result {
            ServiceActionResult::Success => {
                cx.tables.services.update(name, |r| r.action_attempts = 0)?;
                Ok(Some(result_event(action, result)))
            }
            ServiceActionResult::Fatal => {
                warn!(service = %name, %action, "plugin reported fatal failure");
                cx.tables.services.update(name, |r| {
                    r.action_attempts = 0;
                    r.status = ServiceStatus::Failed;
                    r.condition = ServiceCondition::FatalFailure;
                    r.condition_reason = format!("{action} fatal");
                })?;
                Ok(Some(ServiceEvent::Shutdown))
            }
            ServiceActionResult::Failed | ServiceActionResult::Timeout => {
                let retry = svc
                    .action(action)
                    .is_some_and(|def| retry_allowed(def, svc.action_attempts, result));
                if retry {
                    info!(service = %name, %action, %result, attempt = svc.action_attempts, "retrying action");
                    return self.run_action(cx, name, action);
                }
                warn!(service = %name, %action, %result, attempts = svc.action_attempts, "action retries exhausted");
                cx.tables.services.update(name, |r| r.action_attempts = 0)?;
                Ok(Some(result_event(action, result)))
            }
        }
    }

    fn abort_action<T>(&mut self, cx: &mut ServiceContext<'_, T>, name: &str) -> AvailResult<()> {
        let svc = cx.tables.services.get(name)?;
        let (pid, timer, action) = (svc.action_pid, svc.action_timer, svc.action_running);
        if let Some(id) = timer {
            cx.timers.disarm(id);
        }
        if let Some(pid) = pid {
            debug!(service = %name, pid, action = ?action, "aborting running action");
            cx.launcher.kill(pid);
        }
        cx.tables.services.update(name, |r| {
            r.action_running = None;
            r.action_pid = None;
            r.action_timer = None;
        })?;
        Ok(())
    }

    // ── Fatal policy ──────────────────────────────────────────────

    fn ensure_countdown<T>(&mut self, cx: &mut ServiceContext<'_, T>, name: &str) -> AvailResult<()>
    where
        T: From<ServiceTimer> + Clone,
    {
        let svc = cx.tables.services.get(name)?;
        if svc.fail_count == 0 || svc.fail_countdown_timer.is_some() || svc.state == ServiceState::Shutdown {
            return Ok(());
        }
        let id = cx.timers.arm_periodic(
            format!("{name} fail-countdown"),
            cx.settings.fail_countdown_interval,
            ServiceTimer::FailCountdown(name.to_string()),
        )?;
        cx.tables.services.update(name, |r| r.fail_countdown_timer = Some(id))?;
        Ok(())
    }

    fn fail_countdown<T>(&mut self, cx: &mut ServiceContext<'_, T>, name: &str) -> AvailResult<()> {
        let svc = cx.tables.services.get(name)?;
        if svc.status == ServiceStatus::Failed {
            return Ok(());
        }
        let remaining = svc.fail_count.saturating_sub(svc.fail_countdown);
        let timer = svc.fail_countdown_timer;
        debug!(service = %name, fail_count = remaining, "fail countdown");
        if remaining == 0 {
            if let Some(id) = timer {
                cx.timers.disarm(id);
            }
        }
        cx.tables.services.update(name, |r| {
            r.fail_count = remaining;
            if remaining == 0 {
                r.fail_countdown_timer = None;
            }
        })?;
        Ok(())
    }
}

// ── Pure dispatch ─────────────────────────────────────────────────

/// The action a state runs on entry, if any.
fn state_action(state: ServiceState) -> Option<ServiceAction> {
    match state {
        ServiceState::Enabling => Some(ServiceAction::Enable),
        ServiceState::EnabledGoActive => Some(ServiceAction::GoActive),
        ServiceState::EnabledGoStandby => Some(ServiceAction::GoStandby),
        ServiceState::Disabling => Some(ServiceAction::Disable),
        _ => None,
    }
}

fn retry_allowed(def: &ServiceActionDef, attempts: u32, result: ServiceActionResult) -> bool {
    let budget = match result {
        ServiceActionResult::Failed => def.max_failure_retries,
        ServiceActionResult::Timeout => def.max_timeout_retries,
        _ => return false,
    };
    attempts <= budget && attempts <= def.max_total_retries
}

fn result_event(action: ServiceAction, result: ServiceActionResult) -> ServiceEvent {
    use ServiceActionResult as R;
    use ServiceEvent as E;
    match (action, result) {
        (ServiceAction::Enable, R::Success) => E::EnableSuccess,
        (ServiceAction::Enable, R::Timeout) => E::EnableTimeout,
        (ServiceAction::Enable, _) => E::EnableFailed,
        (ServiceAction::GoActive, R::Success) => E::GoActiveSuccess,
        (ServiceAction::GoActive, R::Timeout) => E::GoActiveTimeout,
        (ServiceAction::GoActive, _) => E::GoActiveFailed,
        (ServiceAction::GoStandby, R::Success) => E::GoStandbySuccess,
        (ServiceAction::GoStandby, R::Timeout) => E::GoStandbyTimeout,
        (ServiceAction::GoStandby, _) => E::GoStandbyFailed,
        (ServiceAction::Disable, R::Success) => E::DisableSuccess,
        (ServiceAction::Disable, R::Timeout) => E::DisableTimeout,
        (ServiceAction::Disable, _) => E::DisableFailed,
        (ServiceAction::AuditEnabled, R::Success) => E::AuditSuccess,
        (ServiceAction::AuditEnabled, R::Timeout) => E::AuditTimeout,
        (ServiceAction::AuditEnabled, _) => E::AuditFailed,
        // A failing "is it stopped?" probe means the service is running.
        (ServiceAction::AuditDisabled, R::Success) => E::AuditSuccess,
        (ServiceAction::AuditDisabled, R::Timeout) => E::AuditTimeout,
        (ServiceAction::AuditDisabled, _) => E::AuditMismatch,
    }
}

fn record_failure(svc: &mut ServiceRecord) {
    svc.fail_count += 1;
    svc.transition_fail_count += 1;
    if svc.max_failures > 0 && svc.fail_count >= svc.max_failures {
        svc.condition = ServiceCondition::FatalFailure;
        svc.condition_reason = format!("{} failures", svc.fail_count);
    }
}

fn action_failed(svc: &mut ServiceRecord, event: ServiceEvent) {
    svc.action_fail_count += 1;
    svc.status = ServiceStatus::Failed;
    if svc.condition < ServiceCondition::ActionFailure {
        svc.condition = ServiceCondition::ActionFailure;
        svc.condition_reason = event.to_string();
    }
    record_failure(svc);
}

fn enable_succeeded(svc: &mut ServiceRecord) {
    if svc.status == ServiceStatus::Failed {
        svc.status = ServiceStatus::None;
    }
    if matches!(
        svc.condition,
        ServiceCondition::ActionFailure | ServiceCondition::RecoveryFailure
    ) {
        svc.condition = ServiceCondition::None;
        svc.condition_reason.clear();
    }
}

fn dispatch(svc: &mut ServiceRecord, event: ServiceEvent, throttle_full: bool) -> AvailResult<Step> {
    use ServiceEvent as E;
    use ServiceState as S;

    let state = svc.state;
    if state == S::Shutdown {
        return Ok(Step::Ignore);
    }

    // Events every live state handles the same way.
    match event {
        E::Shutdown => return Ok(Step::Goto(S::Shutdown)),
        E::HeartbeatOkay => {
            if matches!(svc.status, ServiceStatus::Warn | ServiceStatus::Degraded) {
                svc.status = ServiceStatus::None;
            }
            svc.heartbeat_warn = false;
            return Ok(Step::Stay);
        }
        E::HeartbeatWarn => {
            if svc.status < ServiceStatus::Warn {
                svc.status = ServiceStatus::Warn;
                svc.heartbeat_warn = true;
            }
            return Ok(Step::Stay);
        }
        E::HeartbeatDegrade => {
            if svc.status < ServiceStatus::Degraded {
                svc.status = ServiceStatus::Degraded;
            }
            return Ok(Step::Stay);
        }
        E::HeartbeatFail | E::ProcessFailure => {
            return Ok(match state {
                S::Initial | S::Disabled | S::Unknown => Step::Ignore,
                S::Disabling => Step::Stay,
                _ => {
                    svc.status = ServiceStatus::Failed;
                    svc.condition_reason = event.to_string();
                    record_failure(svc);
                    Step::Goto(S::Disabling)
                }
            });
        }
        E::Audit => {
            return Ok(if state.is_enabled() {
                Step::RunAudit(ServiceAction::AuditEnabled)
            } else if matches!(state, S::Initial | S::Disabled) {
                Step::RunAudit(ServiceAction::AuditDisabled)
            } else {
                Step::Ignore
            });
        }
        E::AuditSuccess => {
            if svc.status == ServiceStatus::Warn && !svc.heartbeat_warn {
                svc.status = ServiceStatus::None;
            }
            return Ok(Step::Stay);
        }
        E::AuditFailed => {
            return Ok(if state.is_enabled() {
                svc.status = ServiceStatus::Failed;
                svc.condition_reason = event.to_string();
                record_failure(svc);
                Step::Goto(S::Disabling)
            } else {
                Step::Ignore
            });
        }
        E::AuditTimeout => {
            if svc.status < ServiceStatus::Warn {
                svc.status = ServiceStatus::Warn;
                svc.heartbeat_warn = false;
            }
            return Ok(Step::Stay);
        }
        E::AuditMismatch => {
            return Ok(match state {
                S::Initial | S::Disabled => {
                    warn!(service = %svc.name, "running while disabled, disabling");
                    Step::Goto(S::Disabling)
                }
                _ => Step::Ignore,
            });
        }
        _ => {}
    }

    let step = match (state, event) {
        (S::Initial | S::Disabled, E::Enable) => {
            if throttle_full {
                Step::Goto(S::EnablingThrottle)
            } else {
                Step::Goto(S::Enabling)
            }
        }
        (S::Initial, E::Disable) => Step::Goto(S::Disabling),
        (S::Disabled, E::Disable) => Step::Ignore,

        (S::Enabling, E::EnableSuccess) => {
            enable_succeeded(svc);
            if svc.has_action(ServiceAction::GoActive) {
                Step::Goto(S::EnabledStandby)
            } else {
                Step::Goto(S::EnabledActive)
            }
        }
        (S::Enabling, E::EnableFailed | E::EnableTimeout) => {
            action_failed(svc, event);
            Step::Goto(S::Disabling)
        }
        (S::Enabling, E::Enable | E::EnableThrottle) => Step::Ignore,

        (S::EnablingThrottle, E::EnableThrottle) => {
            if throttle_full {
                Step::RetryThrottle
            } else {
                Step::Goto(S::Enabling)
            }
        }
        (S::EnablingThrottle, E::Enable) => Step::Ignore,

        (S::EnabledStandby, E::GoActive) => Step::Goto(S::EnabledGoActive),
        (S::EnabledStandby, E::Enable | E::GoStandby) => Step::Ignore,

        (S::EnabledGoActive, E::GoActiveSuccess) => Step::Goto(S::EnabledActive),
        (S::EnabledGoActive, E::GoActiveFailed | E::GoActiveTimeout) => {
            action_failed(svc, event);
            Step::Goto(S::Disabling)
        }
        (S::EnabledGoActive, E::GoStandby) => Step::Goto(S::EnabledGoStandby),
        (S::EnabledGoActive, E::Enable | E::GoActive) => Step::Ignore,

        (S::EnabledActive, E::GoStandby) => Step::Goto(S::EnabledGoStandby),
        (S::EnabledActive, E::Enable | E::GoActive) => Step::Ignore,

        (S::EnabledGoStandby, E::GoStandbySuccess) => Step::Goto(S::EnabledStandby),
        (S::EnabledGoStandby, E::GoStandbyFailed | E::GoStandbyTimeout) => {
            action_failed(svc, event);
            Step::Goto(S::Disabling)
        }
        (S::EnabledGoStandby, E::GoActive) => Step::Goto(S::EnabledGoActive),
        (S::EnabledGoStandby, E::Enable | E::GoStandby) => Step::Ignore,

        (
            S::Enabling
            | S::EnablingThrottle
            | S::EnabledStandby
            | S::EnabledGoActive
            | S::EnabledActive
            | S::EnabledGoStandby,
            E::Disable,
        ) => Step::Goto(S::Disabling),

        (S::Disabling, E::DisableSuccess) => Step::Goto(S::Disabled),
        (S::Disabling, E::DisableFailed | E::DisableTimeout) => {
            svc.action_fail_count += 1;
            svc.status = ServiceStatus::Failed;
            svc.condition_reason = event.to_string();
            Step::Goto(S::Disabled)
        }
        (S::Disabling, E::Disable | E::Enable) => Step::Ignore,

        (state, event) => return Err(AvailError::invalid_transition("service", state, event)),
    };
    Ok(step)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use avail_core::config::ExitCodeMapping;
    use avail_state::Tables;

    use super::*;
    use crate::context::ServiceSettings;
    use crate::process::{RecordingLauncher, EXIT_PLUGIN_FAILURE};

    fn def(action: ServiceAction) -> ServiceActionDef {
        ServiceActionDef {
            action,
            plugin: "/usr/lib/ocf/resource.d/svc".into(),
            params: vec!["--verbose".into()],
            timeout_secs: 20,
            interval_secs: 0,
            max_failure_retries: 2,
            max_timeout_retries: 1,
            max_total_retries: 10,
            results: vec![ExitCodeMapping {
                code: 9,
                result: ServiceActionResult::Fatal,
            }],
        }
    }

    fn service(name: &str, actions: &[ServiceAction]) -> ServiceRecord {
        let mut svc = ServiceRecord::new(name);
        svc.actions = actions.iter().map(|a| def(*a)).collect();
        svc
    }

    struct Fixture {
        tables: Tables,
        timers: TimerRegistry<ServiceTimer>,
        launcher: RecordingLauncher,
        settings: ServiceSettings,
        fsm: ServiceFsm,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                tables: Tables::in_memory(),
                timers: TimerRegistry::new(),
                launcher: RecordingLauncher::new(),
                settings: ServiceSettings::default(),
                fsm: ServiceFsm::new(),
            }
        }

        fn event(&mut self, name: &str, event: ServiceEvent) -> AvailResult<Option<ServiceChange>> {
            let mut cx = ServiceContext::new(&mut self.tables, &mut self.timers, &self.launcher, &self.settings);
            self.fsm.event_handler(&mut cx, name, event)
        }

        fn exit(&mut self, name: &str, code: i32) -> Option<ServiceChange> {
            let pid = self.tables.services.read(name).unwrap().action_pid.unwrap();
            let mut cx = ServiceContext::new(&mut self.tables, &mut self.timers, &self.launcher, &self.settings);
            self.fsm.action_exit(&mut cx, name, pid, code).unwrap()
        }

        fn fire_due(&mut self) {
            while let Some((id, tag)) = self.timers.pop_due() {
                let mut cx =
                    ServiceContext::new(&mut self.tables, &mut self.timers, &self.launcher, &self.settings);
                self.fsm.timer_fired(&mut cx, id, &tag).unwrap();
            }
        }

        fn kick(&mut self) -> Vec<ServiceChange> {
            let mut cx = ServiceContext::new(&mut self.tables, &mut self.timers, &self.launcher, &self.settings);
            self.fsm.kick_waiting(&mut cx).unwrap()
        }

        fn svc(&self, name: &str) -> &ServiceRecord {
            self.tables.services.read(name).unwrap()
        }
    }

    #[test]
    fn enable_runs_plugin_then_settles_standby() {
        let mut fx = Fixture::new();
        fx.tables
            .services
            .insert(service("haproxy", &[ServiceAction::Enable, ServiceAction::GoActive]))
            .unwrap();

        let change = fx.event("haproxy", ServiceEvent::Enable).unwrap().unwrap();
        assert_eq!(change.state, ServiceState::Enabling);
        let (_, spec) = &fx.launcher.spawned()[0];
        assert_eq!(spec.args, vec!["enable".to_string(), "--verbose".to_string()]);

        let change = fx.exit("haproxy", 0).unwrap();
        assert_eq!(change.prev_state, ServiceState::Enabling);
        assert_eq!(change.state, ServiceState::EnabledStandby);
        assert!(fx.svc("haproxy").action_pid.is_none());
    }

    #[test]
    fn actions_without_plugins_complete_immediately() {
        let mut fx = Fixture::new();
        fx.tables.services.insert(service("dummy", &[])).unwrap();
        let change = fx.event("dummy", ServiceEvent::Enable).unwrap().unwrap();
        assert_eq!(change.state, ServiceState::EnabledActive);
        let change = fx.event("dummy", ServiceEvent::Disable).unwrap().unwrap();
        assert_eq!(change.state, ServiceState::Disabled);
        assert!(fx.launcher.spawned().is_empty());
    }

    #[test]
    fn failure_retries_are_budgeted_then_action_failure() {
        let mut fx = Fixture::new();
        fx.tables.services.insert(service("nfs", &[ServiceAction::Enable])).unwrap();
        fx.event("nfs", ServiceEvent::Enable).unwrap();

        assert!(fx.exit("nfs", EXIT_PLUGIN_FAILURE).is_none());
        assert!(fx.exit("nfs", 1).is_none());
        let change = fx.exit("nfs", 1).unwrap();

        assert_eq!(fx.launcher.counts()["nfs:enable"], 3);
        assert_eq!(change.condition, ServiceCondition::ActionFailure);
        assert_eq!(change.status, ServiceStatus::Failed);
        assert_eq!(change.state, ServiceState::Disabled);
        let svc = fx.svc("nfs");
        assert_eq!(svc.action_fail_count, 1);
        assert_eq!(svc.fail_count, 1);
        assert!(svc.fail_countdown_timer.is_some());
    }

    #[test]
    fn action_timeout_kills_and_retries() {
        let mut fx = Fixture::new();
        fx.tables.services.insert(service("dns", &[ServiceAction::Enable])).unwrap();
        fx.event("dns", ServiceEvent::Enable).unwrap();
        let first = fx.svc("dns").action_pid.unwrap();

        fx.timers.advance(Duration::from_secs(21));
        fx.fire_due();
        assert!(fx.launcher.killed().contains(&first));
        let second = fx.svc("dns").action_pid.unwrap();
        assert_ne!(first, second);

        // The killed child exiting later is not tracked any more.
        let mut cx = ServiceContext::new(&mut fx.tables, &mut fx.timers, &fx.launcher, &fx.settings);
        assert!(fx.fsm.action_exit(&mut cx, "dns", first, -9).unwrap().is_none());

        fx.timers.advance(Duration::from_secs(21));
        fx.fire_due();
        let svc = fx.svc("dns");
        assert_eq!(svc.state, ServiceState::Disabled);
        assert_eq!(svc.condition, ServiceCondition::ActionFailure);
    }

    #[test]
    fn fatal_result_shuts_service_down() {
        let mut fx = Fixture::new();
        fx.tables.services.insert(service("db", &[ServiceAction::Enable])).unwrap();
        fx.event("db", ServiceEvent::Enable).unwrap();
        let change = fx.exit("db", 9).unwrap();
        assert_eq!(change.state, ServiceState::Shutdown);
        assert_eq!(change.condition, ServiceCondition::FatalFailure);
        // Terminal: everything else is ignored.
        assert!(fx.event("db", ServiceEvent::Enable).unwrap().is_none());
    }

    #[test]
    fn max_failures_escalates_to_fatal_condition() {
        let mut fx = Fixture::new();
        let mut svc = service("vim", &[]);
        svc.max_failures = 2;
        fx.tables.services.insert(svc).unwrap();
        fx.event("vim", ServiceEvent::Enable).unwrap();
        fx.event("vim", ServiceEvent::ProcessFailure).unwrap();
        assert_eq!(fx.svc("vim").condition, ServiceCondition::None);
        fx.event("vim", ServiceEvent::Enable).unwrap();
        fx.event("vim", ServiceEvent::HeartbeatFail).unwrap();
        assert_eq!(fx.svc("vim").condition, ServiceCondition::FatalFailure);
    }

    #[test]
    fn fail_countdown_decays_when_not_failed() {
        let mut fx = Fixture::new();
        fx.tables.services.insert(service("vim", &[])).unwrap();
        fx.event("vim", ServiceEvent::Enable).unwrap();
        fx.event("vim", ServiceEvent::ProcessFailure).unwrap();
        assert_eq!(fx.svc("vim").fail_count, 1);

        // Still failed: no decay.
        fx.timers.advance(fx.settings.fail_countdown_interval);
        fx.fire_due();
        assert_eq!(fx.svc("vim").fail_count, 1);

        fx.event("vim", ServiceEvent::Enable).unwrap();
        assert_eq!(fx.svc("vim").status, ServiceStatus::None);
        fx.timers.advance(fx.settings.fail_countdown_interval);
        fx.fire_due();
        assert_eq!(fx.svc("vim").fail_count, 0);
        assert!(fx.svc("vim").fail_countdown_timer.is_none());
    }

    #[test]
    fn enable_waits_for_dependencies() {
        let mut fx = Fixture::new();
        fx.tables.services.insert(service("db", &[ServiceAction::Enable])).unwrap();
        let mut api = service("api", &[ServiceAction::Enable]);
        api.dependencies = vec!["db".into()];
        fx.tables.services.insert(api).unwrap();

        fx.event("api", ServiceEvent::Enable).unwrap();
        assert!(fx.launcher.pid_of("api:enable").is_none());
        assert!(fx.kick().is_empty());

        fx.event("db", ServiceEvent::Enable).unwrap();
        fx.exit("db", 0);
        fx.kick();
        assert!(fx.launcher.pid_of("api:enable").is_some());
    }

    #[test]
    fn disable_waits_for_dependents_unless_skipped() {
        let mut fx = Fixture::new();
        fx.tables.services.insert(service("db", &[ServiceAction::Disable])).unwrap();
        let mut api = service("api", &[]);
        api.dependencies = vec!["db".into()];
        fx.tables.services.insert(api).unwrap();
        fx.event("db", ServiceEvent::Enable).unwrap();
        fx.event("api", ServiceEvent::Enable).unwrap();

        fx.event("db", ServiceEvent::Disable).unwrap();
        assert!(fx.launcher.pid_of("db:disable").is_none());

        fx.fsm.skip_dependents_once("db");
        fx.kick();
        assert!(fx.launcher.pid_of("db:disable").is_some());
    }

    #[test]
    fn throttle_holds_enables_back() {
        let mut fx = Fixture::new();
        fx.settings.max_concurrent_enables = 1;
        fx.tables.services.insert(service("a", &[ServiceAction::Enable])).unwrap();
        fx.tables.services.insert(service("b", &[ServiceAction::Enable])).unwrap();
        fx.event("a", ServiceEvent::Enable).unwrap();
        fx.event("b", ServiceEvent::Enable).unwrap();
        assert_eq!(fx.svc("b").state, ServiceState::EnablingThrottle);

        fx.timers.advance(Duration::from_millis(250));
        fx.fire_due();
        assert_eq!(fx.svc("b").state, ServiceState::EnablingThrottle);

        fx.exit("a", 0);
        fx.timers.advance(Duration::from_millis(250));
        fx.fire_due();
        assert_eq!(fx.svc("b").state, ServiceState::Enabling);
    }

    #[test]
    fn heartbeat_severity_never_downgrades() {
        let mut fx = Fixture::new();
        fx.tables.services.insert(service("x", &[])).unwrap();
        fx.event("x", ServiceEvent::Enable).unwrap();
        fx.event("x", ServiceEvent::HeartbeatDegrade).unwrap();
        assert!(fx.event("x", ServiceEvent::HeartbeatWarn).unwrap().is_none());
        assert_eq!(fx.svc("x").status, ServiceStatus::Degraded);
        fx.event("x", ServiceEvent::HeartbeatOkay).unwrap();
        assert_eq!(fx.svc("x").status, ServiceStatus::None);
    }

    #[test]
    fn audit_success_keeps_heartbeat_warn() {
        let mut fx = Fixture::new();
        fx.tables.services.insert(service("x", &[])).unwrap();
        fx.event("x", ServiceEvent::Enable).unwrap();
        fx.event("x", ServiceEvent::HeartbeatWarn).unwrap();
        fx.event("x", ServiceEvent::AuditSuccess).unwrap();
        assert_eq!(fx.svc("x").status, ServiceStatus::Warn);

        fx.event("x", ServiceEvent::HeartbeatOkay).unwrap();
        fx.event("x", ServiceEvent::AuditTimeout).unwrap();
        fx.event("x", ServiceEvent::AuditSuccess).unwrap();
        assert_eq!(fx.svc("x").status, ServiceStatus::None);
    }

    #[test]
    fn periodic_audit_runs_plugin_and_detects_mismatch() {
        let mut fx = Fixture::new();
        let mut svc = service("ntp", &[ServiceAction::AuditDisabled]);
        svc.actions[0].interval_secs = 5;
        fx.tables.services.insert(svc).unwrap();
        fx.event("ntp", ServiceEvent::Disable).unwrap();
        assert_eq!(fx.svc("ntp").state, ServiceState::Disabled);
        fx.tables
            .services
            .update("ntp", |r| r.actions.push(def(ServiceAction::Disable)))
            .unwrap();

        fx.timers.advance(Duration::from_secs(5));
        fx.fire_due();
        assert!(fx.launcher.pid_of("ntp:audit-disabled").is_some());
        let change = fx.exit("ntp", 1).unwrap();
        assert_eq!(change.state, ServiceState::Disabling);
        assert!(fx.launcher.pid_of("ntp:disable").is_some());
        assert!(fx.svc("ntp").audit_timer.is_none());
    }

    #[test]
    fn stale_timer_fires_are_ignored() {
        let mut fx = Fixture::new();
        fx.tables.services.insert(service("x", &[ServiceAction::Enable])).unwrap();
        fx.event("x", ServiceEvent::Enable).unwrap();
        let old = fx.svc("x").action_timer.unwrap();
        fx.event("x", ServiceEvent::Disable).unwrap();
        assert!(!fx.timers.is_armed(old));

        let mut cx = ServiceContext::new(&mut fx.tables, &mut fx.timers, &fx.launcher, &fx.settings);
        let fired = fx
            .fsm
            .timer_fired(&mut cx, old, &ServiceTimer::Action("x".into()))
            .unwrap();
        assert!(fired.is_none());
        assert_eq!(fx.svc("x").state, ServiceState::Disabled);
    }

    #[test]
    fn observers_only_hear_real_changes() {
        let mut fx = Fixture::new();
        fx.tables.services.insert(service("x", &[ServiceAction::Enable])).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        fx.fsm.observers().register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        fx.event("x", ServiceEvent::Enable).unwrap();
        fx.event("x", ServiceEvent::Enable).unwrap();
        fx.event("x", ServiceEvent::HeartbeatOkay).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn every_state_event_pair_is_handled_or_rejected() {
        for &state in ServiceState::ALL {
            for &event in ServiceEvent::ALL {
                let mut fx = Fixture::new();
                let mut svc = service("x", &[]);
                svc.state = state;
                fx.tables.services.insert(svc).unwrap();
                match fx.event("x", event) {
                    Ok(_) => {}
                    Err(e) => {
                        assert_eq!(e.kind(), ErrorKind::Failed, "{state} + {event}");
                        assert!(matches!(e, AvailError::InvalidTransition { .. }), "{state} + {event}: {e}");
                    }
                }
            }
        }

        let mut fx = Fixture::new();
        fx.tables.services.insert(service("x", &[])).unwrap();
        let err = fx.event("x", ServiceEvent::GoActiveSuccess).unwrap_err();
        assert!(matches!(err, AvailError::InvalidTransition { .. }));
        assert!(matches!(
            fx.event("missing", ServiceEvent::Enable),
            Err(AvailError::NotFound(_))
        ));
    }

    #[test]
    fn sync_events_set_data_condition() {
        let mut fx = Fixture::new();
        fx.tables.services.insert(service("drbd", &[])).unwrap();
        let mut cx = ServiceContext::new(&mut fx.tables, &mut fx.timers, &fx.launcher, &fx.settings);
        let change = fx.fsm.sync_event(&mut cx, "drbd", SyncEvent::SyncStart).unwrap().unwrap();
        assert_eq!(change.condition, ServiceCondition::DataSyncing);
        assert!(fx.fsm.sync_event(&mut cx, "drbd", SyncEvent::SyncStart).unwrap().is_none());
        let change = fx.fsm.sync_event(&mut cx, "drbd", SyncEvent::SyncEnd).unwrap().unwrap();
        assert_eq!(change.condition, ServiceCondition::DataConsistent);
    }
}
