//! Run-to-completion coupling of the service and group state machines.
//!
//! A service change fans into `service-scn` for every group that holds the
//! service; a group request fans out to member services. Both directions go
//! through one work queue, so neither FSM ever calls the other.

use std::collections::{HashSet, VecDeque};

use avail_core::*;
use avail_msg::SyncEvent;
use tracing::{debug, error, info, warn};

use crate::context::{ServiceContext, ServiceTimer};
use crate::group_fsm::{GroupChange, GroupFsm, GroupOutcome};
use crate::service_fsm::{ServiceChange, ServiceFsm};

/// Bound on queued items processed for a single input.
const MAX_WORK_ITEMS: usize = 10_000;

#[derive(Debug)]
enum Work {
    Service { name: String, event: ServiceEvent },
    Group { name: String, event: GroupEvent },
    ServiceChanged(ServiceChange),
    Kick,
}

#[derive(Default)]
pub struct ServiceEngine {
    services: ServiceFsm,
    groups: GroupFsm,
    queue: VecDeque<Work>,
    /// Services to enable again once their restart disable completes.
    pending_restart: HashSet<String>,
}

impl ServiceEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn services(&mut self) -> &mut ServiceFsm {
        &mut self.services
    }

    pub fn groups(&mut self) -> &mut GroupFsm {
        &mut self.groups
    }

    /// Drop every registered observer. Called on daemon shutdown.
    pub fn clear_observers(&mut self) {
        self.services.observers().clear();
        self.groups.observers().clear();
    }

    // ── Inputs ────────────────────────────────────────────────────

    pub fn service_event<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        event: ServiceEvent,
    ) -> AvailResult<Vec<GroupChange>>
    where
        T: From<ServiceTimer> + Clone,
    {
        let change = self.services.event_handler(cx, name, event)?;
        self.run(cx, change.map(Work::ServiceChanged))
    }

    pub fn group_event<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        event: GroupEvent,
    ) -> AvailResult<Vec<GroupChange>>
    where
        T: From<ServiceTimer> + Clone,
    {
        let outcome = self.groups.event_handler(cx, name, event)?;
        let mut changes = Vec::new();
        self.absorb(outcome, &mut changes);
        changes.extend(self.run(cx, None)?);
        Ok(changes)
    }

    /// Scheduler request for a local group.
    pub fn group_action<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        action: GroupAction,
    ) -> AvailResult<Vec<GroupChange>>
    where
        T: From<ServiceTimer> + Clone,
    {
        self.group_event(cx, name, action.event())
    }

    /// Exit of a child started by either FSM.
    pub fn process_exit<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        pid: u32,
        code: i32,
    ) -> AvailResult<Vec<GroupChange>>
    where
        T: From<ServiceTimer> + Clone,
    {
        if let Some(service) = self.services.owner_of(cx, pid) {
            let change = self.services.action_exit(cx, &service, pid, code)?;
            return self.run(cx, change.map(Work::ServiceChanged));
        }
        if let Some(group) = self.groups.owner_of(cx, pid) {
            let outcome = self.groups.notification_exit(cx, &group, pid, code)?;
            let mut changes = Vec::new();
            self.absorb(outcome, &mut changes);
            changes.extend(self.run(cx, None)?);
            return Ok(changes);
        }
        debug!(pid, code, "exit of an untracked process");
        Ok(Vec::new())
    }

    pub fn timer_fired<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        id: TimerId,
        tag: &ServiceTimer,
    ) -> AvailResult<Vec<GroupChange>>
    where
        T: From<ServiceTimer> + Clone,
    {
        match tag {
            ServiceTimer::GroupTransition(_) | ServiceTimer::Notification(_) => {
                let outcome = self.groups.timer_fired(cx, id, tag)?;
                let mut changes = Vec::new();
                self.absorb(outcome, &mut changes);
                changes.extend(self.run(cx, None)?);
                Ok(changes)
            }
            _ => {
                let change = self.services.timer_fired(cx, id, tag)?;
                self.run(cx, change.map(Work::ServiceChanged))
            }
        }
    }

    /// Operator restart: clear failures, disable, then enable once disabled.
    ///
    /// Without `skip_dep` the dependents are restarted with it; with it only
    /// this service cycles and its disable does not wait for dependents.
    pub fn restart_service<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        skip_dep: bool,
    ) -> AvailResult<Vec<GroupChange>>
    where
        T: From<ServiceTimer> + Clone,
    {
        cx.tables.services.get(name)?;
        info!(service = %name, skip_dep, "restart requested");
        self.services.reset_failures(cx, name)?;

        let mut targets = vec![name.to_string()];
        if skip_dep {
            self.services.skip_dependents_once(name);
        } else {
            let mut i = 0;
            while i < targets.len() {
                for dependent in cx.tables.service_dependents(&targets[i]) {
                    if !targets.contains(&dependent) {
                        targets.push(dependent);
                    }
                }
                i += 1;
            }
        }

        for target in targets.iter().rev() {
            if target != name {
                self.services.reset_failures(cx, target)?;
            }
            self.pending_restart.insert(target.clone());
            self.queue.push_back(Work::Service {
                name: target.clone(),
                event: ServiceEvent::Disable,
            });
        }
        self.run(cx, None)
    }

    pub fn sync_event<T>(
        &mut self,
        cx: &mut ServiceContext<'_, T>,
        name: &str,
        event: SyncEvent,
    ) -> AvailResult<Vec<GroupChange>>
    where
        T: From<ServiceTimer> + Clone,
    {
        let change = self.services.sync_event(cx, name, event)?;
        self.run(cx, change.map(Work::ServiceChanged))
    }

    /// Send `shutdown` to every group.
    pub fn shutdown<T>(&mut self, cx: &mut ServiceContext<'_, T>) -> AvailResult<Vec<GroupChange>>
    where
        T: From<ServiceTimer> + Clone,
    {
        for name in cx.tables.service_groups.keys() {
            self.queue.push_back(Work::Group {
                name,
                event: GroupEvent::Shutdown,
            });
        }
        self.run(cx, None)
    }

    // ── Work queue ────────────────────────────────────────────────

    fn absorb(&mut self, outcome: GroupOutcome, changes: &mut Vec<GroupChange>) {
        for (name, event) in outcome.requests {
            self.queue.push_back(Work::Service { name, event });
        }
        if let Some(change) = outcome.change {
            changes.push(change);
        }
    }

    fn run<T>(&mut self, cx: &mut ServiceContext<'_, T>, first: Option<Work>) -> AvailResult<Vec<GroupChange>>
    where
        T: From<ServiceTimer> + Clone,
    {
        if let Some(work) = first {
            self.queue.push_front(work);
        }
        let mut changes = Vec::new();
        let mut processed = 0;
        while let Some(work) = self.queue.pop_front() {
            processed += 1;
            if processed > MAX_WORK_ITEMS {
                error!(pending = self.queue.len(), "service work queue did not settle, dropping");
                self.queue.clear();
                break;
            }
            if let Err(e) = self.step(cx, work, &mut changes) {
                match e.kind() {
                    ErrorKind::NotFound => warn!(error = %e, "work item skipped"),
                    _ => error!(error = %e, "work item failed"),
                }
            }
        }
        Ok(changes)
    }

    fn step<T>(&mut self, cx: &mut ServiceContext<'_, T>, work: Work, changes: &mut Vec<GroupChange>) -> AvailResult<()>
    where
        T: From<ServiceTimer> + Clone,
    {
        match work {
            Work::Service { name, event } => {
                if let Some(change) = self.services.event_handler(cx, &name, event)? {
                    self.queue.push_back(Work::ServiceChanged(change));
                }
            }
            Work::Group { name, event } => {
                let outcome = self.groups.event_handler(cx, &name, event)?;
                self.absorb(outcome, changes);
            }
            Work::ServiceChanged(change) => {
                for group in cx.tables.service_groups_of(&change.service) {
                    self.queue.push_back(Work::Group {
                        name: group,
                        event: GroupEvent::ServiceScn,
                    });
                }
                if change.state == ServiceState::Disabled && self.pending_restart.remove(&change.service) {
                    debug!(service = %change.service, "restart: disabled, enabling");
                    self.queue.push_back(Work::Service {
                        name: change.service.clone(),
                        event: ServiceEvent::Enable,
                    });
                }
                if change.state != change.prev_state
                    && !self.queue.iter().any(|w| matches!(w, Work::Kick))
                {
                    self.queue.push_back(Work::Kick);
                }
            }
            Work::Kick => {
                for change in self.services.kick_waiting(cx)? {
                    self.queue.push_back(Work::ServiceChanged(change));
                }
            }
        }
        Ok(())
    }
}
