//! The [`DomainEngine`] couples election, neighbor exchange, scheduling and
//! node state behind one message/timer surface.

use std::time::Instant;

use avail_core::*;
use avail_msg::message::NodeSwact;
use avail_msg::Payload;
use avail_state::AssignmentRecord;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::{epoch_ms, DomainContext, DomainTimer, NODE_HELLO_INTERVAL};
use crate::election::{DomainChange, DomainFsm};
use crate::neighbor::NeighborFsm;
use crate::node::{node_schedule_state, NodeApi, NodeChange};
use crate::scheduler::{should_schedule, Scheduler};

/// Latest state of a group hosted on this node, as reported by the
/// service layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalGroupState {
    pub group: String,
    pub state: GroupState,
    pub status: GroupStatus,
    pub condition: GroupCondition,
    pub health: i64,
    pub reason_text: String,
}

#[derive(Default)]
pub struct DomainEngine {
    election: DomainFsm,
    neighbors: NeighborFsm,
    scheduler: Scheduler,
    nodes: NodeApi,
    started: Option<Instant>,
    swact_requests: u64,
}

impl DomainEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes_mut(&mut self) -> &mut NodeApi {
        &mut self.nodes
    }

    /// Arm the periodic timers and bring every domain out of `initial`
    /// whose interfaces are already up.
    pub fn start<T>(&mut self, cx: &mut DomainContext<'_, T>) -> AvailResult<Vec<DomainChange>>
    where
        T: From<DomainTimer> + Clone,
    {
        self.started = Some(cx.timers.now());
        cx.timers
            .arm_periodic("domain-scheduler", cx.settings.scheduler_interval, DomainTimer::Scheduler)?;
        cx.timers
            .arm_periodic("node-hello", NODE_HELLO_INTERVAL, DomainTimer::NodeHello)?;

        let mut changes = Vec::new();
        for name in cx.tables.domains.keys() {
            changes.extend(self.election.interface_changed(cx, &name)?);
        }
        info!(domains = cx.tables.domains.len(), "domain engine started");
        Ok(changes)
    }

    fn uptime_secs<T: Clone>(&self, cx: &DomainContext<'_, T>) -> u64 {
        self.started
            .map(|s| cx.timers.now().saturating_duration_since(s).as_secs())
            .unwrap_or(0)
    }

    // ── Messages ──────────────────────────────────────────────────

    /// Handle one peer message already accepted by the session layer.
    pub fn message<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        from: &str,
        payload: &Payload,
    ) -> AvailResult<Vec<DomainChange>>
    where
        T: From<DomainTimer> + Clone,
    {
        let mut changes = Vec::new();
        match payload {
            Payload::DomainHello(hello) => {
                self.neighbors.hello_received(cx, hello)?;
                changes.extend(self.election.hello_received(cx, hello)?);
            }
            Payload::ExchangeStart(msg) => self.neighbors.exchange_start_received(cx, msg)?,
            Payload::Exchange(msg) => self.neighbors.exchange_received(cx, msg)?,
            Payload::MemberRequest(msg) => self.neighbors.member_request_received(cx, msg)?,
            Payload::MemberUpdate(msg) => {
                self.neighbors.member_update_received(cx, msg)?;
            }
            Payload::DomainPause(msg) => {
                log_not_implemented("domain-pause");
                debug!(domain = %msg.domain, node = %msg.node, pause_ms = msg.pause_interval_ms, "domain pause ignored");
            }
            Payload::NodeHello(hello) => {
                self.nodes.hello_received(cx.tables, hello)?;
            }
            Payload::NodeUpdate(update) => {
                self.nodes.apply_update(cx.tables, update)?;
            }
            Payload::NodeSwact(swact) => {
                self.scheduler.swact_node(cx.tables, &swact.node_name, swact.force)?;
                cx.out.send(Some(from), Payload::NodeSwactAck(swact.clone()));
            }
            Payload::NodeSwactAck(ack) => {
                info!(node = %ack.node_name, request = ack.request_id, %from, "swact acknowledged");
            }
        }
        Ok(changes)
    }

    // ── Timers ────────────────────────────────────────────────────

    pub fn timer_fired<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        id: TimerId,
        tag: &DomainTimer,
    ) -> AvailResult<Vec<DomainChange>>
    where
        T: From<DomainTimer> + Clone,
    {
        let mut changes = Vec::new();
        match tag {
            DomainTimer::Hello(_) | DomainTimer::Wait(_) => {
                changes.extend(self.election.timer_fired(cx, id, tag)?);
            }
            DomainTimer::Dead { .. } | DomainTimer::Exchange { .. } => {
                if let Some((domain, node)) = self.neighbors.timer_fired(cx, id, tag)? {
                    changes.extend(self.election.neighbor_ageout(cx, &domain, &node)?);
                }
            }
            DomainTimer::Scheduler => self.run_scheduler(cx)?,
            DomainTimer::NodeHello => {
                let uptime = self.uptime_secs(cx);
                let hello = self.nodes.local_hello(cx.tables, &cx.settings.local_node, uptime)?;
                cx.out.send(None, Payload::NodeHello(hello));
            }
        }
        Ok(changes)
    }

    // ── Local inputs ──────────────────────────────────────────────

    pub fn interface_changed<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        domain: &str,
    ) -> AvailResult<Option<DomainChange>>
    where
        T: From<DomainTimer> + Clone,
    {
        self.election.interface_changed(cx, domain)
    }

    /// Record a local group change in every domain that schedules the group
    /// and push it to full neighbors.
    pub fn local_group_changed<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        change: &LocalGroupState,
    ) -> AvailResult<usize> {
        let local = cx.settings.local_node.clone();
        let mut pushed = 0;
        for member in cx.tables.group_domain_members(&change.group) {
            let key = AssignmentRecord::key(&member.domain, &local, &change.group);
            let Some(prev) = cx.tables.assignments.read(&key).map(|a| a.state) else {
                continue;
            };
            let updated = cx.tables.assignments.update(&key, |a| {
                a.state = change.state;
                a.status = change.status;
                a.condition = change.condition;
                a.health = change.health;
                a.reason_text = change.reason_text.clone();
                if prev != change.state {
                    a.last_state_change = epoch_ms();
                }
            })?;
            if !updated {
                continue;
            }
            let row = cx.tables.assignments.get(&key)?.clone();
            pushed += self.neighbors.push_member_update(cx, &row)?;
        }
        Ok(pushed)
    }

    /// Apply a SET_NODE command. Swacts of a node whose domains are led
    /// elsewhere are also forwarded to those leaders.
    #[allow(clippy::too_many_arguments)]
    pub fn set_node<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        node: &str,
        action: NodeSetAction,
        admin: AdminState,
        oper: OperState,
        avail: AvailStatus,
    ) -> AvailResult<Option<NodeChange>>
    where
        T: Clone,
    {
        let change = self
            .nodes
            .set_node(cx.tables, &mut self.scheduler, node, action, admin, oper, avail)?;

        if matches!(action, NodeSetAction::Swact | NodeSetAction::SwactForce) {
            let mut leaders: Vec<String> = cx
                .tables
                .domains
                .iter()
                .filter(|d| !should_schedule(d, cx.settings))
                .map(|d| d.leader.clone())
                .filter(|l| !l.is_empty() && *l != cx.settings.local_node)
                .collect();
            leaders.sort();
            leaders.dedup();
            for leader in leaders {
                self.swact_requests += 1;
                let swact = NodeSwact {
                    request_id: self.swact_requests,
                    node_name: node.to_string(),
                    force: action == NodeSetAction::SwactForce,
                };
                info!(%node, %leader, request = swact.request_id, "swact forwarded to leader");
                cx.out.send(Some(&leader), Payload::NodeSwact(swact));
            }
        }

        if let Some(change) = &change {
            if change.node == cx.settings.local_node {
                let uptime = self.uptime_secs(cx);
                cx.out.send(None, Payload::NodeUpdate(change.to_update(uptime)));
            }
        }
        Ok(change)
    }

    /// One scheduler pass over every domain this node schedules, then a
    /// refresh of derived node schedule states.
    pub fn run_scheduler<T>(&mut self, cx: &mut DomainContext<'_, T>) -> AvailResult<()> {
        for name in cx.tables.domains.keys() {
            let Some(domain) = cx.tables.domains.read(&name) else {
                continue;
            };
            if !should_schedule(domain, cx.settings) {
                continue;
            }
            if let Err(e) = self.scheduler.schedule(cx, &name) {
                warn!(domain = %name, error = %e, "scheduler pass failed");
            }
        }

        for name in cx.tables.nodes.keys() {
            let derived = node_schedule_state(cx.tables, &name);
            let prev = cx.tables.nodes.get(&name)?.schedule_state;
            if prev != derived {
                cx.tables.nodes.update(&name, |n| n.schedule_state = derived)?;
                info!(node = %name, from = %prev, to = %derived, "node schedule state change");
            }
        }
        Ok(())
    }
}
