//! Active/standby scheduling for a service domain.
//!
//! A pass works on a copy of the domain's assignments:
//!
//! 1. preselect filters sort every assignment into a scheduling list
//! 2. weights rank the candidates of each member
//! 3. swact and disable scheduling states are cleared once settled
//! 4. actives are selected per member against `n_active`
//! 5. standbys are selected per member against `m_standby`
//! 6. changed rows are written back and requests emitted
//!
//! Counts are taken over the actual group state; selection walks the
//! scheduling lists in weight order.

use std::cmp::Reverse;

use avail_core::*;
use avail_msg::message::MemberRequest;
use avail_msg::Payload;
use avail_state::{AssignmentRecord, DomainMemberRecord, DomainRecord, Tables};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::context::{DomainContext, DomainSettings, GroupRequest};

/// Member-request flag asking the owner to recover a failed group.
pub const ACTION_FLAG_RECOVER: u64 = 0x1;

const WEIGHT_SETTLED: i32 = 50;
const WEIGHT_UNSETTLED: i32 = 25;
const WEIGHT_PER_ORDINAL: i32 = 100;

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct FilterCounts {
    pub active: usize,
    pub go_active: usize,
    pub standby: usize,
    pub go_standby: usize,
    pub disabling: usize,
    pub disabled: usize,
    pub failed: usize,
    pub fatal: usize,
    pub unavailable: usize,
    pub total: usize,
}

impl FilterCounts {
    fn tally(rows: &[AssignmentRecord]) -> Self {
        let mut counts = Self {
            total: rows.len(),
            ..Self::default()
        };
        for row in rows {
            match row.sched_list {
                SchedulingList::Active => counts.active += 1,
                SchedulingList::GoActive => counts.go_active += 1,
                SchedulingList::Standby => counts.standby += 1,
                SchedulingList::GoStandby => counts.go_standby += 1,
                SchedulingList::Disabling => counts.disabling += 1,
                SchedulingList::Disabled => counts.disabled += 1,
                SchedulingList::Failed => counts.failed += 1,
                SchedulingList::Fatal => counts.fatal += 1,
                SchedulingList::Unavailable => counts.unavailable += 1,
                SchedulingList::Unknown => {}
            }
        }
        counts
    }
}

/// Whether this node schedules `domain`: as its leader, or always when no
/// peer controller is provisioned.
pub fn should_schedule(domain: &DomainRecord, settings: &DomainSettings) -> bool {
    domain.enabled && (domain.state == DomainState::Leader || !settings.has_peer)
}

/// Why a member cannot be scheduled, if it cannot.
fn malformed(tables: &Tables, member: &DomainMemberRecord) -> Option<&'static str> {
    if !tables.service_groups.contains(&member.group) {
        return Some("unknown service group");
    }
    match member.redundancy_model {
        RedundancyModel::Unknown => Some("unknown redundancy model"),
        RedundancyModel::None if member.m_standby > 0 => Some("standby count on a none redundancy model"),
        RedundancyModel::N | RedundancyModel::NPlusM | RedundancyModel::NTo1 | RedundancyModel::NToN
            if member.n_active == 0 =>
        {
            Some("redundancy model without actives")
        }
        _ => None,
    }
}

fn is_swacting(state: SchedulingState) -> bool {
    matches!(state, SchedulingState::Swact | SchedulingState::SwactForce)
}

fn in_states(row: &AssignmentRecord, states: &[GroupState]) -> bool {
    states.contains(&row.state)
}

#[derive(Debug, Default)]
pub struct Scheduler;

impl Scheduler {
    pub fn new() -> Self {
        Self
    }

    /// Run one scheduling pass over `domain`.
    pub fn schedule<T>(&mut self, cx: &mut DomainContext<'_, T>, domain: &str) -> AvailResult<FilterCounts> {
        let domain_row = cx.tables.domains.get(domain)?.clone();

        let mut members = Vec::new();
        for member in cx.tables.domain_members_of(domain) {
            match malformed(cx.tables, &member) {
                Some(reason) => {
                    warn!(domain = %domain, group = %member.group, reason, "member skipped by scheduler");
                }
                None => members.push(member),
            }
        }

        let original: Vec<AssignmentRecord> = cx
            .tables
            .domain_assignments(domain)
            .into_iter()
            .filter(|a| members.iter().any(|m| m.group == a.group))
            .collect();
        let mut rows = original.clone();

        for row in rows.iter_mut() {
            let Some(member) = members.iter().find(|m| m.group == row.group) else {
                continue;
            };
            row.sched_list = preselect(cx.tables, cx.settings, member, row);
        }
        for member in &members {
            filter_health(member, &mut rows);
        }
        debug!(domain = %domain, counts = ?FilterCounts::tally(&rows), "preselect");

        for row in rows.iter_mut() {
            row.sched_weight = weight(cx.tables, row);
        }

        let removing_activity = update_sched_states(domain, &mut rows);

        for member in &members {
            let order = ranked(&rows, &member.group);
            if removing_activity {
                debug!(domain = %domain, group = %member.group, "removing activity, active selection delayed");
            } else {
                select_active(&domain_row, member, &mut rows, &order);
            }
            select_standby(member, &mut rows, &order);
        }

        let counts = FilterCounts::tally(&rows);
        debug!(domain = %domain, counts = ?counts, "post select");
        self.apply(cx, &original, rows)?;
        Ok(counts)
    }

    /// Mark every N+M assignment on `node` to swact away.
    pub fn swact_node(&mut self, tables: &mut Tables, node: &str, force: bool) -> AvailResult<usize> {
        let sched_state = if force {
            SchedulingState::SwactForce
        } else {
            SchedulingState::Swact
        };
        let mut total = 0;
        for row in tables.node_assignments(node) {
            let member_key = format!("{}/{}", row.domain, row.group);
            let Some(member) = tables.domain_members.read(&member_key) else {
                warn!(domain = %row.domain, group = %row.group, "swact of an assignment without a member");
                continue;
            };
            if member.redundancy_model != RedundancyModel::NPlusM {
                debug!(domain = %row.domain, group = %row.group, model = %member.redundancy_model, "swact skipped, no standby support");
                continue;
            }
            let key = AssignmentRecord::key(&row.domain, &row.node, &row.group);
            if tables.assignments.update(&key, |a| a.sched_state = sched_state)? {
                total += 1;
            }
        }
        info!(%node, force, total, "swact requested");
        Ok(total)
    }

    fn apply<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        original: &[AssignmentRecord],
        rows: Vec<AssignmentRecord>,
    ) -> AvailResult<()> {
        let local = cx.settings.local_node.clone();
        for (before, mut row) in original.iter().zip(rows) {
            let (action, flags) = match row.sched_list {
                SchedulingList::Active | SchedulingList::GoActive => {
                    row.desired_state = GroupState::Active;
                    (Some(GroupAction::GoActive), 0)
                }
                SchedulingList::Standby | SchedulingList::GoStandby => {
                    row.desired_state = GroupState::Standby;
                    (Some(GroupAction::GoStandby), 0)
                }
                SchedulingList::Disabling | SchedulingList::Disabled | SchedulingList::Unavailable => {
                    row.desired_state = GroupState::Disabled;
                    (Some(GroupAction::Disable), 0)
                }
                SchedulingList::Failed => (Some(GroupAction::Audit), ACTION_FLAG_RECOVER),
                SchedulingList::Fatal | SchedulingList::Unknown => (None, 0),
            };

            let key = AssignmentRecord::key(&row.domain, &row.node, &row.group);
            let changed = row.desired_state != before.desired_state
                || row.sched_list != before.sched_list
                || row.sched_state != before.sched_state
                || row.sched_weight != before.sched_weight;
            if changed {
                let next = row.clone();
                cx.tables.assignments.update(&key, |a| {
                    a.desired_state = next.desired_state;
                    a.sched_list = next.sched_list;
                    a.sched_state = next.sched_state;
                    a.sched_weight = next.sched_weight;
                })?;
            }

            let Some(action) = action else {
                continue;
            };
            let desired_changed = row.desired_state != before.desired_state;
            let idle = !matches!(
                row.state,
                GroupState::GoActive | GroupState::GoStandby | GroupState::Disabling
            );
            let redrive = row.state != row.desired_state && idle;
            if !(desired_changed || redrive || action == GroupAction::Audit) {
                continue;
            }
            if desired_changed {
                info!(domain = %row.domain, node = %row.node, group = %row.group, from = %before.desired_state, to = %row.desired_state, list = %row.sched_list, "assignment scheduled");
            }

            if row.node == local {
                cx.out.group_requests.push(GroupRequest {
                    domain: row.domain.clone(),
                    group: row.group.clone(),
                    action,
                });
            } else {
                let request = MemberRequest {
                    domain: row.domain.clone(),
                    node: local.clone(),
                    member_node: row.node.clone(),
                    member_id: row.id,
                    member_name: row.group.clone(),
                    action,
                    action_flags: flags,
                };
                cx.out.send(Some(&row.node), Payload::MemberRequest(request));
            }
        }
        Ok(())
    }
}

// ── Preselect ──────────────────────────────────────────────────────

fn preselect(
    tables: &Tables,
    settings: &DomainSettings,
    member: &DomainMemberRecord,
    row: &AssignmentRecord,
) -> SchedulingList {
    let Some(node) = tables.nodes.read(&row.node) else {
        return SchedulingList::Unavailable;
    };
    if !node.is_ready() || node.admin == AdminState::Locked {
        return SchedulingList::Unavailable;
    }
    if row.node != settings.local_node {
        let full = tables
            .neighbors
            .read(&format!("{}/{}", row.domain, row.node))
            .is_some_and(|n| n.state == NeighborState::Full);
        if !full {
            return SchedulingList::Unavailable;
        }
    }

    match row.sched_state {
        SchedulingState::Disable => {
            return if row.status == GroupStatus::Failed {
                SchedulingList::Failed
            } else {
                SchedulingList::Unavailable
            };
        }
        SchedulingState::Swact | SchedulingState::SwactForce => {
            return match row.state {
                GroupState::Active | GroupState::GoActive if member.m_standby > 0 => SchedulingList::GoStandby,
                GroupState::Standby => SchedulingList::Standby,
                _ => SchedulingList::Disabled,
            };
        }
        SchedulingState::None => {}
    }

    if row.status == GroupStatus::Failed {
        return if row.condition == GroupCondition::FatalFailure {
            SchedulingList::Fatal
        } else {
            SchedulingList::Failed
        };
    }

    match (row.desired_state, row.state) {
        (GroupState::Active, GroupState::Active) => SchedulingList::Active,
        (GroupState::Active, _) => SchedulingList::GoActive,
        (GroupState::Standby, GroupState::Standby) => SchedulingList::Standby,
        (GroupState::Standby, _) => SchedulingList::GoStandby,
        (GroupState::Disabled, GroupState::Disabled) => SchedulingList::Disabled,
        (GroupState::Disabled, _) => SchedulingList::Disabling,
        _ => SchedulingList::Disabled,
    }
}

/// A failed assignment with enough healthy alternatives is taken out of
/// service so activity can move elsewhere.
fn filter_health(member: &DomainMemberRecord, rows: &mut [AssignmentRecord]) {
    let healthy = rows
        .iter()
        .filter(|r| r.group == member.group)
        .filter(|r| {
            !matches!(
                r.sched_list,
                SchedulingList::Failed | SchedulingList::Fatal | SchedulingList::Unavailable
            )
        })
        .count() as u32;
    let needed = member.n_active.max(1);
    for row in rows
        .iter_mut()
        .filter(|r| r.group == member.group && r.sched_list == SchedulingList::Failed)
    {
        if healthy >= needed && row.sched_state == SchedulingState::None {
            debug!(domain = %row.domain, node = %row.node, group = %row.group, healthy, "failed assignment disabled in favor of healthy peers");
            row.sched_state = SchedulingState::Disable;
            row.sched_list = SchedulingList::Unavailable;
        }
    }
}

// ── Weights ────────────────────────────────────────────────────────

fn weight(tables: &Tables, row: &AssignmentRecord) -> i32 {
    let Some(node) = tables.nodes.read(&row.node) else {
        return SERVICE_DOMAIN_WEIGHT_UNSELECTABLE_ACTIVE;
    };
    if node.avail == AvailStatus::Failed {
        return SERVICE_DOMAIN_WEIGHT_UNSELECTABLE_ACTIVE;
    }
    let mut weight = if row.state == row.desired_state {
        WEIGHT_SETTLED
    } else {
        WEIGHT_UNSETTLED
    };
    if !is_swacting(row.sched_state) {
        weight += WEIGHT_PER_ORDINAL * node.ordinal as i32;
    }
    weight
}

/// Indices of `group`'s rows, best candidate first.
fn ranked(rows: &[AssignmentRecord], group: &str) -> Vec<usize> {
    let mut order: Vec<usize> = (0..rows.len()).filter(|&i| rows[i].group == group).collect();
    order.sort_by(|&a, &b| {
        (Reverse(rows[a].sched_weight), &rows[a].node).cmp(&(Reverse(rows[b].sched_weight), &rows[b].node))
    });
    order
}

// ── Scheduling states ──────────────────────────────────────────────

/// Clear swact and disable marks once nothing is still acting on them.
/// Returns whether activity is still being removed from a swacting node.
fn update_sched_states(domain: &str, rows: &mut [AssignmentRecord]) -> bool {
    let swacting = rows
        .iter()
        .filter(|r| is_swacting(r.sched_state))
        .filter(|r| {
            let settled_standby = r.desired_state == GroupState::Standby
                && matches!(r.state, GroupState::Standby | GroupState::Disabled);
            let settled_disabled = r.desired_state == GroupState::Disabled && r.state == GroupState::Disabled;
            !(settled_standby || settled_disabled)
        })
        .count();
    if swacting == 0 {
        let mut cleared = 0;
        for row in rows.iter_mut().filter(|r| is_swacting(r.sched_state)) {
            row.sched_state = SchedulingState::None;
            cleared += 1;
        }
        if cleared > 0 {
            info!(%domain, cleared, "swact scheduling states cleared");
        }
    }

    let disabling = rows
        .iter()
        .filter(|r| r.sched_state == SchedulingState::Disable)
        .filter(|r| !(r.desired_state == GroupState::Disabled && r.state == GroupState::Disabled))
        .count();
    if disabling == 0 {
        let mut cleared = 0;
        for row in rows
            .iter_mut()
            .filter(|r| r.sched_state == SchedulingState::Disable)
        {
            row.sched_state = SchedulingState::None;
            cleared += 1;
        }
        if cleared > 0 {
            info!(%domain, cleared, "disable scheduling states cleared");
        }
    }

    swacting > 0
}

// ── Selection ──────────────────────────────────────────────────────

fn select_active(domain: &DomainRecord, member: &DomainMemberRecord, rows: &mut [AssignmentRecord], order: &[usize]) {
    let transitioning = order
        .iter()
        .filter(|&&i| in_states(&rows[i], &[GroupState::GoStandby, GroupState::Disabling]))
        .count();
    if transitioning > 0 {
        debug!(domain = %domain.name, group = %member.group, transitioning, "members transitioning to standby or disabled");
        return;
    }

    let count = order
        .iter()
        .filter(|&&i| in_states(&rows[i], &[GroupState::Active, GroupState::GoActive]))
        .count() as u32;
    let n_active = member.n_active;

    if count > n_active && domain.split_brain_recovery == SplitBrainRecovery::DisableAllActive {
        warn!(domain = %domain.name, group = %member.group, count, n_active, "too many actives, disabling all to recover");
        for &i in order {
            if in_states(&rows[i], &[GroupState::Active, GroupState::GoActive]) {
                rows[i].sched_state = SchedulingState::Disable;
                rows[i].sched_list = SchedulingList::Disabling;
            }
        }
    } else if count > n_active {
        warn!(domain = %domain.name, group = %member.group, count, n_active, "too many actives, keeping the best");
        let mut current = 0;
        for list in [SchedulingList::GoActive, SchedulingList::Active] {
            for i in on_list(rows, order, list) {
                if rows[i].sched_weight == SERVICE_DOMAIN_WEIGHT_UNSELECTABLE_ACTIVE || current >= n_active {
                    rows[i].sched_list = SchedulingList::GoStandby;
                } else {
                    current += 1;
                }
            }
        }
    } else if count < n_active {
        let mut current = count;
        for list in [SchedulingList::Standby, SchedulingList::Disabled] {
            for i in on_list(rows, order, list) {
                if current >= n_active {
                    break;
                }
                if rows[i].sched_weight == SERVICE_DOMAIN_WEIGHT_UNSELECTABLE_ACTIVE {
                    continue;
                }
                rows[i].sched_list = SchedulingList::GoActive;
                current += 1;
            }
        }
    }
}

/// Rows of `order` currently on `list`, captured before any are moved.
fn on_list(rows: &[AssignmentRecord], order: &[usize], list: SchedulingList) -> Vec<usize> {
    order.iter().copied().filter(|&i| rows[i].sched_list == list).collect()
}

fn select_standby(member: &DomainMemberRecord, rows: &mut [AssignmentRecord], order: &[usize]) {
    let count = order
        .iter()
        .filter(|&&i| in_states(&rows[i], &[GroupState::Standby, GroupState::GoStandby]))
        .count() as u32;
    let m_standby = member.m_standby;

    if count > m_standby {
        let mut current = 0;
        for i in on_list(rows, order, SchedulingList::Standby) {
            if current < m_standby && !is_swacting(rows[i].sched_state) {
                current += 1;
            } else {
                rows[i].sched_list = SchedulingList::Disabling;
            }
        }
    } else if count < m_standby {
        let mut current = count;
        for i in on_list(rows, order, SchedulingList::Disabled) {
            if current >= m_standby {
                break;
            }
            rows[i].sched_list = SchedulingList::GoStandby;
            current += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use avail_state::{NeighborRecord, NodeRecord, ServiceGroupRecord};

    use super::*;
    use crate::context::{DomainOutput, DomainTimer};

    struct Harness {
        tables: Tables,
        timers: TimerRegistry<DomainTimer>,
        settings: DomainSettings,
        out: DomainOutput,
        scheduler: Scheduler,
    }

    impl Harness {
        /// Two controllers, `controller-0` local, one N+M 1+1 member.
        fn new() -> Self {
            let mut tables = Tables::in_memory();
            tables.nodes.insert(NodeRecord::new("controller-0", 1)).unwrap();
            tables.nodes.insert(NodeRecord::new("controller-1", 2)).unwrap();
            let mut domain = DomainRecord::new("controller");
            domain.state = DomainState::Leader;
            tables.domains.insert(domain).unwrap();
            tables.service_groups.insert(ServiceGroupRecord::new("oam")).unwrap();
            tables
                .domain_members
                .insert(DomainMemberRecord {
                    id: 0,
                    domain: "controller".into(),
                    group: "oam".into(),
                    redundancy_model: RedundancyModel::NPlusM,
                    n_active: 1,
                    m_standby: 1,
                    aggregate: None,
                })
                .unwrap();
            let mut neighbor = NeighborRecord::new("controller", "controller-1");
            neighbor.state = NeighborState::Full;
            tables.neighbors.insert(neighbor).unwrap();
            for node in ["controller-0", "controller-1"] {
                tables
                    .assignments
                    .insert(AssignmentRecord::new("controller", node, "oam"))
                    .unwrap();
            }
            Self {
                tables,
                timers: TimerRegistry::new(),
                settings: DomainSettings::new("controller-0"),
                out: DomainOutput::default(),
                scheduler: Scheduler::new(),
            }
        }

        fn pass(&mut self) -> FilterCounts {
            let mut cx = DomainContext::new(&mut self.tables, &mut self.timers, &self.settings, &mut self.out);
            self.scheduler.schedule(&mut cx, "controller").unwrap()
        }

        fn row(&self, node: &str) -> AssignmentRecord {
            self.tables
                .assignments
                .get(&AssignmentRecord::key("controller", node, "oam"))
                .unwrap()
                .clone()
        }

        /// Report a group state as if the owner had finished transitioning.
        fn settle(&mut self, node: &str, state: GroupState) {
            self.tables
                .assignments
                .update(&AssignmentRecord::key("controller", node, "oam"), |a| a.state = state)
                .unwrap();
        }

        fn settle_all(&mut self) {
            for node in ["controller-0", "controller-1"] {
                let desired = self.row(node).desired_state;
                self.settle(node, desired);
            }
        }
    }

    fn standby_row(node: &str, weight: i32) -> AssignmentRecord {
        let mut row = AssignmentRecord::new("controller", node, "oam");
        row.state = GroupState::Standby;
        row.sched_list = SchedulingList::Standby;
        row.sched_weight = weight;
        row
    }

    #[test]
    fn surplus_standbys_beyond_m_are_disabled_in_rank_order() {
        let member = DomainMemberRecord {
            id: 0,
            domain: "controller".into(),
            group: "oam".into(),
            redundancy_model: RedundancyModel::NPlusM,
            n_active: 1,
            m_standby: 1,
            aggregate: None,
        };
        let mut rows = vec![
            standby_row("controller-0", 1),
            standby_row("controller-1", 3),
            standby_row("controller-2", 2),
        ];
        let order = [1, 2, 0];
        select_standby(&member, &mut rows, &order);
        assert_eq!(rows[1].sched_list, SchedulingList::Standby);
        assert_eq!(rows[2].sched_list, SchedulingList::Disabling);
        assert_eq!(rows[0].sched_list, SchedulingList::Disabling);
    }

    #[test]
    fn first_pass_selects_one_active_and_one_standby() {
        let mut h = Harness::new();
        h.pass();
        let actives: Vec<_> = ["controller-0", "controller-1"]
            .into_iter()
            .filter(|n| h.row(n).desired_state == GroupState::Active)
            .collect();
        assert_eq!(actives, vec!["controller-1"]);
        assert_eq!(h.row("controller-0").desired_state, GroupState::Standby);

        // Local row becomes a group request, remote row a member request.
        assert_eq!(h.out.group_requests.len(), 1);
        assert_eq!(h.out.group_requests[0].action, GroupAction::GoStandby);
        assert!(h.out.messages.iter().any(|m| matches!(
            &m.payload,
            Payload::MemberRequest(r) if r.member_node == "controller-1" && r.action == GroupAction::GoActive
        )));
    }

    #[test]
    fn settled_pass_is_quiet() {
        let mut h = Harness::new();
        h.pass();
        h.settle_all();
        h.out = DomainOutput::default();
        let counts = h.pass();
        assert_eq!(counts.active, 1);
        assert_eq!(counts.standby, 1);
        assert!(h.out.is_empty());
    }

    #[test]
    fn never_more_actives_than_n_active() {
        let mut h = Harness::new();
        for round in 0..6 {
            h.pass();
            h.settle_all();
            let active = ["controller-0", "controller-1"]
                .into_iter()
                .filter(|n| h.row(n).state == GroupState::Active)
                .count();
            assert!(active <= 1, "round {round}");
        }
    }

    #[test]
    fn unavailable_neighbor_is_never_selected() {
        let mut h = Harness::new();
        h.tables
            .neighbors
            .update("controller/controller-1", |n| n.state = NeighborState::ExchangeStart)
            .unwrap();
        h.pass();
        assert_eq!(h.row("controller-1").sched_list, SchedulingList::Unavailable);
        assert_eq!(h.row("controller-0").desired_state, GroupState::Active);
    }

    #[test]
    fn failed_node_is_unselectable() {
        let mut h = Harness::new();
        h.tables
            .nodes
            .update("controller-1", |n| n.avail = AvailStatus::Failed)
            .unwrap();
        h.pass();
        assert_eq!(h.row("controller-1").sched_weight, SERVICE_DOMAIN_WEIGHT_UNSELECTABLE_ACTIVE);
        assert_eq!(h.row("controller-0").desired_state, GroupState::Active);
        assert_eq!(h.row("controller-1").desired_state, GroupState::Standby);
    }

    #[test]
    fn split_brain_disables_every_active() {
        let mut h = Harness::new();
        for node in ["controller-0", "controller-1"] {
            h.tables
                .assignments
                .update(&AssignmentRecord::key("controller", node, "oam"), |a| {
                    a.desired_state = GroupState::Active;
                    a.state = GroupState::Active;
                })
                .unwrap();
        }
        h.pass();
        for node in ["controller-0", "controller-1"] {
            let row = h.row(node);
            assert_eq!(row.sched_state, SchedulingState::Disable, "{node}");
            assert_eq!(row.desired_state, GroupState::Disabled, "{node}");
        }
    }

    #[test]
    fn select_best_active_keeps_the_heaviest() {
        let mut h = Harness::new();
        h.tables
            .domains
            .update("controller", |d| d.split_brain_recovery = SplitBrainRecovery::SelectBestActive)
            .unwrap();
        for node in ["controller-0", "controller-1"] {
            h.tables
                .assignments
                .update(&AssignmentRecord::key("controller", node, "oam"), |a| {
                    a.desired_state = GroupState::Active;
                    a.state = GroupState::Active;
                })
                .unwrap();
        }
        h.pass();
        assert_eq!(h.row("controller-1").desired_state, GroupState::Active);
        assert_eq!(h.row("controller-0").desired_state, GroupState::Standby);
    }

    #[test]
    fn swact_moves_activity_to_the_standby() {
        let mut h = Harness::new();
        h.pass();
        h.settle_all();
        assert_eq!(h.row("controller-1").state, GroupState::Active);

        let marked = h.scheduler.swact_node(&mut h.tables, "controller-1", false).unwrap();
        assert_eq!(marked, 1);

        h.pass();
        assert_eq!(h.row("controller-1").desired_state, GroupState::Standby);
        assert_eq!(h.row("controller-0").desired_state, GroupState::Standby);

        h.settle("controller-1", GroupState::Standby);
        h.pass();
        assert_eq!(h.row("controller-1").sched_state, SchedulingState::None);
        assert_eq!(h.row("controller-0").desired_state, GroupState::Active);
    }

    #[test]
    fn swact_ignores_non_standby_models() {
        let mut h = Harness::new();
        h.tables
            .domain_members
            .update("controller/oam", |m| {
                m.redundancy_model = RedundancyModel::N;
                m.m_standby = 0;
            })
            .unwrap();
        assert_eq!(h.scheduler.swact_node(&mut h.tables, "controller-1", true).unwrap(), 0);
    }

    #[test]
    fn malformed_member_is_skipped() {
        let mut h = Harness::new();
        h.tables
            .domain_members
            .update("controller/oam", |m| m.n_active = 0)
            .unwrap();
        let counts = h.pass();
        assert_eq!(counts.total, 0);
        assert_eq!(h.row("controller-0").desired_state, GroupState::Initial);
    }

    #[test]
    fn failed_active_hands_over_to_healthy_peer() {
        let mut h = Harness::new();
        h.pass();
        h.settle_all();
        h.tables
            .assignments
            .update(&AssignmentRecord::key("controller", "controller-1", "oam"), |a| {
                a.status = GroupStatus::Failed;
                a.condition = GroupCondition::ActionFailure;
            })
            .unwrap();
        h.pass();
        let failed = h.row("controller-1");
        assert_eq!(failed.sched_state, SchedulingState::Disable);
        assert_eq!(failed.desired_state, GroupState::Disabled);
    }

    #[test]
    fn fatal_assignment_gets_no_request() {
        let mut h = Harness::new();
        h.tables
            .nodes
            .update("controller-1", |n| n.admin = AdminState::Locked)
            .unwrap();
        h.tables
            .assignments
            .update(&AssignmentRecord::key("controller", "controller-0", "oam"), |a| {
                a.status = GroupStatus::Failed;
                a.condition = GroupCondition::FatalFailure;
            })
            .unwrap();
        let counts = h.pass();
        assert_eq!(counts.fatal, 1);
        assert!(h.out.group_requests.is_empty());
    }

    #[test]
    fn simplex_schedules_without_leadership() {
        let mut settings = DomainSettings::new("controller-0");
        settings.has_peer = false;
        let domain = DomainRecord::new("controller");
        assert!(should_schedule(&domain, &settings));
        settings.has_peer = true;
        assert!(!should_schedule(&domain, &settings));
    }
}
