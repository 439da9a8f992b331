//! Neighbor adjacency and assignment exchange.
//!
//! A hello brings a neighbor up into `exchange-start`. One side, chosen by a
//! total order both sides evaluate identically, is the exchange master: it
//! picks the sequence number and sends the first record. The exchange itself
//! is lockstep, one assignment per message, each acknowledging the last
//! record received. Once both sides have sent and received a final record
//! the neighbor is `full` and further changes travel as member updates.

use std::cmp::Reverse;
use std::time::Duration;

use avail_core::*;
use avail_msg::message::{DomainHello, Exchange, ExchangeStart, MemberRequest, MemberUpdate};
use avail_msg::Payload;
use avail_state::{AssignmentRecord, NeighborRecord, Record};
use tracing::{debug, info, warn};

use crate::context::{epoch_ms, DomainContext, DomainTimer, GroupRequest};

/// Multiplier applied to `exchange_interval` while waiting on the peer.
const EXCHANGE_TIMEOUT_FACTOR: u32 = 4;

fn neighbor_key(domain: &str, node: &str) -> String {
    format!("{domain}/{node}")
}

/// The fields the exchange-master order is computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSide<'a> {
    pub designation: Designation,
    pub generation: u32,
    pub priority: u32,
    pub avail: AvailStatus,
    pub name: &'a str,
}

impl ExchangeSide<'_> {
    fn rank(&self) -> (bool, u32, u32, i32, Reverse<&str>) {
        (
            self.designation == Designation::Leader,
            self.generation,
            self.priority,
            self.avail.weight(),
            Reverse(self.name),
        )
    }
}

/// Whether `local` masters the exchange with `peer`. Exactly one of
/// `is_exchange_master(a, b)` and `is_exchange_master(b, a)` holds for
/// distinct names.
pub fn is_exchange_master(local: &ExchangeSide<'_>, peer: &ExchangeSide<'_>) -> bool {
    local.rank() > peer.rank()
}

/// Desired group state implied by a requested action.
fn desired_for(action: GroupAction) -> Option<GroupState> {
    match action {
        GroupAction::GoActive => Some(GroupState::Active),
        GroupAction::GoStandby => Some(GroupState::Standby),
        GroupAction::Disable => Some(GroupState::Disabled),
        GroupAction::Audit => None,
    }
}

#[derive(Debug, Default)]
pub struct NeighborFsm;

impl NeighborFsm {
    pub fn new() -> Self {
        Self
    }

    // ── Inputs ────────────────────────────────────────────────────

    pub fn hello_received<T>(&mut self, cx: &mut DomainContext<'_, T>, hello: &DomainHello) -> AvailResult<()>
    where
        T: From<DomainTimer> + Clone,
    {
        if hello.node == cx.settings.local_node {
            return Ok(());
        }
        if !cx.tables.domains.contains(&hello.domain) {
            debug!(domain = %hello.domain, from = %hello.node, "hello for unknown domain");
            return Ok(());
        }
        let key = neighbor_key(&hello.domain, &hello.node);
        if !cx.tables.neighbors.contains(&key) {
            info!(domain = %hello.domain, node = %hello.node, "neighbor discovered");
            cx.tables
                .neighbors
                .insert(NeighborRecord::new(&hello.domain, &hello.node))?;
        }
        cx.tables.neighbors.update(&key, |n| {
            n.orchestration = hello.orchestration;
            n.designation = hello.designation;
            n.generation = hello.generation;
            n.priority = hello.priority;
            n.avail = hello.avail;
            n.leader = hello.leader.clone();
            n.hello_interval_ms = u64::from(hello.hello_interval_ms);
            n.dead_interval_ms = u64::from(hello.dead_interval_ms);
            n.wait_interval_ms = u64::from(hello.wait_interval_ms);
            n.exchange_interval_ms = u64::from(hello.exchange_interval_ms);
        })?;
        self.refresh_dead_timer(cx, &key)?;

        if cx.tables.neighbors.get(&key)?.state == NeighborState::Down {
            self.enter(cx, &key, NeighborState::ExchangeStart)?;
        }
        Ok(())
    }

    pub fn exchange_start_received<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        msg: &ExchangeStart,
    ) -> AvailResult<()>
    where
        T: From<DomainTimer> + Clone,
    {
        if msg.exchange_node != cx.settings.local_node {
            return Ok(());
        }
        let key = neighbor_key(&msg.domain, &msg.node);
        let Some(n) = cx.tables.neighbors.read(&key).cloned() else {
            debug!(domain = %msg.domain, from = %msg.node, "exchange-start before hello");
            return Ok(());
        };

        match n.state {
            NeighborState::ExchangeStart => {
                let master = self.is_master(cx, &n);
                if master != n.exchange_master {
                    cx.tables.neighbors.update(&key, |r| r.exchange_master = master)?;
                }
                if master {
                    if msg.exchange_seq == n.exchange_seq {
                        self.enter(cx, &key, NeighborState::Exchange)?;
                    } else {
                        debug!(domain = %msg.domain, node = %msg.node, ours = n.exchange_seq, theirs = msg.exchange_seq, "exchange-start seq mismatch");
                        self.send_exchange_start(cx, &key, true)?;
                    }
                } else {
                    cx.tables.neighbors.update(&key, |r| r.exchange_seq = msg.exchange_seq)?;
                    self.send_exchange_start(cx, &key, false)?;
                    self.enter(cx, &key, NeighborState::Exchange)?;
                }
            }
            NeighborState::Exchange | NeighborState::Full if msg.exchange_seq == n.exchange_seq => {
                let nothing_received = n.exchange_last_recvd_id == 0 && !n.exchange_recvd_final;
                if n.state == NeighborState::Exchange && !n.exchange_master && nothing_received {
                    self.send_exchange_start(cx, &key, false)?;
                } else {
                    debug!(domain = %msg.domain, node = %msg.node, seq = msg.exchange_seq, "duplicate exchange-start");
                }
            }
            NeighborState::Exchange | NeighborState::Full => {
                info!(domain = %msg.domain, node = %msg.node, seq = msg.exchange_seq, "peer restarted exchange");
                self.enter(cx, &key, NeighborState::ExchangeStart)?;
                return self.exchange_start_received(cx, msg);
            }
            state => {
                debug!(domain = %msg.domain, node = %msg.node, %state, "exchange-start ignored");
            }
        }
        Ok(())
    }

    pub fn exchange_received<T>(&mut self, cx: &mut DomainContext<'_, T>, msg: &Exchange) -> AvailResult<()>
    where
        T: From<DomainTimer> + Clone,
    {
        if msg.exchange_node != cx.settings.local_node {
            return Ok(());
        }
        let key = neighbor_key(&msg.domain, &msg.node);
        let Some(n) = cx.tables.neighbors.read(&key).cloned() else {
            return Ok(());
        };
        if n.state != NeighborState::Exchange {
            debug!(domain = %msg.domain, node = %msg.node, state = %n.state, "exchange outside exchange state");
            return Ok(());
        }

        let has_record = !msg.member_name.is_empty();
        let reject = if msg.exchange_seq != n.exchange_seq {
            Some("sequence mismatch")
        } else if msg.last_received_member_id != n.exchange_last_sent_id {
            Some("acknowledged id mismatch")
        } else if has_record && msg.member_id <= n.exchange_last_recvd_id {
            Some("member id not increasing")
        } else if has_record
            && msg
                .member_id
                .checked_sub(n.exchange_last_recvd_id)
                .is_none_or(|gap| gap > MSG_MAX_SEQ_DELTA as i64)
        {
            Some("member id gap too large")
        } else {
            None
        };
        if let Some(reason) = reject {
            warn!(domain = %msg.domain, node = %msg.node, reason, "exchange rejected");
            return self.enter(cx, &key, NeighborState::ExchangeStart);
        }

        if has_record {
            let mut row = AssignmentRecord::new(&msg.domain, &msg.node, &msg.member_name);
            row.desired_state = msg.desired_state;
            row.state = msg.state;
            row.status = msg.status;
            row.condition = msg.condition;
            row.health = msg.health;
            row.reason_text = msg.reason_text.clone();
            self.merge_peer_row(cx, row)?;
        }

        let mut timer = n.exchange_timer;
        cx.timers.disarm_slot(&mut timer);
        let timer = Some(cx.timers.arm(
            format!("{key}:exchange"),
            Duration::from_millis(n.exchange_interval_ms) * EXCHANGE_TIMEOUT_FACTOR,
            DomainTimer::Exchange {
                domain: n.domain.clone(),
                node: n.node.clone(),
            },
        )?);
        cx.tables.neighbors.update(&key, |r| {
            if has_record {
                r.exchange_last_recvd_id = msg.member_id;
            }
            r.exchange_recvd_final = !msg.more_members;
            r.exchange_timer = timer;
        })?;

        let n = cx.tables.neighbors.get(&key)?;
        if !(n.exchange_sent_final && n.exchange_recvd_final) {
            self.send_next(cx, &key)?;
        }
        let n = cx.tables.neighbors.get(&key)?;
        if n.exchange_sent_final && n.exchange_recvd_final {
            self.enter(cx, &key, NeighborState::Full)?;
        }
        Ok(())
    }

    /// Apply a peer's assignment change. Returns whether our copy changed.
    pub fn member_update_received<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        msg: &MemberUpdate,
    ) -> AvailResult<bool> {
        let key = neighbor_key(&msg.domain, &msg.node);
        if cx.tables.neighbors.read(&key).map(|n| n.state) != Some(NeighborState::Full) {
            debug!(domain = %msg.domain, from = %msg.node, group = %msg.member_name, "member update from non-full neighbor dropped");
            return Ok(false);
        }
        let mut row = AssignmentRecord::new(&msg.domain, &msg.member_node, &msg.member_name);
        row.desired_state = msg.desired_state;
        row.state = msg.state;
        row.status = msg.status;
        row.condition = msg.condition;
        row.health = msg.health;
        row.reason_text = msg.reason_text.clone();
        self.merge_peer_row(cx, row)
    }

    /// A peer leader asks this node to move one of its groups.
    pub fn member_request_received<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        msg: &MemberRequest,
    ) -> AvailResult<()> {
        let key = neighbor_key(&msg.domain, &msg.node);
        if cx.tables.neighbors.read(&key).map(|n| n.state) != Some(NeighborState::Full) {
            debug!(domain = %msg.domain, from = %msg.node, group = %msg.member_name, "member request from non-full neighbor dropped");
            return Ok(());
        }
        if msg.member_node != cx.settings.local_node {
            debug!(domain = %msg.domain, member_node = %msg.member_node, "member request for another node");
            return Ok(());
        }
        let row_key = AssignmentRecord::key(&msg.domain, &msg.member_node, &msg.member_name);
        if !cx.tables.assignments.contains(&row_key) {
            warn!(domain = %msg.domain, group = %msg.member_name, "member request for unassigned group");
            return Ok(());
        }
        if let Some(desired) = desired_for(msg.action) {
            cx.tables.assignments.update(&row_key, |a| a.desired_state = desired)?;
        }
        info!(domain = %msg.domain, from = %msg.node, group = %msg.member_name, action = %msg.action, "member request");
        cx.out.group_requests.push(GroupRequest {
            domain: msg.domain.clone(),
            group: msg.member_name.clone(),
            action: msg.action,
        });
        Ok(())
    }

    /// Returns the `(domain, node)` of a neighbor whose dead timer expired.
    pub fn timer_fired<T>(
        &mut self,
        cx: &mut DomainContext<'_, T>,
        id: TimerId,
        tag: &DomainTimer,
    ) -> AvailResult<Option<(String, String)>>
    where
        T: From<DomainTimer> + Clone,
    {
        match tag {
            DomainTimer::Dead { domain, node } => {
                let key = neighbor_key(domain, node);
                let Some(n) = cx.tables.neighbors.read(&key) else {
                    return Ok(None);
                };
                if n.dead_timer != Some(id) {
                    debug!(%key, timer = %id, "stale dead timer");
                    return Ok(None);
                }
                cx.tables.neighbors.update(&key, |r| r.dead_timer = None)?;
                warn!(domain = %domain, node = %node, "neighbor dead interval expired");
                self.enter(cx, &key, NeighborState::Down)?;
                Ok(Some((domain.clone(), node.clone())))
            }
            DomainTimer::Exchange { domain, node } => {
                let key = neighbor_key(domain, node);
                let Some(n) = cx.tables.neighbors.read(&key).cloned() else {
                    return Ok(None);
                };
                if n.exchange_timer != Some(id) {
                    debug!(%key, timer = %id, "stale exchange timer");
                    return Ok(None);
                }
                cx.tables.neighbors.update(&key, |r| r.exchange_timer = None)?;
                match n.state {
                    NeighborState::ExchangeStart if n.exchange_master => {
                        self.send_exchange_start(cx, &key, false)?;
                        self.arm_exchange_timer(cx, &key, 1)?;
                    }
                    NeighborState::ExchangeStart => {
                        self.arm_exchange_timer(cx, &key, EXCHANGE_TIMEOUT_FACTOR)?;
                    }
                    NeighborState::Exchange => {
                        warn!(domain = %domain, node = %node, "exchange timed out");
                        self.enter(cx, &key, NeighborState::ExchangeStart)?;
                    }
                    state => debug!(%key, %state, "exchange timer in settled state"),
                }
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Force a neighbor down.
    pub fn down<T>(&mut self, cx: &mut DomainContext<'_, T>, domain: &str, node: &str) -> AvailResult<()>
    where
        T: From<DomainTimer> + Clone,
    {
        let key = neighbor_key(domain, node);
        if cx.tables.neighbors.contains(&key) {
            self.enter(cx, &key, NeighborState::Down)?;
        }
        Ok(())
    }

    /// Send a local assignment to every full neighbor of its domain.
    pub fn push_member_update<T>(
        &self,
        cx: &mut DomainContext<'_, T>,
        assignment: &AssignmentRecord,
    ) -> AvailResult<usize> {
        if assignment.node != cx.settings.local_node {
            return Ok(0);
        }
        let full: Vec<String> = cx
            .tables
            .domain_neighbors(&assignment.domain)
            .into_iter()
            .filter(|n| n.state == NeighborState::Full)
            .map(|n| n.node)
            .collect();
        for node in &full {
            let update = MemberUpdate {
                domain: assignment.domain.clone(),
                node: cx.settings.local_node.clone(),
                member_node: assignment.node.clone(),
                member_id: assignment.id,
                member_name: assignment.group.clone(),
                desired_state: assignment.desired_state,
                state: assignment.state,
                status: assignment.status,
                condition: assignment.condition,
                health: assignment.health,
                reason_text: assignment.reason_text.clone(),
            };
            cx.out.send(Some(node), Payload::MemberUpdate(update));
        }
        Ok(full.len())
    }

    // ── State entry ───────────────────────────────────────────────

    fn enter<T>(&mut self, cx: &mut DomainContext<'_, T>, key: &str, state: NeighborState) -> AvailResult<()>
    where
        T: From<DomainTimer> + Clone,
    {
        let n = cx.tables.neighbors.get(key)?.clone();
        let mut exchange_timer = n.exchange_timer;
        let mut dead_timer = n.dead_timer;
        cx.timers.disarm_slot(&mut exchange_timer);

        let mut master = n.exchange_master;
        let mut seq = n.exchange_seq;
        match state {
            NeighborState::Down => {
                cx.timers.disarm_slot(&mut dead_timer);
                master = false;
            }
            NeighborState::ExchangeStart => {
                master = self.is_master(cx, &n);
                if master {
                    seq = seq.wrapping_add(1);
                }
            }
            _ => {}
        }

        cx.tables.neighbors.update(key, |r| {
            r.state = state;
            r.exchange_master = master;
            r.exchange_seq = seq;
            r.exchange_timer = exchange_timer;
            r.dead_timer = dead_timer;
            if state != NeighborState::Full {
                r.reset_exchange_cursors();
            }
        })?;
        info!(domain = %n.domain, node = %n.node, from = %n.state, to = %state, master, seq, "neighbor state change");

        match state {
            NeighborState::ExchangeStart if master => {
                self.send_exchange_start(cx, key, false)?;
                self.arm_exchange_timer(cx, key, 1)?;
            }
            NeighborState::ExchangeStart => {
                self.arm_exchange_timer(cx, key, EXCHANGE_TIMEOUT_FACTOR)?;
            }
            NeighborState::Exchange => {
                self.arm_exchange_timer(cx, key, EXCHANGE_TIMEOUT_FACTOR)?;
                if master {
                    self.send_next(cx, key)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────

    fn is_master<T>(&self, cx: &DomainContext<'_, T>, n: &NeighborRecord) -> bool {
        let Some(domain) = cx.tables.domains.read(&n.domain) else {
            return false;
        };
        let avail = cx
            .tables
            .nodes
            .read(&cx.settings.local_node)
            .map(|node| node.avail)
            .unwrap_or(AvailStatus::Unknown);
        let local = ExchangeSide {
            designation: domain.designation,
            generation: domain.generation,
            priority: domain.priority,
            avail,
            name: &cx.settings.local_node,
        };
        let peer = ExchangeSide {
            designation: n.designation,
            generation: n.generation,
            priority: n.priority,
            avail: n.avail,
            name: &n.node,
        };
        is_exchange_master(&local, &peer)
    }

    fn refresh_dead_timer<T>(&self, cx: &mut DomainContext<'_, T>, key: &str) -> AvailResult<()>
    where
        T: From<DomainTimer> + Clone,
    {
        let n = cx.tables.neighbors.get(key)?;
        let mut slot = n.dead_timer;
        let (domain, node, interval) = (n.domain.clone(), n.node.clone(), n.dead_interval_ms);
        cx.timers.disarm_slot(&mut slot);
        let id = cx.timers.arm(
            format!("{key}:dead"),
            Duration::from_millis(interval),
            DomainTimer::Dead { domain, node },
        )?;
        cx.tables.neighbors.update(key, |r| r.dead_timer = Some(id))?;
        Ok(())
    }

    fn arm_exchange_timer<T>(&self, cx: &mut DomainContext<'_, T>, key: &str, factor: u32) -> AvailResult<()>
    where
        T: From<DomainTimer> + Clone,
    {
        let n = cx.tables.neighbors.get(key)?;
        let mut slot = n.exchange_timer;
        let (domain, node, interval) = (n.domain.clone(), n.node.clone(), n.exchange_interval_ms);
        cx.timers.disarm_slot(&mut slot);
        let id = cx.timers.arm(
            format!("{key}:exchange"),
            Duration::from_millis(interval) * factor,
            DomainTimer::Exchange { domain, node },
        )?;
        cx.tables.neighbors.update(key, |r| r.exchange_timer = Some(id))?;
        Ok(())
    }

    fn send_exchange_start<T>(&self, cx: &mut DomainContext<'_, T>, key: &str, throttled: bool) -> AvailResult<()> {
        let n = cx.tables.neighbors.get(key)?;
        let now = cx.timers.now();
        if throttled {
            if let Some(last) = n.last_exchange_start_sent {
                if now.saturating_duration_since(last) < cx.settings.min_exchange_start_interval {
                    debug!(%key, "exchange-start resend throttled");
                    return Ok(());
                }
            }
        }
        let msg = ExchangeStart {
            domain: n.domain.clone(),
            node: cx.settings.local_node.clone(),
            exchange_node: n.node.clone(),
            exchange_seq: n.exchange_seq,
        };
        let to = n.node.clone();
        cx.out.send(Some(&to), Payload::ExchangeStart(msg));
        cx.tables
            .neighbors
            .update(key, |r| r.last_exchange_start_sent = Some(now))?;
        Ok(())
    }

    /// Send the next local assignment after the cursor, or an empty final
    /// record when none remain.
    fn send_next<T>(&self, cx: &mut DomainContext<'_, T>, key: &str) -> AvailResult<()> {
        let n = cx.tables.neighbors.get(key)?.clone();
        let local = cx.settings.local_node.clone();
        let mut rows: Vec<AssignmentRecord> = cx
            .tables
            .assignments
            .filter(|a| a.domain == n.domain && a.node == local && a.id > n.exchange_last_sent_id);
        rows.sort_by_key(|a| a.id);

        let mut msg = Exchange {
            domain: n.domain.clone(),
            node: local.clone(),
            exchange_node: n.node.clone(),
            exchange_seq: n.exchange_seq,
            member_id: n.exchange_last_sent_id,
            member_name: String::new(),
            desired_state: GroupState::Unknown,
            state: GroupState::Unknown,
            status: GroupStatus::Unknown,
            condition: GroupCondition::Unknown,
            health: 0,
            reason_text: String::new(),
            more_members: false,
            last_received_member_id: n.exchange_last_recvd_id,
        };
        if let Some(row) = rows.first() {
            msg.member_id = row.id;
            msg.member_name = row.group.clone();
            msg.desired_state = row.desired_state;
            msg.state = row.state;
            msg.status = row.status;
            msg.condition = row.condition;
            msg.health = row.health;
            msg.reason_text = row.reason_text.clone();
            msg.more_members = rows.len() > 1;
        }
        let (sent_id, more) = (msg.member_id, msg.more_members);
        cx.out.send(Some(&n.node), Payload::Exchange(msg));
        cx.tables.neighbors.update(key, |r| {
            r.exchange_last_sent_id = sent_id;
            r.exchange_sent_final = !more;
        })?;
        Ok(())
    }

    /// Upsert a peer-owned assignment. Scheduling fields stay local.
    fn merge_peer_row<T>(&self, cx: &mut DomainContext<'_, T>, incoming: AssignmentRecord) -> AvailResult<bool> {
        if incoming.node == cx.settings.local_node {
            warn!(domain = %incoming.domain, group = %incoming.group, "peer tried to overwrite a local assignment");
            return Ok(false);
        }
        let key = incoming.table_key();
        if cx.tables.assignments.contains(&key) {
            return cx.tables.assignments.update(&key, |a| {
                if a.state != incoming.state {
                    a.last_state_change = epoch_ms();
                }
                a.desired_state = incoming.desired_state;
                a.state = incoming.state;
                a.status = incoming.status;
                a.condition = incoming.condition;
                a.health = incoming.health;
                a.reason_text = incoming.reason_text.clone();
            });
        }
        let mut row = incoming;
        row.last_state_change = epoch_ms();
        debug!(%key, state = %row.state, "peer assignment learned");
        cx.tables.assignments.insert(row)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use avail_state::{DomainRecord, NodeRecord, Tables};

    use super::*;
    use crate::context::{DomainOutput, DomainSettings};

    struct Side {
        tables: Tables,
        timers: TimerRegistry<DomainTimer>,
        settings: DomainSettings,
        out: DomainOutput,
        fsm: NeighborFsm,
    }

    impl Side {
        fn new(local: &str, groups: &[&str]) -> Self {
            let mut tables = Tables::in_memory();
            tables.nodes.insert(NodeRecord::new(local, 1)).unwrap();
            tables.domains.insert(DomainRecord::new("controller")).unwrap();
            for group in groups {
                let mut a = AssignmentRecord::new("controller", local, *group);
                a.state = GroupState::Active;
                tables.assignments.insert(a).unwrap();
            }
            Self {
                tables,
                timers: TimerRegistry::new(),
                settings: DomainSettings::new(local),
                out: DomainOutput::default(),
                fsm: NeighborFsm::new(),
            }
        }

        fn deliver(&mut self, payload: &Payload) {
            let mut cx = DomainContext::new(&mut self.tables, &mut self.timers, &self.settings, &mut self.out);
            match payload {
                Payload::DomainHello(m) => self.fsm.hello_received(&mut cx, m).unwrap(),
                Payload::ExchangeStart(m) => self.fsm.exchange_start_received(&mut cx, m).unwrap(),
                Payload::Exchange(m) => self.fsm.exchange_received(&mut cx, m).unwrap(),
                Payload::MemberUpdate(m) => {
                    self.fsm.member_update_received(&mut cx, m).unwrap();
                }
                Payload::MemberRequest(m) => self.fsm.member_request_received(&mut cx, m).unwrap(),
                _ => {}
            }
        }

        fn hello(&self) -> DomainHello {
            DomainHello {
                domain: "controller".into(),
                node: self.settings.local_node.clone(),
                orchestration: Orchestration::Regular,
                designation: Designation::Unknown,
                generation: 1,
                priority: 100,
                avail: AvailStatus::Available,
                hello_interval_ms: 1000,
                dead_interval_ms: 4000,
                wait_interval_ms: 5000,
                exchange_interval_ms: 1000,
                leader: String::new(),
            }
        }

        fn neighbor(&self, node: &str) -> NeighborRecord {
            self.tables
                .neighbors
                .get(&neighbor_key("controller", node))
                .unwrap()
                .clone()
        }
    }

    /// Move queued messages between the two sides until both go quiet.
    fn pump(a: &mut Side, b: &mut Side) -> usize {
        let mut moved = 0;
        for _ in 0..200 {
            let from_a = a.out.take().messages;
            let from_b = b.out.take().messages;
            if from_a.is_empty() && from_b.is_empty() {
                break;
            }
            for m in &from_a {
                b.deliver(&m.payload);
            }
            for m in &from_b {
                a.deliver(&m.payload);
            }
            moved += from_a.len() + from_b.len();
        }
        moved
    }

    #[test]
    fn master_order_is_antisymmetric() {
        let designations = [Designation::Unknown, Designation::Leader, Designation::Backup];
        let avails = [AvailStatus::Available, AvailStatus::Degraded, AvailStatus::Failed];
        for da in designations {
            for db in designations {
                for (ga, gb) in [(1, 1), (1, 2), (2, 1)] {
                    for va in avails {
                        for vb in avails {
                            let a = ExchangeSide {
                                designation: da,
                                generation: ga,
                                priority: 100,
                                avail: va,
                                name: "controller-0",
                            };
                            let b = ExchangeSide {
                                designation: db,
                                generation: gb,
                                priority: 100,
                                avail: vb,
                                name: "controller-1",
                            };
                            assert_ne!(is_exchange_master(&a, &b), is_exchange_master(&b, &a));
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn leader_designation_outranks_generation() {
        let leader = ExchangeSide {
            designation: Designation::Leader,
            generation: 1,
            priority: 1,
            avail: AvailStatus::Failed,
            name: "z",
        };
        let other = ExchangeSide {
            designation: Designation::Backup,
            generation: 9,
            priority: 200,
            avail: AvailStatus::Available,
            name: "a",
        };
        assert!(is_exchange_master(&leader, &other));
    }

    #[test]
    fn exchange_reaches_full_and_copies_rows() {
        let mut a = Side::new("controller-0", &["oam", "mgmt", "vim"]);
        let mut b = Side::new("controller-1", &["oam"]);
        let (ha, hb) = (a.hello(), b.hello());
        b.deliver(&Payload::DomainHello(ha));
        a.deliver(&Payload::DomainHello(hb));
        pump(&mut a, &mut b);

        assert_eq!(a.neighbor("controller-1").state, NeighborState::Full);
        assert_eq!(b.neighbor("controller-0").state, NeighborState::Full);
        assert!(a.neighbor("controller-1").exchange_master);
        assert!(!b.neighbor("controller-0").exchange_master);
        for group in ["oam", "mgmt", "vim"] {
            let row = b
                .tables
                .assignments
                .get(&AssignmentRecord::key("controller", "controller-0", group))
                .unwrap();
            assert_eq!(row.state, GroupState::Active);
        }
        assert!(a
            .tables
            .assignments
            .contains(&AssignmentRecord::key("controller", "controller-1", "oam")));
    }

    #[test]
    fn empty_sides_still_reach_full() {
        let mut a = Side::new("controller-0", &[]);
        let mut b = Side::new("controller-1", &[]);
        let (ha, hb) = (a.hello(), b.hello());
        b.deliver(&Payload::DomainHello(ha));
        a.deliver(&Payload::DomainHello(hb));
        pump(&mut a, &mut b);
        assert_eq!(a.neighbor("controller-1").state, NeighborState::Full);
        assert_eq!(b.neighbor("controller-0").state, NeighborState::Full);
    }

    #[test]
    fn wrong_sequence_restarts_exchange() {
        let mut a = Side::new("controller-0", &["oam"]);
        let mut b = Side::new("controller-1", &["oam"]);
        let (ha, hb) = (a.hello(), b.hello());
        b.deliver(&Payload::DomainHello(ha));
        a.deliver(&Payload::DomainHello(hb));

        // a (master) sends exchange-start; b echoes and enters exchange.
        let from_a = a.out.take().messages;
        for m in &from_a {
            b.deliver(&m.payload);
        }
        assert_eq!(b.neighbor("controller-0").state, NeighborState::Exchange);

        let bogus = Exchange {
            domain: "controller".into(),
            node: "controller-0".into(),
            exchange_node: "controller-1".into(),
            exchange_seq: 77,
            member_id: 1,
            member_name: "oam".into(),
            desired_state: GroupState::Active,
            state: GroupState::Active,
            status: GroupStatus::None,
            condition: GroupCondition::None,
            health: 0,
            reason_text: String::new(),
            more_members: false,
            last_received_member_id: 0,
        };
        b.deliver(&Payload::Exchange(bogus));
        let n = b.neighbor("controller-0");
        assert_eq!(n.state, NeighborState::ExchangeStart);
        assert_eq!(n.exchange_last_recvd_id, 0);
        assert!(!b
            .tables
            .assignments
            .contains(&AssignmentRecord::key("controller", "controller-0", "oam")));
    }

    fn exchange_into(side: &Side, member_id: i64) -> Exchange {
        let n = side.neighbor("controller-0");
        Exchange {
            domain: "controller".into(),
            node: "controller-0".into(),
            exchange_node: "controller-1".into(),
            exchange_seq: n.exchange_seq,
            member_id,
            member_name: "oam".into(),
            desired_state: GroupState::Active,
            state: GroupState::Active,
            status: GroupStatus::None,
            condition: GroupCondition::None,
            health: 0,
            reason_text: String::new(),
            more_members: true,
            last_received_member_id: n.exchange_last_sent_id,
        }
    }

    /// `b` in exchange with `a`, nothing received yet.
    fn exchanging_pair() -> (Side, Side) {
        let mut a = Side::new("controller-0", &["oam"]);
        let mut b = Side::new("controller-1", &["oam"]);
        let (ha, hb) = (a.hello(), b.hello());
        b.deliver(&Payload::DomainHello(ha));
        a.deliver(&Payload::DomainHello(hb));
        for m in &a.out.take().messages {
            b.deliver(&m.payload);
        }
        assert_eq!(b.neighbor("controller-0").state, NeighborState::Exchange);
        (a, b)
    }

    #[test]
    fn member_ids_must_increase_within_the_gap() {
        for bad in [-5, 0, MSG_MAX_SEQ_DELTA as i64 + 1, i64::MAX] {
            let (_a, mut b) = exchanging_pair();
            b.deliver(&Payload::Exchange(exchange_into(&b, bad)));
            let n = b.neighbor("controller-0");
            assert_eq!(n.state, NeighborState::ExchangeStart, "member id {bad}");
            assert_eq!(n.exchange_last_recvd_id, 0, "member id {bad}");
        }

        let (_a, mut b) = exchanging_pair();
        b.deliver(&Payload::Exchange(exchange_into(&b, 3)));
        assert_eq!(b.neighbor("controller-0").exchange_last_recvd_id, 3);
        // Repeating or going back is rejected once a record has been taken.
        b.deliver(&Payload::Exchange(exchange_into(&b, 3)));
        assert_eq!(b.neighbor("controller-0").state, NeighborState::ExchangeStart);
    }

    #[test]
    fn member_updates_only_apply_when_full() {
        let mut a = Side::new("controller-0", &["oam"]);
        let update = MemberUpdate {
            domain: "controller".into(),
            node: "controller-1".into(),
            member_node: "controller-1".into(),
            member_id: 4,
            member_name: "oam".into(),
            desired_state: GroupState::Standby,
            state: GroupState::Standby,
            status: GroupStatus::None,
            condition: GroupCondition::None,
            health: 0,
            reason_text: String::new(),
        };
        let mut b = Side::new("controller-1", &["oam"]);
        a.deliver(&Payload::DomainHello(b.hello()));
        a.deliver(&Payload::MemberUpdate(update.clone()));
        assert!(!a
            .tables
            .assignments
            .contains(&AssignmentRecord::key("controller", "controller-1", "oam")));

        b.deliver(&Payload::DomainHello(a.hello()));
        pump(&mut a, &mut b);
        let mut update = update;
        update.state = GroupState::GoActive;
        a.deliver(&Payload::MemberUpdate(update));
        let row = a
            .tables
            .assignments
            .get(&AssignmentRecord::key("controller", "controller-1", "oam"))
            .unwrap();
        assert_eq!(row.state, GroupState::GoActive);
    }

    #[test]
    fn dead_timer_takes_neighbor_down_and_ignores_stale_ids() {
        let mut a = Side::new("controller-0", &[]);
        let b = Side::new("controller-1", &[]);
        a.deliver(&Payload::DomainHello(b.hello()));
        let stale = a.neighbor("controller-1").dead_timer.unwrap();
        a.deliver(&Payload::DomainHello(b.hello()));
        let tag = DomainTimer::Dead {
            domain: "controller".into(),
            node: "controller-1".into(),
        };

        let mut cx = DomainContext::new(&mut a.tables, &mut a.timers, &a.settings, &mut a.out);
        assert_eq!(a.fsm.timer_fired(&mut cx, stale, &tag).unwrap(), None);

        a.timers.advance(Duration::from_millis(4000));
        let mut downed = None;
        while let Some((id, tag)) = a.timers.pop_due() {
            let mut cx = DomainContext::new(&mut a.tables, &mut a.timers, &a.settings, &mut a.out);
            if let Some(hit) = a.fsm.timer_fired(&mut cx, id, &tag).unwrap() {
                downed = Some(hit);
            }
        }
        assert_eq!(downed, Some(("controller".into(), "controller-1".into())));
        let n = a.neighbor("controller-1");
        assert_eq!(n.state, NeighborState::Down);
        assert!(n.dead_timer.is_none() && n.exchange_timer.is_none());
    }

    #[test]
    fn member_request_becomes_group_request() {
        let mut a = Side::new("controller-0", &["oam"]);
        let mut b = Side::new("controller-1", &["oam"]);
        let (ha, hb) = (a.hello(), b.hello());
        b.deliver(&Payload::DomainHello(ha));
        a.deliver(&Payload::DomainHello(hb));
        pump(&mut a, &mut b);

        b.deliver(&Payload::MemberRequest(MemberRequest {
            domain: "controller".into(),
            node: "controller-0".into(),
            member_node: "controller-1".into(),
            member_id: 1,
            member_name: "oam".into(),
            action: GroupAction::GoStandby,
            action_flags: 0,
        }));
        assert_eq!(
            b.out.group_requests,
            vec![GroupRequest {
                domain: "controller".into(),
                group: "oam".into(),
                action: GroupAction::GoStandby,
            }]
        );
        let row = b
            .tables
            .assignments
            .get(&AssignmentRecord::key("controller", "controller-1", "oam"))
            .unwrap();
        assert_eq!(row.desired_state, GroupState::Standby);
    }
}
