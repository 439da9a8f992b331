//! Node records: local administrative commands and peer state updates.

use avail_core::*;
use avail_msg::message::{NodeHello, NodeUpdate};
use avail_state::{NodeRecord, Tables};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::scheduler::Scheduler;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeChange {
    pub node: String,
    pub admin: AdminState,
    pub oper: OperState,
    pub avail: AvailStatus,
    pub ready: ReadyState,
    pub old_state_uuid: Uuid,
    pub state_uuid: Uuid,
}

impl NodeChange {
    /// The update to broadcast for a change of the local node.
    pub fn to_update(&self, uptime_secs: u64) -> NodeUpdate {
        NodeUpdate {
            node_name: self.node.clone(),
            admin: self.admin,
            oper: self.oper,
            avail: self.avail,
            ready: self.ready,
            old_state_uuid: self.old_state_uuid,
            state_uuid: self.state_uuid,
            uptime_secs,
            force: false,
        }
    }
}

#[derive(Default)]
pub struct NodeApi {
    observers: Observers<NodeChange>,
}

impl NodeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observers_mut(&mut self) -> &mut Observers<NodeChange> {
        &mut self.observers
    }

    /// Apply a SET_NODE command. Swacts only mark the node's assignments;
    /// they never touch the node record.
    #[allow(clippy::too_many_arguments)]
    pub fn set_node(
        &mut self,
        tables: &mut Tables,
        scheduler: &mut Scheduler,
        node: &str,
        action: NodeSetAction,
        admin: AdminState,
        oper: OperState,
        avail: AvailStatus,
    ) -> AvailResult<Option<NodeChange>> {
        let current = tables.nodes.get(node)?.clone();
        let (admin, oper, avail) = match action {
            NodeSetAction::Lock => (AdminState::Locked, current.oper, current.avail),
            NodeSetAction::Unlock => (AdminState::Unlocked, current.oper, current.avail),
            NodeSetAction::Event => (current.admin, oper, avail),
            NodeSetAction::Swact | NodeSetAction::SwactForce => {
                let force = action == NodeSetAction::SwactForce;
                scheduler.swact_node(tables, node, force)?;
                debug!(%node, %admin, "swact leaves node state unchanged");
                return Ok(None);
            }
        };
        self.change(tables, &current, admin, oper, avail, current.ready, Uuid::new_v4())
    }

    /// Apply a peer's NODE_UPDATE. Repeats of an applied update are no-ops.
    pub fn apply_update(&mut self, tables: &mut Tables, update: &NodeUpdate) -> AvailResult<Option<NodeChange>> {
        self.apply_peer_state(
            tables,
            &update.node_name,
            update.admin,
            update.oper,
            update.avail,
            update.ready,
            update.state_uuid,
        )
    }

    /// A NODE_HELLO carries the sender's full state; apply it when the
    /// state uuid moved on.
    pub fn hello_received(&mut self, tables: &mut Tables, hello: &NodeHello) -> AvailResult<Option<NodeChange>> {
        self.apply_peer_state(
            tables,
            &hello.node_name,
            hello.admin,
            hello.oper,
            hello.avail,
            hello.ready,
            hello.state_uuid,
        )
    }

    pub fn local_hello(&self, tables: &Tables, local: &str, uptime_secs: u64) -> AvailResult<NodeHello> {
        let node = tables.nodes.get(local)?;
        Ok(NodeHello {
            node_name: node.name.clone(),
            admin: node.admin,
            oper: node.oper,
            avail: node.avail,
            ready: node.ready,
            state_uuid: node.state_uuid,
            uptime_secs,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn apply_peer_state(
        &mut self,
        tables: &mut Tables,
        name: &str,
        admin: AdminState,
        oper: OperState,
        avail: AvailStatus,
        ready: ReadyState,
        state_uuid: Uuid,
    ) -> AvailResult<Option<NodeChange>> {
        if !tables.nodes.contains(name) {
            let ordinal = tables.nodes.len() as u32 + 1;
            info!(node = %name, ordinal, "node learned from peer");
            let mut record = NodeRecord::new(name, ordinal);
            record.state_uuid = Uuid::nil();
            tables.nodes.insert(record)?;
        }
        let current = tables.nodes.get(name)?.clone();
        if current.state_uuid == state_uuid {
            debug!(node = %name, %state_uuid, "node state already applied");
            return Ok(None);
        }
        self.change(tables, &current, admin, oper, avail, ready, state_uuid)
    }

    #[allow(clippy::too_many_arguments)]
    fn change(
        &mut self,
        tables: &mut Tables,
        current: &NodeRecord,
        admin: AdminState,
        oper: OperState,
        avail: AvailStatus,
        ready: ReadyState,
        state_uuid: Uuid,
    ) -> AvailResult<Option<NodeChange>> {
        let unchanged = current.admin == admin
            && current.oper == oper
            && current.avail == avail
            && current.ready == ready;
        if unchanged {
            // Adopt the peer's uuid so its next hello is recognised.
            if current.state_uuid != state_uuid {
                tables.nodes.update(&current.name, |n| n.state_uuid = state_uuid)?;
            }
            return Ok(None);
        }
        tables.nodes.update(&current.name, |n| {
            n.admin = admin;
            n.oper = oper;
            n.avail = avail;
            n.ready = ready;
            n.state_uuid = state_uuid;
        })?;
        info!(
            node = %current.name,
            %admin,
            %oper,
            %avail,
            %ready,
            "node state change"
        );
        let change = NodeChange {
            node: current.name.clone(),
            admin,
            oper,
            avail,
            ready,
            old_state_uuid: current.state_uuid,
            state_uuid,
        };
        self.observers.notify(&change);
        Ok(Some(change))
    }
}

/// A node's role derived from its assignments.
pub fn node_schedule_state(tables: &Tables, node: &str) -> NodeScheduleState {
    if tables.nodes.read(node).is_some_and(|n| n.avail == AvailStatus::Failed) {
        return NodeScheduleState::Failed;
    }
    let assignments = tables.node_assignments(node);
    if assignments.is_empty() {
        return NodeScheduleState::Unknown;
    }
    if assignments
        .iter()
        .any(|a| matches!(a.state, GroupState::Active | GroupState::GoActive))
    {
        return NodeScheduleState::Active;
    }
    if assignments.iter().all(|a| a.state == GroupState::Standby) {
        return NodeScheduleState::Standby;
    }
    NodeScheduleState::Init
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use avail_state::AssignmentRecord;

    use super::*;

    fn tables() -> Tables {
        let mut tables = Tables::in_memory();
        tables.nodes.insert(NodeRecord::new("controller-0", 1)).unwrap();
        tables.nodes.insert(NodeRecord::new("controller-1", 2)).unwrap();
        tables
    }

    fn update_for(tables: &Tables, avail: AvailStatus, state_uuid: Uuid) -> NodeUpdate {
        let node = tables.nodes.get("controller-1").unwrap();
        NodeUpdate {
            node_name: node.name.clone(),
            admin: node.admin,
            oper: node.oper,
            avail,
            ready: node.ready,
            old_state_uuid: node.state_uuid,
            state_uuid,
            uptime_secs: 10,
            force: false,
        }
    }

    #[test]
    fn repeated_update_is_applied_once() {
        let mut tables = tables();
        let mut api = NodeApi::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        api.observers_mut().register(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let update = update_for(&tables, AvailStatus::Degraded, Uuid::new_v4());
        let first = api.apply_update(&mut tables, &update).unwrap();
        assert!(first.is_some());
        let second = api.apply_update(&mut tables, &update).unwrap();
        assert!(second.is_none());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert_eq!(tables.nodes.get("controller-1").unwrap().avail, AvailStatus::Degraded);
    }

    #[test]
    fn unknown_node_is_learned() {
        let mut tables = tables();
        let mut api = NodeApi::new();
        let hello = NodeHello {
            node_name: "controller-2".into(),
            admin: AdminState::Unlocked,
            oper: OperState::Enabled,
            avail: AvailStatus::Available,
            ready: ReadyState::Enabled,
            state_uuid: Uuid::new_v4(),
            uptime_secs: 1,
        };
        api.hello_received(&mut tables, &hello).unwrap();
        let node = tables.nodes.get("controller-2").unwrap();
        assert_eq!(node.ordinal, 3);
        assert_eq!(node.state_uuid, hello.state_uuid);
    }

    #[test]
    fn lock_refreshes_state_uuid() {
        let mut tables = tables();
        let mut api = NodeApi::new();
        let mut scheduler = Scheduler::new();
        let before = tables.nodes.get("controller-0").unwrap().state_uuid;
        let change = api
            .set_node(
                &mut tables,
                &mut scheduler,
                "controller-0",
                NodeSetAction::Lock,
                AdminState::Unknown,
                OperState::Unknown,
                AvailStatus::Unknown,
            )
            .unwrap()
            .unwrap();
        assert_eq!(change.admin, AdminState::Locked);
        assert_eq!(change.old_state_uuid, before);
        assert_ne!(tables.nodes.get("controller-0").unwrap().state_uuid, before);

        // Locking again changes nothing.
        let again = api
            .set_node(
                &mut tables,
                &mut scheduler,
                "controller-0",
                NodeSetAction::Lock,
                AdminState::Unknown,
                OperState::Unknown,
                AvailStatus::Unknown,
            )
            .unwrap();
        assert!(again.is_none());
    }

    #[test]
    fn set_node_on_unknown_node_is_not_found() {
        let mut tables = tables();
        let err = NodeApi::new()
            .set_node(
                &mut tables,
                &mut Scheduler::new(),
                "compute-9",
                NodeSetAction::Unlock,
                AdminState::Unknown,
                OperState::Unknown,
                AvailStatus::Unknown,
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn schedule_state_follows_assignments() {
        let mut tables = tables();
        assert_eq!(node_schedule_state(&tables, "controller-0"), NodeScheduleState::Unknown);

        let mut row = AssignmentRecord::new("controller", "controller-0", "oam");
        row.state = GroupState::Standby;
        tables.assignments.insert(row).unwrap();
        assert_eq!(node_schedule_state(&tables, "controller-0"), NodeScheduleState::Standby);

        tables
            .assignments
            .update(&AssignmentRecord::key("controller", "controller-0", "oam"), |a| {
                a.state = GroupState::GoActive
            })
            .unwrap();
        assert_eq!(node_schedule_state(&tables, "controller-0"), NodeScheduleState::Active);

        tables
            .nodes
            .update("controller-0", |n| n.avail = AvailStatus::Failed)
            .unwrap();
        assert_eq!(node_schedule_state(&tables, "controller-0"), NodeScheduleState::Failed);
    }
}
