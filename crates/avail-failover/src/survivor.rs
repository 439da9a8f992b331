//! Survivor selection: which controller should carry activity given what
//! each side knows about its interfaces and the heartbeat between them.

use avail_core::NodeScheduleState;
use serde::Serialize;
use tracing::info;

use crate::interface::comm_fault;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HeartbeatState {
    Ok,
    Fail,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub schedule_state: NodeScheduleState,
    /// Interface fault bits, see [`comm_fault`].
    pub interface_flags: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    pub host: NodeStatus,
    pub peer: NodeStatus,
    pub heartbeat: HeartbeatState,
    pub cluster_host_configured: bool,
    /// The cluster reports the peer reachable while we cannot reach it.
    pub peer_reachable_by_cluster: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SystemFailoverStatus {
    pub host_schedule_state: NodeScheduleState,
    pub peer_schedule_state: NodeScheduleState,
}

/// Zero for a fully healthy node, more negative the worse it is.
pub fn health_score(flags: u32) -> i32 {
    let mut score = 0;
    if flags & comm_fault::OAM_DOWN != 0 {
        score -= 1;
    }
    if flags & comm_fault::CLUSTER_HOST_DOWN != 0 {
        score -= 2;
    }
    if flags & comm_fault::MGMT_DOWN != 0 {
        score -= 4;
    }
    score
}

pub fn get_survivor(status: &SystemStatus) -> SystemFailoverStatus {
    let mut selection = SystemFailoverStatus {
        host_schedule_state: status.host.schedule_state,
        peer_schedule_state: status.peer.schedule_state,
    };

    match status.heartbeat {
        HeartbeatState::Ok => {
            let host = health_score(status.host.interface_flags);
            let peer = health_score(status.peer.interface_flags);
            if host > peer {
                selection.host_schedule_state = NodeScheduleState::Active;
                selection.peer_schedule_state = NodeScheduleState::Standby;
            } else if peer > host {
                selection.host_schedule_state = NodeScheduleState::Standby;
                selection.peer_schedule_state = NodeScheduleState::Active;
            }
        }
        HeartbeatState::Fail => {
            let flags = status.host.interface_flags;
            let cluster_host_down =
                flags & comm_fault::CLUSTER_HOST_DOWN != 0 || !status.cluster_host_configured;
            let isolated = flags & comm_fault::MGMT_DOWN != 0 && cluster_host_down;
            if isolated || status.peer_reachable_by_cluster {
                selection.host_schedule_state = NodeScheduleState::Failed;
                selection.peer_schedule_state = NodeScheduleState::Active;
            } else {
                selection.host_schedule_state = NodeScheduleState::Active;
                selection.peer_schedule_state = NodeScheduleState::Failed;
            }
        }
    }

    if selection.host_schedule_state != status.host.schedule_state
        || selection.peer_schedule_state != status.peer.schedule_state
    {
        info!(
            host_from = %status.host.schedule_state,
            host_to = %selection.host_schedule_state,
            peer_from = %status.peer.schedule_state,
            peer_to = %selection.peer_schedule_state,
            "survivor selected"
        );
    }
    selection
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(host_flags: u32, peer_flags: u32, heartbeat: HeartbeatState) -> SystemStatus {
        SystemStatus {
            host: NodeStatus {
                schedule_state: NodeScheduleState::Standby,
                interface_flags: host_flags,
            },
            peer: NodeStatus {
                schedule_state: NodeScheduleState::Active,
                interface_flags: peer_flags,
            },
            heartbeat,
            cluster_host_configured: true,
            peer_reachable_by_cluster: false,
        }
    }

    #[test]
    fn scores_weight_mgmt_heaviest() {
        assert_eq!(health_score(0), 0);
        assert_eq!(health_score(comm_fault::OAM_DOWN), -1);
        assert_eq!(health_score(comm_fault::CLUSTER_HOST_DOWN), -2);
        assert_eq!(health_score(comm_fault::MGMT_DOWN), -4);
        assert_eq!(health_score(comm_fault::INTERFACE_MASK), -7);
    }

    #[test]
    fn healthier_node_takes_activity() {
        let picked = get_survivor(&status(0, comm_fault::OAM_DOWN, HeartbeatState::Ok));
        assert_eq!(picked.host_schedule_state, NodeScheduleState::Active);
        assert_eq!(picked.peer_schedule_state, NodeScheduleState::Standby);
    }

    #[test]
    fn equal_health_keeps_current_roles() {
        let picked = get_survivor(&status(comm_fault::OAM_DOWN, comm_fault::OAM_DOWN, HeartbeatState::Ok));
        assert_eq!(picked.host_schedule_state, NodeScheduleState::Standby);
        assert_eq!(picked.peer_schedule_state, NodeScheduleState::Active);
    }

    #[test]
    fn isolated_host_fails_itself() {
        let flags = comm_fault::MGMT_DOWN | comm_fault::CLUSTER_HOST_DOWN;
        let picked = get_survivor(&status(flags, 0, HeartbeatState::Fail));
        assert_eq!(picked.host_schedule_state, NodeScheduleState::Failed);
        assert_eq!(picked.peer_schedule_state, NodeScheduleState::Active);

        let mut no_cluster_host = status(comm_fault::MGMT_DOWN, 0, HeartbeatState::Fail);
        no_cluster_host.cluster_host_configured = false;
        assert_eq!(
            get_survivor(&no_cluster_host).host_schedule_state,
            NodeScheduleState::Failed
        );
    }

    #[test]
    fn lost_peer_with_healthy_host_survives() {
        let picked = get_survivor(&status(0, 0, HeartbeatState::Fail));
        assert_eq!(picked.host_schedule_state, NodeScheduleState::Active);
        assert_eq!(picked.peer_schedule_state, NodeScheduleState::Failed);
    }

    #[test]
    fn cluster_view_of_peer_wins() {
        let mut s = status(0, 0, HeartbeatState::Fail);
        s.peer_reachable_by_cluster = true;
        assert_eq!(get_survivor(&s).host_schedule_state, NodeScheduleState::Failed);
    }
}
