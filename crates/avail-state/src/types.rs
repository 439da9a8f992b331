//! Row types for the availability entity tables.
//!
//! Every row is JSON-serialized for storage. Fields marked `#[serde(skip)]`
//! are runtime bookkeeping (timer ids, running pids) and are rebuilt by the
//! owning state machine after a restart.

use std::fmt::Debug;
use std::time::Instant;

use avail_core::config::ExitCodeMapping;
use avail_core::*;
use redb::TableDefinition;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tables;

/// A row that lives in one redb table under a composite string key.
pub trait Record: Clone + Debug + PartialEq + Serialize + DeserializeOwned {
    const TABLE: TableDefinition<'static, &'static str, &'static [u8]>;
    const KIND: &'static str;

    fn table_key(&self) -> String;
    fn id(&self) -> i64;
    fn set_id(&mut self, id: i64);
}

macro_rules! record {
    ($ty:ty, $table:expr, $kind:literal, |$s:ident| $key:expr) => {
        impl Record for $ty {
            const TABLE: TableDefinition<'static, &'static str, &'static [u8]> = $table;
            const KIND: &'static str = $kind;

            fn table_key(&self) -> String {
                let $s = self;
                $key
            }

            fn id(&self) -> i64 {
                self.id
            }

            fn set_id(&mut self, id: i64) {
                self.id = id;
            }
        }
    };
}

fn unknown_schedule_state() -> NodeScheduleState {
    NodeScheduleState::Unknown
}

// ── Node ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: i64,
    pub name: String,
    /// 1-based provisioning order, used for location weighting.
    pub ordinal: u32,
    pub admin: AdminState,
    pub oper: OperState,
    pub avail: AvailStatus,
    pub ready: ReadyState,
    /// Refreshed on every state change; peers compare it to skip
    /// re-applying an update they already have.
    pub state_uuid: Uuid,
    /// Derived from assignments, never persisted.
    #[serde(skip, default = "unknown_schedule_state")]
    pub schedule_state: NodeScheduleState,
}

impl NodeRecord {
    pub fn new(name: impl Into<String>, ordinal: u32) -> Self {
        Self {
            id: 0,
            name: name.into(),
            ordinal,
            admin: AdminState::Unlocked,
            oper: OperState::Enabled,
            avail: AvailStatus::Available,
            ready: ReadyState::Enabled,
            state_uuid: Uuid::new_v4(),
            schedule_state: NodeScheduleState::Unknown,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready == ReadyState::Enabled
    }
}

record!(NodeRecord, tables::NODES, "node", |r| r.name.clone());

// ── Service ────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceActionDef {
    pub action: ServiceAction,
    pub plugin: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub timeout_secs: u64,
    #[serde(default)]
    pub interval_secs: u64,
    pub max_failure_retries: u32,
    pub max_timeout_retries: u32,
    pub max_total_retries: u32,
    #[serde(default)]
    pub results: Vec<ExitCodeMapping>,
}

impl ServiceActionDef {
    pub fn mapped_result(&self, code: i32) -> Option<ServiceActionResult> {
        self.results.iter().find(|m| m.code == code).map(|m| m.result)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceRecord {
    pub id: i64,
    pub name: String,
    pub desired_state: ServiceState,
    pub state: ServiceState,
    pub status: ServiceStatus,
    pub condition: ServiceCondition,
    #[serde(default)]
    pub condition_reason: String,
    pub max_failures: u32,
    pub fail_countdown: u32,
    pub fail_count: u32,
    pub action_fail_count: u32,
    pub transition_fail_count: u32,
    pub dependencies: Vec<String>,
    pub actions: Vec<ServiceActionDef>,

    #[serde(skip)]
    pub action_running: Option<ServiceAction>,
    #[serde(skip)]
    pub action_pid: Option<u32>,
    #[serde(skip)]
    pub action_attempts: u32,
    #[serde(skip)]
    pub action_timer: Option<TimerId>,
    #[serde(skip)]
    pub audit_timer: Option<TimerId>,
    #[serde(skip)]
    pub state_timer: Option<TimerId>,
    #[serde(skip)]
    pub fail_countdown_timer: Option<TimerId>,
    /// Set while the current warn status came from a heartbeat report.
    #[serde(skip)]
    pub heartbeat_warn: bool,
}

impl ServiceRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            desired_state: ServiceState::Initial,
            state: ServiceState::Initial,
            status: ServiceStatus::None,
            condition: ServiceCondition::None,
            condition_reason: String::new(),
            max_failures: 3,
            fail_countdown: 1,
            fail_count: 0,
            action_fail_count: 0,
            transition_fail_count: 0,
            dependencies: Vec::new(),
            actions: Vec::new(),
            action_running: None,
            action_pid: None,
            action_attempts: 0,
            action_timer: None,
            audit_timer: None,
            state_timer: None,
            fail_countdown_timer: None,
            heartbeat_warn: false,
        }
    }

    pub fn action(&self, action: ServiceAction) -> Option<&ServiceActionDef> {
        self.actions.iter().find(|a| a.action == action)
    }

    pub fn has_action(&self, action: ServiceAction) -> bool {
        self.action(action).is_some()
    }
}

record!(ServiceRecord, tables::SERVICES, "service", |r| r.name.clone());

// ── Service group ──────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceGroupRecord {
    pub id: i64,
    pub name: String,
    pub desired_state: GroupState,
    pub state: GroupState,
    pub status: GroupStatus,
    pub condition: GroupCondition,
    pub health: i64,
    #[serde(default)]
    pub reason_text: String,
    pub auto_recover: bool,
    pub core: bool,
    pub fatal_error_reboot: bool,
    pub notification_failed: bool,
    pub notification_timeout: bool,
    pub needs_audit: bool,
    /// A go-state outlived its transition timer; cleared on completion.
    #[serde(default)]
    pub transition_failed: bool,

    #[serde(skip)]
    pub notification_pid: Option<u32>,
    #[serde(skip)]
    pub notification_timer: Option<TimerId>,
    #[serde(skip)]
    pub notification_attempts: u32,
    #[serde(skip)]
    pub notification_seq: u64,
    #[serde(skip)]
    pub transition_timer: Option<TimerId>,
}

impl ServiceGroupRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            desired_state: GroupState::Initial,
            state: GroupState::Initial,
            status: GroupStatus::None,
            condition: GroupCondition::None,
            health: 0,
            reason_text: String::new(),
            auto_recover: false,
            core: false,
            fatal_error_reboot: false,
            notification_failed: false,
            notification_timeout: false,
            needs_audit: false,
            transition_failed: false,
            notification_pid: None,
            notification_timer: None,
            notification_attempts: 0,
            notification_seq: 0,
            transition_timer: None,
        }
    }
}

record!(ServiceGroupRecord, tables::SERVICE_GROUPS, "service-group", |r| r.name.clone());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMemberRecord {
    pub id: i64,
    pub group: String,
    pub service: String,
    pub failure_impact: ServiceSeverity,
    pub service_state: ServiceState,
    pub service_status: ServiceStatus,
    pub service_condition: ServiceCondition,
}

impl GroupMemberRecord {
    pub fn new(group: impl Into<String>, service: impl Into<String>, impact: ServiceSeverity) -> Self {
        Self {
            id: 0,
            group: group.into(),
            service: service.into(),
            failure_impact: impact,
            service_state: ServiceState::Initial,
            service_status: ServiceStatus::None,
            service_condition: ServiceCondition::None,
        }
    }
}

record!(GroupMemberRecord, tables::SERVICE_GROUP_MEMBERS, "service-group-member", |r| format!(
    "{}/{}",
    r.group, r.service
));

// ── Service domain ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub orchestration: Orchestration,
    pub designation: Designation,
    pub state: DomainState,
    /// Current leader, empty when unknown.
    pub leader: String,
    pub priority: u32,
    pub generation: u32,
    pub preempt: bool,
    pub hello_interval_ms: u64,
    pub dead_interval_ms: u64,
    pub wait_interval_ms: u64,
    pub exchange_interval_ms: u64,
    pub split_brain_recovery: SplitBrainRecovery,

    #[serde(skip)]
    pub hello_timer: Option<TimerId>,
    #[serde(skip)]
    pub wait_timer: Option<TimerId>,
}

impl DomainRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: 0,
            name: name.into(),
            enabled: true,
            orchestration: Orchestration::Regular,
            designation: Designation::Unknown,
            state: DomainState::Initial,
            leader: String::new(),
            priority: 100,
            generation: 1,
            preempt: false,
            hello_interval_ms: 1000,
            dead_interval_ms: 4000,
            wait_interval_ms: 5000,
            exchange_interval_ms: 1000,
            split_brain_recovery: SplitBrainRecovery::DisableAllActive,
            hello_timer: None,
            wait_timer: None,
        }
    }
}

record!(DomainRecord, tables::SERVICE_DOMAINS, "service-domain", |r| r.name.clone());

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainMemberRecord {
    pub id: i64,
    pub domain: String,
    pub group: String,
    pub redundancy_model: RedundancyModel,
    pub n_active: u32,
    pub m_standby: u32,
    pub aggregate: Option<String>,
}

record!(DomainMemberRecord, tables::SERVICE_DOMAIN_MEMBERS, "service-domain-member", |r| {
    format!("{}/{}", r.domain, r.group)
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NeighborRecord {
    pub id: i64,
    pub domain: String,
    pub node: String,
    pub orchestration: Orchestration,
    pub designation: Designation,
    pub generation: u32,
    pub priority: u32,
    pub avail: AvailStatus,
    pub leader: String,
    pub hello_interval_ms: u64,
    pub dead_interval_ms: u64,
    pub wait_interval_ms: u64,
    pub exchange_interval_ms: u64,
    pub state: NeighborState,
    pub exchange_master: bool,
    pub exchange_seq: u32,
    pub exchange_last_sent_id: i64,
    pub exchange_last_recvd_id: i64,
    pub exchange_sent_final: bool,
    pub exchange_recvd_final: bool,

    #[serde(skip)]
    pub dead_timer: Option<TimerId>,
    #[serde(skip)]
    pub exchange_timer: Option<TimerId>,
    #[serde(skip)]
    pub last_exchange_start_sent: Option<Instant>,
}

impl NeighborRecord {
    pub fn new(domain: impl Into<String>, node: impl Into<String>) -> Self {
        Self {
            id: 0,
            domain: domain.into(),
            node: node.into(),
            orchestration: Orchestration::Unknown,
            designation: Designation::Unknown,
            generation: 0,
            priority: 0,
            avail: AvailStatus::Unknown,
            leader: String::new(),
            hello_interval_ms: 1000,
            dead_interval_ms: 4000,
            wait_interval_ms: 5000,
            exchange_interval_ms: 1000,
            state: NeighborState::Down,
            exchange_master: false,
            exchange_seq: 0,
            exchange_last_sent_id: 0,
            exchange_last_recvd_id: 0,
            exchange_sent_final: false,
            exchange_recvd_final: false,
            dead_timer: None,
            exchange_timer: None,
            last_exchange_start_sent: None,
        }
    }

    pub fn reset_exchange_cursors(&mut self) {
        self.exchange_last_sent_id = 0;
        self.exchange_last_recvd_id = 0;
        self.exchange_sent_final = false;
        self.exchange_recvd_final = false;
    }
}

record!(NeighborRecord, tables::SERVICE_DOMAIN_NEIGHBORS, "service-domain-neighbor", |r| {
    format!("{}/{}", r.domain, r.node)
});

/// Who runs what: one row per (domain, node, group).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentRecord {
    pub id: i64,
    pub domain: String,
    pub node: String,
    pub group: String,
    pub desired_state: GroupState,
    pub state: GroupState,
    pub status: GroupStatus,
    pub condition: GroupCondition,
    pub health: i64,
    #[serde(default)]
    pub reason_text: String,
    /// Epoch milliseconds of the last `state` change.
    pub last_state_change: u64,
    pub sched_state: SchedulingState,
    pub sched_weight: i32,
    pub sched_list: SchedulingList,
}

impl AssignmentRecord {
    pub fn new(domain: impl Into<String>, node: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            id: 0,
            domain: domain.into(),
            node: node.into(),
            group: group.into(),
            desired_state: GroupState::Initial,
            state: GroupState::Initial,
            status: GroupStatus::None,
            condition: GroupCondition::None,
            health: 0,
            reason_text: String::new(),
            last_state_change: 0,
            sched_state: SchedulingState::None,
            sched_weight: 0,
            sched_list: SchedulingList::Unknown,
        }
    }

    pub fn key(domain: &str, node: &str, group: &str) -> String {
        format!("{domain}/{node}/{group}")
    }
}

record!(AssignmentRecord, tables::SERVICE_DOMAIN_ASSIGNMENTS, "service-domain-assignment", |r| {
    AssignmentRecord::key(&r.domain, &r.node, &r.group)
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainInterfaceRecord {
    pub id: i64,
    pub domain: String,
    pub interface: String,
    pub kind: InterfaceKind,
    pub bind: String,
    pub peer: String,
    pub port: u16,
    pub state: InterfaceState,
}

record!(DomainInterfaceRecord, tables::SERVICE_DOMAIN_INTERFACES, "service-domain-interface", |r| {
    format!("{}/{}", r.domain, r.interface)
});
