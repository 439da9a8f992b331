//! Shared state, status and event enums used across the availability crates.
//!
//! Every enum here is a closed set with a canonical lower-case name used in
//! config files, persisted rows, log records and text sockets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AvailError;

/// Maximum number of nodes in a cluster (and peer sessions kept).
pub const NODE_MAX: usize = 16;
/// Fixed width of node names on the wire.
pub const NODE_NAME_MAX: usize = 32;
/// Scheduler weight that excludes a node from active candidacy.
pub const SERVICE_DOMAIN_WEIGHT_UNSELECTABLE_ACTIVE: i32 = -1;
/// Largest accepted gap in message or exchange sequence numbers.
pub const MSG_MAX_SEQ_DELTA: u64 = 1000;

macro_rules! named_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident => $text:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub enum $name {
            $( $(#[$vmeta])* #[serde(rename = $text)] $variant ),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }

            /// Numeric code used by the binary wire codec.
            pub fn code(&self) -> u32 {
                *self as u32
            }

            pub fn from_code(code: u32) -> Option<Self> {
                Self::ALL.get(code as usize).copied()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AvailError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(AvailError::NotFound(format!(
                        "{} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// ── Node ────────────────────────────────────────────────────────

named_enum! {
    pub enum AdminState {
        Unknown => "unknown",
        Locked => "locked",
        Unlocked => "unlocked",
    }
}

named_enum! {
    pub enum OperState {
        Unknown => "unknown",
        Enabled => "enabled",
        Disabled => "disabled",
    }
}

named_enum! {
    pub enum AvailStatus {
        Unknown => "unknown",
        None => "none",
        Available => "available",
        Degraded => "degraded",
        Failed => "failed",
    }
}

impl AvailStatus {
    /// Weight used when ordering nodes for exchange mastership.
    pub fn weight(&self) -> i32 {
        match self {
            AvailStatus::Available => 10,
            AvailStatus::Degraded => 5,
            AvailStatus::Failed => -1,
            AvailStatus::Unknown | AvailStatus::None => 0,
        }
    }
}

named_enum! {
    pub enum ReadyState {
        Unknown => "unknown",
        Enabled => "enabled",
        Disabled => "disabled",
    }
}

named_enum! {
    /// Role of a node derived from its controller assignments.
    pub enum NodeScheduleState {
        Unknown => "unknown",
        Init => "init",
        Active => "active",
        Standby => "standby",
        Failed => "failed",
    }
}

named_enum! {
    pub enum NodeSetAction {
        Lock => "lock",
        Unlock => "unlock",
        Swact => "swact",
        SwactForce => "swact-force",
        Event => "event",
    }
}

named_enum! {
    pub enum InterfaceKind {
        Mgmt => "mgmt",
        ClusterHost => "cluster-host",
        Oam => "oam",
    }
}

named_enum! {
    pub enum SystemMode {
        Standard => "standard",
        CpeDuplex => "cpe-duplex",
        CpeDuplexDc => "cpe-duplex-dc",
        CpeSimplex => "cpe-simplex",
    }
}

impl SystemMode {
    pub fn is_duplex(&self) -> bool {
        !matches!(self, SystemMode::CpeSimplex)
    }
}

impl Default for SystemMode {
    fn default() -> Self {
        SystemMode::Standard
    }
}

// ── Service ─────────────────────────────────────────────────────

named_enum! {
    pub enum ServiceState {
        Unknown => "unknown",
        Initial => "initial",
        Enabling => "enabling",
        EnablingThrottle => "enabling-throttle",
        EnabledStandby => "enabled-standby",
        EnabledGoActive => "enabled-go-active",
        EnabledActive => "enabled-active",
        EnabledGoStandby => "enabled-go-standby",
        Disabling => "disabling",
        Disabled => "disabled",
        Shutdown => "shutdown",
    }
}

impl ServiceState {
    pub fn is_enabled(&self) -> bool {
        matches!(
            self,
            ServiceState::EnabledStandby
                | ServiceState::EnabledGoActive
                | ServiceState::EnabledActive
                | ServiceState::EnabledGoStandby
        )
    }
}

named_enum! {
    /// Declared in ascending severity order.
    pub enum ServiceStatus {
        Unknown => "unknown",
        None => "none",
        Warn => "warn",
        Degraded => "degraded",
        Failed => "failed",
    }
}

named_enum! {
    /// Declared in ascending badness order.
    pub enum ServiceCondition {
        Unknown => "unknown",
        None => "none",
        DataConsistent => "data-consistent",
        DataSyncing => "data-syncing",
        DataStandalone => "data-standalone",
        DataInconsistent => "data-inconsistent",
        RecoveryFailure => "recovery-failure",
        ActionFailure => "action-failure",
        FatalFailure => "fatal-failure",
    }
}

named_enum! {
    /// Impact a failed member service has on its group's health.
    pub enum ServiceSeverity {
        None => "none",
        Minor => "minor",
        Major => "major",
        Critical => "critical",
    }
}

impl ServiceSeverity {
    pub fn weight(&self) -> i64 {
        match self {
            ServiceSeverity::None => 0,
            ServiceSeverity::Minor => 1,
            ServiceSeverity::Major => 2,
            ServiceSeverity::Critical => 3,
        }
    }
}

impl Default for ServiceSeverity {
    fn default() -> Self {
        ServiceSeverity::Major
    }
}

named_enum! {
    pub enum ServiceEvent {
        Enable => "enable",
        EnableThrottle => "enable-throttle",
        EnableSuccess => "enable-success",
        EnableFailed => "enable-failed",
        EnableTimeout => "enable-timeout",
        GoActive => "go-active",
        GoActiveSuccess => "go-active-success",
        GoActiveFailed => "go-active-failed",
        GoActiveTimeout => "go-active-timeout",
        GoStandby => "go-standby",
        GoStandbySuccess => "go-standby-success",
        GoStandbyFailed => "go-standby-failed",
        GoStandbyTimeout => "go-standby-timeout",
        Disable => "disable",
        DisableSuccess => "disable-success",
        DisableFailed => "disable-failed",
        DisableTimeout => "disable-timeout",
        Audit => "audit",
        AuditSuccess => "audit-success",
        AuditFailed => "audit-failed",
        AuditTimeout => "audit-timeout",
        AuditMismatch => "audit-mismatch",
        HeartbeatOkay => "heartbeat-okay",
        HeartbeatWarn => "heartbeat-warn",
        HeartbeatDegrade => "heartbeat-degrade",
        HeartbeatFail => "heartbeat-fail",
        ProcessFailure => "process-failure",
        Shutdown => "shutdown",
    }
}

named_enum! {
    pub enum ServiceAction {
        Enable => "enable",
        Disable => "disable",
        GoActive => "go-active",
        GoStandby => "go-standby",
        AuditEnabled => "audit-enabled",
        AuditDisabled => "audit-disabled",
    }
}

named_enum! {
    pub enum ServiceActionResult {
        Success => "success",
        Failed => "failed",
        Fatal => "fatal",
        Timeout => "timeout",
    }
}

// ── Service group ───────────────────────────────────────────────

named_enum! {
    pub enum GroupState {
        Unknown => "unknown",
        Initial => "initial",
        Active => "active",
        GoActive => "go-active",
        Standby => "standby",
        GoStandby => "go-standby",
        Disabling => "disabling",
        Disabled => "disabled",
        Shutdown => "shutdown",
    }
}

named_enum! {
    /// Declared in ascending severity order.
    pub enum GroupStatus {
        Unknown => "unknown",
        None => "none",
        Warn => "warn",
        Degraded => "degraded",
        Failed => "failed",
    }
}

impl From<ServiceStatus> for GroupStatus {
    fn from(status: ServiceStatus) -> Self {
        match status {
            ServiceStatus::Unknown => GroupStatus::Unknown,
            ServiceStatus::None => GroupStatus::None,
            ServiceStatus::Warn => GroupStatus::Warn,
            ServiceStatus::Degraded => GroupStatus::Degraded,
            ServiceStatus::Failed => GroupStatus::Failed,
        }
    }
}

named_enum! {
    /// Declared in ascending badness order.
    pub enum GroupCondition {
        Unknown => "unknown",
        None => "none",
        DataConsistent => "data-consistent",
        DataSyncing => "data-syncing",
        DataStandalone => "data-standalone",
        DataInconsistent => "data-inconsistent",
        RecoveryFailure => "recovery-failure",
        ActionFailure => "action-failure",
        FatalFailure => "fatal-failure",
    }
}

impl From<ServiceCondition> for GroupCondition {
    fn from(condition: ServiceCondition) -> Self {
        match condition {
            ServiceCondition::Unknown => GroupCondition::Unknown,
            ServiceCondition::None => GroupCondition::None,
            ServiceCondition::DataConsistent => GroupCondition::DataConsistent,
            ServiceCondition::DataSyncing => GroupCondition::DataSyncing,
            ServiceCondition::DataStandalone => GroupCondition::DataStandalone,
            ServiceCondition::DataInconsistent => GroupCondition::DataInconsistent,
            ServiceCondition::RecoveryFailure => GroupCondition::RecoveryFailure,
            ServiceCondition::ActionFailure => GroupCondition::ActionFailure,
            ServiceCondition::FatalFailure => GroupCondition::FatalFailure,
        }
    }
}

named_enum! {
    pub enum GroupEvent {
        GoActive => "go-active",
        GoStandby => "go-standby",
        Disable => "disable",
        Audit => "audit",
        ServiceScn => "service-scn",
        TransitionTimeout => "transition-timeout",
        NotificationSuccess => "notification-success",
        NotificationFailed => "notification-failed",
        NotificationTimeout => "notification-timeout",
        Shutdown => "shutdown",
    }
}

named_enum! {
    pub enum GroupAction {
        Disable => "disable",
        GoActive => "go-active",
        GoStandby => "go-standby",
        Audit => "audit",
    }
}

impl GroupAction {
    pub fn event(&self) -> GroupEvent {
        match self {
            GroupAction::Disable => GroupEvent::Disable,
            GroupAction::GoActive => GroupEvent::GoActive,
            GroupAction::GoStandby => GroupEvent::GoStandby,
            GroupAction::Audit => GroupEvent::Audit,
        }
    }
}

// ── Service domain ──────────────────────────────────────────────

named_enum! {
    pub enum DomainState {
        Unknown => "unknown",
        Initial => "initial",
        Waiting => "waiting",
        Leader => "leader",
        Backup => "backup",
        Other => "other",
    }
}

named_enum! {
    pub enum DomainEvent {
        Hello => "hello",
        NeighborAgeout => "neighbor-ageout",
        InterfaceEnabled => "interface-enabled",
        InterfaceDisabled => "interface-disabled",
        WaitExpired => "wait-expired",
        ChangingLeader => "changing-leader",
    }
}

named_enum! {
    pub enum NeighborState {
        Unknown => "unknown",
        Down => "down",
        ExchangeStart => "exchange-start",
        Exchange => "exchange",
        Full => "full",
    }
}

named_enum! {
    pub enum NeighborEvent {
        HelloMsg => "hello-msg",
        ExchangeStartMsg => "exchange-start-msg",
        ExchangeStartTimer => "exchange-start-timer",
        ExchangeMsg => "exchange-msg",
        ExchangeTimeout => "exchange-timeout",
        Down => "down",
    }
}

named_enum! {
    pub enum InterfaceState {
        Unknown => "unknown",
        Enabled => "enabled",
        Disabled => "disabled",
        NotInUse => "not-in-use",
    }
}

named_enum! {
    pub enum RedundancyModel {
        Unknown => "unknown",
        None => "none",
        N => "N",
        NPlusM => "N+M",
        NTo1 => "N-to-1",
        NToN => "N-to-N",
    }
}

named_enum! {
    pub enum SchedulingState {
        None => "none",
        SwactForce => "swact-force",
        Swact => "swact",
        Disable => "disable",
    }
}

impl Default for SchedulingState {
    fn default() -> Self {
        SchedulingState::None
    }
}

named_enum! {
    pub enum SchedulingList {
        Unknown => "unknown",
        Active => "active",
        GoActive => "go-active",
        GoStandby => "go-standby",
        Standby => "standby",
        Disabling => "disabling",
        Disabled => "disabled",
        Failed => "failed",
        Fatal => "fatal",
        Unavailable => "unavailable",
    }
}

named_enum! {
    pub enum SplitBrainRecovery {
        DisableAllActive => "disable-all-active",
        SelectBestActive => "select-best-active",
    }
}

impl Default for SplitBrainRecovery {
    fn default() -> Self {
        SplitBrainRecovery::DisableAllActive
    }
}

named_enum! {
    pub enum Orchestration {
        Unknown => "unknown",
        Regular => "regular",
        Hybrid => "hybrid",
    }
}

named_enum! {
    pub enum Designation {
        Unknown => "unknown",
        Leader => "leader",
        Backup => "backup",
        Other => "other",
    }
}

impl From<DomainState> for Designation {
    fn from(state: DomainState) -> Self {
        match state {
            DomainState::Leader => Designation::Leader,
            DomainState::Backup => Designation::Backup,
            DomainState::Other => Designation::Other,
            _ => Designation::Unknown,
        }
    }
}

// ── Failover ────────────────────────────────────────────────────

named_enum! {
    pub enum FailoverInterfaceState {
        Unknown => "unknown",
        Ok => "ok",
        MissingHeartbeat => "missing-heartbeat",
        Down => "down",
        Recovering => "recovering",
    }
}

impl FailoverInterfaceState {
    /// Whether this state counts as a communication fault.
    pub fn is_fault(&self) -> bool {
        matches!(
            self,
            FailoverInterfaceState::Down | FailoverInterfaceState::MissingHeartbeat
        )
    }

    /// Ordering used to tell improving transitions from degrading ones.
    pub fn badness(&self) -> u8 {
        match self {
            FailoverInterfaceState::Ok => 0,
            FailoverInterfaceState::Unknown | FailoverInterfaceState::Recovering => 1,
            FailoverInterfaceState::MissingHeartbeat => 2,
            FailoverInterfaceState::Down => 3,
        }
    }
}

named_enum! {
    pub enum FailoverState {
        Initial => "initial",
        Normal => "normal",
        FailPending => "fail-pending",
        Failed => "failed",
        Survived => "survived",
    }
}

named_enum! {
    pub enum FailoverEvent {
        HeartbeatEnabled => "heartbeat-enabled",
        HeartbeatLost => "heartbeat-lost",
        HeartbeatRestored => "heartbeat-restored",
        InterfaceDown => "interface-down",
        InterfaceStateChanged => "interface-state-changed",
        FailPendingTimeout => "fail-pending-timeout",
        NodeEnabled => "node-enabled",
        BlindGuessTimeout => "blind-guess-timeout",
    }
}

named_enum! {
    pub enum AuthType {
        None => "none",
        HmacSha512 => "hmac-sha512",
    }
}

impl Default for AuthType {
    fn default() -> Self {
        AuthType::HmacSha512
    }
}
