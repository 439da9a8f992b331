//! availd.toml configuration parser.
//!
//! Besides daemon settings the file carries the provisioning lists that
//! seed the entity tables (nodes, services, groups, domains).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub timers: TimersConfig,
    #[serde(default)]
    pub messaging: MessagingConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub nodes: Vec<NodeProvision>,
    #[serde(default)]
    pub services: Vec<ServiceProvision>,
    #[serde(default)]
    pub service_groups: Vec<GroupProvision>,
    #[serde(default)]
    pub service_group_members: Vec<GroupMemberProvision>,
    #[serde(default)]
    pub domains: Vec<DomainProvision>,
    #[serde(default)]
    pub domain_members: Vec<DomainMemberProvision>,
    #[serde(default)]
    pub domain_interfaces: Vec<DomainInterfaceProvision>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSection {
    pub name: String,
    #[serde(default)]
    pub system_mode: SystemMode,
    pub peer: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub data_dir: PathBuf,
    pub control_socket: PathBuf,
    pub control_client_socket: PathBuf,
    pub notify_socket: PathBuf,
    pub stay_failed_file: PathBuf,
    pub notification_script: Option<PathBuf>,
    pub disable_peer_command: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/availd"),
            control_socket: PathBuf::from("/tmp/.sm_server_api"),
            control_client_socket: PathBuf::from("/tmp/.sm_client_api"),
            notify_socket: PathBuf::from("/tmp/.sm_notify_api"),
            stay_failed_file: PathBuf::from("/var/run/.sm_stayfailed"),
            notification_script: None,
            disable_peer_command: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimersConfig {
    pub scheduler_interval_ms: u64,
    pub fail_pending_timeout_ms: u64,
    pub interface_settle_ms: u64,
    pub group_transition_timeout_ms: u64,
    pub notification_timeout_ms: u64,
    pub notification_max_retries: u32,
    pub enabling_timeout_ms: u64,
    pub fail_countdown_interval_ms: u64,
    pub max_concurrent_enables: usize,
    pub blind_guess_reset_timeout_ms: u64,
    pub blind_guess_go_active_timeout_ms: u64,
    pub dispatch_budget: usize,
}

impl Default for TimersConfig {
    fn default() -> Self {
        Self {
            scheduler_interval_ms: 3000,
            fail_pending_timeout_ms: 2000,
            interface_settle_ms: 2000,
            group_transition_timeout_ms: 300_000,
            notification_timeout_ms: 30_000,
            notification_max_retries: 3,
            enabling_timeout_ms: 300_000,
            fail_countdown_interval_ms: 60_000,
            max_concurrent_enables: 16,
            blind_guess_reset_timeout_ms: 10_000,
            blind_guess_go_active_timeout_ms: 30_000,
            dispatch_budget: 8,
        }
    }
}

impl TimersConfig {
    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler_interval_ms)
    }

    pub fn fail_pending_timeout(&self) -> Duration {
        Duration::from_millis(self.fail_pending_timeout_ms)
    }

    pub fn interface_settle(&self) -> Duration {
        Duration::from_millis(self.interface_settle_ms)
    }

    pub fn group_transition_timeout(&self) -> Duration {
        Duration::from_millis(self.group_transition_timeout_ms)
    }

    pub fn notification_timeout(&self) -> Duration {
        Duration::from_millis(self.notification_timeout_ms)
    }

    pub fn enabling_timeout(&self) -> Duration {
        Duration::from_millis(self.enabling_timeout_ms)
    }

    pub fn fail_countdown_interval(&self) -> Duration {
        Duration::from_millis(self.fail_countdown_interval_ms)
    }

    pub fn blind_guess_reset_timeout(&self) -> Duration {
        Duration::from_millis(self.blind_guess_reset_timeout_ms)
    }

    pub fn blind_guess_go_active_timeout(&self) -> Duration {
        Duration::from_millis(self.blind_guess_go_active_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    pub port: u16,
    pub interfaces: Vec<MessagingInterface>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            port: 2222,
            interfaces: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagingInterface {
    pub name: String,
    pub kind: InterfaceKind,
    /// Local address to bind, e.g. `192.168.204.3`.
    pub bind: String,
    /// Peer unicast or multicast address.
    pub peer: String,
    #[serde(default)]
    pub auth_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub port: u16,
    pub interval_ms: u64,
    pub missing_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            port: 2224,
            interval_ms: 100,
            missing_threshold: 10,
        }
    }
}

impl HeartbeatConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,availd=debug,avail=debug".to_string(),
            json: false,
        }
    }
}

// ── Provisioning ───────────────────────────────────────────────

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeProvision {
    pub name: String,
    #[serde(default = "NodeProvision::default_admin")]
    pub admin: AdminState,
    #[serde(default = "NodeProvision::default_oper")]
    pub oper: OperState,
    #[serde(default = "NodeProvision::default_avail")]
    pub avail: AvailStatus,
    #[serde(default = "NodeProvision::default_ready")]
    pub ready: ReadyState,
}

impl NodeProvision {
    fn default_admin() -> AdminState {
        AdminState::Unlocked
    }
    fn default_oper() -> OperState {
        OperState::Enabled
    }
    fn default_avail() -> AvailStatus {
        AvailStatus::Available
    }
    fn default_ready() -> ReadyState {
        ReadyState::Enabled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceProvision {
    pub name: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "ServiceProvision::default_max_failures")]
    pub max_failures: u32,
    #[serde(default = "ServiceProvision::default_fail_countdown")]
    pub fail_countdown: u32,
    #[serde(default)]
    pub actions: Vec<ServiceActionProvision>,
}

impl ServiceProvision {
    fn default_max_failures() -> u32 {
        3
    }
    fn default_fail_countdown() -> u32 {
        1
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitCodeMapping {
    pub code: i32,
    pub result: ServiceActionResult,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceActionProvision {
    pub action: ServiceAction,
    pub plugin: String,
    #[serde(default)]
    pub params: Vec<String>,
    #[serde(default = "ServiceActionProvision::default_timeout")]
    pub timeout_secs: u64,
    /// Audit period; zero means the action is not periodic.
    #[serde(default)]
    pub interval_secs: u64,
    #[serde(default)]
    pub max_failure_retries: u32,
    #[serde(default)]
    pub max_timeout_retries: u32,
    #[serde(default = "ServiceActionProvision::default_total_retries")]
    pub max_total_retries: u32,
    #[serde(default)]
    pub results: Vec<ExitCodeMapping>,
}

impl ServiceActionProvision {
    fn default_timeout() -> u64 {
        60
    }
    fn default_total_retries() -> u32 {
        10
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupProvision {
    pub name: String,
    #[serde(default)]
    pub auto_recover: bool,
    #[serde(default)]
    pub core: bool,
    #[serde(default)]
    pub fatal_error_reboot: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupMemberProvision {
    pub group: String,
    pub service: String,
    #[serde(default)]
    pub failure_impact: ServiceSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainProvision {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "DomainProvision::default_orchestration")]
    pub orchestration: Orchestration,
    #[serde(default = "DomainProvision::default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub preempt: bool,
    #[serde(default = "DomainProvision::default_generation")]
    pub generation: u32,
    #[serde(default = "DomainProvision::default_hello")]
    pub hello_interval_ms: u64,
    #[serde(default = "DomainProvision::default_dead")]
    pub dead_interval_ms: u64,
    #[serde(default = "DomainProvision::default_wait")]
    pub wait_interval_ms: u64,
    #[serde(default = "DomainProvision::default_exchange")]
    pub exchange_interval_ms: u64,
    #[serde(default)]
    pub split_brain_recovery: SplitBrainRecovery,
}

impl DomainProvision {
    fn default_orchestration() -> Orchestration {
        Orchestration::Regular
    }
    fn default_priority() -> u32 {
        100
    }
    fn default_generation() -> u32 {
        1
    }
    fn default_hello() -> u64 {
        1000
    }
    fn default_dead() -> u64 {
        4000
    }
    fn default_wait() -> u64 {
        5000
    }
    fn default_exchange() -> u64 {
        1000
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainMemberProvision {
    pub domain: String,
    pub group: String,
    pub redundancy_model: RedundancyModel,
    #[serde(default = "DomainMemberProvision::default_one")]
    pub n_active: u32,
    #[serde(default = "DomainMemberProvision::default_one")]
    pub m_standby: u32,
    #[serde(default)]
    pub aggregate: Option<String>,
}

impl DomainMemberProvision {
    fn default_one() -> u32 {
        1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainInterfaceProvision {
    pub domain: String,
    /// Name of a `[[messaging.interfaces]]` entry.
    pub interface: String,
    #[serde(default = "DomainInterfaceProvision::default_state")]
    pub state: InterfaceState,
}

impl DomainInterfaceProvision {
    fn default_state() -> InterfaceState {
        InterfaceState::Enabled
    }
}

impl AvailConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: AvailConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Cross-reference checks that serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.name.is_empty() || self.node.name.len() > NODE_NAME_MAX {
            anyhow::bail!(
                "node name must be 1..={} bytes, got '{}'",
                NODE_NAME_MAX,
                self.node.name
            );
        }
        if self.nodes.len() > NODE_MAX {
            anyhow::bail!("at most {} nodes may be provisioned", NODE_MAX);
        }
        for member in &self.service_group_members {
            if !self.service_groups.iter().any(|g| g.name == member.group) {
                anyhow::bail!("group member references unknown group '{}'", member.group);
            }
            if !self.services.iter().any(|s| s.name == member.service) {
                anyhow::bail!(
                    "group member references unknown service '{}'",
                    member.service
                );
            }
        }
        for domain in &self.domains {
            for (field, ms) in [
                ("hello_interval_ms", domain.hello_interval_ms),
                ("dead_interval_ms", domain.dead_interval_ms),
                ("wait_interval_ms", domain.wait_interval_ms),
                ("exchange_interval_ms", domain.exchange_interval_ms),
            ] {
                if ms == 0 || ms > u64::from(u32::MAX) {
                    anyhow::bail!(
                        "domain '{}': {} must be 1..={}, got {}",
                        domain.name,
                        field,
                        u32::MAX,
                        ms
                    );
                }
            }
        }
        for member in &self.domain_members {
            if !self.domains.iter().any(|d| d.name == member.domain) {
                anyhow::bail!("domain member references unknown domain '{}'", member.domain);
            }
        }
        for iface in &self.domain_interfaces {
            if !self.messaging.interfaces.iter().any(|i| i.name == iface.interface) {
                anyhow::bail!(
                    "domain interface references unknown messaging interface '{}'",
                    iface.interface
                );
            }
        }
        Ok(())
    }

    pub fn messaging_interface(&self, name: &str) -> Option<&MessagingInterface> {
        self.messaging.interfaces.iter().find(|i| i.name == name)
    }

    /// Scaffold a single-controller config, handy for `check-config` output
    /// and tests.
    pub fn scaffold(node: &str) -> Self {
        AvailConfig {
            node: NodeSection {
                name: node.to_string(),
                system_mode: SystemMode::CpeSimplex,
                peer: None,
            },
            paths: PathsConfig::default(),
            timers: TimersConfig::default(),
            messaging: MessagingConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            logging: LoggingConfig::default(),
            nodes: vec![NodeProvision {
                name: node.to_string(),
                admin: AdminState::Unlocked,
                oper: OperState::Enabled,
                avail: AvailStatus::Available,
                ready: ReadyState::Enabled,
            }],
            services: Vec::new(),
            service_groups: Vec::new(),
            service_group_members: Vec::new(),
            domains: Vec::new(),
            domain_members: Vec::new(),
            domain_interfaces: Vec::new(),
        }
    }
}
