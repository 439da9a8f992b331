//! Seeding the entity tables from the provisioning lists in availd.toml.
//!
//! Provisioned fields are refreshed on every start; runtime state already
//! persisted (states, counters, assignments learned from peers) is kept.

use avail_core::config::ServiceActionProvision;
use avail_core::{AvailConfig, AvailResult, GroupState};
use tracing::info;

use crate::table::Tables;
use crate::types::*;

impl From<&ServiceActionProvision> for ServiceActionDef {
    fn from(p: &ServiceActionProvision) -> Self {
        Self {
            action: p.action,
            plugin: p.plugin.clone(),
            params: p.params.clone(),
            timeout_secs: p.timeout_secs,
            interval_secs: p.interval_secs,
            max_failure_retries: p.max_failure_retries,
            max_timeout_retries: p.max_timeout_retries,
            max_total_retries: p.max_total_retries,
            results: p.results.clone(),
        }
    }
}

impl Tables {
    pub fn provision(&mut self, config: &AvailConfig) -> AvailResult<()> {
        for (index, p) in config.nodes.iter().enumerate() {
            let ordinal = index as u32 + 1;
            if self.nodes.contains(&p.name) {
                self.nodes.update(&p.name, |n| {
                    n.ordinal = ordinal;
                    n.admin = p.admin;
                })?;
            } else {
                let mut node = NodeRecord::new(&p.name, ordinal);
                node.admin = p.admin;
                node.oper = p.oper;
                node.avail = p.avail;
                node.ready = p.ready;
                self.nodes.insert(node)?;
            }
        }

        for p in &config.services {
            let actions: Vec<ServiceActionDef> = p.actions.iter().map(Into::into).collect();
            if self.services.contains(&p.name) {
                self.services.update(&p.name, |s| {
                    s.dependencies = p.dependencies.clone();
                    s.max_failures = p.max_failures;
                    s.fail_countdown = p.fail_countdown;
                    s.actions = actions;
                })?;
            } else {
                let mut service = ServiceRecord::new(&p.name);
                service.dependencies = p.dependencies.clone();
                service.max_failures = p.max_failures;
                service.fail_countdown = p.fail_countdown;
                service.actions = actions;
                self.services.insert(service)?;
            }
        }

        for p in &config.service_groups {
            if self.service_groups.contains(&p.name) {
                self.service_groups.update(&p.name, |g| {
                    g.auto_recover = p.auto_recover;
                    g.core = p.core;
                    g.fatal_error_reboot = p.fatal_error_reboot;
                })?;
            } else {
                let mut group = ServiceGroupRecord::new(&p.name);
                group.auto_recover = p.auto_recover;
                group.core = p.core;
                group.fatal_error_reboot = p.fatal_error_reboot;
                self.service_groups.insert(group)?;
            }
        }

        for p in &config.service_group_members {
            let member = GroupMemberRecord::new(&p.group, &p.service, p.failure_impact);
            let key = member.table_key();
            if self.service_group_members.contains(&key) {
                self.service_group_members
                    .update(&key, |m| m.failure_impact = p.failure_impact)?;
            } else {
                self.service_group_members.insert(member)?;
            }
        }

        for p in &config.domains {
            let apply = |d: &mut DomainRecord| {
                d.enabled = p.enabled;
                d.orchestration = p.orchestration;
                d.priority = p.priority;
                d.preempt = p.preempt;
                d.generation = p.generation;
                d.hello_interval_ms = p.hello_interval_ms;
                d.dead_interval_ms = p.dead_interval_ms;
                d.wait_interval_ms = p.wait_interval_ms;
                d.exchange_interval_ms = p.exchange_interval_ms;
                d.split_brain_recovery = p.split_brain_recovery;
            };
            if self.domains.contains(&p.name) {
                self.domains.update(&p.name, apply)?;
            } else {
                let mut domain = DomainRecord::new(&p.name);
                apply(&mut domain);
                self.domains.insert(domain)?;
            }
        }

        for p in &config.domain_members {
            let member = DomainMemberRecord {
                id: 0,
                domain: p.domain.clone(),
                group: p.group.clone(),
                redundancy_model: p.redundancy_model,
                n_active: p.n_active,
                m_standby: p.m_standby,
                aggregate: p.aggregate.clone(),
            };
            self.domain_members.upsert(member)?;

            // The local node always has an assignment for every member it
            // provisions; peer rows arrive through the exchange.
            let key = AssignmentRecord::key(&p.domain, &config.node.name, &p.group);
            if !self.assignments.contains(&key) {
                let mut assignment =
                    AssignmentRecord::new(&p.domain, &config.node.name, &p.group);
                assignment.desired_state = GroupState::Initial;
                self.assignments.insert(assignment)?;
            }
        }

        for p in &config.domain_interfaces {
            let Some(iface) = config.messaging_interface(&p.interface) else {
                continue;
            };
            let row = DomainInterfaceRecord {
                id: 0,
                domain: p.domain.clone(),
                interface: p.interface.clone(),
                kind: iface.kind,
                bind: iface.bind.clone(),
                peer: iface.peer.clone(),
                port: config.messaging.port,
                state: p.state,
            };
            self.domain_interfaces.upsert(row)?;
        }

        info!(
            nodes = self.nodes.len(),
            services = self.services.len(),
            groups = self.service_groups.len(),
            domains = self.domains.len(),
            assignments = self.assignments.len(),
            "tables provisioned"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avail_core::{AdminState, ServiceAction, ServiceState};

    const CONFIG: &str = r#"
[node]
name = "controller-0"
peer = "controller-1"

[[messaging.interfaces]]
name = "mgmt"
kind = "mgmt"
bind = "10.0.0.3"
peer = "10.0.0.4"

[[nodes]]
name = "controller-0"

[[nodes]]
name = "controller-1"

[[services]]
name = "dnsmasq"

[[services.actions]]
action = "enable"
plugin = "/bin/true"

[[service_groups]]
name = "controller-services"

[[service_group_members]]
group = "controller-services"
service = "dnsmasq"

[[domains]]
name = "controller"

[[domain_members]]
domain = "controller"
group = "controller-services"
redundancy_model = "N+M"

[[domain_interfaces]]
domain = "controller"
interface = "mgmt"
"#;

    #[test]
    fn provisions_every_table() {
        let config = AvailConfig::from_toml_str(CONFIG).unwrap();
        let mut tables = Tables::in_memory();
        tables.provision(&config).unwrap();

        assert_eq!(tables.nodes.get("controller-1").unwrap().ordinal, 2);
        let dnsmasq = tables.services.get("dnsmasq").unwrap();
        assert!(dnsmasq.has_action(ServiceAction::Enable));
        assert_eq!(tables.group_services("controller-services"), vec!["dnsmasq"]);
        assert!(tables
            .assignments
            .contains("controller/controller-0/controller-services"));
        assert!(!tables
            .assignments
            .contains("controller/controller-1/controller-services"));
        assert_eq!(tables.domain_interfaces_of("controller").len(), 1);
    }

    #[test]
    fn reprovision_keeps_runtime_state() {
        let config = AvailConfig::from_toml_str(CONFIG).unwrap();
        let mut tables = Tables::in_memory();
        tables.provision(&config).unwrap();
        tables
            .services
            .update("dnsmasq", |s| s.state = ServiceState::EnabledActive)
            .unwrap();
        tables
            .nodes
            .update("controller-0", |n| n.admin = AdminState::Locked)
            .unwrap();

        tables.provision(&config).unwrap();
        assert_eq!(
            tables.services.get("dnsmasq").unwrap().state,
            ServiceState::EnabledActive
        );
        assert_eq!(
            tables.nodes.get("controller-0").unwrap().admin,
            AdminState::Unlocked
        );
    }
}
