//! Tables survive a daemon restart through the redb file.

use avail_core::{AvailConfig, GroupState, ServiceState};
use avail_state::{AssignmentRecord, StateStore, Tables};

const CONFIG: &str = r#"
[node]
name = "controller-0"

[[nodes]]
name = "controller-0"

[[services]]
name = "haproxy"

[[services.actions]]
action = "enable"
plugin = "/usr/lib/ocf/resource.d/haproxy"

[[service_groups]]
name = "web"

[[service_group_members]]
group = "web"
service = "haproxy"

[[domains]]
name = "controller"

[[domain_members]]
domain = "controller"
group = "web"
redundancy_model = "N"
m_standby = 0
"#;

#[test]
fn runtime_state_is_reloaded_after_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("availd.redb");
    let config = AvailConfig::from_toml_str(CONFIG).unwrap();
    let key = AssignmentRecord::key("controller", "controller-0", "web");

    {
        let mut tables = Tables::with_store(StateStore::open(&path).unwrap()).unwrap();
        tables.provision(&config).unwrap();
        tables
            .services
            .update("haproxy", |s| s.state = ServiceState::EnabledActive)
            .unwrap();
        tables
            .assignments
            .update(&key, |a| a.state = GroupState::Active)
            .unwrap();
    }

    let mut tables = Tables::with_store(StateStore::open(&path).unwrap()).unwrap();
    assert_eq!(tables.services.get("haproxy").unwrap().state, ServiceState::EnabledActive);
    assert_eq!(tables.assignments.get(&key).unwrap().state, GroupState::Active);

    // Provisioning again refreshes configuration without resetting state.
    tables.provision(&config).unwrap();
    assert_eq!(tables.services.len(), 1);
    assert_eq!(tables.assignments.get(&key).unwrap().state, GroupState::Active);
}

#[test]
fn deleted_rows_stay_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("availd.redb");
    let config = AvailConfig::from_toml_str(CONFIG).unwrap();

    {
        let mut tables = Tables::with_store(StateStore::open(&path).unwrap()).unwrap();
        tables.provision(&config).unwrap();
        assert!(tables.service_group_members.delete("web/haproxy").unwrap().is_some());
    }

    let tables = Tables::with_store(StateStore::open(&path).unwrap()).unwrap();
    assert!(tables.group_services("web").is_empty());
    assert!(tables.services.contains("haproxy"));
}
