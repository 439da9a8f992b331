//! In-memory entity tables mirroring the persisted rows.
//!
//! The engine task is the only writer. Every mutation writes through to the
//! [`StateStore`] (when one is attached) before returning, one redb
//! transaction per row.

use std::collections::{BTreeMap, HashMap};

use avail_core::{AvailError, AvailResult};
use tracing::{debug, warn};

use crate::store::StateStore;
use crate::types::*;

/// Default row bound per table.
pub const DEFAULT_TABLE_CAPACITY: usize = 4096;

#[derive(Clone)]
pub struct Table<R: Record> {
    rows: BTreeMap<String, R>,
    by_id: HashMap<i64, String>,
    next_id: i64,
    capacity: usize,
    store: Option<StateStore>,
}

impl<R: Record> Table<R> {
    pub fn new(store: Option<StateStore>) -> Self {
        Self::with_capacity(store, DEFAULT_TABLE_CAPACITY)
    }

    pub fn with_capacity(store: Option<StateStore>, capacity: usize) -> Self {
        Self {
            rows: BTreeMap::new(),
            by_id: HashMap::new(),
            next_id: 1,
            capacity,
            store,
        }
    }

    /// Rebuild the table from persisted rows. Returns the number loaded.
    pub fn load(&mut self) -> AvailResult<usize> {
        let Some(store) = &self.store else {
            return Ok(0);
        };
        let rows: Vec<R> = store.list()?;
        let count = rows.len();
        for row in rows {
            self.next_id = self.next_id.max(row.id() + 1);
            let key = row.table_key();
            self.by_id.insert(row.id(), key.clone());
            self.rows.insert(key, row);
        }
        debug!(kind = R::KIND, count, "table loaded");
        Ok(count)
    }

    fn persist(&self, row: &R) -> AvailResult<()> {
        if let Some(store) = &self.store {
            store.put(row)?;
        }
        Ok(())
    }

    /// Insert a new row. Assigns a synthetic id when the row has none.
    pub fn insert(&mut self, mut row: R) -> AvailResult<i64> {
        let key = row.table_key();
        if self.rows.contains_key(&key) {
            return Err(AvailError::failed(format!(
                "{} '{}' already exists",
                R::KIND,
                key
            )));
        }
        if self.rows.len() >= self.capacity {
            return Err(AvailError::TableFull {
                table: R::KIND,
                capacity: self.capacity,
            });
        }
        if row.id() == 0 {
            row.set_id(self.next_id);
        }
        self.next_id = self.next_id.max(row.id() + 1);
        self.persist(&row)?;
        let id = row.id();
        self.by_id.insert(id, key.clone());
        self.rows.insert(key, row);
        Ok(id)
    }

    /// Insert or replace by key, keeping the existing id.
    pub fn upsert(&mut self, mut row: R) -> AvailResult<bool> {
        let key = row.table_key();
        match self.rows.get(&key) {
            Some(existing) => {
                row.set_id(existing.id());
                if *existing == row {
                    return Ok(false);
                }
                self.persist(&row)?;
                self.rows.insert(key, row);
                Ok(true)
            }
            None => {
                row.set_id(0);
                self.insert(row)?;
                Ok(true)
            }
        }
    }

    pub fn read(&self, key: &str) -> Option<&R> {
        self.rows.get(key)
    }

    /// Like [`Table::read`] but an absent row is `NotFound`.
    pub fn get(&self, key: &str) -> AvailResult<&R> {
        self.rows
            .get(key)
            .ok_or_else(|| AvailError::not_found(format!("{} '{}'", R::KIND, key)))
    }

    pub fn read_by_id(&self, id: i64) -> Option<&R> {
        self.by_id.get(&id).and_then(|key| self.rows.get(key))
    }

    pub fn contains(&self, key: &str) -> bool {
        self.rows.contains_key(key)
    }

    /// Mutate a row in place. Returns whether anything changed; unchanged
    /// rows are not written. The key fields must not be modified.
    pub fn update<F>(&mut self, key: &str, f: F) -> AvailResult<bool>
    where
        F: FnOnce(&mut R),
    {
        let Some(row) = self.rows.get_mut(key) else {
            return Err(AvailError::not_found(format!("{} '{}'", R::KIND, key)));
        };
        let before = row.clone();
        f(row);
        if *row == before {
            return Ok(false);
        }
        if row.table_key() != key || row.id() != before.id() {
            warn!(kind = R::KIND, %key, "update tried to change row identity, reverting");
            *row = before;
            return Err(AvailError::failed(format!(
                "{} '{}' identity is immutable",
                R::KIND,
                key
            )));
        }
        let changed_persisted = serde_json::to_vec(&*row).ok() != serde_json::to_vec(&before).ok();
        if changed_persisted {
            if let Some(store) = &self.store {
                store.put(&*row)?;
            }
        }
        Ok(true)
    }

    pub fn delete(&mut self, key: &str) -> AvailResult<Option<R>> {
        let Some(row) = self.rows.remove(key) else {
            return Ok(None);
        };
        self.by_id.remove(&row.id());
        if let Some(store) = &self.store {
            store.delete::<R>(key)?;
        }
        Ok(Some(row))
    }

    pub fn iter(&self) -> impl Iterator<Item = &R> {
        self.rows.values()
    }

    pub fn for_each(&self, mut f: impl FnMut(&R)) {
        for row in self.rows.values() {
            f(row);
        }
    }

    pub fn filter(&self, pred: impl Fn(&R) -> bool) -> Vec<R> {
        self.rows.values().filter(|r| pred(r)).cloned().collect()
    }

    pub fn count(&self, pred: impl Fn(&R) -> bool) -> usize {
        self.rows.values().filter(|r| pred(r)).count()
    }

    pub fn keys(&self) -> Vec<String> {
        self.rows.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// All entity tables owned by the engine.
#[derive(Clone)]
pub struct Tables {
    pub nodes: Table<NodeRecord>,
    pub services: Table<ServiceRecord>,
    pub service_groups: Table<ServiceGroupRecord>,
    pub service_group_members: Table<GroupMemberRecord>,
    pub domains: Table<DomainRecord>,
    pub domain_members: Table<DomainMemberRecord>,
    pub neighbors: Table<NeighborRecord>,
    pub assignments: Table<AssignmentRecord>,
    pub domain_interfaces: Table<DomainInterfaceRecord>,
}

impl Tables {
    /// Tables without persistence.
    pub fn in_memory() -> Self {
        Self::build(None)
    }

    /// Tables that write through to `store`, loaded from what it holds.
    pub fn with_store(store: StateStore) -> AvailResult<Self> {
        let mut tables = Self::build(Some(store));
        tables.nodes.load()?;
        tables.services.load()?;
        tables.service_groups.load()?;
        tables.service_group_members.load()?;
        tables.domains.load()?;
        tables.domain_members.load()?;
        tables.neighbors.load()?;
        tables.assignments.load()?;
        tables.domain_interfaces.load()?;
        Ok(tables)
    }

    fn build(store: Option<StateStore>) -> Self {
        Self {
            nodes: Table::new(store.clone()),
            services: Table::new(store.clone()),
            service_groups: Table::new(store.clone()),
            service_group_members: Table::new(store.clone()),
            domains: Table::new(store.clone()),
            domain_members: Table::new(store.clone()),
            neighbors: Table::new(store.clone()),
            assignments: Table::new(store.clone()),
            domain_interfaces: Table::new(store),
        }
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Services belonging to `group`, in member key order.
    pub fn group_services(&self, group: &str) -> Vec<String> {
        self.service_group_members
            .iter()
            .filter(|m| m.group == group)
            .map(|m| m.service.clone())
            .collect()
    }

    pub fn group_members(&self, group: &str) -> Vec<GroupMemberRecord> {
        self.service_group_members.filter(|m| m.group == group)
    }

    /// Groups that contain `service`.
    pub fn service_groups_of(&self, service: &str) -> Vec<String> {
        self.service_group_members
            .iter()
            .filter(|m| m.service == service)
            .map(|m| m.group.clone())
            .collect()
    }

    /// Services that list `service` as a dependency.
    pub fn service_dependents(&self, service: &str) -> Vec<String> {
        self.services
            .iter()
            .filter(|s| s.dependencies.iter().any(|d| d == service))
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn domain_assignments(&self, domain: &str) -> Vec<AssignmentRecord> {
        self.assignments.filter(|a| a.domain == domain)
    }

    pub fn node_assignments(&self, node: &str) -> Vec<AssignmentRecord> {
        self.assignments.filter(|a| a.node == node)
    }

    pub fn domain_neighbors(&self, domain: &str) -> Vec<NeighborRecord> {
        self.neighbors.filter(|n| n.domain == domain)
    }

    pub fn domain_members_of(&self, domain: &str) -> Vec<DomainMemberRecord> {
        self.domain_members.filter(|m| m.domain == domain)
    }

    /// Domain members that schedule `group`.
    pub fn group_domain_members(&self, group: &str) -> Vec<DomainMemberRecord> {
        self.domain_members.filter(|m| m.group == group)
    }

    pub fn domain_interfaces_of(&self, domain: &str) -> Vec<DomainInterfaceRecord> {
        self.domain_interfaces.filter(|i| i.domain == domain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use avail_core::{ErrorKind, GroupState, ServiceSeverity};

    #[test]
    fn insert_assigns_ids_and_rejects_duplicates() {
        let mut tables = Tables::in_memory();
        let a = tables.nodes.insert(NodeRecord::new("controller-0", 1)).unwrap();
        let b = tables.nodes.insert(NodeRecord::new("controller-1", 2)).unwrap();
        assert_ne!(a, b);
        assert_eq!(tables.nodes.read_by_id(b).unwrap().name, "controller-1");
        assert!(tables.nodes.insert(NodeRecord::new("controller-0", 3)).is_err());
    }

    #[test]
    fn update_reports_change_only_when_row_differs() {
        let mut tables = Tables::in_memory();
        tables.service_groups.insert(ServiceGroupRecord::new("oam")).unwrap();
        assert!(!tables.service_groups.update("oam", |_| {}).unwrap());
        assert!(tables
            .service_groups
            .update("oam", |g| g.state = GroupState::Active)
            .unwrap());
        assert!(!tables
            .service_groups
            .update("oam", |g| g.state = GroupState::Active)
            .unwrap());
    }

    #[test]
    fn update_unknown_row_is_not_found() {
        let mut tables = Tables::in_memory();
        let err = tables.services.update("ghost", |_| {}).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn update_cannot_change_key() {
        let mut tables = Tables::in_memory();
        tables.nodes.insert(NodeRecord::new("controller-0", 1)).unwrap();
        assert!(tables.nodes.update("controller-0", |n| n.name = "x".into()).is_err());
        assert!(tables.nodes.read("controller-0").is_some());
    }

    #[test]
    fn capacity_bound_is_table_full() {
        let mut table: Table<NodeRecord> = Table::with_capacity(None, 1);
        table.insert(NodeRecord::new("a", 1)).unwrap();
        let err = table.insert(NodeRecord::new("b", 2)).unwrap_err();
        assert!(matches!(err, AvailError::TableFull { .. }));
    }

    #[test]
    fn write_through_survives_reload() {
        let store = StateStore::open_in_memory().unwrap();
        {
            let mut tables = Tables::with_store(store.clone()).unwrap();
            tables
                .assignments
                .insert(AssignmentRecord::new("controller", "controller-0", "oam"))
                .unwrap();
            tables
                .assignments
                .update("controller/controller-0/oam", |a| a.state = GroupState::Standby)
                .unwrap();
        }
        let tables = Tables::with_store(store).unwrap();
        let row = tables.assignments.get("controller/controller-0/oam").unwrap();
        assert_eq!(row.state, GroupState::Standby);
        assert_eq!(row.id, 1);
    }

    #[test]
    fn membership_queries() {
        let mut tables = Tables::in_memory();
        tables
            .service_group_members
            .insert(GroupMemberRecord::new("oam", "oam-ip", ServiceSeverity::Critical))
            .unwrap();
        tables
            .service_group_members
            .insert(GroupMemberRecord::new("oam", "haproxy", ServiceSeverity::Major))
            .unwrap();
        let mut haproxy = ServiceRecord::new("haproxy");
        haproxy.dependencies = vec!["oam-ip".into()];
        tables.services.insert(haproxy).unwrap();
        tables.services.insert(ServiceRecord::new("oam-ip")).unwrap();

        assert_eq!(tables.group_services("oam"), vec!["haproxy", "oam-ip"]);
        assert_eq!(tables.service_groups_of("haproxy"), vec!["oam"]);
        assert_eq!(tables.service_dependents("oam-ip"), vec!["haproxy"]);
    }
}
