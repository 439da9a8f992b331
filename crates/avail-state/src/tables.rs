//! redb table definitions for the availability state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized rows).
//! Composite keys join their parts with `/`, parent first.

use redb::TableDefinition;

/// Nodes keyed by `{node}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Services keyed by `{service}`.
pub const SERVICES: TableDefinition<&str, &[u8]> = TableDefinition::new("services");

/// Service groups keyed by `{group}`.
pub const SERVICE_GROUPS: TableDefinition<&str, &[u8]> = TableDefinition::new("service_groups");

/// Group membership keyed by `{group}/{service}`.
pub const SERVICE_GROUP_MEMBERS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("service_group_members");

/// Service domains keyed by `{domain}`.
pub const SERVICE_DOMAINS: TableDefinition<&str, &[u8]> = TableDefinition::new("service_domains");

/// Domain members keyed by `{domain}/{group}`.
pub const SERVICE_DOMAIN_MEMBERS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("service_domain_members");

/// Neighbors keyed by `{domain}/{node}`.
pub const SERVICE_DOMAIN_NEIGHBORS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("service_domain_neighbors");

/// Assignments keyed by `{domain}/{node}/{group}`.
pub const SERVICE_DOMAIN_ASSIGNMENTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("service_domain_assignments");

/// Domain interfaces keyed by `{domain}/{interface}`.
pub const SERVICE_DOMAIN_INTERFACES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("service_domain_interfaces");

pub const ALL: [TableDefinition<&str, &[u8]>; 9] = [
    NODES,
    SERVICES,
    SERVICE_GROUPS,
    SERVICE_GROUP_MEMBERS,
    SERVICE_DOMAINS,
    SERVICE_DOMAIN_MEMBERS,
    SERVICE_DOMAIN_NEIGHBORS,
    SERVICE_DOMAIN_ASSIGNMENTS,
    SERVICE_DOMAIN_INTERFACES,
];
