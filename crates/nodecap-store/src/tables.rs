//! redb table definitions for the resource store.

use redb::TableDefinition;

/// Serialized node resource info keyed by `/resource/{kind}/{node}`.
pub const RESOURCES: TableDefinition<&str, &[u8]> = TableDefinition::new("resources");
