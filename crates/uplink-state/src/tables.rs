//! redb table definitions for the status store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Network instance status snapshots keyed by instance id.
pub const NETWORK_INSTANCES: TableDefinition<&str, &[u8]> =
    TableDefinition::new("network_instances");
