//! StatusStore: redb-backed persistence for network instance status.
//!
//! Acts as the publish sink of the probe engine: every publish is an upsert
//! keyed by instance id, so readers always see the latest snapshot. The
//! store supports both on-disk and in-memory backends (the latter for
//! testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe status store backed by redb.
#[derive(Clone)]
pub struct StatusStore {
    db: Arc<Database>,
}

impl StatusStore {
    /// Open (or create) a persistent status store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "status store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory status store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory status store opened");
        Ok(store)
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(NETWORK_INSTANCES).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Insert or replace the status snapshot of a network instance.
    pub fn put_instance_status(&self, status: &NetworkInstanceStatus) -> StateResult<()> {
        let value = serde_json::to_vec(status).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn
                .open_table(NETWORK_INSTANCES)
                .map_err(map_err!(Table))?;
            table
                .insert(status.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = %status.id, bridge = %status.bridge_name, "instance status stored");
        Ok(())
    }

    /// Get the latest status snapshot of a network instance.
    pub fn get_instance_status(&self, id: &str) -> StateResult<Option<NetworkInstanceStatus>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(NETWORK_INSTANCES)
            .map_err(map_err!(Table))?;
        match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => {
                let status: NetworkInstanceStatus =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(status))
            }
            None => Ok(None),
        }
    }

    /// List every stored status snapshot, ordered by instance id.
    pub fn list_instance_statuses(&self) -> StateResult<Vec<NetworkInstanceStatus>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn
            .open_table(NETWORK_INSTANCES)
            .map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let status: NetworkInstanceStatus =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(status);
        }
        Ok(results)
    }

    /// Delete a status snapshot. Returns true if it existed.
    pub fn delete_instance_status(&self, id: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn
                .open_table(NETWORK_INSTANCES)
                .map_err(map_err!(Table))?;
            existed = table.remove(id).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%id, existed, "instance status deleted");
        Ok(existed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_status(id: &str) -> NetworkInstanceStatus {
        let mut status = NetworkInstanceStatus::new(NetworkInstanceConfig {
            id: id.to_string(),
            bridge_name: format!("bn-{id}"),
            kind: InstanceType::Local,
            port: "uplink".to_string(),
            probe: ProbeConfig::default(),
            error: None,
        });
        status.pinfo.insert(
            "eth0".to_string(),
            ProbeInfo::new(
                "eth0",
                Some("192.168.1.1".parse().unwrap()),
                Some("192.168.1.10".parse().unwrap()),
                CostTier::Free,
            ),
        );
        status.current_uplink_intf = Some("eth0".to_string());
        status.curr_intf_up = CurrIntfStatus::Up;
        status
    }

    #[test]
    fn status_put_and_get() {
        let store = StatusStore::open_in_memory().unwrap();
        let status = test_status("ni-1");
        store.put_instance_status(&status).unwrap();

        let loaded = store.get_instance_status("ni-1").unwrap().unwrap();
        assert_eq!(loaded, status);
    }

    #[test]
    fn status_get_nonexistent_returns_none() {
        let store = StatusStore::open_in_memory().unwrap();
        assert!(store.get_instance_status("missing").unwrap().is_none());
    }

    #[test]
    fn last_write_wins() {
        let store = StatusStore::open_in_memory().unwrap();
        let mut status = test_status("ni-1");
        store.put_instance_status(&status).unwrap();

        status.curr_intf_up = CurrIntfStatus::Down;
        status.pinfo.get_mut("eth0").unwrap().gateway_up = false;
        store.put_instance_status(&status).unwrap();

        let loaded = store.get_instance_status("ni-1").unwrap().unwrap();
        assert_eq!(loaded.curr_intf_up, CurrIntfStatus::Down);
        assert!(!loaded.pinfo["eth0"].gateway_up);
        assert_eq!(store.list_instance_statuses().unwrap().len(), 1);
    }

    #[test]
    fn list_is_ordered_by_id() {
        let store = StatusStore::open_in_memory().unwrap();
        store.put_instance_status(&test_status("ni-b")).unwrap();
        store.put_instance_status(&test_status("ni-a")).unwrap();

        let ids: Vec<String> = store
            .list_instance_statuses()
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["ni-a", "ni-b"]);
    }

    #[test]
    fn status_delete() {
        let store = StatusStore::open_in_memory().unwrap();
        store.put_instance_status(&test_status("ni-1")).unwrap();

        assert!(store.delete_instance_status("ni-1").unwrap());
        assert!(!store.delete_instance_status("ni-1").unwrap());
        assert!(store.list_instance_statuses().unwrap().is_empty());
    }

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("status.redb");

        {
            let store = StatusStore::open(&db_path).unwrap();
            store.put_instance_status(&test_status("ni-1")).unwrap();
        }

        let store = StatusStore::open(&db_path).unwrap();
        let status = store.get_instance_status("ni-1").unwrap();
        assert_eq!(status.unwrap().bridge_name, "bn-ni-1");
    }
}
