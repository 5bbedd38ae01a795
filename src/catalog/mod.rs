//! Catalog of databases, tables, and partition versions.
//!
//! All metadata sits behind one `parking_lot::RwLock`. Plain reads clone
//! snapshots and release the lock immediately; the refresh path instead
//! takes the write guard via [`Catalog::lock_metadata`] right before target
//! resolution and holds it through commit, so the partition list and schema
//! it validated are exactly the ones the commit applies to (deferred
//! locking). DDL helpers exist for wiring and tests; durable DDL is the
//! caller's concern.

mod table;
pub mod version;

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use table::{
    Column, KeysModel, MvInfo, Partition, PartitionBounds, Table, TableKind, TableState,
};
pub use version::{PartitionKey, PartitionVersion, VersionMap};

use crate::error::{RefreshError, Result};

/// A named collection of tables.
#[derive(Debug, Default)]
pub struct Database {
    tables: BTreeMap<u64, Table>,
    by_name: HashMap<String, u64>,
}

impl Database {
    fn insert(&mut self, table: Table) -> Result<()> {
        if self.by_name.contains_key(table.name()) {
            return Err(RefreshError::internal(format!(
                "table '{}' already registered",
                table.name()
            )));
        }
        self.by_name.insert(table.name().to_string(), table.id());
        self.tables.insert(table.id(), table);
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Option<Table> {
        let id = self.by_name.remove(name)?;
        self.tables.remove(&id)
    }

    pub fn table(&self, name: &str) -> Option<&Table> {
        self.by_name.get(name).and_then(|id| self.tables.get(id))
    }

    pub fn table_by_id(&self, id: u64) -> Option<&Table> {
        self.tables.get(&id)
    }

    pub fn table_mut(&mut self, name: &str) -> Option<&mut Table> {
        let id = *self.by_name.get(name)?;
        self.tables.get_mut(&id)
    }

    pub fn table_by_id_mut(&mut self, id: u64) -> Option<&mut Table> {
        self.tables.get_mut(&id)
    }

    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.by_name.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Everything behind the metadata lock.
#[derive(Debug, Default)]
pub struct CatalogState {
    databases: HashMap<String, Database>,
}

impl CatalogState {
    pub fn database(&self, name: &str) -> Result<&Database> {
        self.databases
            .get(name)
            .ok_or_else(|| RefreshError::database_not_found(name))
    }

    pub fn database_mut(&mut self, name: &str) -> Result<&mut Database> {
        self.databases
            .get_mut(name)
            .ok_or_else(|| RefreshError::database_not_found(name))
    }

    pub fn table(&self, db: &str, name: &str) -> Result<&Table> {
        self.database(db)?
            .table(name)
            .ok_or_else(|| RefreshError::table_not_found(name))
    }

    pub fn table_by_id(&self, db: &str, id: u64) -> Result<&Table> {
        self.database(db)?
            .table_by_id(id)
            .ok_or_else(|| RefreshError::table_not_found(format!("id={}", id)))
    }

    pub fn table_mut(&mut self, db: &str, name: &str) -> Result<&mut Table> {
        self.database_mut(db)?
            .table_mut(name)
            .ok_or_else(|| RefreshError::table_not_found(name))
    }

    pub fn table_by_id_mut(&mut self, db: &str, id: u64) -> Result<&mut Table> {
        self.database_mut(db)?
            .table_by_id_mut(id)
            .ok_or_else(|| RefreshError::table_not_found(format!("id={}", id)))
    }

    /// Apply a successful refresh's bookkeeping in one step: replace the
    /// recorded version maps of the refreshed MV partitions, bump those
    /// partitions' visible versions, and stamp the view refreshed. Runs
    /// under the held metadata lock, in the same critical section that made
    /// the new data visible.
    pub fn commit_refresh(
        &mut self,
        db: &str,
        mv_table_id: u64,
        target_partitions: &[u64],
        recorded: &BTreeMap<u64, VersionMap>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let table = self.table_by_id_mut(db, mv_table_id)?;
        if !table.is_materialized_view() {
            return Err(RefreshError::internal(format!(
                "commit_refresh on non-MV table id={}",
                mv_table_id
            )));
        }

        for &pid in target_partitions {
            let next = table
                .partition(pid)
                .ok_or_else(|| {
                    RefreshError::internal(format!(
                        "refreshed partition id={} vanished before commit",
                        pid
                    ))
                })?
                .visible_version()
                + 1;
            // partition existence checked just above
            if let Some(p) = table.partition_mut(pid) {
                p.advance_visible_version(next, at);
            }
        }

        let live: Vec<u64> = table.partitions().map(|p| p.id()).collect();
        if let Some(mv) = table.mv_mut() {
            for (&pid, versions) in recorded {
                mv.record(pid, versions.clone());
            }
            mv.retain_recorded(&live);
            mv.mark_refreshed(at);
        }

        tracing::debug!(
            "Committed refresh bookkeeping for table {} ({} partitions)",
            mv_table_id,
            target_partitions.len()
        );
        Ok(())
    }
}

/// The shared catalog handle.
#[derive(Debug)]
pub struct Catalog {
    state: RwLock<CatalogState>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self::new()
    }
}

impl Catalog {
    /// Create an empty catalog with a `default` database.
    pub fn new() -> Self {
        let catalog = Self {
            state: RwLock::new(CatalogState::default()),
        };
        catalog
            .state
            .write()
            .databases
            .insert("default".to_string(), Database::default());
        catalog
    }

    /// Create a database. Creating an existing database is a no-op.
    pub fn create_database(&self, name: impl Into<String>) {
        self.state
            .write()
            .databases
            .entry(name.into())
            .or_default();
    }

    pub fn database_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.state.read().databases.keys().cloned().collect();
        names.sort();
        names
    }

    /// Register a table definition.
    pub fn register_table(&self, db: &str, table: Table) -> Result<()> {
        self.state.write().database_mut(db)?.insert(table)
    }

    /// Drop a table by name.
    pub fn drop_table(&self, db: &str, name: &str) -> Result<Table> {
        self.state
            .write()
            .database_mut(db)?
            .remove(name)
            .ok_or_else(|| RefreshError::table_not_found(name))
    }

    /// Snapshot a table's full definition.
    pub fn get_table(&self, db: &str, name: &str) -> Result<Table> {
        Ok(self.state.read().table(db, name)?.clone())
    }

    /// Snapshot a table's full definition by id.
    pub fn get_table_by_id(&self, db: &str, id: u64) -> Result<Table> {
        Ok(self.state.read().table_by_id(db, id)?.clone())
    }

    /// Snapshot one partition of a table.
    pub fn get_partition(&self, db: &str, table: &str, partition: &str) -> Result<Partition> {
        let state = self.state.read();
        let t = state.table(db, table)?;
        t.partition_by_name(partition, false)
            .cloned()
            .ok_or_else(|| RefreshError::unknown_partition(partition, table))
    }

    /// Snapshot all regular partitions of a table.
    pub fn list_partitions(&self, db: &str, table: &str) -> Result<Vec<Partition>> {
        let state = self.state.read();
        Ok(state.table(db, table)?.partitions().cloned().collect())
    }

    /// Snapshot a table's column definitions.
    pub fn table_schema(&self, db: &str, table: &str) -> Result<Vec<Column>> {
        let state = self.state.read();
        Ok(state.table(db, table)?.columns().to_vec())
    }

    /// Shared read access for lock-free phases (analysis, detection).
    pub fn read(&self) -> RwLockReadGuard<'_, CatalogState> {
        self.state.read()
    }

    /// The metadata lock. Taken immediately before target resolution and
    /// held through commit; concurrent DDL waits on it.
    pub fn lock_metadata(&self) -> RwLockWriteGuard<'_, CatalogState> {
        self.state.write()
    }

    /// Bump a base partition's visible version by one, as a committed write
    /// would. Returns the new version.
    pub fn record_base_commit(&self, db: &str, table: &str, partition: &str) -> Result<u64> {
        let mut state = self.state.write();
        let t = state.table_mut(db, table)?;
        let p = t
            .partition_by_name(partition, false)
            .ok_or_else(|| RefreshError::unknown_partition(partition, table))?;
        let id = p.id();
        let next = p.visible_version() + 1;
        if let Some(p) = t.partition_mut(id) {
            p.advance_visible_version(next, Utc::now());
        }
        Ok(next)
    }

    /// Force a base partition to an exact visible version (test fixtures,
    /// replication). Versions never move backwards.
    pub fn set_partition_version(
        &self,
        db: &str,
        table: &str,
        partition: &str,
        version: u64,
    ) -> Result<()> {
        let mut state = self.state.write();
        let t = state.table_mut(db, table)?;
        let id = t
            .partition_by_name(partition, false)
            .ok_or_else(|| RefreshError::unknown_partition(partition, table))?
            .id();
        if let Some(p) = t.partition_mut(id) {
            p.advance_visible_version(version, Utc::now());
        }
        Ok(())
    }
}
