//! Per-partition version bookkeeping.
//!
//! Every committed write bumps the target partition's visible version.
//! A [`VersionMap`] is a snapshot of such versions, scoped either to a base
//! table's live partitions or to the versions a materialized-view partition
//! recorded at its last refresh. Staleness detection is a diff of the two.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Globally unique partition identity.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct PartitionKey {
    pub table_id: u64,
    pub partition_id: u64,
}

impl PartitionKey {
    pub fn new(table_id: u64, partition_id: u64) -> Self {
        Self {
            table_id,
            partition_id,
        }
    }
}

/// A committed visible version and when it committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionVersion {
    pub version: u64,
    pub committed_at: DateTime<Utc>,
}

impl PartitionVersion {
    pub fn new(version: u64, committed_at: DateTime<Utc>) -> Self {
        Self {
            version,
            committed_at,
        }
    }
}

/// Versions keyed by partition identity.
///
/// No interior locking: callers serialize access through the catalog's
/// metadata lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VersionMap {
    // JSON map keys must be strings, so the map journals as a sequence of
    // `(key, version)` pairs.
    #[serde(with = "versions_as_pairs")]
    versions: BTreeMap<PartitionKey, PartitionVersion>,
}

mod versions_as_pairs {
    use std::collections::BTreeMap;

    use serde::{Deserialize, Deserializer, Serializer};

    use super::{PartitionKey, PartitionVersion};

    pub fn serialize<S: Serializer>(
        versions: &BTreeMap<PartitionKey, PartitionVersion>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(versions.iter())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<PartitionKey, PartitionVersion>, D::Error> {
        let pairs = Vec::<(PartitionKey, PartitionVersion)>::deserialize(deserializer)?;
        Ok(pairs.into_iter().collect())
    }
}

impl VersionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the recorded version for a partition.
    pub fn get(&self, key: PartitionKey) -> Option<PartitionVersion> {
        self.versions.get(&key).copied()
    }

    /// Record a version for a partition. Versions only move forward: a
    /// version older than the recorded one is ignored.
    pub fn set(&mut self, key: PartitionKey, version: u64, committed_at: DateTime<Utc>) {
        match self.versions.get_mut(&key) {
            Some(existing) => {
                if version > existing.version {
                    *existing = PartitionVersion::new(version, committed_at);
                }
            }
            None => {
                self.versions
                    .insert(key, PartitionVersion::new(version, committed_at));
            }
        }
    }

    /// Partition identities whose versions differ between the two maps.
    /// A key present on only one side counts as differing.
    pub fn diff(&self, other: &VersionMap) -> Vec<PartitionKey> {
        let mut out = Vec::new();
        for (key, ver) in &self.versions {
            match other.versions.get(key) {
                Some(theirs) if theirs.version == ver.version => {}
                _ => out.push(*key),
            }
        }
        for key in other.versions.keys() {
            if !self.versions.contains_key(key) {
                out.push(*key);
            }
        }
        out.sort_unstable();
        out.dedup();
        out
    }

    /// The sub-map covering exactly `keys`. Keys with no entry are absent
    /// from the result.
    pub fn restrict(&self, keys: &[PartitionKey]) -> VersionMap {
        let versions = keys
            .iter()
            .filter_map(|k| self.versions.get(k).map(|v| (*k, *v)))
            .collect();
        VersionMap { versions }
    }

    /// Iterate entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (PartitionKey, PartitionVersion)> + '_ {
        self.versions.iter().map(|(k, v)| (*k, *v))
    }

    pub fn keys(&self) -> impl Iterator<Item = PartitionKey> + '_ {
        self.versions.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}
