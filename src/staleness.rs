//! Staleness detection for materialized views.
//!
//! Decides, for one view, which of its partitions must be rebuilt: compares
//! the base-partition versions recorded at the last refresh against the
//! catalog's live versions, restricted per view partition to the base
//! partitions that actually feed it. The decision is one of three shapes: a
//! no-op (nothing changed), an incremental refresh of exactly the stale
//! partitions, or a full rebuild when incremental repair is impossible or
//! not worth it.
//!
//! Detection is read-only and runs without the catalog metadata lock.

use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogState, Partition, PartitionBounds, PartitionKey, Table, VersionMap};
use crate::config::EngineConfig;
use crate::error::{RefreshError, Result};
use crate::types::ScalarValue;

/// A partition-key interval restricting which view partitions a refresh may
/// touch. Half-open: `[lower, upper)`. An absent side is unbounded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefreshRange {
    lower: Option<ScalarValue>,
    upper: Option<ScalarValue>,
}

impl RefreshRange {
    pub fn new(lower: Option<ScalarValue>, upper: Option<ScalarValue>) -> Self {
        Self { lower, upper }
    }

    pub fn unbounded() -> Self {
        Self {
            lower: None,
            upper: None,
        }
    }

    pub fn lower(&self) -> Option<&ScalarValue> {
        self.lower.as_ref()
    }

    pub fn upper(&self) -> Option<&ScalarValue> {
        self.upper.as_ref()
    }

    /// Whether a partition with these bounds falls inside the range.
    /// Partitions without a bounds description cannot be excluded.
    pub fn covers(&self, bounds: Option<&PartitionBounds>) -> bool {
        match bounds {
            Some(b) => b.overlaps(self.lower.as_ref(), self.upper.as_ref()),
            None => true,
        }
    }

    /// The smallest range containing both. An unbounded side stays
    /// unbounded; incomparable bounds widen to unbounded.
    pub fn union(&self, other: &RefreshRange) -> RefreshRange {
        let lower = match (&self.lower, &other.lower) {
            (Some(a), Some(b)) => match a.partial_cmp(b) {
                Some(std::cmp::Ordering::Greater) => Some(b.clone()),
                Some(_) => Some(a.clone()),
                None => None,
            },
            _ => None,
        };
        let upper = match (&self.upper, &other.upper) {
            (Some(a), Some(b)) => match a.partial_cmp(b) {
                Some(std::cmp::Ordering::Less) => Some(b.clone()),
                Some(_) => Some(a.clone()),
                None => None,
            },
            _ => None,
        };
        RefreshRange { lower, upper }
    }
}

/// The refresh decision for one view.
#[derive(Debug, Clone, PartialEq)]
pub enum RefreshSet {
    /// Every contributing base partition matches its recorded version.
    /// The run still completes successfully but writes nothing.
    NoOp,
    /// Rebuild the whole view. `partitions` is `None` for an unrestricted
    /// rebuild (no partition clause on the overwrite) and `Some` when a
    /// request range narrowed the rebuild to the listed view partitions.
    Full { partitions: Option<Vec<u64>> },
    /// Rebuild exactly the listed stale view partitions.
    Incremental { partitions: Vec<u64> },
}

impl RefreshSet {
    pub fn is_noop(&self) -> bool {
        matches!(self, RefreshSet::NoOp)
    }
}

/// Computes refresh decisions against a frozen view of the catalog.
pub struct StalenessDetector<'a> {
    state: &'a CatalogState,
    config: &'a EngineConfig,
}

impl<'a> StalenessDetector<'a> {
    pub fn new(state: &'a CatalogState, config: &'a EngineConfig) -> Self {
        Self { state, config }
    }

    /// Decide what `mv` needs: nothing, the stale partitions, or a full
    /// rebuild.
    ///
    /// Full rebuild triggers: a forced request, a view that has never been
    /// refreshed, a base table without partitioning (its changes cannot be
    /// attributed to individual view partitions), a reference-table
    /// partition with no same-named view partition, or a stale ratio
    /// strictly above the configured threshold.
    pub fn compute_refresh_set(
        &self,
        db: &str,
        mv: &Table,
        forced: bool,
        range: Option<&RefreshRange>,
    ) -> Result<RefreshSet> {
        let info = mv.mv().ok_or_else(|| RefreshError::NotMaterializedView {
            name: mv.name().to_string(),
        })?;

        let candidates: Vec<&Partition> = mv
            .partitions()
            .filter(|p| range.map(|r| r.covers(p.bounds())).unwrap_or(true))
            .collect();
        if candidates.is_empty() {
            return Ok(RefreshSet::NoOp);
        }

        let full = || {
            Ok(RefreshSet::Full {
                partitions: range.map(|_| candidates.iter().map(|p| p.id()).collect()),
            })
        };

        if forced || !info.has_been_refreshed() {
            return full();
        }
        for &base_id in info.base_tables() {
            let base = self.state.table_by_id(db, base_id)?;
            if !base.is_partitioned() {
                return full();
            }
            if info.reference_table() == Some(base_id) {
                for bp in base.partitions() {
                    if mv.partition_by_name(bp.name(), false).is_none() {
                        return full();
                    }
                }
            }
        }

        let live = self.live_base_versions(db, mv)?;
        let mut stale = Vec::new();
        for p in &candidates {
            let contributing = self.contributing_keys(db, mv, p)?;
            let is_stale = match info.recorded_for(p.id()) {
                None => true,
                Some(recorded) => !live.restrict(&contributing).diff(recorded).is_empty(),
            };
            if is_stale {
                stale.push(p.id());
            }
        }

        if stale.is_empty() {
            return Ok(RefreshSet::NoOp);
        }
        let ratio = stale.len() as f64 / candidates.len() as f64;
        tracing::debug!(
            "View {}: {}/{} partitions stale (ratio {:.2}, threshold {:.2})",
            mv.name(),
            stale.len(),
            candidates.len(),
            ratio,
            self.config.full_refresh_ratio
        );
        if ratio > self.config.full_refresh_ratio {
            return full();
        }
        Ok(RefreshSet::Incremental { partitions: stale })
    }

    /// The base partitions feeding one view partition. The reference
    /// table's same-named partition feeds it; every partition of every
    /// other base table feeds all view partitions.
    pub fn contributing_keys(
        &self,
        db: &str,
        mv: &Table,
        partition: &Partition,
    ) -> Result<Vec<PartitionKey>> {
        let info = mv.mv().ok_or_else(|| RefreshError::NotMaterializedView {
            name: mv.name().to_string(),
        })?;
        let mut keys = Vec::new();
        for &base_id in info.base_tables() {
            let base = self.state.table_by_id(db, base_id)?;
            if info.reference_table() == Some(base_id) {
                if let Some(rp) = base.partition_by_name(partition.name(), false) {
                    keys.push(PartitionKey::new(base_id, rp.id()));
                }
            } else {
                for bp in base.partitions() {
                    keys.push(PartitionKey::new(base_id, bp.id()));
                }
            }
        }
        keys.sort_unstable();
        Ok(keys)
    }

    /// The combined live versions of every base table of `mv`.
    pub fn live_base_versions(&self, db: &str, mv: &Table) -> Result<VersionMap> {
        let info = mv.mv().ok_or_else(|| RefreshError::NotMaterializedView {
            name: mv.name().to_string(),
        })?;
        let mut live = VersionMap::new();
        for &base_id in info.base_tables() {
            let base = self.state.table_by_id(db, base_id)?;
            for (key, ver) in base.live_versions().iter() {
                live.set(key, ver.version, ver.committed_at);
            }
        }
        Ok(live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, Column, MvInfo, TableKind};
    use crate::types::DataType;
    use chrono::Utc;

    fn int_bounds(lo: i64, hi: i64) -> PartitionBounds {
        PartitionBounds::Range {
            lower: Some(ScalarValue::Int64(lo)),
            upper: Some(ScalarValue::Int64(hi)),
        }
    }

    fn columns() -> Vec<Column> {
        vec![
            Column::new("k", DataType::Int64, false).key(),
            Column::new("v", DataType::Int64, true),
        ]
    }

    /// Base table with partitions p0..p{n-1}, ids `id*100 + i`, bounds
    /// [i, i+1).
    fn base_table(id: u64, n: u64) -> Table {
        let mut t = Table::new(id, format!("base{}", id), TableKind::Olap, columns())
            .with_partition_columns(vec!["k"]);
        for i in 0..n {
            t.add_partition(
                Partition::new(id * 100 + i, format!("p{}", i))
                    .with_bounds(int_bounds(i as i64, i as i64 + 1)),
            );
        }
        t
    }

    /// View mirroring `base`'s partitions by name, ids `id*100 + i`.
    fn mv_table(id: u64, base: &Table, extra_bases: &[u64]) -> Table {
        let mut base_ids = vec![base.id()];
        base_ids.extend_from_slice(extra_bases);
        let mut t = Table::new(id, format!("mv{}", id), TableKind::Olap, columns())
            .with_partition_columns(vec!["k"])
            .with_mv(MvInfo::new("SELECT k, v FROM src", base_ids).with_reference_table(base.id()));
        for (i, bp) in base.partitions().enumerate() {
            let mut p = Partition::new(id * 100 + i as u64, bp.name());
            if let Some(b) = bp.bounds() {
                p = p.with_bounds(b.clone());
            }
            t.add_partition(p);
        }
        t
    }

    /// Record every view partition as freshly refreshed against `bases`.
    fn record_in_sync(mv: &mut Table, bases: &[&Table]) {
        let mut live = VersionMap::new();
        for b in bases {
            for (k, v) in b.live_versions().iter() {
                live.set(k, v.version, v.committed_at);
            }
        }
        let ref_id = mv.mv().unwrap().reference_table();
        let mv_partitions: Vec<(u64, String)> = mv
            .partitions()
            .map(|p| (p.id(), p.name().to_string()))
            .collect();
        for (pid, name) in mv_partitions {
            let mut keys = Vec::new();
            for b in bases {
                if Some(b.id()) == ref_id {
                    if let Some(rp) = b.partition_by_name(&name, false) {
                        keys.push(PartitionKey::new(b.id(), rp.id()));
                    }
                } else {
                    for p in b.partitions() {
                        keys.push(PartitionKey::new(b.id(), p.id()));
                    }
                }
            }
            let slice = live.restrict(&keys);
            mv.mv_mut().unwrap().record(pid, slice);
        }
        mv.mv_mut().unwrap().mark_refreshed(Utc::now());
    }

    fn bump(base: &mut Table, partition_id: u64) {
        let p = base.partition_mut(partition_id).unwrap();
        let next = p.visible_version() + 1;
        p.advance_visible_version(next, Utc::now());
    }

    struct Fixture {
        catalog: Catalog,
        config: EngineConfig,
    }

    impl Fixture {
        fn new(tables: Vec<Table>, threshold: f64) -> Self {
            let catalog = Catalog::new();
            for t in tables {
                catalog.register_table("default", t).unwrap();
            }
            Self {
                catalog,
                config: EngineConfig::new().with_full_refresh_ratio(threshold),
            }
        }

        fn detect(&self, mv: &str, forced: bool, range: Option<&RefreshRange>) -> RefreshSet {
            let state = self.catalog.read();
            let mv = state.table("default", mv).unwrap();
            StalenessDetector::new(&state, &self.config)
                .compute_refresh_set("default", mv, forced, range)
                .unwrap()
        }
    }

    #[test]
    fn test_noop_when_in_sync() {
        let base = base_table(1, 10);
        let mut mv = mv_table(2, &base, &[]);
        record_in_sync(&mut mv, &[&base]);
        let f = Fixture::new(vec![base, mv], 0.5);
        assert_eq!(f.detect("mv2", false, None), RefreshSet::NoOp);
    }

    #[test]
    fn test_incremental_at_exact_threshold() {
        // 5 of 10 stale and threshold 0.5: not strictly above, stays
        // incremental
        let mut base = base_table(1, 10);
        let mut mv = mv_table(2, &base, &[]);
        record_in_sync(&mut mv, &[&base]);
        for i in 0..5 {
            bump(&mut base, 100 + i);
        }
        let f = Fixture::new(vec![base, mv], 0.5);
        assert_eq!(
            f.detect("mv2", false, None),
            RefreshSet::Incremental {
                partitions: vec![200, 201, 202, 203, 204]
            }
        );
    }

    #[test]
    fn test_full_when_ratio_exceeded() {
        let mut base = base_table(1, 10);
        let mut mv = mv_table(2, &base, &[]);
        record_in_sync(&mut mv, &[&base]);
        for i in 0..5 {
            bump(&mut base, 100 + i);
        }
        let f = Fixture::new(vec![base, mv], 0.4);
        assert_eq!(
            f.detect("mv2", false, None),
            RefreshSet::Full { partitions: None }
        );
    }

    #[test]
    fn test_full_when_forced_even_if_fresh() {
        let base = base_table(1, 4);
        let mut mv = mv_table(2, &base, &[]);
        record_in_sync(&mut mv, &[&base]);
        let f = Fixture::new(vec![base, mv], 0.5);
        assert_eq!(
            f.detect("mv2", true, None),
            RefreshSet::Full { partitions: None }
        );
    }

    #[test]
    fn test_full_when_never_refreshed() {
        let base = base_table(1, 4);
        let mv = mv_table(2, &base, &[]);
        let f = Fixture::new(vec![base, mv], 0.5);
        assert_eq!(
            f.detect("mv2", false, None),
            RefreshSet::Full { partitions: None }
        );
    }

    #[test]
    fn test_full_when_base_unpartitioned() {
        let base = base_table(1, 4);
        let dim = Table::new(3, "dim", TableKind::Olap, columns());
        let mut mv = mv_table(2, &base, &[3]);
        record_in_sync(&mut mv, &[&base, &dim]);
        let f = Fixture::new(vec![base, dim, mv], 0.5);
        assert_eq!(
            f.detect("mv2", false, None),
            RefreshSet::Full { partitions: None }
        );
    }

    #[test]
    fn test_full_when_reference_partition_unmatched() {
        let mut base = base_table(1, 4);
        let mut mv = mv_table(2, &base, &[]);
        record_in_sync(&mut mv, &[&base]);
        base.add_partition(Partition::new(110, "p10").with_bounds(int_bounds(10, 11)));
        let f = Fixture::new(vec![base, mv], 0.5);
        assert_eq!(
            f.detect("mv2", false, None),
            RefreshSet::Full { partitions: None }
        );
    }

    #[test]
    fn test_nonreference_partition_touches_every_view_partition() {
        let base = base_table(1, 4);
        let mut dim = base_table(3, 1);
        let mut mv = mv_table(2, &base, &[3]);
        record_in_sync(&mut mv, &[&base, &dim]);
        bump(&mut dim, 300);
        // every view partition goes stale; ratio 1.0 is not strictly above
        // a threshold of 1.0
        let f = Fixture::new(vec![base, dim, mv], 1.0);
        assert_eq!(
            f.detect("mv2", false, None),
            RefreshSet::Incremental {
                partitions: vec![200, 201, 202, 203]
            }
        );
    }

    #[test]
    fn test_new_nonreference_partition_marks_stale() {
        let base = base_table(1, 4);
        let mut dim = base_table(3, 1);
        let mut mv = mv_table(2, &base, &[3]);
        record_in_sync(&mut mv, &[&base, &dim]);
        dim.add_partition(Partition::new(301, "p1").with_bounds(int_bounds(1, 2)));
        let f = Fixture::new(vec![base, dim, mv], 1.0);
        assert!(matches!(
            f.detect("mv2", false, None),
            RefreshSet::Incremental { partitions } if partitions.len() == 4
        ));
    }

    #[test]
    fn test_dropped_nonreference_partition_marks_stale() {
        let base = base_table(1, 4);
        let mut dim = base_table(3, 2);
        let mut mv = mv_table(2, &base, &[3]);
        record_in_sync(&mut mv, &[&base, &dim]);
        dim.drop_partition(301);
        let f = Fixture::new(vec![base, dim, mv], 1.0);
        assert!(matches!(
            f.detect("mv2", false, None),
            RefreshSet::Incremental { partitions } if partitions.len() == 4
        ));
    }

    #[test]
    fn test_range_restricts_candidates_and_ratio() {
        // partitions p0..p9 with bounds [i, i+1); only p0 is stale
        let mut base = base_table(1, 10);
        let mut mv = mv_table(2, &base, &[]);
        record_in_sync(&mut mv, &[&base]);
        bump(&mut base, 100);

        // range [0, 3) keeps three candidates, one stale: 1/3 beats a 0.3
        // threshold and upgrades to a range-restricted full refresh
        let f = Fixture::new(vec![base, mv], 0.3);
        let range = RefreshRange::new(Some(ScalarValue::Int64(0)), Some(ScalarValue::Int64(3)));
        assert_eq!(
            f.detect("mv2", false, Some(&range)),
            RefreshSet::Full {
                partitions: Some(vec![200, 201, 202])
            }
        );

        let lenient = Fixture {
            catalog: f.catalog,
            config: EngineConfig::new().with_full_refresh_ratio(0.5),
        };
        assert_eq!(
            lenient.detect("mv2", false, Some(&range)),
            RefreshSet::Incremental {
                partitions: vec![200]
            }
        );
    }

    #[test]
    fn test_range_excluding_everything_is_noop() {
        let mut base = base_table(1, 4);
        let mut mv = mv_table(2, &base, &[]);
        record_in_sync(&mut mv, &[&base]);
        bump(&mut base, 100);
        let f = Fixture::new(vec![base, mv], 0.5);
        let range =
            RefreshRange::new(Some(ScalarValue::Int64(100)), Some(ScalarValue::Int64(200)));
        assert_eq!(f.detect("mv2", true, Some(&range)), RefreshSet::NoOp);
    }

    #[test]
    fn test_contributing_keys_reference_and_broadcast() {
        let base = base_table(1, 3);
        let dim = base_table(3, 2);
        let mut mv = mv_table(2, &base, &[3]);
        record_in_sync(&mut mv, &[&base, &dim]);
        let f = Fixture::new(vec![base, dim, mv], 0.5);

        let state = f.catalog.read();
        let mv = state.table("default", "mv2").unwrap();
        let p1 = mv.partition(201).unwrap();
        let keys = StalenessDetector::new(&state, &f.config)
            .contributing_keys("default", mv, p1)
            .unwrap();
        assert_eq!(
            keys,
            vec![
                PartitionKey::new(1, 101),
                PartitionKey::new(3, 300),
                PartitionKey::new(3, 301),
            ]
        );
    }

    #[test]
    fn test_range_union_widens() {
        let a = RefreshRange::new(Some(ScalarValue::Int64(5)), Some(ScalarValue::Int64(10)));
        let b = RefreshRange::new(Some(ScalarValue::Int64(0)), Some(ScalarValue::Int64(7)));
        assert_eq!(
            a.union(&b),
            RefreshRange::new(Some(ScalarValue::Int64(0)), Some(ScalarValue::Int64(10)))
        );
        let unbounded = RefreshRange::new(None, Some(ScalarValue::Int64(7)));
        assert_eq!(
            a.union(&unbounded),
            RefreshRange::new(None, Some(ScalarValue::Int64(10)))
        );
    }
}
