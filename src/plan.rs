//! Refresh plan construction.
//!
//! Turns a refresh decision into the overwrite statement that carries it
//! out: target = the view's backing table, partition clause = the stale
//! partition names, source = the view's defining query narrowed by a
//! predicate over the partition key so only the stale key ranges are
//! recomputed. Full rebuilds skip the narrowing.

use crate::catalog::{Partition, PartitionBounds, Table};
use crate::dml::{DmlStatement, SourceQuery};
use crate::error::{RefreshError, Result};
use crate::staleness::RefreshSet;

/// Builds overwrite statements for one view.
pub struct RefreshPlanBuilder<'a> {
    db: &'a str,
    mv: &'a Table,
}

impl<'a> RefreshPlanBuilder<'a> {
    pub fn new(db: &'a str, mv: &'a Table) -> Self {
        Self { db, mv }
    }

    /// Build the overwrite statement for `set`. Must not be called for a
    /// no-op decision.
    pub fn build(&self, set: &RefreshSet) -> Result<DmlStatement> {
        let defining = self
            .mv
            .mv()
            .map(|info| info.defining_query())
            .ok_or_else(|| RefreshError::NotMaterializedView {
                name: self.mv.name().to_string(),
            })?;
        match set {
            RefreshSet::NoOp => Err(RefreshError::internal(
                "no overwrite statement for a no-op refresh",
            )),
            RefreshSet::Full { partitions: None } => Ok(self.overwrite(defining, None, None)),
            RefreshSet::Full {
                partitions: Some(ids),
            } => {
                let partitions = self.target_partitions(ids)?;
                Ok(self.overwrite(defining, Some(&partitions), None))
            }
            RefreshSet::Incremental { partitions: ids } => {
                // The predicate needs a single partition key column to
                // range over; anything else forces a whole-view rebuild.
                if self.mv.partition_columns().len() != 1 {
                    return Ok(self.overwrite(defining, None, None));
                }
                let key = &self.mv.partition_columns()[0];
                let partitions = self.target_partitions(ids)?;
                let predicate = self.render_predicate(key, &partitions)?;
                Ok(self.overwrite(defining, Some(&partitions), predicate))
            }
        }
    }

    fn target_partitions(&self, ids: &[u64]) -> Result<Vec<&Partition>> {
        ids.iter()
            .map(|&id| {
                self.mv.partition(id).ok_or_else(|| {
                    RefreshError::internal(format!(
                        "refresh set names partition {} which '{}' does not have",
                        id,
                        self.mv.name()
                    ))
                })
            })
            .collect()
    }

    /// One predicate group per partition, OR-joined. Returns `None` when a
    /// partition's bounds cover everything, in which case no narrowing is
    /// possible or needed.
    fn render_predicate(&self, key: &str, partitions: &[&Partition]) -> Result<Option<String>> {
        let mut groups = Vec::with_capacity(partitions.len());
        for p in partitions {
            let bounds = p.bounds().ok_or_else(|| {
                RefreshError::plan_build(format!(
                    "partition '{}' of '{}' has no bounds to derive a refresh predicate from",
                    p.name(),
                    self.mv.name()
                ))
            })?;
            match bounds {
                PartitionBounds::Range { lower, upper } => {
                    let mut conjuncts = Vec::new();
                    if let Some(lo) = lower {
                        conjuncts.push(format!("{} >= {}", key, lo));
                    }
                    if let Some(hi) = upper {
                        conjuncts.push(format!("{} < {}", key, hi));
                    }
                    if conjuncts.is_empty() {
                        return Ok(None);
                    }
                    groups.push(conjuncts.join(" AND "));
                }
                PartitionBounds::List { values } => {
                    if values.is_empty() {
                        return Err(RefreshError::plan_build(format!(
                            "partition '{}' of '{}' has an empty value list",
                            p.name(),
                            self.mv.name()
                        )));
                    }
                    let rendered: Vec<String> = values.iter().map(|v| v.to_string()).collect();
                    groups.push(format!("{} IN ({})", key, rendered.join(", ")));
                }
            }
        }
        if groups.len() == 1 {
            Ok(Some(groups.remove(0)))
        } else {
            let joined: Vec<String> = groups.into_iter().map(|g| format!("({})", g)).collect();
            Ok(Some(joined.join(" OR ")))
        }
    }

    fn overwrite(
        &self,
        defining: &str,
        partitions: Option<&[&Partition]>,
        predicate: Option<String>,
    ) -> DmlStatement {
        let sql = match &predicate {
            Some(p) => format!("SELECT * FROM ({}) AS src WHERE {}", defining, p),
            None => defining.to_string(),
        };
        let field_count = self.mv.writable_columns().count();
        let mut stmt = DmlStatement::insert(
            self.db,
            self.mv.name(),
            SourceQuery::new(sql, field_count),
        )
        .overwrite()
        .system();
        if let Some(partitions) = partitions {
            let names: Vec<&str> = partitions.iter().map(|p| p.name()).collect();
            stmt = stmt.with_partition_names(names, false);
        }
        stmt
    }
}
