//! Run processing: one refresh from decision to commit.
//!
//! Implements [`TaskRunProcessor`] over the catalog and the execution
//! collaborators. A run flows through four phases: decide what to refresh
//! (read snapshot), analyze the source query (no lock), resolve the write
//! target and execute (metadata lock), commit the version bookkeeping
//! (same lock, same critical section as the data swap). Recoverable
//! execution failures re-run the same plan up to the run's retry budget.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::error::{ErrorClass, RefreshError, Result};
use crate::exec::{ExecutablePlan, ExecutionEngine, QueryAnalyzer};
use crate::journal::{JournalEntry, MetaJournal, VersionCommitRecord};
use crate::plan::RefreshPlanBuilder;
use crate::resolver::resolve_targets;
use crate::staleness::StalenessDetector;
use crate::task::{RunOutcome, TaskRun, TaskRunProcessor};

/// Drives dispatched runs against a catalog.
pub struct RefreshProcessor {
    catalog: Arc<Catalog>,
    analyzer: Arc<dyn QueryAnalyzer>,
    engine: Arc<dyn ExecutionEngine>,
    config: EngineConfig,
    journal: Option<Arc<MetaJournal>>,
}

impl RefreshProcessor {
    pub fn new(
        catalog: Arc<Catalog>,
        analyzer: Arc<dyn QueryAnalyzer>,
        engine: Arc<dyn ExecutionEngine>,
        config: EngineConfig,
    ) -> Self {
        Self {
            catalog,
            analyzer,
            engine,
            config,
            journal: None,
        }
    }

    /// Record committed version maps to `journal`.
    pub fn with_journal(mut self, journal: Arc<MetaJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    fn refresh(&self, run: &TaskRun, retries: &mut u32) -> Result<u64> {
        // Decide and plan against a read snapshot.
        let statement = {
            let state = self.catalog.read();
            let mv = state.table(run.database(), run.view())?;
            let detector = StalenessDetector::new(&state, &self.config);
            let set =
                detector.compute_refresh_set(run.database(), mv, run.is_forced(), run.range())?;
            if set.is_noop() {
                tracing::debug!(
                    "View {}.{} is in sync, nothing to refresh",
                    run.database(),
                    run.view()
                );
                return Ok(0);
            }
            RefreshPlanBuilder::new(run.database(), mv).build(&set)?
        };

        // Analyze the source query without any catalog lock.
        let source = self.analyzer.analyze(statement.source().sql())?;

        // Take the metadata lock and hold it through commit. The partition
        // names in the statement re-validate against the definition as it
        // stands now, not as it stood at planning time.
        let mut meta = self.catalog.lock_metadata();
        let (mv_id, resolution, recorded) = {
            let state = &*meta;
            let mv = state.table(run.database(), run.view())?;
            let resolution = resolve_targets(mv, &statement, &self.config)?;

            // Snapshot the contributing base versions per target partition.
            // Nothing can commit while the lock is held, so the snapshot is
            // exactly what the overwrite will read.
            let detector = StalenessDetector::new(state, &self.config);
            let live = detector.live_base_versions(run.database(), mv)?;
            let mut recorded = BTreeMap::new();
            for &pid in &resolution.partition_ids {
                let partition = mv.partition(pid).ok_or_else(|| {
                    RefreshError::internal(format!("resolved partition id={} vanished", pid))
                })?;
                let contributing = detector.contributing_keys(run.database(), mv, partition)?;
                recorded.insert(pid, live.restrict(&contributing));
            }
            (mv.id(), resolution, recorded)
        };

        let targets = resolution.partition_ids.clone();
        let plan = ExecutablePlan::new(statement, source, resolution);
        let rows = self.execute_with_retry(run, &plan, retries)?;

        let now = Utc::now();
        meta.commit_refresh(run.database(), mv_id, &targets, &recorded, now)?;
        if let Some(journal) = &self.journal {
            journal.append(&JournalEntry::VersionsCommitted(VersionCommitRecord {
                database: run.database().to_string(),
                table_id: mv_id,
                partitions: recorded.into_iter().collect(),
                refreshed_at: now,
            }))?;
        }
        Ok(rows)
    }

    fn execute_with_retry(
        &self,
        run: &TaskRun,
        plan: &ExecutablePlan,
        retries: &mut u32,
    ) -> Result<u64> {
        loop {
            match self.engine.execute(plan) {
                Ok(rows) => return Ok(rows),
                Err(e) => {
                    let err = RefreshError::from(e);
                    if err.class() == ErrorClass::Transient && *retries < run.max_retries() {
                        *retries += 1;
                        tracing::warn!(
                            "Run {} execution failed (attempt {}), retrying: {}",
                            run.id(),
                            *retries,
                            err
                        );
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

impl TaskRunProcessor for RefreshProcessor {
    fn process(&self, run: &TaskRun) -> RunOutcome {
        let mut retries = 0;
        match self.refresh(run, &mut retries) {
            Ok(rows_affected) => RunOutcome::Success {
                rows_affected,
                retries,
            },
            Err(error) => RunOutcome::Failed { error, retries },
        }
    }
}
