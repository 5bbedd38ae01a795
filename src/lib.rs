//! Relume - Incremental Refresh Engine for Materialized Views
//!
//! Relume keeps materialized views in sync with their base tables by
//! refreshing only the view partitions whose inputs actually changed. It
//! tracks committed versions per base partition, diffs them against what
//! each view partition recorded at its last refresh, and turns the
//! difference into a partition-restricted overwrite of the view's backing
//! table.
//!
//! # Features
//!
//! - **Partition-level staleness**: per-partition version maps pinpoint
//!   exactly which view partitions are behind their inputs
//! - **Minimal rebuilds**: incremental refreshes rewrite only the stale
//!   partitions, upgrading to a full rebuild past a configurable ratio
//! - **Deferred locking**: source queries are analyzed without the catalog
//!   lock; the lock is taken only from target resolution through commit
//! - **Merged submissions**: requests queued behind an existing pending
//!   run widen that run instead of piling up
//! - **Durable metadata**: task definitions, run transitions, and recorded
//!   versions replay from an append-only journal after a restart
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use relume::catalog::Catalog;
//! use relume::exec::{ExecError, ExecutablePlan, ExecutionEngine, PassthroughAnalyzer};
//! use relume::task::{SubmitOptions, Task, TaskSchedule};
//! use relume::{EngineConfig, RefreshEngine, Result};
//!
//! /// Hands overwrite statements to the storage layer.
//! struct Backend;
//!
//! impl ExecutionEngine for Backend {
//!     fn execute(&self, plan: &ExecutablePlan) -> std::result::Result<u64, ExecError> {
//!         println!("executing: {}", plan.source().sql());
//!         Ok(0)
//!     }
//! }
//!
//! fn main() -> Result<()> {
//!     let catalog = Arc::new(Catalog::new());
//!     catalog.create_database("sales");
//!     // register base tables and the materialized view here
//!
//!     let engine = RefreshEngine::new(
//!         catalog,
//!         Arc::new(PassthroughAnalyzer),
//!         Arc::new(Backend),
//!         EngineConfig::default(),
//!     );
//!     engine.create_task(Task::new(
//!         "refresh_daily_mv",
//!         "sales",
//!         "daily_mv",
//!         TaskSchedule::Manual,
//!     ))?;
//!     let run_id = engine.submit("refresh_daily_mv", SubmitOptions::new().forced())?;
//!     engine.run_pending()?;
//!     println!("{}", engine.run_status(run_id)?);
//!     Ok(())
//! }
//! ```

pub mod catalog;
pub mod config;
pub mod dml;
pub mod error;
pub mod exec;
pub mod journal;
pub mod plan;
pub mod processor;
pub mod resolver;
pub mod staleness;
pub mod task;
pub mod types;

// Re-export commonly used types
pub use config::EngineConfig;
pub use error::{ErrorClass, RefreshError, Result};
pub use staleness::{RefreshRange, RefreshSet};
pub use types::{DataType, ScalarValue};

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use catalog::Catalog;
use exec::{ExecutionEngine, QueryAnalyzer};
use journal::{MetaJournal, VersionCommitRecord};
use processor::RefreshProcessor;
use task::{RunStatus, SubmitOptions, Task, TaskRun, TaskScheduler};

/// The assembled engine: catalog, scheduler, and processor behind one
/// handle.
///
/// `RefreshEngine` is the main entry point. Register tables through
/// [`RefreshEngine::catalog`], define tasks, submit runs, and drive them
/// with [`RefreshEngine::execute_next`] from however many worker threads
/// the embedder provides. The handle is `Sync`; share it with `Arc`.
pub struct RefreshEngine {
    catalog: Arc<Catalog>,
    scheduler: TaskScheduler,
    processor: RefreshProcessor,
}

impl RefreshEngine {
    /// Create an engine without a journal. Nothing survives a restart.
    pub fn new(
        catalog: Arc<Catalog>,
        analyzer: Arc<dyn QueryAnalyzer>,
        engine: Arc<dyn ExecutionEngine>,
        config: EngineConfig,
    ) -> Self {
        let scheduler = TaskScheduler::new(config.clone());
        let processor = RefreshProcessor::new(catalog.clone(), analyzer, engine, config);
        Self {
            catalog,
            scheduler,
            processor,
        }
    }

    /// Create an engine journaled at `path`, replaying whatever the
    /// journal holds: task definitions, finished runs, and the version
    /// maps recorded by committed refreshes. Runs that were live when the
    /// process stopped come back FAILED.
    ///
    /// Table definitions are not journaled. The caller registers them into
    /// `catalog` first; recovered version maps for tables that are not
    /// registered are dropped with a warning.
    pub fn open(
        path: impl AsRef<Path>,
        catalog: Arc<Catalog>,
        analyzer: Arc<dyn QueryAnalyzer>,
        engine: Arc<dyn ExecutionEngine>,
        config: EngineConfig,
    ) -> Result<Self> {
        let journal = Arc::new(MetaJournal::open(path)?);
        let recovered = journal.recover()?;
        Self::apply_recovered_versions(&catalog, &recovered.versions);
        let scheduler = TaskScheduler::restore(config.clone(), recovered.tasks, recovered.runs)
            .with_journal(journal.clone());
        let processor =
            RefreshProcessor::new(catalog.clone(), analyzer, engine, config).with_journal(journal);
        Ok(Self {
            catalog,
            scheduler,
            processor,
        })
    }

    fn apply_recovered_versions(catalog: &Catalog, records: &[VersionCommitRecord]) {
        let mut meta = catalog.lock_metadata();
        for record in records {
            let table = match meta.table_by_id_mut(&record.database, record.table_id) {
                Ok(table) => table,
                Err(_) => {
                    tracing::warn!(
                        "Journal names table id={} in '{}' which is not registered, dropping its version maps",
                        record.table_id,
                        record.database
                    );
                    continue;
                }
            };
            let live: Vec<u64> = table.partitions().map(|p| p.id()).collect();
            if let Some(mv) = table.mv_mut() {
                for (pid, versions) in &record.partitions {
                    if live.contains(pid) {
                        mv.record(*pid, versions.clone());
                    }
                }
                mv.mark_refreshed(record.refreshed_at);
            }
        }
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Register a refresh task for a view.
    pub fn create_task(&self, task: Task) -> Result<()> {
        self.scheduler.create_task(task)
    }

    /// Queue a refresh. Returns immediately with the run's id; if the task
    /// already has a pending run, the request merges into it and the
    /// returned run ends MERGED.
    pub fn submit(&self, task_name: &str, options: SubmitOptions) -> Result<Uuid> {
        self.scheduler.submit(task_name, options)
    }

    /// Dispatch and finish one eligible run. `None` when nothing is
    /// eligible. Call from worker threads.
    pub fn execute_next(&self) -> Result<Option<Uuid>> {
        self.scheduler.execute_next(&self.processor)
    }

    /// Drain the queue on the calling thread. Returns how many runs
    /// finished.
    pub fn run_pending(&self) -> Result<usize> {
        let mut count = 0;
        while self.scheduler.execute_next(&self.processor)?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Queue runs for periodic tasks whose interval has elapsed.
    pub fn poll_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        self.scheduler.poll_due(now)
    }

    /// Cancel a run that has not been dispatched yet.
    pub fn cancel(&self, run_id: Uuid) -> Result<()> {
        self.scheduler.cancel(run_id)
    }

    pub fn run(&self, run_id: Uuid) -> Result<TaskRun> {
        self.scheduler.run(run_id)
    }

    pub fn run_status(&self, run_id: Uuid) -> Result<RunStatus> {
        self.scheduler.run_status(run_id)
    }

    pub fn task_runs(&self, task_name: &str) -> Result<Vec<TaskRun>> {
        self.scheduler.task_runs(task_name)
    }
}
