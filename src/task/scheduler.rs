//! Run scheduling: submission, merging, dispatch, history.
//!
//! The scheduler owns every run. At most one PENDING run exists per task
//! (later submissions merge into it) and at most one run of a task is
//! RUNNING at a time. Workers drive execution by calling
//! [`TaskScheduler::execute_next`]; the processor runs outside the
//! scheduler lock so long refreshes never block submission or inspection.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{RefreshError, Result};
use crate::journal::{JournalEntry, MetaJournal};
use crate::staleness::RefreshRange;
use crate::task::run::{RunOutcome, RunStatus, TaskRun};
use crate::task::{Task, TaskSchedule};

/// Per-submission parameters.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    forced: bool,
    range: Option<RefreshRange>,
}

impl SubmitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a full rebuild regardless of staleness.
    pub fn forced(mut self) -> Self {
        self.forced = true;
        self
    }

    /// Restrict the refresh to view partitions overlapping `range`.
    pub fn with_range(mut self, range: RefreshRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn range(&self) -> Option<&RefreshRange> {
        self.range.as_ref()
    }
}

/// Executes one dispatched run to a terminal outcome.
pub trait TaskRunProcessor: Send + Sync {
    fn process(&self, run: &TaskRun) -> RunOutcome;
}

#[derive(Default)]
struct SchedulerState {
    tasks: HashMap<String, Task>,
    /// Live runs: at most one PENDING plus at most one RUNNING per task.
    runs: HashMap<Uuid, TaskRun>,
    pending_by_task: HashMap<String, Uuid>,
    running_tasks: HashSet<String>,
    history: HashMap<String, VecDeque<TaskRun>>,
    last_submitted: HashMap<String, DateTime<Utc>>,
    next_seq: u64,
}

/// The run registry and dispatch queue.
pub struct TaskScheduler {
    config: EngineConfig,
    journal: Option<Arc<MetaJournal>>,
    state: Mutex<SchedulerState>,
}

impl TaskScheduler {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            journal: None,
            state: Mutex::new(SchedulerState::default()),
        }
    }

    /// Record task definitions and run transitions to `journal`.
    pub fn with_journal(mut self, journal: Arc<MetaJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Rebuild a scheduler from journaled state. `runs` must be terminal;
    /// anything else is discarded.
    pub fn restore(config: EngineConfig, tasks: Vec<Task>, runs: Vec<TaskRun>) -> Self {
        let scheduler = Self::new(config);
        {
            let mut state = scheduler.state.lock();
            for task in tasks {
                state.tasks.insert(task.name().to_string(), task);
            }
            let limit = scheduler.config.run_history_limit;
            for run in runs.into_iter().filter(|r| r.status().is_terminal()) {
                let last = state
                    .last_submitted
                    .entry(run.task_name().to_string())
                    .or_insert_with(|| run.created_at());
                if run.created_at() > *last {
                    *last = run.created_at();
                }
                Self::push_history(&mut state, run, limit);
            }
        }
        scheduler
    }

    pub fn create_task(&self, task: Task) -> Result<()> {
        let mut state = self.state.lock();
        if state.tasks.contains_key(task.name()) {
            return Err(RefreshError::TaskExists {
                name: task.name().to_string(),
            });
        }
        self.journal_append(&JournalEntry::TaskCreated(task.clone()))?;
        state.tasks.insert(task.name().to_string(), task);
        Ok(())
    }

    pub fn task(&self, name: &str) -> Result<Task> {
        self.state
            .lock()
            .tasks
            .get(name)
            .cloned()
            .ok_or_else(|| RefreshError::task_not_found(name))
    }

    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().tasks.keys().cloned().collect();
        names.sort();
        names
    }

    /// Queue a run for `task_name`. If the task already has a PENDING run,
    /// the submission is absorbed into it: the pending run's parameters
    /// widen and the returned run ends MERGED, pointing at its absorber.
    pub fn submit(&self, task_name: &str, options: SubmitOptions) -> Result<Uuid> {
        let mut state = self.state.lock();
        let task = state
            .tasks
            .get(task_name)
            .cloned()
            .ok_or_else(|| RefreshError::task_not_found(task_name))?;
        let now = Utc::now();
        state.last_submitted.insert(task.name().to_string(), now);
        state.next_seq += 1;
        let seq = state.next_seq;

        if let Some(&absorber_id) = state.pending_by_task.get(task_name) {
            let absorber = state
                .runs
                .get_mut(&absorber_id)
                .ok_or_else(|| RefreshError::internal("pending run missing from registry"))?;
            absorber.widen(options.forced, options.range.as_ref());
            let widened = absorber.clone();

            let mut merged = TaskRun::new(&task, &self.config, seq, options.forced, options.range);
            let merged_id = merged.id();
            merged.merge_into(absorber_id, now)?;
            self.journal_append(&JournalEntry::RunTransition(widened))?;
            self.journal_append(&JournalEntry::RunTransition(merged.clone()))?;
            tracing::debug!(
                "Merged submission {} for task {} into pending run {}",
                merged_id,
                task_name,
                absorber_id
            );
            Self::push_history(&mut state, merged, self.config.run_history_limit);
            return Ok(merged_id);
        }

        let run = TaskRun::new(&task, &self.config, seq, options.forced, options.range);
        let id = run.id();
        self.journal_append(&JournalEntry::RunTransition(run.clone()))?;
        state.pending_by_task.insert(task.name().to_string(), id);
        state.runs.insert(id, run);
        Ok(id)
    }

    /// Dispatch the best eligible PENDING run and drive it to a terminal
    /// state. Returns the run's id, or `None` when nothing is eligible.
    /// The processor runs without the scheduler lock.
    pub fn execute_next(&self, processor: &dyn TaskRunProcessor) -> Result<Option<Uuid>> {
        let snapshot = {
            let mut state = self.state.lock();
            let Some(id) = Self::pick_next(&state) else {
                return Ok(None);
            };
            let run = state
                .runs
                .get_mut(&id)
                .ok_or_else(|| RefreshError::internal("pending run missing from registry"))?;
            run.start(Utc::now())?;
            let snapshot = run.clone();
            state.pending_by_task.remove(snapshot.task_name());
            state.running_tasks.insert(snapshot.task_name().to_string());
            self.journal_append(&JournalEntry::RunTransition(snapshot.clone()))?;
            snapshot
        };

        tracing::debug!(
            "Dispatching run {} for task {}",
            snapshot.id(),
            snapshot.task_name()
        );
        let outcome = processor.process(&snapshot);

        let mut state = self.state.lock();
        let mut run = state
            .runs
            .remove(&snapshot.id())
            .ok_or_else(|| RefreshError::internal("running run missing from registry"))?;
        let now = Utc::now();
        match outcome {
            RunOutcome::Success {
                rows_affected,
                retries,
            } => {
                run.set_retries(retries);
                run.succeed(rows_affected, now)?;
            }
            RunOutcome::Failed { error, retries } => {
                tracing::warn!(
                    "Run {} for task {} failed: {}",
                    run.id(),
                    run.task_name(),
                    error
                );
                run.set_retries(retries);
                run.fail(error.to_string(), now)?;
            }
        }
        state.running_tasks.remove(run.task_name());
        self.journal_append(&JournalEntry::RunTransition(run.clone()))?;
        Self::push_history(&mut state, run, self.config.run_history_limit);
        Ok(Some(snapshot.id()))
    }

    /// Drop a run from the queue. Only a PENDING run can be cancelled.
    pub fn cancel(&self, run_id: Uuid) -> Result<()> {
        let mut state = self.state.lock();
        match state.runs.get(&run_id).map(|r| r.status()) {
            Some(RunStatus::Pending) => {
                let mut run = state
                    .runs
                    .remove(&run_id)
                    .ok_or_else(|| RefreshError::internal("pending run missing from registry"))?;
                state.pending_by_task.remove(run.task_name());
                run.cancel(Utc::now())?;
                self.journal_append(&JournalEntry::RunTransition(run.clone()))?;
                Self::push_history(&mut state, run, self.config.run_history_limit);
                Ok(())
            }
            Some(status) => Err(RefreshError::RunNotCancellable {
                id: run_id,
                status: status.to_string(),
            }),
            None => match Self::find_in_history(&state, run_id) {
                Some(run) => Err(RefreshError::RunNotCancellable {
                    id: run_id,
                    status: run.status().to_string(),
                }),
                None => Err(RefreshError::RunNotFound { id: run_id }),
            },
        }
    }

    /// Look up a run, live or historical.
    pub fn run(&self, run_id: Uuid) -> Result<TaskRun> {
        let state = self.state.lock();
        if let Some(run) = state.runs.get(&run_id) {
            return Ok(run.clone());
        }
        Self::find_in_history(&state, run_id)
            .cloned()
            .ok_or(RefreshError::RunNotFound { id: run_id })
    }

    pub fn run_status(&self, run_id: Uuid) -> Result<RunStatus> {
        Ok(self.run(run_id)?.status())
    }

    /// All runs of a task: bounded history first, then live runs.
    pub fn task_runs(&self, task_name: &str) -> Result<Vec<TaskRun>> {
        let state = self.state.lock();
        if !state.tasks.contains_key(task_name) {
            return Err(RefreshError::task_not_found(task_name));
        }
        let mut out: Vec<TaskRun> = state
            .history
            .get(task_name)
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default();
        out.extend(
            state
                .runs
                .values()
                .filter(|r| r.task_name() == task_name)
                .cloned(),
        );
        Ok(out)
    }

    /// Submit runs for periodic tasks whose interval has elapsed. Tasks
    /// with a live run are skipped rather than merged. Returns the created
    /// run ids.
    pub fn poll_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let due: Vec<String> = {
            let state = self.state.lock();
            state
                .tasks
                .values()
                .filter_map(|task| {
                    let TaskSchedule::Periodic { interval } = task.schedule() else {
                        return None;
                    };
                    if state.pending_by_task.contains_key(task.name())
                        || state.running_tasks.contains(task.name())
                    {
                        return None;
                    }
                    let elapsed = match state.last_submitted.get(task.name()) {
                        None => true,
                        Some(last) => {
                            let interval = chrono::Duration::from_std(*interval)
                                .unwrap_or(chrono::Duration::MAX);
                            now.signed_duration_since(*last) >= interval
                        }
                    };
                    elapsed.then(|| task.name().to_string())
                })
                .collect()
        };

        let mut ids = Vec::with_capacity(due.len());
        for name in due {
            ids.push(self.submit(&name, SubmitOptions::new())?);
        }
        Ok(ids)
    }

    fn pick_next(state: &SchedulerState) -> Option<Uuid> {
        state
            .pending_by_task
            .iter()
            .filter(|(task, _)| !state.running_tasks.contains(*task))
            .filter_map(|(_, id)| state.runs.get(id))
            .min_by(|a, b| {
                b.priority()
                    .cmp(&a.priority())
                    .then(a.created_at().cmp(&b.created_at()))
                    .then(a.seq().cmp(&b.seq()))
            })
            .map(|r| r.id())
    }

    fn find_in_history(state: &SchedulerState, run_id: Uuid) -> Option<&TaskRun> {
        state
            .history
            .values()
            .flat_map(|h| h.iter())
            .find(|r| r.id() == run_id)
    }

    fn push_history(state: &mut SchedulerState, run: TaskRun, limit: usize) {
        let h = state.history.entry(run.task_name().to_string()).or_default();
        h.push_back(run);
        while h.len() > limit {
            h.pop_front();
        }
    }

    fn journal_append(&self, entry: &JournalEntry) -> Result<()> {
        if let Some(journal) = &self.journal {
            journal.append(entry)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskConfig;
    use std::time::Duration;

    fn manual_task(name: &str) -> Task {
        Task::new(name, "db1", "mv1", TaskSchedule::Manual)
    }

    #[derive(Default)]
    struct Recording {
        names: Mutex<Vec<String>>,
    }

    impl TaskRunProcessor for Recording {
        fn process(&self, run: &TaskRun) -> RunOutcome {
            self.names.lock().push(run.task_name().to_string());
            RunOutcome::Success {
                rows_affected: 1,
                retries: 0,
            }
        }
    }

    #[test]
    fn test_duplicate_task_rejected() {
        let s = TaskScheduler::new(EngineConfig::default());
        s.create_task(manual_task("t")).unwrap();
        assert!(matches!(
            s.create_task(manual_task("t")).unwrap_err(),
            RefreshError::TaskExists { .. }
        ));
    }

    #[test]
    fn test_submit_unknown_task() {
        let s = TaskScheduler::new(EngineConfig::default());
        assert!(matches!(
            s.submit("nope", SubmitOptions::new()).unwrap_err(),
            RefreshError::TaskNotFound { .. }
        ));
    }

    #[test]
    fn test_second_submission_merges_and_widens() {
        let s = TaskScheduler::new(EngineConfig::default());
        s.create_task(manual_task("t")).unwrap();
        let first = s.submit("t", SubmitOptions::new()).unwrap();
        let second = s.submit("t", SubmitOptions::new().forced()).unwrap();
        assert_ne!(first, second);

        let merged = s.run(second).unwrap();
        assert_eq!(merged.status(), RunStatus::Merged);
        assert_eq!(merged.merged_into(), Some(first));

        // the pending run absorbed the forced flag
        let absorber = s.run(first).unwrap();
        assert_eq!(absorber.status(), RunStatus::Pending);
        assert!(absorber.is_forced());
    }

    #[test]
    fn test_execute_next_runs_to_success() {
        let s = TaskScheduler::new(EngineConfig::default());
        s.create_task(manual_task("t")).unwrap();
        let id = s.submit("t", SubmitOptions::new()).unwrap();
        let p = Recording::default();
        assert_eq!(s.execute_next(&p).unwrap(), Some(id));
        let run = s.run(id).unwrap();
        assert_eq!(run.status(), RunStatus::Success);
        assert_eq!(run.rows_affected(), Some(1));
        assert!(run.started_at().is_some() && run.finished_at().is_some());
        // nothing left to dispatch
        assert_eq!(s.execute_next(&p).unwrap(), None);
    }

    #[test]
    fn test_failed_outcome_records_error() {
        struct Failing;
        impl TaskRunProcessor for Failing {
            fn process(&self, _run: &TaskRun) -> RunOutcome {
                RunOutcome::Failed {
                    error: RefreshError::execution("tablet write timeout", true),
                    retries: 1,
                }
            }
        }
        let s = TaskScheduler::new(EngineConfig::default());
        s.create_task(manual_task("t")).unwrap();
        let id = s.submit("t", SubmitOptions::new()).unwrap();
        s.execute_next(&Failing).unwrap();
        let run = s.run(id).unwrap();
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.retries(), 1);
        assert!(run.error().unwrap().contains("tablet write timeout"));
    }

    #[test]
    fn test_dispatch_order_priority_then_fifo() {
        let s = TaskScheduler::new(EngineConfig::default());
        s.create_task(manual_task("a")).unwrap();
        s.create_task(
            manual_task("b").with_config(TaskConfig::new().with_priority(5)),
        )
        .unwrap();
        s.create_task(manual_task("c")).unwrap();
        s.submit("a", SubmitOptions::new()).unwrap();
        s.submit("b", SubmitOptions::new()).unwrap();
        s.submit("c", SubmitOptions::new()).unwrap();

        let p = Recording::default();
        while s.execute_next(&p).unwrap().is_some() {}
        assert_eq!(*p.names.lock(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_no_second_dispatch_while_running() {
        struct Never;
        impl TaskRunProcessor for Never {
            fn process(&self, _run: &TaskRun) -> RunOutcome {
                unreachable!("dispatched while another run of the task is active")
            }
        }

        struct Reentrant {
            scheduler: Arc<TaskScheduler>,
            inner_dispatch: Mutex<Option<Option<Uuid>>>,
        }
        impl TaskRunProcessor for Reentrant {
            fn process(&self, _run: &TaskRun) -> RunOutcome {
                // queue a second run mid-flight, then try to dispatch it
                self.scheduler.submit("t", SubmitOptions::new()).unwrap();
                *self.inner_dispatch.lock() = Some(self.scheduler.execute_next(&Never).unwrap());
                RunOutcome::Success {
                    rows_affected: 0,
                    retries: 0,
                }
            }
        }

        let scheduler = Arc::new(TaskScheduler::new(EngineConfig::default()));
        scheduler.create_task(manual_task("t")).unwrap();
        scheduler.submit("t", SubmitOptions::new()).unwrap();
        let p = Reentrant {
            scheduler: scheduler.clone(),
            inner_dispatch: Mutex::new(None),
        };
        scheduler.execute_next(&p).unwrap();
        assert_eq!(*p.inner_dispatch.lock(), Some(None));

        // the mid-flight submission dispatches once the first run finished
        assert!(scheduler.execute_next(&Recording::default()).unwrap().is_some());
    }

    #[test]
    fn test_cancel_rules() {
        let s = TaskScheduler::new(EngineConfig::default());
        s.create_task(manual_task("t")).unwrap();
        let id = s.submit("t", SubmitOptions::new()).unwrap();
        s.cancel(id).unwrap();
        let run = s.run(id).unwrap();
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.error(), Some("cancelled before dispatch"));

        // terminal runs cannot be cancelled again
        assert!(matches!(
            s.cancel(id).unwrap_err(),
            RefreshError::RunNotCancellable { .. }
        ));
        assert!(matches!(
            s.cancel(Uuid::new_v4()).unwrap_err(),
            RefreshError::RunNotFound { .. }
        ));
        // the queue is free for the next submission
        assert!(s.submit("t", SubmitOptions::new()).is_ok());
    }

    #[test]
    fn test_history_is_bounded() {
        let config = EngineConfig::new().with_run_history_limit(2);
        let s = TaskScheduler::new(config);
        s.create_task(manual_task("t")).unwrap();
        let p = Recording::default();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(s.submit("t", SubmitOptions::new()).unwrap());
            s.execute_next(&p).unwrap();
        }
        let runs = s.task_runs("t").unwrap();
        assert_eq!(runs.len(), 2);
        // the oldest run fell out
        assert!(matches!(
            s.run(ids[0]).unwrap_err(),
            RefreshError::RunNotFound { .. }
        ));
        assert!(s.run(ids[2]).is_ok());
    }

    #[test]
    fn test_poll_due_submits_periodic_tasks() {
        let s = TaskScheduler::new(EngineConfig::default());
        s.create_task(Task::new(
            "hourly",
            "db1",
            "mv1",
            TaskSchedule::Periodic {
                interval: Duration::from_secs(3600),
            },
        ))
        .unwrap();
        s.create_task(manual_task("manual")).unwrap();

        let t0 = Utc::now();
        let first = s.poll_due(t0).unwrap();
        assert_eq!(first.len(), 1);

        // a live pending run suppresses re-submission even past the
        // interval
        assert!(s.poll_due(t0 + chrono::Duration::hours(2)).unwrap().is_empty());

        s.execute_next(&Recording::default()).unwrap();
        assert!(s.poll_due(t0 + chrono::Duration::minutes(30)).unwrap().is_empty());
        assert_eq!(s.poll_due(t0 + chrono::Duration::hours(2)).unwrap().len(), 1);
    }

    #[test]
    fn test_restore_seeds_history() {
        let s = TaskScheduler::new(EngineConfig::default());
        s.create_task(manual_task("t")).unwrap();
        let id = s.submit("t", SubmitOptions::new()).unwrap();
        s.execute_next(&Recording::default()).unwrap();
        let finished = s.run(id).unwrap();

        let restored = TaskScheduler::restore(
            EngineConfig::default(),
            vec![manual_task("t")],
            vec![finished],
        );
        assert_eq!(restored.run_status(id).unwrap(), RunStatus::Success);
        assert_eq!(restored.task_runs("t").unwrap().len(), 1);
    }
}
