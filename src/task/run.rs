//! One refresh attempt and its state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{RefreshError, Result};
use crate::staleness::RefreshRange;
use crate::task::Task;

/// Lifecycle of a run. `Success`, `Failed`, and `Merged` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failed,
    Merged,
}

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Merged)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Merged => "MERGED",
        };
        write!(f, "{}", s)
    }
}

/// What processing one run produced. `retries` counts re-executions of the
/// same plan after recoverable failures.
#[derive(Debug)]
pub enum RunOutcome {
    Success { rows_affected: u64, retries: u32 },
    Failed { error: RefreshError, retries: u32 },
}

/// A single refresh attempt. Carries everything the processor needs so
/// execution never reaches back into the task registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRun {
    id: Uuid,
    task_name: String,
    database: String,
    view: String,
    seq: u64,
    priority: u8,
    max_retries: u32,
    status: RunStatus,
    forced: bool,
    range: Option<RefreshRange>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    retries: u32,
    merged_into: Option<Uuid>,
    rows_affected: Option<u64>,
    error: Option<String>,
}

impl TaskRun {
    pub(crate) fn new(
        task: &Task,
        config: &EngineConfig,
        seq: u64,
        forced: bool,
        range: Option<RefreshRange>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_name: task.name().to_string(),
            database: task.database().to_string(),
            view: task.view().to_string(),
            seq,
            priority: task.config().priority(),
            max_retries: task
                .config()
                .max_retries()
                .unwrap_or(config.default_max_retries),
            status: RunStatus::Pending,
            forced,
            range,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            retries: 0,
            merged_into: None,
            rows_affected: None,
            error: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn task_name(&self) -> &str {
        &self.task_name
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn is_forced(&self) -> bool {
        self.forced
    }

    pub fn range(&self) -> Option<&RefreshRange> {
        self.range.as_ref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn merged_into(&self) -> Option<Uuid> {
        self.merged_into
    }

    pub fn rows_affected(&self) -> Option<u64> {
        self.rows_affected
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn guard(&self, from: RunStatus, to: RunStatus) -> Result<()> {
        if self.status != from {
            return Err(RefreshError::internal(format!(
                "run {} cannot move {} -> {}",
                self.id, self.status, to
            )));
        }
        Ok(())
    }

    pub(crate) fn start(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.guard(RunStatus::Pending, RunStatus::Running)?;
        self.status = RunStatus::Running;
        self.started_at = Some(at);
        Ok(())
    }

    pub(crate) fn succeed(&mut self, rows_affected: u64, at: DateTime<Utc>) -> Result<()> {
        self.guard(RunStatus::Running, RunStatus::Success)?;
        self.status = RunStatus::Success;
        self.rows_affected = Some(rows_affected);
        self.finished_at = Some(at);
        Ok(())
    }

    pub(crate) fn fail(&mut self, error: impl Into<String>, at: DateTime<Utc>) -> Result<()> {
        self.guard(RunStatus::Running, RunStatus::Failed)?;
        self.status = RunStatus::Failed;
        self.error = Some(error.into());
        self.finished_at = Some(at);
        Ok(())
    }

    /// Drop a queued run before dispatch. Records as FAILED so the history
    /// keeps a trace.
    pub(crate) fn cancel(&mut self, at: DateTime<Utc>) -> Result<()> {
        self.guard(RunStatus::Pending, RunStatus::Failed)?;
        self.status = RunStatus::Failed;
        self.error = Some("cancelled before dispatch".to_string());
        self.finished_at = Some(at);
        Ok(())
    }

    pub(crate) fn merge_into(&mut self, absorber: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.guard(RunStatus::Pending, RunStatus::Merged)?;
        self.status = RunStatus::Merged;
        self.merged_into = Some(absorber);
        self.finished_at = Some(at);
        Ok(())
    }

    /// Absorb a later submission's parameters: forced is OR-ed and the
    /// range widens to the union (an absent range means the whole view and
    /// wins).
    pub(crate) fn widen(&mut self, forced: bool, range: Option<&RefreshRange>) {
        self.forced |= forced;
        self.range = match (&self.range, range) {
            (Some(a), Some(b)) => Some(a.union(b)),
            _ => None,
        };
    }

    pub(crate) fn set_retries(&mut self, retries: u32) {
        self.retries = retries;
    }

    /// Force a non-terminal run to FAILED. Used on recovery for runs that
    /// were live when the process stopped.
    pub(crate) fn abandon(&mut self, error: impl Into<String>, at: DateTime<Utc>) {
        if !self.status.is_terminal() {
            self.status = RunStatus::Failed;
            self.error = Some(error.into());
            self.finished_at = Some(at);
        }
    }
}
