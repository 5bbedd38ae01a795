//! Refresh tasks and their scheduling.
//!
//! A [`Task`] is the durable definition of "keep this view fresh": which
//! view, how it is triggered, and with what priority and retry budget. Each
//! actual refresh attempt is a [`TaskRun`] owned by the [`TaskScheduler`].

mod run;
mod scheduler;

pub use run::{RunOutcome, RunStatus, TaskRun};
pub use scheduler::{SubmitOptions, TaskRunProcessor, TaskScheduler};

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a task's runs get submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TaskSchedule {
    /// Runs only when explicitly submitted.
    Manual,
    /// Submitted automatically whenever `interval` has elapsed since the
    /// last submission.
    Periodic { interval: Duration },
}

/// Per-task execution knobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    priority: u8,
    max_retries: Option<u32>,
}

impl TaskConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Higher priorities dispatch first.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    /// Recoverable execution failures re-run the same plan up to this many
    /// times. Tasks that do not set a budget use
    /// [`EngineConfig::default_max_retries`](crate::EngineConfig).
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }
}

/// A named refresh task bound to one materialized view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    name: String,
    database: String,
    view: String,
    schedule: TaskSchedule,
    config: TaskConfig,
    created_at: DateTime<Utc>,
}

impl Task {
    pub fn new(
        name: impl Into<String>,
        database: impl Into<String>,
        view: impl Into<String>,
        schedule: TaskSchedule,
    ) -> Self {
        Self {
            name: name.into(),
            database: database.into(),
            view: view.into(),
            schedule,
            config: TaskConfig::default(),
            created_at: Utc::now(),
        }
    }

    pub fn with_config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn view(&self) -> &str {
        &self.view
    }

    pub fn schedule(&self) -> &TaskSchedule {
        &self.schedule
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
