//! Metadata journal.
//!
//! Append-only log of refresh metadata: task definitions, run transitions,
//! and the version maps recorded at each commit. Replaying it after a crash
//! reconstructs the scheduler's history and the views' refresh bookkeeping;
//! a run that never reached a terminal state replays as FAILED.
//!
//! # Format
//!
//! Each line is `SEQ|TYPE|DATA`:
//! - `SEQ`: monotonically increasing sequence number
//! - `TYPE`: one of `TASK`, `RUN`, `VERSIONS`
//! - `DATA`: JSON-encoded payload

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::catalog::VersionMap;
use crate::error::{RefreshError, Result};
use crate::task::{RunStatus, Task, TaskRun};

/// The version maps recorded by one committed refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionCommitRecord {
    pub database: String,
    pub table_id: u64,
    /// `(view partition id, contributing base versions)` pairs.
    pub partitions: Vec<(u64, VersionMap)>,
    pub refreshed_at: DateTime<Utc>,
}

/// One journaled mutation.
#[derive(Debug, Clone)]
pub enum JournalEntry {
    /// A task definition was registered.
    TaskCreated(Task),
    /// A run changed state; the payload is the run's full snapshot.
    RunTransition(TaskRun),
    /// A refresh committed and recorded these version maps.
    VersionsCommitted(VersionCommitRecord),
}

/// State reconstructed from a journal replay.
#[derive(Debug, Default)]
pub struct RecoveredState {
    /// Task definitions, last write wins.
    pub tasks: Vec<Task>,
    /// Final run snapshots. Runs that were live at the crash are FAILED.
    pub runs: Vec<TaskRun>,
    /// Version commits in journal order.
    pub versions: Vec<VersionCommitRecord>,
}

struct JournalWriter {
    writer: Option<BufWriter<File>>,
    sequence: u64,
}

/// Append-only journal file. Shared handles append concurrently; the line
/// order on disk is the commit order.
pub struct MetaJournal {
    path: PathBuf,
    inner: Mutex<JournalWriter>,
}

impl MetaJournal {
    /// Create a journal at `path`, overwriting any existing file.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(JournalWriter {
                writer: Some(BufWriter::new(file)),
                sequence: 0,
            }),
        })
    }

    /// Open an existing journal for appending, or create it. Reads through
    /// the existing entries to continue the sequence.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let sequence = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let mut max_seq = 0;
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                if let Ok((seq, _)) = Self::deserialize_entry(line.trim()) {
                    max_seq = max_seq.max(seq);
                }
            }
            max_seq
        } else {
            0
        };

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            inner: Mutex::new(JournalWriter {
                writer: Some(BufWriter::new(file)),
                sequence,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry and flush it to disk. Returns the assigned sequence
    /// number; once this returns, the entry survives a crash.
    pub fn append(&self, entry: &JournalEntry) -> Result<u64> {
        let serialized = Self::serialize_entry(entry)?;
        let mut inner = self.inner.lock();
        inner.sequence += 1;
        let seq = inner.sequence;
        let line = format!("{}|{}\n", seq, serialized);
        match inner.writer.as_mut() {
            Some(writer) => {
                writer.write_all(line.as_bytes())?;
                writer.flush()?;
            }
            None => return Err(RefreshError::journal("journal writer is not open")),
        }
        Ok(seq)
    }

    /// Replay all entries in sequence order. Corrupt lines (a torn write at
    /// the tail) are skipped with a warning.
    pub fn replay(&self) -> Result<Vec<(u64, JournalEntry)>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match Self::deserialize_entry(trimmed) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    tracing::warn!("Skipping corrupt journal entry: {}", e);
                }
            }
        }
        entries.sort_by_key(|(seq, _)| *seq);
        Ok(entries)
    }

    /// Fold the journal into its final state: latest task definition per
    /// name, latest snapshot per run, commits in order. Runs left PENDING
    /// or RUNNING become FAILED.
    pub fn recover(&self) -> Result<RecoveredState> {
        let mut state = Self::fold(self.replay()?);

        let now = Utc::now();
        for run in &mut state.runs {
            if !run.status().is_terminal() {
                tracing::warn!(
                    "Run {} for task {} was {} at shutdown, recovering as FAILED",
                    run.id(),
                    run.task_name(),
                    run.status()
                );
                run.abandon("interrupted by restart", now);
            }
        }
        debug_assert!(state.runs.iter().all(|r| r.status() != RunStatus::Running));

        Ok(state)
    }

    /// Rewrite the journal down to its folded state, dropping superseded
    /// task definitions and run transitions and merging version commits
    /// per table. Appends wait until the rewrite completes; the sequence
    /// restarts from the rewritten entries.
    pub fn compact(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let state = Self::fold(self.replay()?);

        inner.writer = None;
        let file = File::create(&self.path)?;
        let mut writer = BufWriter::new(file);
        let mut sequence = 0u64;
        let entries = state
            .tasks
            .into_iter()
            .map(JournalEntry::TaskCreated)
            .chain(state.runs.into_iter().map(JournalEntry::RunTransition))
            .chain(
                Self::merge_version_records(state.versions)
                    .into_iter()
                    .map(JournalEntry::VersionsCommitted),
            );
        for entry in entries {
            sequence += 1;
            let line = format!("{}|{}\n", sequence, Self::serialize_entry(&entry)?);
            writer.write_all(line.as_bytes())?;
        }
        writer.flush()?;
        inner.writer = Some(writer);
        inner.sequence = sequence;
        Ok(())
    }

    fn fold(entries: Vec<(u64, JournalEntry)>) -> RecoveredState {
        let mut state = RecoveredState::default();
        for (_, entry) in entries {
            match entry {
                JournalEntry::TaskCreated(task) => {
                    state.tasks.retain(|t| t.name() != task.name());
                    state.tasks.push(task);
                }
                JournalEntry::RunTransition(run) => {
                    state.runs.retain(|r| r.id() != run.id());
                    state.runs.push(run);
                }
                JournalEntry::VersionsCommitted(record) => state.versions.push(record),
            }
        }
        state
    }

    /// Collapse a table's commit records into one. Applying the result
    /// yields the same view bookkeeping as applying the records in journal
    /// order: per view partition the last map wins, and the table's
    /// refresh stamp is the latest commit's.
    fn merge_version_records(records: Vec<VersionCommitRecord>) -> Vec<VersionCommitRecord> {
        let mut merged: Vec<VersionCommitRecord> = Vec::new();
        for record in records {
            let existing = merged
                .iter_mut()
                .find(|r| r.database == record.database && r.table_id == record.table_id);
            match existing {
                Some(existing) => {
                    for (pid, map) in record.partitions {
                        match existing.partitions.iter_mut().find(|(id, _)| *id == pid) {
                            Some((_, m)) => *m = map,
                            None => existing.partitions.push((pid, map)),
                        }
                    }
                    existing.refreshed_at = record.refreshed_at;
                }
                None => merged.push(record),
            }
        }
        merged
    }

    fn serialize_entry(entry: &JournalEntry) -> Result<String> {
        let (kind, payload) = match entry {
            JournalEntry::TaskCreated(task) => ("TASK", serde_json::to_string(task)?),
            JournalEntry::RunTransition(run) => ("RUN", serde_json::to_string(run)?),
            JournalEntry::VersionsCommitted(record) => ("VERSIONS", serde_json::to_string(record)?),
        };
        Ok(format!("{}|{}", kind, payload))
    }

    fn deserialize_entry(line: &str) -> Result<(u64, JournalEntry)> {
        let first_pipe = line
            .find('|')
            .ok_or_else(|| RefreshError::journal("invalid journal line: missing sequence separator"))?;
        let seq: u64 = line[..first_pipe]
            .parse()
            .map_err(|e| RefreshError::journal(format!("invalid journal sequence number: {}", e)))?;

        let rest = &line[first_pipe + 1..];
        let second_pipe = rest
            .find('|')
            .ok_or_else(|| RefreshError::journal("invalid journal line: missing type separator"))?;
        let kind = &rest[..second_pipe];
        let payload = &rest[second_pipe + 1..];

        let entry = match kind {
            "TASK" => JournalEntry::TaskCreated(serde_json::from_str(payload)?),
            "RUN" => JournalEntry::RunTransition(serde_json::from_str(payload)?),
            "VERSIONS" => JournalEntry::VersionsCommitted(serde_json::from_str(payload)?),
            other => {
                return Err(RefreshError::journal(format!(
                    "unknown journal entry type: {}",
                    other
                )))
            }
        };
        Ok((seq, entry))
    }
}
