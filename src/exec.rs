//! Execution collaborator seam.
//!
//! Query planning and data movement happen outside this crate: an engine
//! that owns the storage layer analyzes the refresh's source query and runs
//! the overwrite. The two traits here are that boundary. Analysis runs
//! without the catalog metadata lock; execution runs with the target frozen
//! and reports whether a failure is worth retrying.

use thiserror::Error;

use crate::dml::DmlStatement;
use crate::resolver::TargetResolution;

/// An analyzed source query, opaque to the refresh machinery. Produced
/// once per dispatch; retries re-execute the same plan.
#[derive(Debug, Clone)]
pub struct LogicalPlan {
    sql: String,
}

impl LogicalPlan {
    pub fn new(sql: impl Into<String>) -> Self {
        Self { sql: sql.into() }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

/// A collaborator failure, classified by whether re-running the same plan
/// can succeed.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    #[error("{message}")]
    Recoverable { message: String },
    #[error("{message}")]
    Fatal { message: String },
}

impl ExecError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self::Recoverable {
            message: message.into(),
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal {
            message: message.into(),
        }
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Recoverable { .. })
    }
}

/// Analyzes a refresh's source query into an executable form.
pub trait QueryAnalyzer: Send + Sync {
    fn analyze(&self, sql: &str) -> Result<LogicalPlan, ExecError>;
}

/// Runs a fully resolved overwrite and reports rows affected.
pub trait ExecutionEngine: Send + Sync {
    fn execute(&self, plan: &ExecutablePlan) -> Result<u64, ExecError>;
}

/// A refresh ready to run: the overwrite statement, its analyzed source,
/// and the resolved write target.
#[derive(Debug, Clone)]
pub struct ExecutablePlan {
    statement: DmlStatement,
    source: LogicalPlan,
    resolution: TargetResolution,
}

impl ExecutablePlan {
    pub fn new(statement: DmlStatement, source: LogicalPlan, resolution: TargetResolution) -> Self {
        Self {
            statement,
            source,
            resolution,
        }
    }

    pub fn statement(&self) -> &DmlStatement {
        &self.statement
    }

    pub fn source(&self) -> &LogicalPlan {
        &self.source
    }

    pub fn resolution(&self) -> &TargetResolution {
        &self.resolution
    }
}

/// Analyzer that accepts any non-empty query as-is. Stands in where no
/// external planner is wired up.
#[derive(Debug, Default)]
pub struct PassthroughAnalyzer;

impl QueryAnalyzer for PassthroughAnalyzer {
    fn analyze(&self, sql: &str) -> Result<LogicalPlan, ExecError> {
        if sql.trim().is_empty() {
            return Err(ExecError::fatal("empty source query"));
        }
        Ok(LogicalPlan::new(sql))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorClass, RefreshError};

    #[test]
    fn test_passthrough_analyzer() {
        let plan = PassthroughAnalyzer.analyze("SELECT 1").unwrap();
        assert_eq!(plan.sql(), "SELECT 1");
        assert!(PassthroughAnalyzer.analyze("   ").is_err());
    }

    #[test]
    fn test_exec_error_classification_survives_conversion() {
        let err: RefreshError = ExecError::recoverable("commit conflict").into();
        assert_eq!(err.class(), ErrorClass::Transient);
        let err: RefreshError = ExecError::fatal("corrupt tablet").into();
        assert_eq!(err.class(), ErrorClass::Fatal);
    }
}
