//! Error types for the refresh engine.
//!
//! One crate-wide error enum covers everything from DML target resolution
//! to journal replay. Each error classifies itself as user, transient, or
//! fatal via [`RefreshError::class`]; the scheduler retries only transient
//! failures.

use thiserror::Error;
use uuid::Uuid;

/// The primary error type for refresh operations.
#[derive(Error, Debug)]
pub enum RefreshError {
    /// A `PARTITION (...)` clause with zero entries.
    #[error("No partition specified in partition lists")]
    EmptyPartitionList,

    /// A `PARTITION (...)` clause containing an empty name.
    #[error("Empty partition name in partition list")]
    EmptyPartitionName,

    /// A partition name that does not resolve in the addressed namespace.
    #[error("Unknown partition '{partition}' in table '{table}'")]
    UnknownPartition { partition: String, table: String },

    /// Insert without a partition clause into a table with no partitions.
    #[error("Data cannot be inserted into table '{table}' with empty partition")]
    EmptyTable { table: String },

    /// A column name that does not exist in the target schema.
    #[error("Unknown column '{column}' in '{table}'")]
    UnknownColumn { column: String, table: String },

    /// The same column mentioned twice in an explicit column list.
    #[error("Column '{column}' specified twice")]
    DuplicateColumn { column: String },

    /// Generated columns are always computed, never written.
    #[error("Generated column '{column}' cannot be specified")]
    GeneratedColumnSpecified { column: String },

    /// A primary-key write omitting key columns that have no default.
    #[error("Missing key columns for primary-key table: {columns}")]
    MissingKeyColumns { columns: String },

    /// A non-nullable column with no default left out of the column list.
    #[error("'{column}' must be explicitly mentioned in column permutation")]
    MissingRequiredColumn { column: String },

    /// Source query width does not match the target column list.
    #[error("Column count doesn't match value count: {expected} columns, {actual} values")]
    ColumnCountMismatch { expected: usize, actual: usize },

    /// Static partition keys must name exactly the partition columns.
    #[error("Static partition spec must name exactly the {expected} partition column(s) of table '{table}'")]
    PartitionColumnMismatch { table: String, expected: usize },

    /// Static partition values must be literal constants.
    #[error("Partition value for column '{column}' should be a literal expression")]
    NonLiteralPartitionValue { column: String },

    /// A literal that cannot be coerced to the partition column's type.
    #[error("Invalid partition value '{value}' for column '{column}'")]
    InvalidPartitionValue { column: String, value: String },

    /// Explicit column lists on partitioned external sinks must cover
    /// every partition column.
    #[error("Must include partition column '{column}'")]
    MissingPartitionColumn { column: String },

    /// Partition columns of this type cannot address external sink layouts.
    #[error("Unsupported partition column type [{ty}] for {kind} table sink")]
    UnsupportedPartitionColumnType { ty: String, kind: String },

    /// The target table kind cannot replace partition contents atomically.
    #[error("Overwrite is not supported for {kind} table '{table}'")]
    OverwriteNotSupported { table: String, kind: String },

    /// Writes to externally-registered instances are disabled by default.
    #[error("Writes to unmanaged {kind} table '{table}' are disabled")]
    UnmanagedSinkDisabled { table: String, kind: String },

    /// Only the refresh path may write a materialized view.
    #[error("The data of '{view}' cannot be inserted because '{view}' is a materialized view, \
             and the data of materialized view must be consistent with the base table")]
    ViewWriteForbidden { view: String },

    /// Overwrite requires the target to be in its normal state.
    #[error("Table state is {state}, wait to overwrite until table '{table}' state is normal")]
    TableNotNormal { table: String, state: String },

    /// Database lookup failure.
    #[error("Database '{name}' is not found")]
    DatabaseNotFound { name: String },

    /// Table lookup failure.
    #[error("Table '{name}' is not found")]
    TableNotFound { name: String },

    /// A refresh target that exists but is not a materialized view.
    #[error("Table '{name}' is not a materialized view")]
    NotMaterializedView { name: String },

    /// The refresh set could not be turned into an executable overwrite.
    #[error("Plan build error: {message}")]
    PlanBuild { message: String },

    /// Task registration collision.
    #[error("Task '{name}' already exists")]
    TaskExists { name: String },

    /// Task lookup failure.
    #[error("Task '{name}' is not found")]
    TaskNotFound { name: String },

    /// Run lookup failure.
    #[error("Task run {id} is not found")]
    RunNotFound { id: Uuid },

    /// Cancellation is only effective while a run is still pending.
    #[error("Task run {id} is {status} and cannot be cancelled")]
    RunNotCancellable { id: Uuid, status: String },

    /// Failure reported by the execution collaborator.
    #[error("Execution error: {message}")]
    Execution { message: String, recoverable: bool },

    /// I/O error (journal storage).
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Corrupt or inconsistent journal content.
    #[error("Journal error: {message}")]
    Journal { message: String },

    /// Internal error (bug in the engine).
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Coarse classification driving retry behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request itself is wrong; reported verbatim, never retried.
    User,
    /// May succeed on re-execution of the same plan.
    Transient,
    /// Unrecoverable; the run fails without retry.
    Fatal,
}

impl RefreshError {
    /// Create a plan-build error.
    pub fn plan_build(message: impl Into<String>) -> Self {
        Self::PlanBuild {
            message: message.into(),
        }
    }

    /// Create a journal error.
    pub fn journal(message: impl Into<String>) -> Self {
        Self::Journal {
            message: message.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Create an execution error with an explicit recoverability flag.
    pub fn execution(message: impl Into<String>, recoverable: bool) -> Self {
        Self::Execution {
            message: message.into(),
            recoverable,
        }
    }

    /// Create an unknown-partition error.
    pub fn unknown_partition(partition: impl Into<String>, table: impl Into<String>) -> Self {
        Self::UnknownPartition {
            partition: partition.into(),
            table: table.into(),
        }
    }

    /// Create an unknown-column error.
    pub fn unknown_column(column: impl Into<String>, table: impl Into<String>) -> Self {
        Self::UnknownColumn {
            column: column.into(),
            table: table.into(),
        }
    }

    /// Create a duplicate-column error.
    pub fn duplicate_column(column: impl Into<String>) -> Self {
        Self::DuplicateColumn {
            column: column.into(),
        }
    }

    /// Create a missing-required-column error.
    pub fn missing_required_column(column: impl Into<String>) -> Self {
        Self::MissingRequiredColumn {
            column: column.into(),
        }
    }

    /// Create a non-literal partition-value error.
    pub fn non_literal_partition_value(column: impl Into<String>) -> Self {
        Self::NonLiteralPartitionValue {
            column: column.into(),
        }
    }

    /// Create an invalid partition-value error.
    pub fn invalid_partition_value(column: impl Into<String>, value: impl Into<String>) -> Self {
        Self::InvalidPartitionValue {
            column: column.into(),
            value: value.into(),
        }
    }

    /// Create a table-not-found error.
    pub fn table_not_found(name: impl Into<String>) -> Self {
        Self::TableNotFound { name: name.into() }
    }

    /// Create a database-not-found error.
    pub fn database_not_found(name: impl Into<String>) -> Self {
        Self::DatabaseNotFound { name: name.into() }
    }

    /// Create a task-not-found error.
    pub fn task_not_found(name: impl Into<String>) -> Self {
        Self::TaskNotFound { name: name.into() }
    }

    /// Classify this error for retry purposes.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::EmptyPartitionList
            | Self::EmptyPartitionName
            | Self::UnknownPartition { .. }
            | Self::EmptyTable { .. }
            | Self::UnknownColumn { .. }
            | Self::DuplicateColumn { .. }
            | Self::GeneratedColumnSpecified { .. }
            | Self::MissingKeyColumns { .. }
            | Self::MissingRequiredColumn { .. }
            | Self::ColumnCountMismatch { .. }
            | Self::PartitionColumnMismatch { .. }
            | Self::NonLiteralPartitionValue { .. }
            | Self::InvalidPartitionValue { .. }
            | Self::MissingPartitionColumn { .. }
            | Self::UnsupportedPartitionColumnType { .. }
            | Self::OverwriteNotSupported { .. }
            | Self::UnmanagedSinkDisabled { .. }
            | Self::ViewWriteForbidden { .. }
            | Self::TableNotNormal { .. }
            | Self::DatabaseNotFound { .. }
            | Self::TableNotFound { .. }
            | Self::NotMaterializedView { .. }
            | Self::TaskExists { .. }
            | Self::TaskNotFound { .. }
            | Self::RunNotFound { .. }
            | Self::RunNotCancellable { .. } => ErrorClass::User,
            Self::Execution { recoverable, .. } => {
                if *recoverable {
                    ErrorClass::Transient
                } else {
                    ErrorClass::Fatal
                }
            }
            Self::PlanBuild { .. }
            | Self::Io { .. }
            | Self::Journal { .. }
            | Self::Internal { .. } => ErrorClass::Fatal,
        }
    }
}

impl From<serde_json::Error> for RefreshError {
    fn from(err: serde_json::Error) -> Self {
        Self::Journal {
            message: err.to_string(),
        }
    }
}

impl From<crate::exec::ExecError> for RefreshError {
    fn from(err: crate::exec::ExecError) -> Self {
        Self::Execution {
            recoverable: err.is_recoverable(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for refresh operations.
pub type Result<T> = std::result::Result<T, RefreshError>;
