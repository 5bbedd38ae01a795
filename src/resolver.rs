//! Write-target resolution.
//!
//! Binds a DML statement to concrete target partitions and columns against
//! a frozen table definition, validating the partition clause, the column
//! permutation, and the sink's capabilities. Pure: takes the table and the
//! statement, returns a [`TargetResolution`], mutates nothing. Callers hold
//! the catalog metadata lock across resolution and commit so the definition
//! cannot shift underneath.

use std::collections::HashSet;

use crate::catalog::{KeysModel, Table};
use crate::config::EngineConfig;
use crate::dml::{DmlStatement, PartitionSpec};
use crate::error::{RefreshError, Result};
use crate::types::ScalarValue;

/// The outcome of target resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetResolution {
    /// Resolved target columns, schema-cased, in write order.
    pub target_columns: Vec<String>,
    /// Concrete target partition ids. Empty for sinks whose partitions are
    /// not enumerable (static or dynamic partition writes).
    pub partition_ids: Vec<u64>,
    /// Primary-key partial update: the write covers a strict subset of the
    /// value columns.
    pub partial_update: bool,
    /// Coerced static partition key values, in partition-column order.
    pub static_values: Vec<(String, ScalarValue)>,
}

/// Resolve `stmt`'s write target against `table`.
///
/// `table` must be the statement's target; the caller looks it up and keeps
/// the metadata lock held until the write commits.
pub fn resolve_targets(
    table: &Table,
    stmt: &DmlStatement,
    config: &EngineConfig,
) -> Result<TargetResolution> {
    check_sink(table, stmt, config)?;

    let (partition_ids, static_values) = resolve_partitions(table, stmt)?;
    check_external_sink(table, stmt)?;
    let (target_columns, mentioned, partial_update) = resolve_columns(table, stmt)?;
    check_required_columns(table, &mentioned, partial_update)?;
    check_column_count(table, stmt, mentioned.len())?;

    Ok(TargetResolution {
        target_columns,
        partition_ids,
        partial_update,
        static_values,
    })
}

/// Target-table gating: view protection, overwrite capability and state,
/// managed-storage requirement.
fn check_sink(table: &Table, stmt: &DmlStatement, config: &EngineConfig) -> Result<()> {
    if table.is_materialized_view() && !stmt.is_system() {
        return Err(RefreshError::ViewWriteForbidden {
            view: table.name().to_string(),
        });
    }

    if stmt.is_overwrite() {
        if !table.kind().supports_overwrite() {
            return Err(RefreshError::OverwriteNotSupported {
                table: table.name().to_string(),
                kind: table.kind().to_string(),
            });
        }
        if !table.kind().is_external() && table.state() != crate::catalog::TableState::Normal {
            return Err(RefreshError::TableNotNormal {
                table: table.name().to_string(),
                state: table.state().to_string(),
            });
        }
    }

    if table.kind().requires_managed_storage()
        && !table.is_managed()
        && !config.allow_unmanaged_sink_writes
    {
        return Err(RefreshError::UnmanagedSinkDisabled {
            table: table.name().to_string(),
            kind: table.kind().to_string(),
        });
    }

    Ok(())
}

/// Resolve the partition clause to ids (and, for static writes, coerced key
/// values).
fn resolve_partitions(
    table: &Table,
    stmt: &DmlStatement,
) -> Result<(Vec<u64>, Vec<(String, ScalarValue)>)> {
    match stmt.partition_spec() {
        PartitionSpec::Names { names, temporary } => {
            if names.is_empty() {
                return Err(RefreshError::EmptyPartitionList);
            }
            // De-duplicate preserving first occurrence; name identity is
            // case-sensitive.
            let mut seen = HashSet::new();
            let mut ids = Vec::new();
            for name in names {
                if !seen.insert(name.as_str()) {
                    continue;
                }
                if name.is_empty() {
                    return Err(RefreshError::EmptyPartitionName);
                }
                let partition = table
                    .partition_by_name(name, *temporary)
                    .ok_or_else(|| RefreshError::unknown_partition(name, table.name()))?;
                ids.push(partition.id());
            }
            Ok((ids, Vec::new()))
        }
        PartitionSpec::Static { columns, values } => {
            let static_values = resolve_static_keys(table, columns, values)?;
            Ok((Vec::new(), static_values))
        }
        PartitionSpec::None => {
            if table.kind().supports_partition_enumeration() {
                let ids: Vec<u64> = table.partitions().map(|p| p.id()).collect();
                if ids.is_empty() {
                    return Err(RefreshError::EmptyTable {
                        table: table.name().to_string(),
                    });
                }
                Ok((ids, Vec::new()))
            } else {
                // External sinks have no enumerable partitions to pin.
                Ok((Vec::new(), Vec::new()))
            }
        }
    }
}

/// Validate and coerce a static partition-key assignment. The supplied
/// key-column set must be exactly the table's partition columns
/// (case-insensitive, no duplicates) and every value a coercible literal.
fn resolve_static_keys(
    table: &Table,
    columns: &[String],
    values: &[crate::dml::Expr],
) -> Result<Vec<(String, ScalarValue)>> {
    let partition_columns = table.partition_columns();
    let mismatch = || RefreshError::PartitionColumnMismatch {
        table: table.name().to_string(),
        expected: partition_columns.len(),
    };

    if columns.len() != values.len() || columns.len() != partition_columns.len() {
        return Err(mismatch());
    }
    let mut seen = HashSet::new();
    for name in columns {
        if !seen.insert(name.to_lowercase()) {
            return Err(mismatch());
        }
        if !partition_columns
            .iter()
            .any(|pc| pc.eq_ignore_ascii_case(name))
        {
            return Err(mismatch());
        }
    }

    let mut out = Vec::with_capacity(columns.len());
    for (name, value) in columns.iter().zip(values) {
        let literal = value
            .as_literal()
            .ok_or_else(|| RefreshError::non_literal_partition_value(name))?;
        let column = table
            .column(name)
            .ok_or_else(|| RefreshError::unknown_column(name, table.name()))?;
        if literal.is_null() {
            if !column.is_nullable() {
                return Err(RefreshError::invalid_partition_value(name, "NULL"));
            }
            out.push((column.name().to_string(), ScalarValue::Null));
            continue;
        }
        let coerced = literal.try_coerce(column.data_type()).ok_or_else(|| {
            RefreshError::invalid_partition_value(name, literal.to_string())
        })?;
        out.push((column.name().to_string(), coerced));
    }
    Ok(out)
}

/// Checks that apply only to partitioned external sinks: explicit column
/// lists must cover the partition columns, and partition column types must
/// be addressable in the sink's layout.
fn check_external_sink(table: &Table, stmt: &DmlStatement) -> Result<()> {
    if !table.kind().is_external() || !table.is_partitioned() {
        return Ok(());
    }

    if let Some(columns) = stmt.columns() {
        for pc in table.partition_columns() {
            if !columns.iter().any(|c| c.eq_ignore_ascii_case(pc)) {
                return Err(RefreshError::MissingPartitionColumn { column: pc.clone() });
            }
        }
    }

    for pc in table.partition_columns() {
        if let Some(column) = table.column(pc) {
            let ty = column.data_type();
            if ty.is_floating() || ty.is_decimal() || ty.is_datetime() {
                return Err(RefreshError::UnsupportedPartitionColumnType {
                    ty: ty.to_string(),
                    kind: table.kind().to_string(),
                });
            }
        }
    }
    Ok(())
}

/// Resolve the target column list and the mentioned-column set
/// (lowercased). Returns `(target_columns, mentioned, partial_update)`.
fn resolve_columns(
    table: &Table,
    stmt: &DmlStatement,
) -> Result<(Vec<String>, HashSet<String>, bool)> {
    let Some(explicit) = stmt.columns() else {
        let target: Vec<String> = table
            .writable_columns()
            .map(|c| c.name().to_string())
            .collect();
        let mentioned = target.iter().map(|n| n.to_lowercase()).collect();
        return Ok((target, mentioned, false));
    };

    // Key columns with no default and no auto-increment must be covered.
    let mut required_keys: HashSet<String> = table
        .columns()
        .iter()
        .filter(|c| c.is_key() && !c.has_default() && !c.is_auto_increment())
        .map(|c| c.name().to_lowercase())
        .collect();

    let mut target = Vec::with_capacity(explicit.len());
    let mut mentioned = HashSet::new();
    for name in explicit {
        let column = table
            .column(name)
            .ok_or_else(|| RefreshError::unknown_column(name, table.name()))?;
        if column.is_generated() {
            return Err(RefreshError::GeneratedColumnSpecified {
                column: name.clone(),
            });
        }
        if !mentioned.insert(name.to_lowercase()) {
            return Err(RefreshError::duplicate_column(name));
        }
        required_keys.remove(&name.to_lowercase());
        target.push(column.name().to_string());
    }

    let mut partial_update = false;
    if table.keys_model() == KeysModel::PrimaryKeys {
        if !required_keys.is_empty() {
            let mut missing: Vec<_> = required_keys.into_iter().collect();
            missing.sort();
            return Err(RefreshError::MissingKeyColumns {
                columns: missing.join(","),
            });
        }
        if target.len() < table.writable_columns().count() {
            partial_update = true;
        }
    }

    Ok((target, mentioned, partial_update))
}

/// Unless partial update, every non-nullable column with no default must be
/// mentioned.
fn check_required_columns(
    table: &Table,
    mentioned: &HashSet<String>,
    partial_update: bool,
) -> Result<()> {
    if partial_update {
        return Ok(());
    }
    for column in table.columns() {
        if !column.has_default()
            && !column.is_nullable()
            && !column.is_auto_increment()
            && !column.is_generated()
            && !mentioned.contains(&column.name().to_lowercase())
        {
            return Err(RefreshError::missing_required_column(column.name()));
        }
    }
    Ok(())
}

/// The source query must supply exactly one field per written column.
/// Static partition writes into external sinks take the key values from the
/// clause, so the partition columns are not fed by the query.
fn check_column_count(table: &Table, stmt: &DmlStatement, mentioned: usize) -> Result<()> {
    let mut expected = mentioned;
    if table.kind().is_external()
        && matches!(stmt.partition_spec(), PartitionSpec::Static { .. })
    {
        expected = expected.saturating_sub(table.partition_columns().len());
    }
    let actual = stmt.source().field_count();
    if actual != expected {
        return Err(RefreshError::ColumnCountMismatch { expected, actual });
    }
    Ok(())
}
