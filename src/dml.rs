//! Transient DML statement model.
//!
//! A write statement as target resolution sees it: a target, a partition
//! clause, an optional column permutation, and an opaque source query.
//! Statements are values; resolution never writes anything back into them.

use std::fmt;

use crate::types::ScalarValue;

/// The smallest expression shape resolution needs: enough to tell a literal
/// constant from everything else in a static partition value.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A constant literal.
    Literal(ScalarValue),
    /// A column reference.
    Column(String),
    /// A function call such as `now()`.
    FunctionCall { name: String, args: Vec<Expr> },
}

impl Expr {
    pub fn literal(value: ScalarValue) -> Self {
        Expr::Literal(value)
    }

    /// Convenience for string literals.
    pub fn string(value: impl Into<String>) -> Self {
        Expr::Literal(ScalarValue::Utf8(value.into()))
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Self {
        Expr::FunctionCall {
            name: name.into(),
            args,
        }
    }

    pub fn as_literal(&self) -> Option<&ScalarValue> {
        match self {
            Expr::Literal(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Literal(v) => write!(f, "{}", v),
            Expr::Column(name) => write!(f, "{}", name),
            Expr::FunctionCall { name, args } => {
                write!(f, "{}(", name)?;
                for (i, arg) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", arg)?;
                }
                write!(f, ")")
            }
        }
    }
}

/// The statement's partition clause.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum PartitionSpec {
    /// No clause: the write addresses the whole table.
    #[default]
    None,
    /// Explicit partition names, addressing either the regular or the
    /// temporary namespace.
    Names { names: Vec<String>, temporary: bool },
    /// Static key assignment: `PARTITION (dt='2024-01-01', region='us')`.
    Static {
        columns: Vec<String>,
        values: Vec<Expr>,
    },
}

/// The opaque source query feeding the write.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceQuery {
    sql: String,
    field_count: usize,
}

impl SourceQuery {
    pub fn new(sql: impl Into<String>, field_count: usize) -> Self {
        Self {
            sql: sql.into(),
            field_count,
        }
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Width of the query's output row.
    pub fn field_count(&self) -> usize {
        self.field_count
    }
}

/// An insert or overwrite statement against one target table.
#[derive(Debug, Clone)]
pub struct DmlStatement {
    database: String,
    target_table: String,
    partition_spec: PartitionSpec,
    columns: Option<Vec<String>>,
    source: SourceQuery,
    overwrite: bool,
    system: bool,
}

impl DmlStatement {
    /// Create an insert of `source` into `table`.
    pub fn insert(
        database: impl Into<String>,
        table: impl Into<String>,
        source: SourceQuery,
    ) -> Self {
        Self {
            database: database.into(),
            target_table: table.into(),
            partition_spec: PartitionSpec::default(),
            columns: None,
            source,
            overwrite: false,
            system: false,
        }
    }

    /// Make this write replace the addressed partitions atomically.
    pub fn overwrite(mut self) -> Self {
        self.overwrite = true;
        self
    }

    /// Mark this statement as issued by the engine itself (the refresh
    /// path). Only system statements may write a materialized view.
    pub fn system(mut self) -> Self {
        self.system = true;
        self
    }

    /// Address explicit partition names.
    pub fn with_partition_names(mut self, names: Vec<&str>, temporary: bool) -> Self {
        self.partition_spec = PartitionSpec::Names {
            names: names.into_iter().map(String::from).collect(),
            temporary,
        };
        self
    }

    /// Address partitions by static key values.
    pub fn with_static_partition(mut self, columns: Vec<&str>, values: Vec<Expr>) -> Self {
        self.partition_spec = PartitionSpec::Static {
            columns: columns.into_iter().map(String::from).collect(),
            values,
        };
        self
    }

    /// Supply an explicit column permutation.
    pub fn with_columns(mut self, columns: Vec<&str>) -> Self {
        self.columns = Some(columns.into_iter().map(String::from).collect());
        self
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn target_table(&self) -> &str {
        &self.target_table
    }

    pub fn partition_spec(&self) -> &PartitionSpec {
        &self.partition_spec
    }

    pub fn columns(&self) -> Option<&[String]> {
        self.columns.as_deref()
    }

    pub fn source(&self) -> &SourceQuery {
        &self.source
    }

    pub fn is_overwrite(&self) -> bool {
        self.overwrite
    }

    pub fn is_system(&self) -> bool {
        self.system
    }
}
