//! Table, partition, and materialized-view metadata.
//!
//! This is the write-side view of the catalog: enough schema to resolve a
//! DML's target columns and partitions, plus the version bookkeeping a
//! refresh reads and updates. Row storage lives elsewhere.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use chrono::{DateTime, Utc};

use crate::catalog::version::{PartitionKey, VersionMap};
use crate::types::{DataType, ScalarValue};

/// Column metadata relevant to write-target resolution.
#[derive(Debug, Clone)]
pub struct Column {
    name: String,
    data_type: DataType,
    nullable: bool,
    is_key: bool,
    has_default: bool,
    auto_increment: bool,
    generated: bool,
}

impl Column {
    /// Create a new column.
    pub fn new(name: impl Into<String>, data_type: DataType, nullable: bool) -> Self {
        Self {
            name: name.into(),
            data_type,
            nullable,
            is_key: false,
            has_default: false,
            auto_increment: false,
            generated: false,
        }
    }

    /// Mark this column as part of the table's key.
    pub fn key(mut self) -> Self {
        self.is_key = true;
        self
    }

    /// Mark this column as carrying a default value.
    pub fn with_default(mut self) -> Self {
        self.has_default = true;
        self
    }

    /// Mark this column as auto-increment.
    pub fn auto_increment(mut self) -> Self {
        self.auto_increment = true;
        self
    }

    /// Mark this column as generated (always computed, never written).
    pub fn generated(mut self) -> Self {
        self.generated = true;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_key(&self) -> bool {
        self.is_key
    }

    pub fn has_default(&self) -> bool {
        self.has_default
    }

    pub fn is_auto_increment(&self) -> bool {
        self.auto_increment
    }

    pub fn is_generated(&self) -> bool {
        self.generated
    }
}

/// Value coverage of one partition, used for predicate injection and
/// range-restricted refresh.
#[derive(Debug, Clone, PartialEq)]
pub enum PartitionBounds {
    /// Half-open range `[lower, upper)` over the partition column. A `None`
    /// side is unbounded.
    Range {
        lower: Option<ScalarValue>,
        upper: Option<ScalarValue>,
    },
    /// Explicit value list.
    List { values: Vec<ScalarValue> },
}

impl PartitionBounds {
    /// Whether any value covered by these bounds falls inside
    /// `[lower, upper)`. `None` request sides are unbounded.
    pub fn overlaps(&self, lower: Option<&ScalarValue>, upper: Option<&ScalarValue>) -> bool {
        match self {
            PartitionBounds::Range {
                lower: own_lower,
                upper: own_upper,
            } => {
                let below = match (own_upper.as_ref(), lower) {
                    (Some(own), Some(req)) => own > req,
                    _ => true,
                };
                let above = match (own_lower.as_ref(), upper) {
                    (Some(own), Some(req)) => own < req,
                    _ => true,
                };
                below && above
            }
            PartitionBounds::List { values } => values.iter().any(|v| {
                let ge = lower.map_or(true, |req| v >= req);
                let lt = upper.map_or(true, |req| v < req);
                ge && lt
            }),
        }
    }
}

/// One partition of a table.
#[derive(Debug, Clone)]
pub struct Partition {
    id: u64,
    name: String,
    temporary: bool,
    bounds: Option<PartitionBounds>,
    visible_version: u64,
    version_committed_at: DateTime<Utc>,
}

impl Partition {
    /// Create a partition at version 1 (empty, never written).
    pub fn new(id: u64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            temporary: false,
            bounds: None,
            visible_version: 1,
            version_committed_at: Utc::now(),
        }
    }

    /// Mark this partition temporary.
    pub fn temporary(mut self) -> Self {
        self.temporary = true;
        self
    }

    /// Set the partition's value bounds.
    pub fn with_bounds(mut self, bounds: PartitionBounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_temporary(&self) -> bool {
        self.temporary
    }

    pub fn bounds(&self) -> Option<&PartitionBounds> {
        self.bounds.as_ref()
    }

    pub fn visible_version(&self) -> u64 {
        self.visible_version
    }

    pub fn version_committed_at(&self) -> DateTime<Utc> {
        self.version_committed_at
    }

    /// Advance the visible version. Versions never move backwards; an older
    /// version is ignored.
    pub fn advance_visible_version(&mut self, version: u64, committed_at: DateTime<Utc>) {
        if version > self.visible_version {
            self.visible_version = version;
            self.version_committed_at = committed_at;
        }
    }
}

/// Kinds of table this engine can address, with their write capabilities.
///
/// Capability checks replace per-kind branching at the call sites: the
/// resolver asks what a kind supports, never which kind it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// Native storage: enumerable named partitions, atomic overwrite.
    Olap,
    /// Hive external sink: partitioned by static keys, managed-storage gate.
    Hive,
    /// Iceberg external sink: partitioned by static keys.
    Iceberg,
    /// MySQL external sink: unpartitioned, append only.
    Mysql,
}

impl TableKind {
    /// Whether partitions are engine-managed and addressable by name.
    pub fn supports_partition_enumeration(&self) -> bool {
        matches!(self, TableKind::Olap)
    }

    /// Whether the kind can atomically replace partition contents.
    pub fn supports_overwrite(&self) -> bool {
        matches!(self, TableKind::Olap | TableKind::Hive | TableKind::Iceberg)
    }

    /// Whether writes require the instance to be on managed storage.
    pub fn requires_managed_storage(&self) -> bool {
        matches!(self, TableKind::Hive)
    }

    /// Whether this is an external sink (partition-column type limits apply).
    pub fn is_external(&self) -> bool {
        !matches!(self, TableKind::Olap)
    }
}

impl fmt::Display for TableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableKind::Olap => write!(f, "olap"),
            TableKind::Hive => write!(f, "hive"),
            TableKind::Iceberg => write!(f, "iceberg"),
            TableKind::Mysql => write!(f, "mysql"),
        }
    }
}

/// Key semantics of a native table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeysModel {
    #[default]
    Duplicate,
    Aggregate,
    Unique,
    /// Primary-key model: writes must cover the key, partial updates allowed.
    PrimaryKeys,
}

/// Lifecycle state of a table. Overwrite requires `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TableState {
    #[default]
    Normal,
    SchemaChange,
    Rollup,
}

impl fmt::Display for TableState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableState::Normal => write!(f, "NORMAL"),
            TableState::SchemaChange => write!(f, "SCHEMA_CHANGE"),
            TableState::Rollup => write!(f, "ROLLUP"),
        }
    }
}

/// Materialized-view bookkeeping attached to the view's backing table.
#[derive(Debug, Clone)]
pub struct MvInfo {
    defining_query: String,
    base_tables: Vec<u64>,
    reference_table: Option<u64>,
    /// Recorded contributing base versions, one map per MV partition.
    recorded: BTreeMap<u64, VersionMap>,
    last_successful_refresh: Option<DateTime<Utc>>,
}

impl MvInfo {
    /// Define an MV over `base_tables` with the given defining query.
    pub fn new(defining_query: impl Into<String>, base_tables: Vec<u64>) -> Self {
        Self {
            defining_query: defining_query.into(),
            base_tables,
            reference_table: None,
            recorded: BTreeMap::new(),
            last_successful_refresh: None,
        }
    }

    /// Designate the base table the MV's partition key derives from.
    /// Its partitions map by name onto MV partitions.
    pub fn with_reference_table(mut self, table_id: u64) -> Self {
        self.reference_table = Some(table_id);
        self
    }

    pub fn defining_query(&self) -> &str {
        &self.defining_query
    }

    pub fn base_tables(&self) -> &[u64] {
        &self.base_tables
    }

    pub fn reference_table(&self) -> Option<u64> {
        self.reference_table
    }

    /// The versions recorded for one MV partition at its last refresh.
    pub fn recorded_for(&self, mv_partition_id: u64) -> Option<&VersionMap> {
        self.recorded.get(&mv_partition_id)
    }

    /// Replace the recorded versions for one MV partition.
    pub fn record(&mut self, mv_partition_id: u64, versions: VersionMap) {
        self.recorded.insert(mv_partition_id, versions);
    }

    /// Drop recorded state for partitions no longer present.
    pub fn retain_recorded(&mut self, live: &[u64]) {
        self.recorded.retain(|id, _| live.contains(id));
    }

    pub fn last_successful_refresh(&self) -> Option<DateTime<Utc>> {
        self.last_successful_refresh
    }

    pub fn mark_refreshed(&mut self, at: DateTime<Utc>) {
        self.last_successful_refresh = Some(at);
    }

    /// Whether this MV has ever completed a successful refresh.
    pub fn has_been_refreshed(&self) -> bool {
        self.last_successful_refresh.is_some()
    }
}

/// A table definition: schema, partitioning, and versions.
#[derive(Debug, Clone)]
pub struct Table {
    id: u64,
    name: String,
    kind: TableKind,
    state: TableState,
    managed: bool,
    keys_model: KeysModel,
    columns: Vec<Column>,
    /// Lowercased name -> column index; resolution is case-insensitive.
    column_index: HashMap<String, usize>,
    partition_columns: Vec<String>,
    partitions: BTreeMap<u64, Partition>,
    temp_partitions: BTreeMap<u64, Partition>,
    mv: Option<MvInfo>,
}

impl Table {
    /// Create a new table definition.
    pub fn new(id: u64, name: impl Into<String>, kind: TableKind, columns: Vec<Column>) -> Self {
        let column_index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name().to_lowercase(), i))
            .collect();
        Self {
            id,
            name: name.into(),
            kind,
            state: TableState::default(),
            managed: true,
            keys_model: KeysModel::default(),
            columns,
            column_index,
            partition_columns: Vec::new(),
            partitions: BTreeMap::new(),
            temp_partitions: BTreeMap::new(),
            mv: None,
        }
    }

    /// Set the key semantics.
    pub fn with_keys_model(mut self, model: KeysModel) -> Self {
        self.keys_model = model;
        self
    }

    /// Set the lifecycle state.
    pub fn with_state(mut self, state: TableState) -> Self {
        self.state = state;
        self
    }

    /// Mark this instance as externally registered (not on managed storage).
    pub fn unmanaged(mut self) -> Self {
        self.managed = false;
        self
    }

    /// Declare the partition columns, in declaration order.
    pub fn with_partition_columns(mut self, columns: Vec<&str>) -> Self {
        self.partition_columns = columns.into_iter().map(String::from).collect();
        self
    }

    /// Add a partition (routed to the temporary namespace if flagged).
    pub fn with_partition(mut self, partition: Partition) -> Self {
        self.add_partition(partition);
        self
    }

    /// Attach materialized-view bookkeeping.
    pub fn with_mv(mut self, mv: MvInfo) -> Self {
        self.mv = Some(mv);
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TableKind {
        self.kind
    }

    pub fn state(&self) -> TableState {
        self.state
    }

    pub fn is_managed(&self) -> bool {
        self.managed
    }

    pub fn keys_model(&self) -> KeysModel {
        self.keys_model
    }

    pub fn is_materialized_view(&self) -> bool {
        self.mv.is_some()
    }

    pub fn mv(&self) -> Option<&MvInfo> {
        self.mv.as_ref()
    }

    pub fn mv_mut(&mut self) -> Option<&mut MvInfo> {
        self.mv.as_mut()
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Case-insensitive column lookup.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.column_index
            .get(&name.to_lowercase())
            .map(|&i| &self.columns[i])
    }

    /// The writable schema: every column except generated ones.
    pub fn writable_columns(&self) -> impl Iterator<Item = &Column> {
        self.columns.iter().filter(|c| !c.is_generated())
    }

    pub fn partition_columns(&self) -> &[String] {
        &self.partition_columns
    }

    pub fn is_partitioned(&self) -> bool {
        !self.partition_columns.is_empty()
    }

    pub fn add_partition(&mut self, partition: Partition) {
        if partition.is_temporary() {
            self.temp_partitions.insert(partition.id(), partition);
        } else {
            self.partitions.insert(partition.id(), partition);
        }
    }

    pub fn drop_partition(&mut self, id: u64) {
        self.partitions.remove(&id);
        self.temp_partitions.remove(&id);
    }

    /// Regular partitions, in id order.
    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.partitions.values()
    }

    pub fn partition(&self, id: u64) -> Option<&Partition> {
        self.partitions.get(&id).or_else(|| self.temp_partitions.get(&id))
    }

    pub fn partition_mut(&mut self, id: u64) -> Option<&mut Partition> {
        self.partitions
            .get_mut(&id)
            .or_else(|| self.temp_partitions.get_mut(&id))
    }

    /// Name lookup within one namespace; regular and temporary partition
    /// names never shadow each other.
    pub fn partition_by_name(&self, name: &str, temporary: bool) -> Option<&Partition> {
        let map = if temporary {
            &self.temp_partitions
        } else {
            &self.partitions
        };
        map.values().find(|p| p.name() == name)
    }

    /// Live versions of all regular partitions as a [`VersionMap`].
    pub fn live_versions(&self) -> VersionMap {
        let mut map = VersionMap::new();
        for p in self.partitions.values() {
            map.set(
                PartitionKey::new(self.id, p.id()),
                p.visible_version(),
                p.version_committed_at(),
            );
        }
        map
    }
}
