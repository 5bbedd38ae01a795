//! Scalar types and values for partition keys and static partition literals.
//!
//! A deliberately small type system: enough to describe partition columns,
//! coerce static partition values, and render range predicates back into
//! SQL text. Row data never flows through this crate.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};

/// Column data types visible to target resolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataType {
    /// Null type (untyped literal)
    Null,
    /// Boolean type
    Boolean,
    /// 8-bit signed integer
    Int8,
    /// 16-bit signed integer
    Int16,
    /// 32-bit signed integer
    Int32,
    /// 64-bit signed integer
    Int64,
    /// 32-bit floating point
    Float32,
    /// 64-bit floating point
    Float64,
    /// Decimal with precision and scale
    Decimal { precision: u8, scale: i8 },
    /// UTF-8 encoded string
    Utf8,
    /// Calendar date
    Date,
    /// Date and time of day, second precision
    Datetime,
}

impl DataType {
    /// Check if this type is an integer.
    pub fn is_integer(&self) -> bool {
        matches!(
            self,
            DataType::Int8 | DataType::Int16 | DataType::Int32 | DataType::Int64
        )
    }

    /// Check if this type is a floating point.
    pub fn is_floating(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float64)
    }

    /// Check if this type is a decimal.
    pub fn is_decimal(&self) -> bool {
        matches!(self, DataType::Decimal { .. })
    }

    /// Check if this type is DATETIME. DATE is not included.
    pub fn is_datetime(&self) -> bool {
        matches!(self, DataType::Datetime)
    }

    /// Check if this type is a string.
    pub fn is_string(&self) -> bool {
        matches!(self, DataType::Utf8)
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Null => write!(f, "NULL"),
            DataType::Boolean => write!(f, "BOOLEAN"),
            DataType::Int8 => write!(f, "TINYINT"),
            DataType::Int16 => write!(f, "SMALLINT"),
            DataType::Int32 => write!(f, "INT"),
            DataType::Int64 => write!(f, "BIGINT"),
            DataType::Float32 => write!(f, "FLOAT"),
            DataType::Float64 => write!(f, "DOUBLE"),
            DataType::Decimal { precision, scale } => {
                write!(f, "DECIMAL({}, {})", precision, scale)
            }
            DataType::Utf8 => write!(f, "VARCHAR"),
            DataType::Date => write!(f, "DATE"),
            DataType::Datetime => write!(f, "DATETIME"),
        }
    }
}

/// A single literal value: a static partition key, a partition bound, or a
/// constant in a DML expression.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ScalarValue {
    /// Null literal
    Null,
    /// Boolean value
    Boolean(bool),
    /// 8-bit signed integer
    Int8(i8),
    /// 16-bit signed integer
    Int16(i16),
    /// 32-bit signed integer
    Int32(i32),
    /// 64-bit signed integer
    Int64(i64),
    /// 32-bit floating point
    Float32(f32),
    /// 64-bit floating point
    Float64(f64),
    /// UTF-8 string
    Utf8(String),
    /// Calendar date
    Date(NaiveDate),
    /// Date and time of day
    Datetime(NaiveDateTime),
}

impl ScalarValue {
    /// Check if this value is null.
    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    /// The data type this value carries.
    pub fn data_type(&self) -> DataType {
        match self {
            ScalarValue::Null => DataType::Null,
            ScalarValue::Boolean(_) => DataType::Boolean,
            ScalarValue::Int8(_) => DataType::Int8,
            ScalarValue::Int16(_) => DataType::Int16,
            ScalarValue::Int32(_) => DataType::Int32,
            ScalarValue::Int64(_) => DataType::Int64,
            ScalarValue::Float32(_) => DataType::Float32,
            ScalarValue::Float64(_) => DataType::Float64,
            ScalarValue::Utf8(_) => DataType::Utf8,
            ScalarValue::Date(_) => DataType::Date,
            ScalarValue::Datetime(_) => DataType::Datetime,
        }
    }

    /// Coerce this literal to `target`, the way a statement constant binds to
    /// a typed column. Returns `None` when the literal cannot represent the
    /// target type (unparsable text, integer out of range). Null coerces to
    /// any type and stays null; the caller decides whether null is allowed.
    pub fn try_coerce(&self, target: &DataType) -> Option<ScalarValue> {
        if self.data_type() == *target {
            return Some(self.clone());
        }
        match (self, target) {
            (ScalarValue::Null, _) => Some(ScalarValue::Null),
            (ScalarValue::Utf8(s), DataType::Boolean) => match s.to_lowercase().as_str() {
                "true" | "1" => Some(ScalarValue::Boolean(true)),
                "false" | "0" => Some(ScalarValue::Boolean(false)),
                _ => None,
            },
            (ScalarValue::Utf8(s), t) if t.is_integer() => {
                let n: i64 = s.trim().parse().ok()?;
                ScalarValue::Int64(n).try_coerce(t)
            }
            (ScalarValue::Utf8(s), DataType::Float32) => {
                s.trim().parse().ok().map(ScalarValue::Float32)
            }
            (ScalarValue::Utf8(s), DataType::Float64) => {
                s.trim().parse().ok().map(ScalarValue::Float64)
            }
            (ScalarValue::Utf8(s), DataType::Date) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .map(ScalarValue::Date),
            (ScalarValue::Utf8(s), DataType::Datetime) => {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S"))
                    .ok()
                    .map(ScalarValue::Datetime)
            }
            (v, t) if v.data_type().is_integer() && t.is_integer() => {
                let n = v.as_i64()?;
                match t {
                    DataType::Int8 => i8::try_from(n).ok().map(ScalarValue::Int8),
                    DataType::Int16 => i16::try_from(n).ok().map(ScalarValue::Int16),
                    DataType::Int32 => i32::try_from(n).ok().map(ScalarValue::Int32),
                    DataType::Int64 => Some(ScalarValue::Int64(n)),
                    _ => None,
                }
            }
            (v, DataType::Float64) if v.data_type().is_integer() => {
                v.as_i64().map(|n| ScalarValue::Float64(n as f64))
            }
            (v, DataType::Float32) if v.data_type().is_integer() => {
                v.as_i64().map(|n| ScalarValue::Float32(n as f32))
            }
            (ScalarValue::Date(d), DataType::Datetime) => {
                Some(ScalarValue::Datetime(d.and_hms_opt(0, 0, 0)?))
            }
            _ => None,
        }
    }

    /// Integer view of this value, when it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            ScalarValue::Int8(v) => Some(*v as i64),
            ScalarValue::Int16(v) => Some(*v as i64),
            ScalarValue::Int32(v) => Some(*v as i64),
            ScalarValue::Int64(v) => Some(*v),
            _ => None,
        }
    }
}

/// Values compare within a type family only; mixed families yield `None`.
/// Integers compare across widths. Partition bounds share the partition
/// column's type, so range overlap checks never hit the mixed case.
impl PartialOrd for ScalarValue {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        use ScalarValue::*;
        match (self, other) {
            (Null, Null) => Some(std::cmp::Ordering::Equal),
            (Boolean(a), Boolean(b)) => a.partial_cmp(b),
            (Float32(a), Float32(b)) => a.partial_cmp(b),
            (Float64(a), Float64(b)) => a.partial_cmp(b),
            (Utf8(a), Utf8(b)) => a.partial_cmp(b),
            (Date(a), Date(b)) => a.partial_cmp(b),
            (Datetime(a), Datetime(b)) => a.partial_cmp(b),
            (a, b) => match (a.as_i64(), b.as_i64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        self.partial_cmp(other) == Some(std::cmp::Ordering::Equal)
    }
}

/// Renders the SQL literal form: strings and temporals quoted, numerics
/// bare. This is what predicate injection splices into source queries.
impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Boolean(v) => write!(f, "{}", if *v { "TRUE" } else { "FALSE" }),
            ScalarValue::Int8(v) => write!(f, "{}", v),
            ScalarValue::Int16(v) => write!(f, "{}", v),
            ScalarValue::Int32(v) => write!(f, "{}", v),
            ScalarValue::Int64(v) => write!(f, "{}", v),
            ScalarValue::Float32(v) => write!(f, "{}", v),
            ScalarValue::Float64(v) => write!(f, "{}", v),
            ScalarValue::Utf8(v) => write!(f, "'{}'", v.replace('\'', "''")),
            ScalarValue::Date(v) => write!(f, "'{}'", v.format("%Y-%m-%d")),
            ScalarValue::Datetime(v) => write!(f, "'{}'", v.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_type_predicates() {
        assert!(DataType::Int32.is_integer());
        assert!(!DataType::Int32.is_floating());
        assert!(DataType::Float32.is_floating());
        assert!(DataType::Decimal {
            precision: 10,
            scale: 2
        }
        .is_decimal());
        assert!(DataType::Datetime.is_datetime());
        assert!(!DataType::Date.is_datetime());
    }

    #[test]
    fn test_coerce_date_literal() {
        let v = ScalarValue::Utf8("2024-01-01".to_string());
        let coerced = v.try_coerce(&DataType::Date).unwrap();
        assert_eq!(
            coerced,
            ScalarValue::Date(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap())
        );
    }

    #[test]
    fn test_coerce_integer_range() {
        let v = ScalarValue::Int64(300);
        assert!(v.try_coerce(&DataType::Int8).is_none());
        assert_eq!(
            v.try_coerce(&DataType::Int16),
            Some(ScalarValue::Int16(300))
        );
    }

    #[test]
    fn test_coerce_unparsable_text() {
        let v = ScalarValue::Utf8("not-a-date".to_string());
        assert!(v.try_coerce(&DataType::Date).is_none());
        assert!(v.try_coerce(&DataType::Int32).is_none());
    }

    #[test]
    fn test_null_coerces_to_anything() {
        assert_eq!(
            ScalarValue::Null.try_coerce(&DataType::Date),
            Some(ScalarValue::Null)
        );
    }

    #[test]
    fn test_sql_rendering() {
        assert_eq!(ScalarValue::Int32(42).to_string(), "42");
        assert_eq!(
            ScalarValue::Utf8("o'brien".to_string()).to_string(),
            "'o''brien'"
        );
        assert_eq!(
            ScalarValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()).to_string(),
            "'2024-03-01'"
        );
    }

    #[test]
    fn test_ordering_within_family() {
        assert!(ScalarValue::Int32(1) < ScalarValue::Int64(2));
        assert!(
            ScalarValue::Utf8("a".into()).partial_cmp(&ScalarValue::Int32(1)).is_none()
        );
    }
}
