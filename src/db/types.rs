//! PostgreSQL row to raw value conversion.
//!
//! Rows leave the transport as JSON objects so the decoder can validate them
//! into any serde type.
//!
//! # Architecture
//!
//! Type conversion uses a two-phase approach:
//! 1. `TypeCategory` classifies column types into logical categories
//! 2. Category-specific decoders handle the actual value extraction

use crate::db::transport::RawRow;
use crate::error::{DbError, DbResult};
use serde_json::Value as JsonValue;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::{PgInterval, PgTimeTz};
use sqlx::postgres::{PgHasArrayType, PgRow, PgTypeInfo, PgTypeKind, PgValueFormat, PgValueRef};
use sqlx::{Column as _, Decode, Row, Type, TypeInfo, ValueRef};

// =============================================================================
// Type Classification
// =============================================================================

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Text,
    Binary,
    Json,
    Uuid,
    Date,
    Time,
    Timestamp,
    TimestampTz,
    Interval,
    TimeTz,
    Array,
    Unknown,
}

/// Classify a PostgreSQL type name into a logical category.
pub fn categorize_type(type_name: &str) -> TypeCategory {
    let lower = type_name.to_lowercase();

    if lower.ends_with("[]") {
        return TypeCategory::Array;
    }

    if lower.contains("numeric") || lower.contains("decimal") {
        return TypeCategory::Decimal;
    }

    match lower.as_str() {
        "timestamptz" => return TypeCategory::TimestampTz,
        "timestamp" => return TypeCategory::Timestamp,
        "date" => return TypeCategory::Date,
        "time" => return TypeCategory::Time,
        "interval" => return TypeCategory::Interval,
        "timetz" => return TypeCategory::TimeTz,
        _ => {}
    }

    if matches!(
        lower.as_str(),
        "int2" | "int4" | "int8" | "int" | "smallint" | "integer" | "bigint"
            | "smallserial" | "serial" | "bigserial" | "serial2" | "serial4" | "serial8"
    ) {
        return TypeCategory::Integer;
    }

    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }

    if lower == "float4" || lower == "float8" || lower == "real" || lower.contains("double") {
        return TypeCategory::Float;
    }

    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }

    if lower == "uuid" {
        return TypeCategory::Uuid;
    }

    if lower == "bytea" {
        return TypeCategory::Binary;
    }

    if matches!(
        lower.as_str(),
        "text" | "varchar" | "bpchar" | "char" | "name" | "citext" | "unknown"
            | "character varying" | "character"
    ) {
        return TypeCategory::Text;
    }

    TypeCategory::Unknown
}

// =============================================================================
// Decimal Type Support
// =============================================================================

/// Wrapper type for raw NUMERIC values as strings.
/// This preserves the exact database representation.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("NUMERIC")
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl PgHasArrayType for RawDecimal {
    fn array_type_info() -> PgTypeInfo {
        PgTypeInfo::with_name("_numeric")
    }

    fn array_compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name == "numeric[]" || name == "_numeric"
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        match value.format() {
            PgValueFormat::Text => Ok(RawDecimal(value.as_str()?.to_string())),
            PgValueFormat::Binary => numeric_to_string(value.as_bytes()?).map(RawDecimal),
        }
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Render the binary NUMERIC wire format (base-10000 digit groups) as text.
fn numeric_to_string(bytes: &[u8]) -> Result<String, BoxDynError> {
    if bytes.len() < 8 {
        return Err("NUMERIC value shorter than its header".into());
    }
    let word = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);

    let ndigits = word(0) as usize;
    let weight = word(2) as i16 as i32;
    let sign = word(4);
    let dscale = word(6) as usize;

    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }
    if bytes.len() < 8 + ndigits * 2 {
        return Err("NUMERIC value shorter than its digit count".into());
    }
    let digit = |i: i32| -> u16 {
        if i < 0 || i as usize >= ndigits {
            0
        } else {
            word(8 + 2 * i as usize)
        }
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG {
        out.push('-');
    }

    if weight < 0 {
        out.push('0');
    } else {
        for i in 0..=weight {
            if i == 0 {
                out.push_str(&digit(i).to_string());
            } else {
                out.push_str(&format!("{:04}", digit(i)));
            }
        }
    }

    if dscale > 0 {
        let mut fraction = String::with_capacity(dscale + 4);
        let mut i = weight + 1;
        while fraction.len() < dscale {
            fraction.push_str(&format!("{:04}", digit(i)));
            i += 1;
        }
        fraction.truncate(dscale);
        out.push('.');
        out.push_str(&fraction);
    }

    Ok(out)
}

// =============================================================================
// Row to JSON
// =============================================================================

/// Convert a whole row into a raw row keyed by column name.
///
/// Fails with [`DbError::Validation`] naming the column when a value cannot
/// be converted.
pub fn row_to_raw(row: &PgRow) -> DbResult<RawRow> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| Ok((col.name().to_string(), column_to_json(row, idx)?)))
        .collect()
}

/// Convert a single column of a row into a raw value.
pub fn column_to_json(row: &PgRow, idx: usize) -> DbResult<JsonValue> {
    let raw = row.try_get_raw(idx).map_err(DbError::from)?;
    if raw.is_null() {
        return Ok(JsonValue::Null);
    }

    let column = Column::new(row, idx);
    match categorize_type(column.type_name) {
        TypeCategory::Decimal => column.decode_with(|v: RawDecimal| Ok(JsonValue::String(v.0))),
        TypeCategory::Integer => decode_integer(&column),
        TypeCategory::Boolean => column.decode_as::<bool>(),
        TypeCategory::Float => decode_float(&column),
        TypeCategory::Binary => column.decode_as::<Vec<u8>>(),
        TypeCategory::Json => column.decode_as::<JsonValue>(),
        TypeCategory::Uuid => column.decode_as::<uuid::Uuid>(),
        TypeCategory::Date => column.decode_as::<chrono::NaiveDate>(),
        TypeCategory::Time => column.decode_as::<chrono::NaiveTime>(),
        TypeCategory::Timestamp => column.decode_as::<chrono::NaiveDateTime>(),
        TypeCategory::TimestampTz => column.decode_as::<chrono::DateTime<chrono::Utc>>(),
        TypeCategory::Interval => {
            column.decode_with(|v: PgInterval| Ok(JsonValue::String(interval_to_string(&v))))
        }
        TypeCategory::TimeTz => {
            type TimeTz = PgTimeTz<chrono::NaiveTime, chrono::FixedOffset>;
            column.decode_with(|v: TimeTz| Ok(JsonValue::String(format!("{}{}", v.time, v.offset))))
        }
        TypeCategory::Array => decode_array(&column),
        TypeCategory::Text | TypeCategory::Unknown => decode_text(&column, raw),
    }
}

/// One column of a row, with what error messages need to name it.
struct Column<'r> {
    row: &'r PgRow,
    idx: usize,
    name: &'r str,
    type_name: &'r str,
}

impl<'r> Column<'r> {
    fn new(row: &'r PgRow, idx: usize) -> Self {
        let col = &row.columns()[idx];
        Self {
            row,
            idx,
            name: col.name(),
            type_name: col.type_info().name(),
        }
    }

    fn error(&self, message: impl std::fmt::Display) -> DbError {
        DbError::validation(
            self.type_name,
            format!("column \"{}\": {}", self.name, message),
        )
    }

    fn compatible<T: Type<sqlx::Postgres>>(&self) -> bool {
        T::compatible(self.row.columns()[self.idx].type_info())
    }

    /// Decode the column as `T` and convert it with `f`.
    fn decode_with<T, F>(&self, f: F) -> DbResult<JsonValue>
    where
        T: for<'a> Decode<'a, sqlx::Postgres> + Type<sqlx::Postgres>,
        F: FnOnce(T) -> Result<JsonValue, String>,
    {
        let value = self.row.try_get::<T, _>(self.idx).map_err(|e| self.error(e))?;
        f(value).map_err(|e| self.error(e))
    }

    /// Decode the column as `T` and serialize it with its serde representation.
    fn decode_as<T>(&self) -> DbResult<JsonValue>
    where
        T: for<'a> Decode<'a, sqlx::Postgres> + Type<sqlx::Postgres> + serde::Serialize,
    {
        self.decode_with(|v: T| serde_json::to_value(v).map_err(|e| e.to_string()))
    }
}

fn decode_integer(column: &Column<'_>) -> DbResult<JsonValue> {
    if column.compatible::<i16>() {
        column.decode_as::<i16>()
    } else if column.compatible::<i32>() {
        column.decode_as::<i32>()
    } else {
        column.decode_as::<i64>()
    }
}

fn decode_float(column: &Column<'_>) -> DbResult<JsonValue> {
    let to_json = |v: f64| -> Result<JsonValue, String> {
        Ok(serde_json::Number::from_f64(v)
            .map(JsonValue::Number)
            .unwrap_or_else(|| JsonValue::String(v.to_string())))
    };
    if column.compatible::<f32>() {
        column.decode_with(|v: f32| to_json(v as f64))
    } else {
        column.decode_with(to_json)
    }
}

fn decode_array(column: &Column<'_>) -> DbResult<JsonValue> {
    macro_rules! try_array {
        ($($ty:ty),* $(,)?) => {$(
            if column.compatible::<Vec<$ty>>() {
                return column.decode_as::<Vec<$ty>>();
            }
        )*};
    }

    try_array!(
        i16,
        i32,
        i64,
        f32,
        f64,
        bool,
        String,
        uuid::Uuid,
        JsonValue,
        chrono::NaiveDate,
        chrono::NaiveTime,
        chrono::NaiveDateTime,
        chrono::DateTime<chrono::Utc>,
    );
    if column.compatible::<Vec<RawDecimal>>() {
        return column.decode_with(|v: Vec<RawDecimal>| {
            Ok(JsonValue::Array(v.into_iter().map(|d| JsonValue::String(d.0)).collect()))
        });
    }
    Err(column.error("array element type is not supported; cast it to text[] in the query"))
}

fn decode_text(column: &Column<'_>, raw: PgValueRef<'_>) -> DbResult<JsonValue> {
    if column.compatible::<String>() {
        return column.decode_as::<String>();
    }
    // Text format, and enum labels in binary format, are the value's text
    let textual = raw.format() == PgValueFormat::Text
        || matches!(
            column.row.columns()[column.idx].type_info().kind(),
            PgTypeKind::Enum(_)
        );
    if textual {
        return raw
            .as_str()
            .map(|s| JsonValue::String(s.to_string()))
            .map_err(|e| column.error(e));
    }
    Err(column.error(format!(
        "type {} has no conversion; cast it to text in the query",
        column.type_name
    )))
}

/// Render an interval the way the server's default `IntervalStyle` does,
/// e.g. `1 year 2 mons 3 days 04:05:06.5`.
fn interval_to_string(interval: &PgInterval) -> String {
    fn unit(out: &mut Vec<String>, value: i32, name: &str) {
        if value != 0 {
            let plural = if value == 1 { "" } else { "s" };
            out.push(format!("{value} {name}{plural}"));
        }
    }

    let mut parts = Vec::new();
    unit(&mut parts, interval.months / 12, "year");
    unit(&mut parts, interval.months % 12, "mon");
    unit(&mut parts, interval.days, "day");

    let micros = interval.microseconds;
    if micros != 0 || parts.is_empty() {
        let sign = if micros < 0 { "-" } else { "" };
        let total = micros.unsigned_abs();
        let secs = total / 1_000_000;
        let mut time = format!(
            "{sign}{:02}:{:02}:{:02}",
            secs / 3600,
            secs / 60 % 60,
            secs % 60
        );
        let fraction = total % 1_000_000;
        if fraction != 0 {
            let digits = format!("{fraction:06}");
            time.push('.');
            time.push_str(digits.trim_end_matches('0'));
        }
        parts.push(time);
    }
    parts.join(" ")
}
