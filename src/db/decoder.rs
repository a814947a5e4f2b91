//! Raw value to typed value decoding.
//!
//! Rows and scalars come out of the transport as JSON values and are
//! validated into any `serde::de::DeserializeOwned` type.
//!
//! A value is always decoded as-is first. Only when that fails is it decoded
//! again through [`Lax`], which coerces field by field against what the
//! target type asks for: a string holding a number or boolean is accepted
//! where one is expected, integral floats are accepted as integers, JSON text
//! is accepted where a sequence or map is expected, and `YYYY-MM-DD HH:MM:SS`
//! timestamps are accepted with a space separator where a date or time is
//! parsed. Fields that already fit are passed through untouched. A
//! one-column row can also be decoded as its single value, and a row can be
//! decoded positionally into a tuple.
//!
//! # Adapter cache
//!
//! The first decode of a type registers a [`TypeAdapter`] in a process-wide
//! map keyed by `TypeId`. Entries are never evicted. The adapter remembers
//! which fallback strategy last produced a value so later decodes try it
//! right after the as-is decode. The cache only changes the order of
//! attempts, never the decoded value.

use crate::db::transport::RawRow;
use crate::error::{DbError, DbResult};
use dashmap::DashMap;
use serde::Deserializer;
use serde::de::{
    self, DeserializeOwned, DeserializeSeed, IntoDeserializer, MapAccess, SeqAccess, Visitor,
};
use serde_json::Value as JsonValue;
use std::any::TypeId;
use std::borrow::Cow;
use std::sync::LazyLock;
use tracing::trace;

static ADAPTERS: LazyLock<DashMap<TypeId, TypeAdapter>> = LazyLock::new(DashMap::new);

/// How a raw value is shaped and read during deserialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeStrategy {
    /// The raw value as-is.
    Strict,
    /// The raw value read through [`Lax`].
    Lax,
    /// The only value of a one-column row.
    SingleColumn,
    /// The only value of a one-column row, read through [`Lax`].
    SingleColumnLax,
    /// The row's values in column order, for tuples.
    Positional,
    /// The row's values in column order, read through [`Lax`].
    PositionalLax,
}

impl DecodeStrategy {
    const ALL: [Self; 6] = [
        Self::Strict,
        Self::Lax,
        Self::SingleColumn,
        Self::SingleColumnLax,
        Self::Positional,
        Self::PositionalLax,
    ];

    /// The value to deserialize under this strategy, `None` when it does not apply.
    fn shape<'a>(self, raw: &'a JsonValue) -> Option<Cow<'a, JsonValue>> {
        match self {
            Self::Strict | Self::Lax => Some(Cow::Borrowed(raw)),
            Self::SingleColumn | Self::SingleColumnLax => single_column(raw).map(Cow::Borrowed),
            Self::Positional | Self::PositionalLax => positional(raw).map(Cow::Owned),
        }
    }

    fn is_lax(self) -> bool {
        matches!(self, Self::Lax | Self::SingleColumnLax | Self::PositionalLax)
    }

    fn try_decode<T: DeserializeOwned>(self, raw: &JsonValue) -> Option<LaxResult<T>> {
        let shaped = self.shape(raw)?;
        Some(if self.is_lax() {
            T::deserialize(Lax(shaped.as_ref()))
        } else {
            T::deserialize(shaped.as_ref())
        })
    }
}

/// Cached decoding state for one target type.
#[derive(Debug, Clone)]
pub struct TypeAdapter {
    pub type_name: &'static str,
    /// Strategy tried right after `Strict`: the last fallback that produced
    /// a value, `Strict` while none has been needed.
    pub preferred: DecodeStrategy,
}

/// Validates raw values into typed values.
#[derive(Debug, Clone, Copy, Default)]
pub struct RowDecoder;

impl RowDecoder {
    /// Decode a raw value into `T`.
    ///
    /// Fails with [`DbError::Validation`] when no strategy yields a `T`; the
    /// reported message is the one from decoding the value as-is.
    pub fn decode<T>(raw: &JsonValue) -> DbResult<T>
    where
        T: DeserializeOwned + 'static,
    {
        let type_id = TypeId::of::<T>();
        let type_name = std::any::type_name::<T>();
        let preferred = ADAPTERS
            .entry(type_id)
            .or_insert_with(|| {
                trace!(type_name = %type_name, "Registering type adapter");
                TypeAdapter {
                    type_name,
                    preferred: DecodeStrategy::Strict,
                }
            })
            .preferred;

        let strict_error = match T::deserialize(raw) {
            Ok(value) => return Ok(value),
            Err(e) => e.to_string(),
        };

        let fallbacks = std::iter::once(preferred)
            .chain(DecodeStrategy::ALL.into_iter().filter(|s| *s != preferred));
        for strategy in fallbacks.filter(|s| *s != DecodeStrategy::Strict) {
            if let Some(Ok(value)) = strategy.try_decode::<T>(raw) {
                if strategy != preferred {
                    if let Some(mut adapter) = ADAPTERS.get_mut(&type_id) {
                        adapter.preferred = strategy;
                    }
                }
                return Ok(value);
            }
        }

        Err(DbError::validation(type_name, strict_error))
    }

    /// Decode one row into `T`.
    pub fn decode_row<T>(row: RawRow) -> DbResult<T>
    where
        T: DeserializeOwned + 'static,
    {
        Self::decode(&JsonValue::Object(row))
    }

    /// Decode every row into `T`, failing on the first row that does not fit.
    pub fn decode_rows<T>(rows: Vec<RawRow>) -> DbResult<Vec<T>>
    where
        T: DeserializeOwned + 'static,
    {
        rows.into_iter().map(Self::decode_row).collect()
    }

    /// The cached adapter for `T`, if `T` has been decoded before.
    pub fn adapter<T: 'static>() -> Option<TypeAdapter> {
        ADAPTERS
            .get(&TypeId::of::<T>())
            .map(|adapter| adapter.value().clone())
    }

    /// Number of types with a cached adapter.
    pub fn cached_types() -> usize {
        ADAPTERS.len()
    }
}

fn single_column(raw: &JsonValue) -> Option<&JsonValue> {
    match raw {
        JsonValue::Object(map) if map.len() == 1 => map.values().next(),
        _ => None,
    }
}

fn positional(raw: &JsonValue) -> Option<JsonValue> {
    match raw {
        JsonValue::Object(map) => Some(JsonValue::Array(map.values().cloned().collect())),
        _ => None,
    }
}

// =============================================================================
// Lax deserializer
// =============================================================================

/// Deserializer over a raw value that coerces each value against the type
/// requested for it.
///
/// `deserialize_string` and `deserialize_any` hand strings over unchanged,
/// so `String` and `serde_json::Value` fields keep the stored text.
/// `deserialize_str`, which chrono and uuid parse through, rewrites SQL
/// timestamps to ISO 8601.
#[derive(Debug, Clone, Copy)]
pub struct Lax<'a>(pub &'a JsonValue);

type LaxResult<T> = Result<T, serde_json::Error>;

fn parse_bool(s: &str) -> Option<bool> {
    let s = s.trim();
    if s.eq_ignore_ascii_case("true") || s.eq_ignore_ascii_case("t") {
        Some(true)
    } else if s.eq_ignore_ascii_case("false") || s.eq_ignore_ascii_case("f") {
        Some(false)
    } else {
        None
    }
}

fn integral(value: &JsonValue) -> Option<i64> {
    match value {
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Number(n) if n.is_f64() => n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f <= i64::MAX as f64)
            .map(|f| f as i64),
        _ => None,
    }
}

fn unsigned(value: &JsonValue) -> Option<u64> {
    match value {
        JsonValue::String(s) => s.trim().parse().ok(),
        JsonValue::Number(n) if n.is_f64() => n
            .as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= 0.0 && *f <= u64::MAX as f64)
            .map(|f| f as u64),
        _ => None,
    }
}

/// JSON text inside a string, when it holds an array or object.
fn embedded_json(value: &JsonValue) -> Option<JsonValue> {
    let JsonValue::String(s) = value else {
        return None;
    };
    serde_json::from_str::<JsonValue>(s.trim())
        .ok()
        .filter(|v| v.is_array() || v.is_object())
}

fn visit_array<'de, V: Visitor<'de>>(items: &[JsonValue], visitor: V) -> LaxResult<V::Value> {
    let mut seq = LaxSeq(items.iter());
    let value = visitor.visit_seq(&mut seq)?;
    if seq.0.len() == 0 {
        Ok(value)
    } else {
        Err(de::Error::invalid_length(items.len(), &"fewer elements in array"))
    }
}

fn visit_object<'de, V: Visitor<'de>>(
    map: &serde_json::Map<String, JsonValue>,
    visitor: V,
) -> LaxResult<V::Value> {
    visitor.visit_map(LaxMap {
        iter: map.iter(),
        value: None,
    })
}

macro_rules! lax_signed {
    ($($method:ident)*) => {$(
        fn $method<V: Visitor<'de>>(self, visitor: V) -> LaxResult<V::Value> {
            match integral(self.0) {
                Some(n) => visitor.visit_i64(n),
                None => self.0.clone().$method(visitor),
            }
        }
    )*};
}

macro_rules! lax_unsigned {
    ($($method:ident)*) => {$(
        fn $method<V: Visitor<'de>>(self, visitor: V) -> LaxResult<V::Value> {
            match unsigned(self.0) {
                Some(n) => visitor.visit_u64(n),
                None => self.0.clone().$method(visitor),
            }
        }
    )*};
}

macro_rules! lax_float {
    ($($method:ident)*) => {$(
        fn $method<V: Visitor<'de>>(self, visitor: V) -> LaxResult<V::Value> {
            match self.0 {
                JsonValue::String(s) => match s.trim().parse::<f64>() {
                    Ok(f) => visitor.visit_f64(f),
                    Err(_) => self.0.clone().$method(visitor),
                },
                _ => self.0.clone().$method(visitor),
            }
        }
    )*};
}

macro_rules! lax_compound {
    ($($method:ident($($arg:ident: $ty:ty),*))*) => {$(
        fn $method<V: Visitor<'de>>(self, $($arg: $ty,)* visitor: V) -> LaxResult<V::Value> {
            match self.0 {
                JsonValue::Array(items) => visit_array(items, visitor),
                JsonValue::Object(map) => visit_object(map, visitor),
                other => match embedded_json(other) {
                    Some(parsed) => Lax(&parsed).$method($($arg,)* visitor),
                    None => other.clone().$method($($arg,)* visitor),
                },
            }
        }
    )*};
}

impl<'de> Deserializer<'de> for Lax<'_> {
    type Error = serde_json::Error;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> LaxResult<V::Value> {
        match self.0 {
            JsonValue::Array(items) => visit_array(items, visitor),
            JsonValue::Object(map) => visit_object(map, visitor),
            other => other.clone().deserialize_any(visitor),
        }
    }

    fn deserialize_bool<V: Visitor<'de>>(self, visitor: V) -> LaxResult<V::Value> {
        match self.0 {
            JsonValue::String(s) => match parse_bool(s) {
                Some(b) => visitor.visit_bool(b),
                None => self.0.clone().deserialize_bool(visitor),
            },
            other => other.clone().deserialize_bool(visitor),
        }
    }

    lax_signed! { deserialize_i8 deserialize_i16 deserialize_i32 deserialize_i64 }
    lax_unsigned! { deserialize_u8 deserialize_u16 deserialize_u32 deserialize_u64 }
    lax_float! { deserialize_f32 deserialize_f64 }

    fn deserialize_str<V: Visitor<'de>>(self, visitor: V) -> LaxResult<V::Value> {
        match self.0 {
            JsonValue::String(s) => match sql_timestamp_to_iso(s.trim()) {
                Some(iso) => visitor.visit_string(iso),
                None => visitor.visit_str(s),
            },
            other => other.clone().deserialize_str(visitor),
        }
    }

    fn deserialize_string<V: Visitor<'de>>(self, visitor: V) -> LaxResult<V::Value> {
        self.0.clone().deserialize_string(visitor)
    }

    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> LaxResult<V::Value> {
        match self.0 {
            JsonValue::Null => visitor.visit_none(),
            _ => visitor.visit_some(self),
        }
    }

    fn deserialize_newtype_struct<V: Visitor<'de>>(
        self,
        _name: &'static str,
        visitor: V,
    ) -> LaxResult<V::Value> {
        visitor.visit_newtype_struct(self)
    }

    fn deserialize_enum<V: Visitor<'de>>(
        self,
        name: &'static str,
        variants: &'static [&'static str],
        visitor: V,
    ) -> LaxResult<V::Value> {
        self.0.clone().deserialize_enum(name, variants, visitor)
    }

    lax_compound! {
        deserialize_seq()
        deserialize_tuple(len: usize)
        deserialize_tuple_struct(name: &'static str, len: usize)
        deserialize_map()
        deserialize_struct(name: &'static str, fields: &'static [&'static str])
    }

    serde::forward_to_deserialize_any! {
        i128 u128 char bytes byte_buf unit unit_struct identifier ignored_any
    }
}

struct LaxSeq<'a>(std::slice::Iter<'a, JsonValue>);

impl<'de> SeqAccess<'de> for LaxSeq<'_> {
    type Error = serde_json::Error;

    fn next_element_seed<S: DeserializeSeed<'de>>(
        &mut self,
        seed: S,
    ) -> LaxResult<Option<S::Value>> {
        self.0
            .next()
            .map(|item| seed.deserialize(Lax(item)))
            .transpose()
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.0.len())
    }
}

struct LaxMap<'a> {
    iter: serde_json::map::Iter<'a>,
    value: Option<&'a JsonValue>,
}

impl<'de> MapAccess<'de> for LaxMap<'_> {
    type Error = serde_json::Error;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> LaxResult<Option<K::Value>> {
        let Some((key, value)) = self.iter.next() else {
            return Ok(None);
        };
        self.value = Some(value);
        let key: de::value::StrDeserializer<'_, serde_json::Error> =
            key.as_str().into_deserializer();
        seed.deserialize(key).map(Some)
    }

    fn next_value_seed<S: DeserializeSeed<'de>>(&mut self, seed: S) -> LaxResult<S::Value> {
        match self.value.take() {
            Some(value) => seed.deserialize(Lax(value)),
            None => Err(de::Error::custom("value is missing")),
        }
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.iter.len())
    }
}

/// `2023-09-01 09:00:00+00` -> `2023-09-01T09:00:00+00:00`
fn sql_timestamp_to_iso(s: &str) -> Option<String> {
    let bytes = s.as_bytes();
    let date_like = bytes.len() > 11
        && bytes[4] == b'-'
        && bytes[7] == b'-'
        && bytes[10] == b' '
        && bytes[..4].iter().all(u8::is_ascii_digit);
    if !date_like {
        return None;
    }

    let mut iso = format!("{}T{}", &s[..10], &s[11..]);
    // a bare hour offset ("+00") is not valid RFC 3339
    let tail = iso.len().saturating_sub(3);
    if let Some(offset) = iso.get(tail..) {
        let b = offset.as_bytes();
        if (b[0] == b'+' || b[0] == b'-') && b[1].is_ascii_digit() && b[2].is_ascii_digit() {
            iso.push_str(":00");
        }
    }
    Some(iso)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, NaiveDate, Utc};
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Student {
        id: i64,
        full_name: String,
        gpa: Option<f64>,
    }

    fn row(value: JsonValue) -> RawRow {
        match value {
            JsonValue::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn test_decode_struct_from_row() {
        let student: Student = RowDecoder::decode_row(row(json!({
            "id": 1, "full_name": "Jane Doe", "gpa": 3.9
        })))
        .unwrap();
        assert_eq!(
            student,
            Student {
                id: 1,
                full_name: "Jane Doe".to_string(),
                gpa: Some(3.9)
            }
        );
    }

    #[test]
    fn test_string_payload_as_integer() {
        let value: i32 = RowDecoder::decode(&json!("42")).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_string_stays_string() {
        let value: String = RowDecoder::decode(&json!("42")).unwrap();
        assert_eq!(value, "42");
    }

    #[test]
    fn test_integral_float_as_integer() {
        let value: i64 = RowDecoder::decode(&json!(1.0)).unwrap();
        assert_eq!(value, 1);
        assert!(RowDecoder::decode::<i64>(&json!(1.5)).is_err());
    }

    #[test]
    fn test_numeric_text_as_float() {
        let value: f64 = RowDecoder::decode(&json!("3.90")).unwrap();
        assert!((value - 3.9).abs() < f64::EPSILON);
    }

    #[test]
    fn test_sql_timestamp_text() {
        let value: DateTime<Utc> = RowDecoder::decode(&json!("2023-09-01 09:00:00+00")).unwrap();
        assert_eq!(value.to_rfc3339(), "2023-09-01T09:00:00+00:00");

        let date: NaiveDate = RowDecoder::decode(&json!("2002-05-14")).unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2002, 5, 14).unwrap());
    }

    #[test]
    fn test_single_column_row_as_scalar() {
        let name: String = RowDecoder::decode_row(row(json!({"name": "Walter"}))).unwrap();
        assert_eq!(name, "Walter");
    }

    #[test]
    fn test_row_as_tuple_keeps_column_order() {
        let (id, name): (i64, String) =
            RowDecoder::decode_row(row(json!({"id": 2, "full_name": "John Doe"}))).unwrap();
        assert_eq!(id, 2);
        assert_eq!(name, "John Doe");
    }

    #[test]
    fn test_null_into_non_optional_fails() {
        let result = RowDecoder::decode::<i64>(&JsonValue::Null);
        assert!(matches!(result, Err(DbError::Validation { .. })));
        let value: Option<i64> = RowDecoder::decode(&JsonValue::Null).unwrap();
        assert!(value.is_none());
    }

    #[test]
    fn test_validation_error_names_type() {
        let err = RowDecoder::decode::<Student>(&json!({"id": "x"})).unwrap_err();
        match err {
            DbError::Validation { type_name, .. } => assert!(type_name.contains("Student")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_decode_rows_fails_on_bad_row() {
        let rows = vec![
            row(json!({"id": 1, "full_name": "a", "gpa": null})),
            row(json!({"id": "oops", "full_name": "b", "gpa": null})),
        ];
        assert!(RowDecoder::decode_rows::<Student>(rows).is_err());
    }

    #[test]
    fn test_adapter_is_cached_and_remembers_strategy() {
        #[derive(Debug, Deserialize)]
        struct Counted {
            #[allow(dead_code)]
            n: u8,
        }

        assert!(RowDecoder::adapter::<Counted>().is_none());
        let _: Counted = RowDecoder::decode(&json!({"n": "7"})).unwrap();
        let adapter = RowDecoder::adapter::<Counted>().unwrap();
        assert!(adapter.type_name.contains("Counted"));
        assert_eq!(adapter.preferred, DecodeStrategy::Lax);

        let before = RowDecoder::cached_types();
        let _: Counted = RowDecoder::decode(&json!({"n": 8})).unwrap();
        assert_eq!(RowDecoder::cached_types(), before);
    }

    #[test]
    fn test_lax_coercion_is_per_field() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Product {
            price: f64,
            sku: String,
            active: bool,
        }

        let product: Product = RowDecoder::decode_row(row(json!({
            "price": "9.99", "sku": "12345", "active": "t"
        })))
        .unwrap();
        assert_eq!(
            product,
            Product {
                price: 9.99,
                sku: "12345".to_string(),
                active: true
            }
        );
    }

    #[test]
    fn test_lax_leaves_untyped_fields_alone() {
        #[derive(Debug, Deserialize)]
        struct Tagged {
            n: i32,
            label: JsonValue,
            note: String,
        }

        let tagged: Tagged = RowDecoder::decode(&json!({
            "n": "3", "label": "2024-01-01 10:00:00", "note": "true"
        }))
        .unwrap();
        assert_eq!(tagged.n, 3);
        assert_eq!(tagged.label, json!("2024-01-01 10:00:00"));
        assert_eq!(tagged.note, "true");
    }

    #[test]
    fn test_cached_strategy_does_not_change_results() {
        #[derive(Debug, Deserialize)]
        struct Event {
            n: i32,
            label: JsonValue,
        }

        let first: Event = RowDecoder::decode(&json!({"n": "1", "label": "x"})).unwrap();
        assert_eq!(first.n, 1);
        assert_eq!(
            RowDecoder::adapter::<Event>().unwrap().preferred,
            DecodeStrategy::Lax
        );

        let second: Event =
            RowDecoder::decode(&json!({"n": 2, "label": "2024-01-01 10:00:00"})).unwrap();
        assert_eq!(second.n, 2);
        assert_eq!(second.label, json!("2024-01-01 10:00:00"));
    }

    #[test]
    fn test_json_text_payload_as_collection() {
        let values: Vec<i64> = RowDecoder::decode(&json!("[1, \"2\", 3]")).unwrap();
        assert_eq!(values, vec![1, 2, 3]);

        #[derive(Debug, Deserialize, PartialEq)]
        struct Ping {
            id: i64,
        }
        let ping: Ping = RowDecoder::decode(&json!("{\"id\": 7}")).unwrap();
        assert_eq!(ping, Ping { id: 7 });
    }

    #[test]
    fn test_row_as_tuple_with_text_numbers() {
        let (total, name): (f64, String) =
            RowDecoder::decode_row(row(json!({"total": "12.50", "name": "7"}))).unwrap();
        assert!((total - 12.5).abs() < f64::EPSILON);
        assert_eq!(name, "7");

        let short = RowDecoder::decode_row::<(i64,)>(row(json!({"a": 1, "b": 2})));
        assert!(short.is_err());
    }

    #[test]
    fn test_sql_timestamp_to_iso() {
        assert_eq!(
            sql_timestamp_to_iso("2024-02-01 10:30:00").as_deref(),
            Some("2024-02-01T10:30:00")
        );
        assert_eq!(
            sql_timestamp_to_iso("2024-02-01 10:30:00-05").as_deref(),
            Some("2024-02-01T10:30:00-05:00")
        );
        assert!(sql_timestamp_to_iso("hello world, again").is_none());
    }
}
