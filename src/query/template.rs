//! Structured query templates.
//!
//! A [`Template`] keeps literal SQL text and embedded values apart until the
//! assembler turns the values into placeholders. Templates are normally built
//! with the [`sql!`](crate::sql) macro:
//!
//! ```
//! use pgtemplate::sql;
//!
//! let id = 1;
//! let order = sql!("ORDER BY id DESC");
//! let query = sql!("SELECT * FROM students WHERE id = " {id} " " {order});
//! assert_eq!(query.values().len(), 2);
//! ```

use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde_json::Value as JsonValue;
use std::borrow::Cow;
use uuid::Uuid;

/// A value embedded in a template.
#[derive(Debug, Clone, PartialEq)]
pub enum Interpolation {
    /// Bound as a positional parameter.
    Param(QueryParam),
    /// Spliced into the surrounding SQL text after its own assembly.
    Nested(Template),
}

/// An immutable query: `strings[0] + values[0] + strings[1] + ... + strings[n]`.
///
/// Always holds exactly one more literal segment than embedded values.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    strings: Vec<String>,
    values: Vec<Interpolation>,
}

impl Template {
    /// Build a template from its literal segments and embedded values.
    pub fn new(strings: Vec<String>, values: Vec<Interpolation>) -> DbResult<Self> {
        if strings.len() != values.len() + 1 {
            return Err(DbError::invalid_input(format!(
                "a template with {} values needs {} literal segments, got {}",
                values.len(),
                values.len() + 1,
                strings.len()
            )));
        }
        Ok(Self { strings, values })
    }

    /// A template holding only literal text.
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            strings: vec![text.into()],
            values: Vec::new(),
        }
    }

    /// The empty template (`sql!()`).
    pub fn empty() -> Self {
        Self::literal("")
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn values(&self) -> &[Interpolation] {
        &self.values
    }

    /// True when the template has no values and only empty text.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.strings.iter().all(String::is_empty)
    }
}

impl Default for Template {
    fn default() -> Self {
        Self::empty()
    }
}

/// Incremental construction used by the `sql!` macro.
#[derive(Debug)]
pub struct TemplateBuilder {
    strings: Vec<String>,
    values: Vec<Interpolation>,
}

impl TemplateBuilder {
    pub fn new() -> Self {
        Self {
            strings: vec![String::new()],
            values: Vec::new(),
        }
    }

    /// Append literal SQL text.
    pub fn push_str(&mut self, text: &str) -> &mut Self {
        if let Some(last) = self.strings.last_mut() {
            last.push_str(text);
        }
        self
    }

    /// Embed a value at the current position.
    pub fn push_embed<E: Embed + ?Sized>(&mut self, value: &E) -> &mut Self {
        self.values.push(value.embed());
        self.strings.push(String::new());
        self
    }

    pub fn build(self) -> Template {
        Template {
            strings: self.strings,
            values: self.values,
        }
    }
}

impl Default for TemplateBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Conversion of an embedded expression into an [`Interpolation`].
///
/// Takes `&self` so the same variable can be embedded at several sites.
pub trait Embed {
    fn embed(&self) -> Interpolation;
}

impl Embed for Template {
    fn embed(&self) -> Interpolation {
        Interpolation::Nested(self.clone())
    }
}

impl Embed for QueryParam {
    fn embed(&self) -> Interpolation {
        Interpolation::Param(self.clone())
    }
}

impl<T: Embed + ?Sized> Embed for &T {
    fn embed(&self) -> Interpolation {
        (**self).embed()
    }
}

impl<T: Embed> Embed for Option<T> {
    fn embed(&self) -> Interpolation {
        match self {
            Some(value) => value.embed(),
            None => Interpolation::Param(QueryParam::Null),
        }
    }
}

impl Embed for str {
    fn embed(&self) -> Interpolation {
        Interpolation::Param(QueryParam::String(self.to_string()))
    }
}

impl Embed for [u8] {
    fn embed(&self) -> Interpolation {
        Interpolation::Param(QueryParam::Bytes(self.to_vec()))
    }
}

impl Embed for Cow<'_, str> {
    fn embed(&self) -> Interpolation {
        self.as_ref().embed()
    }
}

macro_rules! impl_embed_scalar {
    ($($ty:ty),+ $(,)?) => {
        $(
            impl Embed for $ty {
                fn embed(&self) -> Interpolation {
                    Interpolation::Param(QueryParam::from(self.clone()))
                }
            }
        )+
    };
}

impl_embed_scalar!(
    bool,
    i8,
    i16,
    i32,
    i64,
    u8,
    u16,
    u32,
    f32,
    f64,
    String,
    Vec<u8>,
    Uuid,
    NaiveDate,
    NaiveTime,
    NaiveDateTime,
    DateTime<Utc>,
    JsonValue,
);

/// Input accepted by every query operation.
///
/// Plain text converts into `Query::Text` so that call sites compile, but it
/// is rejected before anything reaches the database: only a [`Template`]
/// keeps values out of the SQL text.
#[derive(Debug, Clone)]
pub enum Query<'a> {
    Template(Cow<'a, Template>),
    Text(Cow<'a, str>),
}

impl From<Template> for Query<'_> {
    fn from(template: Template) -> Self {
        Query::Template(Cow::Owned(template))
    }
}

impl<'a> From<&'a Template> for Query<'a> {
    fn from(template: &'a Template) -> Self {
        Query::Template(Cow::Borrowed(template))
    }
}

impl<'a> From<&'a str> for Query<'a> {
    fn from(text: &'a str) -> Self {
        Query::Text(Cow::Borrowed(text))
    }
}

impl From<String> for Query<'_> {
    fn from(text: String) -> Self {
        Query::Text(Cow::Owned(text))
    }
}

/// Build a [`Template`] from string literals and `{expr}` embeds.
///
/// ```
/// use pgtemplate::sql;
///
/// let var = 1;
/// let query = sql!("SELECT * FROM t WHERE id = " {var} " AND x = " {var});
/// assert_eq!(query.strings(), &["SELECT * FROM t WHERE id = ", " AND x = ", ""]);
/// ```
#[macro_export]
macro_rules! sql {
    () => {
        $crate::query::Template::empty()
    };
    ($($part:tt)+) => {{
        let mut builder = $crate::query::TemplateBuilder::new();
        $crate::__sql_parts!(builder; $($part)+);
        builder.build()
    }};
}

#[doc(hidden)]
#[macro_export]
macro_rules! __sql_parts {
    ($builder:ident;) => {};
    ($builder:ident; $text:literal $($rest:tt)*) => {
        $builder.push_str($text);
        $crate::__sql_parts!($builder; $($rest)*);
    };
    ($builder:ident; { $value:expr } $($rest:tt)*) => {
        $builder.push_embed(&$value);
        $crate::__sql_parts!($builder; $($rest)*);
    };
}
