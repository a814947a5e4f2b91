//! Template to SQL assembly.
//!
//! Flattens a (possibly nested) [`Template`] into one SQL string with
//! `$1..$N` placeholders and the matching argument list. Values are never
//! written into the SQL text.

use crate::error::{DbError, DbResult};
use crate::models::QueryParam;
use crate::query::template::{Interpolation, Query, Template};
use tracing::trace;

/// SQL text plus the arguments bound to its placeholders, in order.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledQuery {
    pub sql: String,
    /// `args[i]` is bound to placeholder `$(i + 1)`.
    pub args: Vec<QueryParam>,
}

/// Turns templates into placeholder SQL.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryAssembler;

impl QueryAssembler {
    pub fn new() -> Self {
        Self
    }

    /// Assemble a query into SQL text and its ordered arguments.
    ///
    /// Plain text is rejected with [`DbError::UnsupportedInput`].
    pub fn assemble<'q>(&self, query: impl Into<Query<'q>>) -> DbResult<AssembledQuery> {
        let template = match query.into() {
            Query::Template(template) => template,
            Query::Text(_) => {
                return Err(DbError::unsupported_input(
                    "plain SQL strings are not accepted; build the query with sql!(...) so values become placeholders",
                ));
            }
        };

        let mut args = Vec::new();
        let sql = Self::assemble_into(&template, &mut args);

        trace!(placeholders = args.len(), "Assembled query");

        Ok(AssembledQuery { sql, args })
    }

    /// Depth-first, left-to-right walk over the template tree.
    ///
    /// `args` is shared across the whole tree, so its length is the running
    /// placeholder counter: a nested template continues the numbering of its
    /// parent and every scalar gets the next number exactly once.
    fn assemble_into(template: &Template, args: &mut Vec<QueryParam>) -> String {
        let strings = template.strings();
        let mut sql = String::with_capacity(strings.iter().map(String::len).sum());

        for (text, value) in strings.iter().zip(template.values()) {
            sql.push_str(text);
            match value {
                Interpolation::Nested(sub) => {
                    let sub_sql = Self::assemble_into(sub, args);
                    // keep the nested text from gluing onto the preceding token
                    if !sub_sql.starts_with(char::is_whitespace) {
                        sql.push(' ');
                    }
                    sql.push_str(&sub_sql);
                }
                Interpolation::Param(param) => {
                    args.push(param.clone());
                    sql.push('$');
                    sql.push_str(&args.len().to_string());
                }
            }
        }

        if let Some(last) = strings.last() {
            sql.push_str(last);
        }
        sql
    }
}
