//! Parameter binding utilities for PostgreSQL queries.
//!
//! Binds each assembled [`QueryParam`] onto an sqlx query in placeholder order.

use crate::models::QueryParam;
use sqlx::Postgres;
use sqlx::encode::IsNull;
use sqlx::error::BoxDynError;
use sqlx::postgres::types::Oid;
use sqlx::postgres::{PgArgumentBuffer, PgArguments, PgTypeInfo};
use sqlx::types::Json;

/// A NULL sent without a declared type so the server infers it from context.
///
/// A typed NULL (say `text`) would be rejected when the placeholder sits in
/// an integer or date position.
#[derive(Debug, Clone, Copy)]
struct UntypedNull;

impl sqlx::Type<Postgres> for UntypedNull {
    fn type_info() -> PgTypeInfo {
        PgTypeInfo::with_oid(Oid(0))
    }
}

impl sqlx::Encode<'_, Postgres> for UntypedNull {
    fn encode_by_ref(&self, _buf: &mut PgArgumentBuffer) -> Result<IsNull, BoxDynError> {
        Ok(IsNull::Yes)
    }
}

/// Bind a parameter to a PostgreSQL query.
pub(crate) fn bind_param<'q>(
    query: sqlx::query::Query<'q, Postgres, PgArguments>,
    param: &'q QueryParam,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match param {
        QueryParam::Null => query.bind(UntypedNull),
        QueryParam::Bool(v) => query.bind(*v),
        QueryParam::Int(v) => query.bind(*v),
        QueryParam::Float(v) => query.bind(*v),
        QueryParam::String(v) => query.bind(v.as_str()),
        QueryParam::Bytes(v) => query.bind(v.as_slice()),
        QueryParam::Uuid(v) => query.bind(*v),
        QueryParam::Date(v) => query.bind(*v),
        QueryParam::Time(v) => query.bind(*v),
        QueryParam::Timestamp(v) => query.bind(*v),
        QueryParam::TimestampTz(v) => query.bind(*v),
        QueryParam::Json(v) => query.bind(Json(v)),
    }
}

/// Build an sqlx query for `sql` with every argument bound in order.
pub(crate) fn build_query<'q>(
    sql: &'q str,
    args: &'q [QueryParam],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    args.iter()
        .fold(sqlx::query(sql), |query, param| bind_param(query, param))
}
