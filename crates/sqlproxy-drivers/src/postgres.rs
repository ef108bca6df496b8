//! PostgreSQL via `tokio-postgres`.
//!
//! The DSN is a libpq key/value string; `sslmode=require` switches to a
//! native-tls connector. The connection future runs on its own task and ends
//! once the client and every statement prepared on it have been dropped.
//!
//! Parameters are coerced to the types the server inferred for the statement.
//! Cells are decoded by column type; types without a mapping come back as
//! text when their payload is UTF-8 and as `\x`-prefixed hex otherwise.

use std::error::Error;
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use sqlproxy_pool::driver::DriverFuture;
use sqlproxy_pool::{DriverConnection, DriverError, DriverStatement, ResultSet, SqlValue};
use tokio_postgres::config::SslMode;
use tokio_postgres::types::{FromSql, IsNull, ToSql, Type};
use tokio_postgres::{Client, Config, NoTls, Row, Statement};
use uuid::Uuid;

type BoxError = Box<dyn Error + Sync + Send>;

fn describe(error: &tokio_postgres::Error) -> String {
    match error.as_db_error() {
        Some(db) => format!("{} (code: {})", db.message(), db.code().code()),
        None => error.to_string(),
    }
}

fn query_error(error: tokio_postgres::Error) -> DriverError {
    DriverError::Query(describe(&error))
}

fn spawn_connection<F>(connection: F)
where
    F: Future<Output = Result<(), tokio_postgres::Error>> + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::warn!(error = %e, "postgres connection task ended with error");
        }
    });
}

pub(crate) async fn open(dsn: &str) -> Result<Box<dyn DriverConnection>, DriverError> {
    let config = Config::from_str(dsn).map_err(|e| DriverError::Connect(describe(&e)))?;

    let client = match config.get_ssl_mode() {
        SslMode::Disable => {
            let (client, connection) = config
                .connect(NoTls)
                .await
                .map_err(|e| DriverError::Connect(describe(&e)))?;
            spawn_connection(connection);
            client
        }
        _ => {
            let connector = TlsConnector::builder()
                .build()
                .map_err(|e| DriverError::Connect(format!("tls setup: {e}")))?;
            let (client, connection) = config
                .connect(MakeTlsConnector::new(connector))
                .await
                .map_err(|e| DriverError::Connect(describe(&e)))?;
            spawn_connection(connection);
            client
        }
    };

    Ok(Box::new(PostgresConnection {
        client: Some(Arc::new(client)),
    }))
}

// ── Connection ───────────────────────────────────────────────────────

pub(crate) struct PostgresConnection {
    client: Option<Arc<Client>>,
}

impl PostgresConnection {
    fn client(&self, on_closed: fn(String) -> DriverError) -> Result<&Arc<Client>, DriverError> {
        match &self.client {
            Some(client) if !client.is_closed() => Ok(client),
            _ => Err(on_closed("connection closed".to_string())),
        }
    }
}

impl fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("open", &self.client.is_some())
            .finish()
    }
}

impl DriverConnection for PostgresConnection {
    fn ping(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let client = self.client(DriverError::Ping)?;
            client
                .simple_query("SELECT 1")
                .await
                .map(|_| ())
                .map_err(|e| DriverError::Ping(describe(&e)))
        })
    }

    fn prepare<'a>(&'a mut self, sql: &'a str) -> DriverFuture<'a, Box<dyn DriverStatement>> {
        Box::pin(async move {
            let client = self.client(DriverError::Prepare)?;
            let statement = client
                .prepare(sql)
                .await
                .map_err(|e| DriverError::Prepare(describe(&e)))?;
            Ok(Box::new(PostgresStatement {
                sql: sql.to_string(),
                prepared: Some((Arc::clone(client), statement)),
            }) as Box<dyn DriverStatement>)
        })
    }

    fn query<'a>(&'a mut self, sql: &'a str, max_rows: usize) -> DriverFuture<'a, ResultSet> {
        Box::pin(async move {
            let client = self.client(DriverError::Query)?;
            let statement = client.prepare(sql).await.map_err(query_error)?;
            query_rows(client, &statement, &[], max_rows).await
        })
    }

    fn execute<'a>(&'a mut self, sql: &'a str) -> DriverFuture<'a, u64> {
        Box::pin(async move {
            let client = self.client(DriverError::Query)?;
            client.execute(sql, &[]).await.map_err(query_error)
        })
    }

    fn close(&mut self) -> DriverFuture<'_, ()> {
        // The session ends when the last client reference is dropped; the
        // registry closes statements before their connection.
        Box::pin(async move {
            self.client.take();
            Ok(())
        })
    }
}

// ── Statement ────────────────────────────────────────────────────────

pub(crate) struct PostgresStatement {
    sql: String,
    prepared: Option<(Arc<Client>, Statement)>,
}

impl PostgresStatement {
    fn prepared(&self) -> Result<(&Client, &Statement), DriverError> {
        match &self.prepared {
            Some((client, _)) if client.is_closed() => {
                Err(DriverError::Query("connection closed".to_string()))
            }
            Some((client, statement)) => Ok((client.as_ref(), statement)),
            None => Err(DriverError::Query("statement closed".to_string())),
        }
    }
}

impl fmt::Debug for PostgresStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresStatement")
            .field("sql", &self.sql)
            .field("open", &self.prepared.is_some())
            .finish()
    }
}

impl DriverStatement for PostgresStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn query<'a>(
        &'a mut self,
        params: &'a [SqlValue],
        max_rows: usize,
    ) -> DriverFuture<'a, ResultSet> {
        Box::pin(async move {
            let (client, statement) = self.prepared()?;
            query_rows(client, statement, params, max_rows).await
        })
    }

    fn execute<'a>(&'a mut self, params: &'a [SqlValue]) -> DriverFuture<'a, u64> {
        Box::pin(async move {
            let (client, statement) = self.prepared()?;
            let bound = bind(statement, params)?;
            let refs: Vec<&(dyn ToSql + Sync)> =
                bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
            client.execute(statement, &refs).await.map_err(query_error)
        })
    }

    fn close(&mut self) -> DriverFuture<'_, ()> {
        // Dropping a prepared statement queues a Close message on its client.
        Box::pin(async move {
            self.prepared.take();
            Ok(())
        })
    }
}

async fn query_rows(
    client: &Client,
    statement: &Statement,
    params: &[SqlValue],
    max_rows: usize,
) -> Result<ResultSet, DriverError> {
    let bound = bind(statement, params)?;
    let refs: Vec<&(dyn ToSql + Sync)> = bound.iter().map(|p| p as &(dyn ToSql + Sync)).collect();
    let rows = client.query(statement, &refs).await.map_err(query_error)?;

    let columns = statement
        .columns()
        .iter()
        .map(|column| column.name().to_string())
        .collect();
    let rows = rows
        .iter()
        .take(max_rows.saturating_add(1))
        .map(decode_row)
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_error)?;
    Ok(ResultSet::new(columns, rows, max_rows))
}

// ── Parameters ───────────────────────────────────────────────────────

fn bind(statement: &Statement, params: &[SqlValue]) -> Result<Vec<PgParam>, DriverError> {
    let types = statement.params();
    if types.len() != params.len() {
        return Err(DriverError::Query(format!(
            "statement expects {} parameters, got {}",
            types.len(),
            params.len()
        )));
    }
    types
        .iter()
        .zip(params)
        .enumerate()
        .map(|(index, (ty, value))| {
            PgParam::coerce(value, ty)
                .map_err(|e| DriverError::Query(format!("parameter ${}: {e}", index + 1)))
        })
        .collect()
}

/// A JSON parameter converted to the Rust type matching its server-side type,
/// so the wire encoding has the width the server expects.
#[derive(Debug)]
enum PgParam {
    Null,
    Bool(bool),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    Float32(f32),
    Float64(f64),
    Text(String),
    Json(SqlValue),
    Uuid(Uuid),
    Date(NaiveDate),
    Time(NaiveTime),
    Timestamp(NaiveDateTime),
    TimestampTz(DateTime<Utc>),
}

impl PgParam {
    fn coerce(value: &SqlValue, ty: &Type) -> Result<Self, String> {
        if matches!(*ty, Type::JSON | Type::JSONB) {
            return Ok(PgParam::Json(value.clone()));
        }
        match value {
            SqlValue::Null => Ok(PgParam::Null),
            SqlValue::Bool(v) => Ok(PgParam::Bool(*v)),
            SqlValue::Number(n) => Self::coerce_number(n, ty),
            SqlValue::String(s) => Self::coerce_string(s, ty),
            SqlValue::Array(_) | SqlValue::Object(_) => Ok(PgParam::Text(value.to_string())),
        }
    }

    fn coerce_number(n: &serde_json::Number, ty: &Type) -> Result<Self, String> {
        let int = || n.as_i64().ok_or_else(|| format!("{n} is not an integer"));
        let float = || n.as_f64().ok_or_else(|| format!("{n} is not a number"));
        let out_of_range = |_| format!("{n} is out of range for {ty}");
        match *ty {
            Type::INT2 => Ok(PgParam::Int16(int()?.try_into().map_err(out_of_range)?)),
            Type::INT4 => Ok(PgParam::Int32(int()?.try_into().map_err(out_of_range)?)),
            Type::INT8 => Ok(PgParam::Int64(int()?)),
            Type::FLOAT4 => Ok(PgParam::Float32(float()? as f32)),
            Type::FLOAT8 => Ok(PgParam::Float64(float()?)),
            Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
                Ok(PgParam::Text(n.to_string()))
            }
            _ => match n.as_i64() {
                Some(i) => Ok(PgParam::Int64(i)),
                None => Ok(PgParam::Float64(float()?)),
            },
        }
    }

    fn coerce_string(s: &str, ty: &Type) -> Result<Self, String> {
        let invalid = |e: &dyn fmt::Display| format!("{s:?} is not a valid {ty}: {e}");
        match *ty {
            Type::UUID => Uuid::parse_str(s)
                .map(PgParam::Uuid)
                .map_err(|e| invalid(&e)),
            Type::DATE => NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map(PgParam::Date)
                .map_err(|e| invalid(&e)),
            Type::TIME => NaiveTime::parse_from_str(s, "%H:%M:%S%.f")
                .map(PgParam::Time)
                .map_err(|e| invalid(&e)),
            Type::TIMESTAMP => NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
                .map(PgParam::Timestamp)
                .map_err(|e| invalid(&e)),
            Type::TIMESTAMPTZ => DateTime::parse_from_rfc3339(s)
                .map(|ts| PgParam::TimestampTz(ts.with_timezone(&Utc)))
                .map_err(|e| invalid(&e)),
            _ => Ok(PgParam::Text(s.to_string())),
        }
    }
}

impl ToSql for PgParam {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self {
            PgParam::Null => Ok(IsNull::Yes),
            PgParam::Bool(v) => v.to_sql(ty, out),
            PgParam::Int16(v) => v.to_sql(ty, out),
            PgParam::Int32(v) => v.to_sql(ty, out),
            PgParam::Int64(v) => v.to_sql(ty, out),
            PgParam::Float32(v) => v.to_sql(ty, out),
            PgParam::Float64(v) => v.to_sql(ty, out),
            PgParam::Text(v) => v.to_sql(ty, out),
            PgParam::Json(v) => v.to_sql(ty, out),
            PgParam::Uuid(v) => v.to_sql(ty, out),
            PgParam::Date(v) => v.to_sql(ty, out),
            PgParam::Time(v) => v.to_sql(ty, out),
            PgParam::Timestamp(v) => v.to_sql(ty, out),
            PgParam::TimestampTz(v) => v.to_sql(ty, out),
        }
    }

    fn accepts(_: &Type) -> bool {
        true
    }

    postgres_types::to_sql_checked!();
}

// ── Cells ────────────────────────────────────────────────────────────

fn decode_row(row: &Row) -> Result<Vec<SqlValue>, tokio_postgres::Error> {
    (0..row.len()).map(|idx| decode_cell(row, idx)).collect()
}

fn decode_cell(row: &Row, idx: usize) -> Result<SqlValue, tokio_postgres::Error> {
    fn text<T: ToString>(value: Option<T>) -> Option<SqlValue> {
        value.map(|v| SqlValue::String(v.to_string()))
    }

    let value = match *row.columns()[idx].type_() {
        Type::BOOL => row.try_get::<_, Option<bool>>(idx)?.map(SqlValue::from),
        Type::INT2 => row.try_get::<_, Option<i16>>(idx)?.map(SqlValue::from),
        Type::INT4 => row.try_get::<_, Option<i32>>(idx)?.map(SqlValue::from),
        Type::INT8 => row.try_get::<_, Option<i64>>(idx)?.map(SqlValue::from),
        Type::OID => row.try_get::<_, Option<u32>>(idx)?.map(SqlValue::from),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(idx)?.map(|v| SqlValue::from(f64::from(v))),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(idx)?.map(SqlValue::from),
        Type::NUMERIC => row.try_get::<_, Option<PgNumeric>>(idx)?.map(|v| SqlValue::String(v.0)),
        Type::JSON | Type::JSONB => row.try_get::<_, Option<SqlValue>>(idx)?,
        Type::UUID => text(row.try_get::<_, Option<Uuid>>(idx)?),
        Type::DATE => text(row.try_get::<_, Option<NaiveDate>>(idx)?),
        Type::TIME => text(row.try_get::<_, Option<NaiveTime>>(idx)?),
        Type::TIMESTAMP => text(row.try_get::<_, Option<NaiveDateTime>>(idx)?),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)?
            .map(|v| SqlValue::String(v.to_rfc3339())),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(idx)?
            .map(|v| SqlValue::String(String::from_utf8_lossy(&v).into_owned())),
        _ => row.try_get::<_, Option<PgText>>(idx)?.map(|v| SqlValue::String(v.0)),
    };
    Ok(value.unwrap_or(SqlValue::Null))
}

/// Raw payload of a type without a dedicated mapping.
struct PgText(String);

impl<'a> FromSql<'a> for PgText {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        Ok(Self(match std::str::from_utf8(raw) {
            Ok(text) => text.to_string(),
            Err(_) => format!("\\x{}", hex::encode(raw)),
        }))
    }

    fn accepts(_: &Type) -> bool {
        true
    }
}

/// NUMERIC rendered as its exact decimal text.
struct PgNumeric(String);

impl<'a> FromSql<'a> for PgNumeric {
    fn from_sql(_: &Type, raw: &'a [u8]) -> Result<Self, BoxError> {
        numeric_to_string(raw).map(Self)
    }

    fn accepts(ty: &Type) -> bool {
        *ty == Type::NUMERIC
    }
}

const NUMERIC_NEG: u16 = 0x4000;
const NUMERIC_NAN: u16 = 0xC000;
const NUMERIC_PINF: u16 = 0xD000;
const NUMERIC_NINF: u16 = 0xF000;

/// Binary NUMERIC: ndigits, weight, sign, dscale, then base-10000 digits.
fn numeric_to_string(raw: &[u8]) -> Result<String, BoxError> {
    let word = |i: usize| -> Result<u16, BoxError> {
        raw.get(i * 2..i * 2 + 2)
            .map(|b| u16::from_be_bytes([b[0], b[1]]))
            .ok_or_else(|| "truncated NUMERIC value".into())
    };
    let ndigits = usize::from(word(0)?);
    let weight = i32::from(word(1)? as i16);
    let sign = word(2)?;
    let dscale = usize::from(word(3)?);
    match sign {
        NUMERIC_NAN => return Ok("NaN".to_string()),
        NUMERIC_PINF => return Ok("Infinity".to_string()),
        NUMERIC_NINF => return Ok("-Infinity".to_string()),
        _ => {}
    }
    let digits = (0..ndigits)
        .map(|i| word(4 + i))
        .collect::<Result<Vec<_>, _>>()?;
    let digit = |i: i32| -> u16 {
        usize::try_from(i)
            .ok()
            .and_then(|i| digits.get(i).copied())
            .unwrap_or(0)
    };

    let mut out = String::new();
    if sign == NUMERIC_NEG && !digits.iter().all(|d| *d == 0) {
        out.push('-');
    }
    if weight < 0 {
        out.push('0');
    } else {
        out.push_str(&digit(0).to_string());
        for i in 1..=weight {
            out.push_str(&format!("{:04}", digit(i)));
        }
    }
    if dscale > 0 {
        let mut fraction = String::new();
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

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use sqlproxy_pool::connector::build_dsn;
    use sqlproxy_pool::{ConnectionParams, Engine};

    fn numeric(weight: i16, sign: u16, dscale: u16, digits: &[u16]) -> Vec<u8> {
        let mut raw = Vec::new();
        for word in [digits.len() as u16, weight as u16, sign, dscale] {
            raw.extend_from_slice(&word.to_be_bytes());
        }
        for digit in digits {
            raw.extend_from_slice(&digit.to_be_bytes());
        }
        raw
    }

    #[test]
    fn pool_dsn_parses_with_awkward_password() {
        let params =
            ConnectionParams::new(Engine::Postgres, "db.local", "app", r"it's a \ pass", "main")
                .with_ssl(true);
        let config = Config::from_str(&build_dsn(Engine::Postgres, &params)).unwrap();
        assert_eq!(config.get_password(), Some(&br"it's a \ pass"[..]));
        assert_eq!(config.get_user(), Some("app"));
        assert_eq!(config.get_dbname(), Some("main"));
        assert_eq!(config.get_ports(), [5432u16].as_slice());
        assert!(matches!(config.get_ssl_mode(), SslMode::Require));
    }

    #[test]
    fn pool_dsn_disables_tls_without_ssl() {
        let params = ConnectionParams::new(Engine::Postgres, "db.local", "app", "pw", "main");
        let config = Config::from_str(&build_dsn(Engine::Postgres, &params)).unwrap();
        assert!(matches!(config.get_ssl_mode(), SslMode::Disable));
    }

    #[test]
    fn numbers_take_the_width_of_the_parameter_type() {
        assert!(matches!(PgParam::coerce(&json!(7), &Type::INT2), Ok(PgParam::Int16(7))));
        assert!(matches!(PgParam::coerce(&json!(7), &Type::INT4), Ok(PgParam::Int32(7))));
        assert!(matches!(PgParam::coerce(&json!(7), &Type::INT8), Ok(PgParam::Int64(7))));
        assert!(matches!(PgParam::coerce(&json!(1.5), &Type::FLOAT8), Ok(PgParam::Float64(_))));
        assert!(matches!(
            PgParam::coerce(&json!(7), &Type::TEXT),
            Ok(PgParam::Text(ref s)) if s == "7"
        ));
    }

    #[test]
    fn out_of_range_integer_is_rejected() {
        let err = PgParam::coerce(&json!(70_000), &Type::INT2).unwrap_err();
        assert!(err.contains("out of range"), "{err}");
        assert!(PgParam::coerce(&json!(1.5), &Type::INT4).is_err());
    }

    #[test]
    fn strings_parse_into_temporal_and_uuid_types() {
        assert!(matches!(
            PgParam::coerce(&json!("2024-02-29"), &Type::DATE),
            Ok(PgParam::Date(_))
        ));
        assert!(matches!(
            PgParam::coerce(&json!("2024-02-29 10:15:00"), &Type::TIMESTAMP),
            Ok(PgParam::Timestamp(_))
        ));
        assert!(matches!(
            PgParam::coerce(&json!("2024-02-29T10:15:00+02:00"), &Type::TIMESTAMPTZ),
            Ok(PgParam::TimestampTz(_))
        ));
        assert!(matches!(
            PgParam::coerce(&json!("67e55044-10b1-426f-9247-bb680e5fe0c8"), &Type::UUID),
            Ok(PgParam::Uuid(_))
        ));
        assert!(PgParam::coerce(&json!("yesterday"), &Type::DATE).is_err());
    }

    #[test]
    fn json_columns_take_any_value() {
        let value = json!({"tags": ["a", "b"]});
        assert!(matches!(
            PgParam::coerce(&value, &Type::JSONB),
            Ok(PgParam::Json(ref v)) if *v == value
        ));
        assert!(matches!(PgParam::coerce(&json!(null), &Type::INT4), Ok(PgParam::Null)));
    }

    #[test]
    fn numeric_renders_exact_decimal() {
        assert_eq!(numeric_to_string(&numeric(0, 0, 2, &[12, 5000])).unwrap(), "12.50");
        assert_eq!(numeric_to_string(&numeric(1, 0, 0, &[1, 0])).unwrap(), "10000");
        assert_eq!(numeric_to_string(&numeric(-1, 0, 4, &[1])).unwrap(), "0.0001");
        assert_eq!(numeric_to_string(&numeric(-2, 0, 8, &[1])).unwrap(), "0.00000001");
        assert_eq!(
            numeric_to_string(&numeric(0, NUMERIC_NEG, 3, &[3, 1415])).unwrap(),
            "-3.141"
        );
        assert_eq!(numeric_to_string(&numeric(0, NUMERIC_NAN, 0, &[])).unwrap(), "NaN");
        assert_eq!(numeric_to_string(&numeric(0, 0, 0, &[])).unwrap(), "0");
    }

    #[test]
    fn truncated_numeric_is_an_error() {
        assert!(numeric_to_string(&[0, 2, 0, 0]).is_err());
        let mut raw = numeric(0, 0, 0, &[1, 2]);
        raw.truncate(raw.len() - 1);
        assert!(numeric_to_string(&raw).is_err());
    }

    #[test]
    fn unmapped_payload_falls_back_to_text_or_hex() {
        assert_eq!(PgText::from_sql(&Type::INTERVAL, b"mood").unwrap().0, "mood");
        assert_eq!(PgText::from_sql(&Type::INTERVAL, &[0xff, 0x01]).unwrap().0, "\\xff01");
    }

    #[tokio::test]
    async fn closed_connection_refuses_use() {
        let mut conn = PostgresConnection { client: None };
        assert!(matches!(conn.ping().await, Err(DriverError::Ping(_))));
        assert!(matches!(conn.prepare("SELECT 1").await, Err(DriverError::Prepare(_))));
        assert!(matches!(conn.query("SELECT 1", 10).await, Err(DriverError::Query(_))));
        assert!(matches!(conn.execute("DELETE FROM t").await, Err(DriverError::Query(_))));
        assert!(conn.close().await.is_ok());
    }

    #[tokio::test]
    async fn closed_statement_refuses_use() {
        let mut stmt = PostgresStatement {
            sql: "SELECT $1".to_string(),
            prepared: None,
        };
        let err = stmt.query(&[json!(1)], 10).await.unwrap_err();
        assert_eq!(err, DriverError::Query("statement closed".to_string()));
        assert!(stmt.execute(&[]).await.is_err());
        assert!(stmt.close().await.is_ok());
    }
}
