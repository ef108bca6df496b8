//! SQL Server via `tiberius` over a tokio TCP stream.
//!
//! TDS has no client-visible prepared statement handle outside of a single
//! execution, so preparing validates the batch with
//! `sp_describe_first_result_set` and keeps only the SQL text. Statements
//! run through the client slot they share with their connection, binding
//! parameters as `@P1`, `@P2`, ...

use std::borrow::Cow;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime};
use sqlproxy_pool::driver::DriverFuture;
use sqlproxy_pool::{DriverConnection, DriverError, DriverStatement, ResultSet, SqlValue};
use tiberius::{Client, ColumnData, Config, FromSql, QueryStream, ToSql};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};

type TdsClient = Client<Compat<TcpStream>>;
type ClientSlot = Arc<Mutex<Option<TdsClient>>>;

const DESCRIBE_BATCH: &str = "EXEC sp_describe_first_result_set @tsql = @P1";

fn query_error(error: tiberius::error::Error) -> DriverError {
    DriverError::Query(error.to_string())
}

fn closed() -> DriverError {
    DriverError::Query("connection closed".to_string())
}

pub(crate) async fn open(dsn: &str) -> Result<Box<dyn DriverConnection>, DriverError> {
    let config = Config::from_ado_string(dsn).map_err(|e| DriverError::Connect(e.to_string()))?;
    let tcp = TcpStream::connect(config.get_addr())
        .await
        .map_err(|e| DriverError::Connect(e.to_string()))?;
    tcp.set_nodelay(true)
        .map_err(|e| DriverError::Connect(e.to_string()))?;
    let client = Client::connect(config, tcp.compat_write())
        .await
        .map_err(|e| DriverError::Connect(e.to_string()))?;
    Ok(Box::new(SqlServerConnection {
        client: Arc::new(Mutex::new(Some(client))),
    }))
}

pub(crate) struct SqlServerConnection {
    client: ClientSlot,
}

impl fmt::Debug for SqlServerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlServerConnection").finish_non_exhaustive()
    }
}

impl DriverConnection for SqlServerConnection {
    fn ping(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let mut slot = self.client.lock().await;
            let client = slot
                .as_mut()
                .ok_or_else(|| DriverError::Ping("connection closed".to_string()))?;
            client
                .simple_query("SELECT 1")
                .await
                .map_err(|e| DriverError::Ping(e.to_string()))?
                .into_results()
                .await
                .map(|_| ())
                .map_err(|e| DriverError::Ping(e.to_string()))
        })
    }

    fn prepare<'a>(&'a mut self, sql: &'a str) -> DriverFuture<'a, Box<dyn DriverStatement>> {
        Box::pin(async move {
            let mut slot = self.client.lock().await;
            let client = slot
                .as_mut()
                .ok_or_else(|| DriverError::Prepare("connection closed".to_string()))?;
            let params: [&dyn ToSql; 1] = [&sql];
            client
                .query(DESCRIBE_BATCH, &params)
                .await
                .map_err(|e| DriverError::Prepare(e.to_string()))?
                .into_results()
                .await
                .map_err(|e| DriverError::Prepare(e.to_string()))?;
            Ok(Box::new(SqlServerStatement {
                sql: sql.to_string(),
                client: Arc::clone(&self.client),
                closed: false,
            }) as Box<dyn DriverStatement>)
        })
    }

    fn query<'a>(&'a mut self, sql: &'a str, max_rows: usize) -> DriverFuture<'a, ResultSet> {
        Box::pin(async move {
            let mut slot = self.client.lock().await;
            let client = slot.as_mut().ok_or_else(closed)?;
            let stream = client.simple_query(sql).await.map_err(query_error)?;
            collect_rows(stream, max_rows).await
        })
    }

    fn execute<'a>(&'a mut self, sql: &'a str) -> DriverFuture<'a, u64> {
        Box::pin(async move {
            let mut slot = self.client.lock().await;
            let client = slot.as_mut().ok_or_else(closed)?;
            let result = client.execute(sql, &[]).await.map_err(query_error)?;
            Ok(result.total())
        })
    }

    fn close(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let client = self.client.lock().await.take();
            match client {
                Some(client) => client
                    .close()
                    .await
                    .map_err(|e| DriverError::Close(e.to_string())),
                None => Ok(()),
            }
        })
    }
}

pub(crate) struct SqlServerStatement {
    sql: String,
    client: ClientSlot,
    closed: bool,
}

impl SqlServerStatement {
    fn check_open(&self) -> Result<(), DriverError> {
        if self.closed {
            return Err(DriverError::Query("statement closed".to_string()));
        }
        Ok(())
    }
}

impl fmt::Debug for SqlServerStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqlServerStatement")
            .field("sql", &self.sql)
            .field("open", &!self.closed)
            .finish()
    }
}

impl DriverStatement for SqlServerStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn query<'a>(
        &'a mut self,
        params: &'a [SqlValue],
        max_rows: usize,
    ) -> DriverFuture<'a, ResultSet> {
        Box::pin(async move {
            self.check_open()?;
            let bound: Vec<TdsParam> = params.iter().map(TdsParam::from_value).collect();
            let refs: Vec<&dyn ToSql> = bound.iter().map(|p| p as &dyn ToSql).collect();
            let mut slot = self.client.lock().await;
            let client = slot.as_mut().ok_or_else(closed)?;
            let stream = client
                .query(self.sql.as_str(), &refs[..])
                .await
                .map_err(query_error)?;
            collect_rows(stream, max_rows).await
        })
    }

    fn execute<'a>(&'a mut self, params: &'a [SqlValue]) -> DriverFuture<'a, u64> {
        Box::pin(async move {
            self.check_open()?;
            let bound: Vec<TdsParam> = params.iter().map(TdsParam::from_value).collect();
            let refs: Vec<&dyn ToSql> = bound.iter().map(|p| p as &dyn ToSql).collect();
            let mut slot = self.client.lock().await;
            let client = slot.as_mut().ok_or_else(closed)?;
            let result = client
                .execute(self.sql.as_str(), &refs[..])
                .await
                .map_err(query_error)?;
            Ok(result.total())
        })
    }

    fn close(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            self.closed = true;
            Ok(())
        })
    }
}

async fn collect_rows(
    mut stream: QueryStream<'_>,
    max_rows: usize,
) -> Result<ResultSet, DriverError> {
    let columns = stream
        .columns()
        .await
        .map_err(query_error)?
        .map(|columns| columns.iter().map(|c| c.name().to_string()).collect())
        .unwrap_or_default();
    let rows = stream.into_first_result().await.map_err(query_error)?;
    let rows = rows
        .into_iter()
        .take(max_rows.saturating_add(1))
        .map(|row| row.into_iter().map(decode_cell).collect::<tiberius::Result<Vec<_>>>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(query_error)?;
    Ok(ResultSet::new(columns, rows, max_rows))
}

#[derive(Debug, PartialEq)]
enum TdsParam {
    Null,
    Bool(bool),
    I64(i64),
    F64(f64),
    String(String),
}

impl TdsParam {
    fn from_value(value: &SqlValue) -> Self {
        match value {
            SqlValue::Null => TdsParam::Null,
            SqlValue::Bool(v) => TdsParam::Bool(*v),
            SqlValue::Number(n) => match (n.as_i64(), n.as_f64()) {
                (Some(i), _) => TdsParam::I64(i),
                // u64 above i64::MAX keeps its digits as text
                (None, _) if n.is_u64() => TdsParam::String(n.to_string()),
                (None, Some(f)) => TdsParam::F64(f),
                (None, None) => TdsParam::String(n.to_string()),
            },
            SqlValue::String(s) => TdsParam::String(s.clone()),
            SqlValue::Array(_) | SqlValue::Object(_) => TdsParam::String(value.to_string()),
        }
    }
}

impl ToSql for TdsParam {
    fn to_sql(&self) -> ColumnData<'_> {
        match self {
            TdsParam::Null => ColumnData::I32(None),
            TdsParam::Bool(v) => ColumnData::Bit(Some(*v)),
            TdsParam::I64(v) => ColumnData::I64(Some(*v)),
            TdsParam::F64(v) => ColumnData::F64(Some(*v)),
            TdsParam::String(v) => ColumnData::String(Some(Cow::Borrowed(v.as_str()))),
        }
    }
}

fn decode_cell(data: ColumnData<'static>) -> tiberius::Result<SqlValue> {
    let value = match data {
        ColumnData::Bit(v) => v.map_or(SqlValue::Null, SqlValue::from),
        ColumnData::U8(v) => v.map_or(SqlValue::Null, SqlValue::from),
        ColumnData::I16(v) => v.map_or(SqlValue::Null, SqlValue::from),
        ColumnData::I32(v) => v.map_or(SqlValue::Null, SqlValue::from),
        ColumnData::I64(v) => v.map_or(SqlValue::Null, SqlValue::from),
        ColumnData::F32(v) => v.map_or(SqlValue::Null, |f| SqlValue::from(f64::from(f))),
        ColumnData::F64(v) => v.map_or(SqlValue::Null, SqlValue::from),
        ColumnData::String(v) => v.map_or(SqlValue::Null, |s| SqlValue::String(s.into_owned())),
        ColumnData::Guid(v) => text(v),
        ColumnData::Numeric(v) => text(v),
        ColumnData::Binary(v) => v.map_or(SqlValue::Null, |b| {
            SqlValue::String(String::from_utf8_lossy(&b).into_owned())
        }),
        ColumnData::Xml(v) => v.map_or(SqlValue::Null, |x| {
            SqlValue::String(x.into_owned().into_string())
        }),
        temporal => decode_temporal(&temporal)?,
    };
    Ok(value)
}

fn decode_temporal(data: &ColumnData<'static>) -> tiberius::Result<SqlValue> {
    Ok(match data {
        ColumnData::Date(_) => text(NaiveDate::from_sql(data)?),
        ColumnData::Time(_) => text(NaiveTime::from_sql(data)?),
        ColumnData::DateTimeOffset(_) => DateTime::<FixedOffset>::from_sql(data)?
            .map_or(SqlValue::Null, |ts| SqlValue::String(ts.to_rfc3339())),
        _ => text(NaiveDateTime::from_sql(data)?),
    })
}

fn text<T: ToString>(value: Option<T>) -> SqlValue {
    value.map_or(SqlValue::Null, |v| SqlValue::String(v.to_string()))
}
