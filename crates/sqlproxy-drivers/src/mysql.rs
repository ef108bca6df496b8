//! MySQL / MariaDB via `mysql_async`.
//!
//! Statements need their connection to be closed server-side, so the
//! connection and every statement prepared on it share one `Conn` slot.
//! Once the connection is closed the slot is empty and statement closes
//! become no-ops.

use std::fmt;
use std::sync::Arc;

use mysql_async::consts::ColumnType;
use mysql_async::prelude::{Protocol, Queryable};
use mysql_async::{Conn, Opts, Params, QueryResult, Row, Statement, Value};
use sqlproxy_pool::driver::DriverFuture;
use sqlproxy_pool::{DriverConnection, DriverError, DriverStatement, ResultSet, SqlValue};
use tokio::sync::Mutex;

type ConnSlot = Arc<Mutex<Option<Conn>>>;

fn query_error(error: mysql_async::Error) -> DriverError {
    DriverError::Query(error.to_string())
}

fn closed() -> DriverError {
    DriverError::Query("connection closed".to_string())
}

pub(crate) async fn open(dsn: &str) -> Result<Box<dyn DriverConnection>, DriverError> {
    let opts = Opts::from_url(dsn).map_err(|e| DriverError::Connect(e.to_string()))?;
    let conn = Conn::new(opts)
        .await
        .map_err(|e| DriverError::Connect(e.to_string()))?;
    Ok(Box::new(MySqlConnection {
        conn: Arc::new(Mutex::new(Some(conn))),
    }))
}

pub(crate) struct MySqlConnection {
    conn: ConnSlot,
}

impl fmt::Debug for MySqlConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlConnection").finish_non_exhaustive()
    }
}

impl DriverConnection for MySqlConnection {
    fn ping(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let mut slot = self.conn.lock().await;
            let conn = slot
                .as_mut()
                .ok_or_else(|| DriverError::Ping("connection closed".to_string()))?;
            conn.ping().await.map_err(|e| DriverError::Ping(e.to_string()))
        })
    }

    fn prepare<'a>(&'a mut self, sql: &'a str) -> DriverFuture<'a, Box<dyn DriverStatement>> {
        Box::pin(async move {
            let mut slot = self.conn.lock().await;
            let conn = slot
                .as_mut()
                .ok_or_else(|| DriverError::Prepare("connection closed".to_string()))?;
            let statement = conn
                .prep(sql)
                .await
                .map_err(|e| DriverError::Prepare(e.to_string()))?;
            Ok(Box::new(MySqlStatement {
                sql: sql.to_string(),
                statement: Some(statement),
                conn: Arc::clone(&self.conn),
            }) as Box<dyn DriverStatement>)
        })
    }

    fn query<'a>(&'a mut self, sql: &'a str, max_rows: usize) -> DriverFuture<'a, ResultSet> {
        Box::pin(async move {
            let mut slot = self.conn.lock().await;
            let conn = slot.as_mut().ok_or_else(closed)?;
            let result = conn.query_iter(sql).await.map_err(query_error)?;
            collect_rows(result, max_rows).await
        })
    }

    fn execute<'a>(&'a mut self, sql: &'a str) -> DriverFuture<'a, u64> {
        Box::pin(async move {
            let mut slot = self.conn.lock().await;
            let conn = slot.as_mut().ok_or_else(closed)?;
            conn.query_drop(sql).await.map_err(query_error)?;
            Ok(conn.affected_rows())
        })
    }

    fn close(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let conn = self.conn.lock().await.take();
            match conn {
                Some(conn) => conn
                    .disconnect()
                    .await
                    .map_err(|e| DriverError::Close(e.to_string())),
                None => Ok(()),
            }
        })
    }
}

pub(crate) struct MySqlStatement {
    sql: String,
    statement: Option<Statement>,
    conn: ConnSlot,
}

impl MySqlStatement {
    fn statement(&self) -> Result<Statement, DriverError> {
        self.statement
            .clone()
            .ok_or_else(|| DriverError::Query("statement closed".to_string()))
    }
}

impl fmt::Debug for MySqlStatement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MySqlStatement")
            .field("sql", &self.sql)
            .field("open", &self.statement.is_some())
            .finish()
    }
}

impl DriverStatement for MySqlStatement {
    fn sql(&self) -> &str {
        &self.sql
    }

    fn query<'a>(
        &'a mut self,
        params: &'a [SqlValue],
        max_rows: usize,
    ) -> DriverFuture<'a, ResultSet> {
        Box::pin(async move {
            let statement = self.statement()?;
            let mut slot = self.conn.lock().await;
            let conn = slot.as_mut().ok_or_else(closed)?;
            let result = conn
                .exec_iter(statement, bind(params))
                .await
                .map_err(query_error)?;
            collect_rows(result, max_rows).await
        })
    }

    fn execute<'a>(&'a mut self, params: &'a [SqlValue]) -> DriverFuture<'a, u64> {
        Box::pin(async move {
            let statement = self.statement()?;
            let mut slot = self.conn.lock().await;
            let conn = slot.as_mut().ok_or_else(closed)?;
            conn.exec_drop(statement, bind(params))
                .await
                .map_err(query_error)?;
            Ok(conn.affected_rows())
        })
    }

    fn close(&mut self) -> DriverFuture<'_, ()> {
        Box::pin(async move {
            let Some(statement) = self.statement.take() else {
                return Ok(());
            };
            let mut slot = self.conn.lock().await;
            match slot.as_mut() {
                Some(conn) => conn
                    .close(statement)
                    .await
                    .map_err(|e| DriverError::Close(e.to_string())),
                None => Ok(()),
            }
        })
    }
}

/// Drain a result, keeping one row past the limit to detect overflow.
async fn collect_rows<P: Protocol>(
    mut result: QueryResult<'_, 'static, P>,
    max_rows: usize,
) -> Result<ResultSet, DriverError> {
    let columns = result
        .columns_ref()
        .iter()
        .map(|column| column.name_str().into_owned())
        .collect();
    let mut rows = Vec::new();
    while let Some(row) = result.next().await.map_err(query_error)? {
        if rows.len() <= max_rows {
            rows.push(decode_row(&row));
        }
    }
    result.drop_result().await.map_err(query_error)?;
    Ok(ResultSet::new(columns, rows, max_rows))
}

fn bind(params: &[SqlValue]) -> Params {
    if params.is_empty() {
        return Params::Empty;
    }
    Params::Positional(params.iter().map(to_mysql).collect())
}

fn to_mysql(value: &SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::NULL,
        SqlValue::Bool(v) => Value::Int(i64::from(*v)),
        SqlValue::Number(n) => match (n.as_i64(), n.as_u64()) {
            (Some(i), _) => Value::Int(i),
            (None, Some(u)) => Value::UInt(u),
            _ => Value::Double(n.as_f64().unwrap_or_default()),
        },
        SqlValue::String(s) => Value::Bytes(s.clone().into_bytes()),
        SqlValue::Array(_) | SqlValue::Object(_) => Value::Bytes(value.to_string().into_bytes()),
    }
}

fn decode_row(row: &Row) -> Vec<SqlValue> {
    row.columns_ref()
        .iter()
        .enumerate()
        .map(|(idx, column)| {
            let value = row.as_ref(idx).cloned().unwrap_or(Value::NULL);
            from_mysql(value, column.column_type())
        })
        .collect()
}

/// Text-protocol cells arrive as bytes; the column type says how to read them.
fn from_mysql(value: Value, column_type: ColumnType) -> SqlValue {
    match value {
        Value::NULL => SqlValue::Null,
        Value::Bytes(bytes) => match String::from_utf8(bytes) {
            Ok(text) => from_text(text, column_type),
            Err(e) => SqlValue::String(format!("\\x{}", hex::encode(e.as_bytes()))),
        },
        Value::Int(i) => SqlValue::from(i),
        Value::UInt(u) => SqlValue::from(u),
        Value::Float(f) => SqlValue::from(f64::from(f)),
        Value::Double(d) => SqlValue::from(d),
        Value::Date(year, month, day, 0, 0, 0, 0) if column_type == ColumnType::MYSQL_TYPE_DATE => {
            SqlValue::String(format!("{year:04}-{month:02}-{day:02}"))
        }
        Value::Date(year, month, day, hour, min, sec, 0) => SqlValue::String(format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{min:02}:{sec:02}"
        )),
        Value::Date(year, month, day, hour, min, sec, micros) => SqlValue::String(format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{min:02}:{sec:02}.{micros:06}"
        )),
        Value::Time(negative, days, hours, mins, secs, micros) => {
            let sign = if negative { "-" } else { "" };
            let hours = days * 24 + u32::from(hours);
            if micros == 0 {
                SqlValue::String(format!("{sign}{hours:02}:{mins:02}:{secs:02}"))
            } else {
                SqlValue::String(format!("{sign}{hours:02}:{mins:02}:{secs:02}.{micros:06}"))
            }
        }
    }
}

fn from_text(text: String, column_type: ColumnType) -> SqlValue {
    let parsed = match column_type {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_YEAR => text
            .parse::<i64>()
            .map(SqlValue::from)
            .or_else(|_| text.parse::<u64>().map(SqlValue::from))
            .ok(),
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => {
            text.parse::<f64>().ok().map(SqlValue::from)
        }
        ColumnType::MYSQL_TYPE_JSON => serde_json::from_str(&text).ok(),
        _ => None,
    };
    parsed.unwrap_or(SqlValue::String(text))
}
