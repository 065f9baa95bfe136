//! `mysql_async`-backed upstream connector.
//!
//! Statements run over the text protocol, so row values arrive as raw bytes
//! and are relayed to the client unchanged. The column metadata of the first
//! result set is kept even when it has zero rows.

use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, DriverError, OptsBuilder, Row, Value};

use super::{
    ColumnMeta, OkStatus, QueryOutcome, ResultSet, UpstreamConnection, UpstreamConnector,
    UpstreamError,
};
use crate::config::UpstreamOptions;

// ── MysqlConnector ───────────────────────────────────────────────────

/// Opens TCP connections to a MySQL server with `mysql_async`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MysqlConnector;

#[async_trait]
impl UpstreamConnector for MysqlConnector {
    async fn connect(
        &self,
        options: &UpstreamOptions,
    ) -> Result<Box<dyn UpstreamConnection>, UpstreamError> {
        let opts = OptsBuilder::default()
            .ip_or_hostname(options.host.clone())
            .tcp_port(options.port)
            .user(Some(options.user.clone()))
            .pass(Some(options.password.clone()))
            .db_name(options.database.clone())
            .prefer_socket(false);

        let conn = Conn::new(opts).await.map_err(map_error)?;
        tracing::debug!(
            host = %options.host,
            port = options.port,
            connection_id = conn.id(),
            "upstream connection established"
        );
        Ok(Box::new(MysqlUpstream { conn: Some(conn) }))
    }
}

// ── MysqlUpstream ────────────────────────────────────────────────────

pub struct MysqlUpstream {
    /// `None` once closed.
    conn: Option<Conn>,
}

impl std::fmt::Debug for MysqlUpstream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MysqlUpstream")
            .field("connection_id", &self.conn.as_ref().map(|c| c.id()))
            .finish()
    }
}

#[async_trait]
impl UpstreamConnection for MysqlUpstream {
    async fn query(&mut self, sql: &str) -> Result<QueryOutcome, UpstreamError> {
        let conn = self
            .conn
            .as_mut()
            .ok_or_else(|| UpstreamError::ConnectionLost("connection already closed".to_string()))?;

        let mut result = conn.query_iter(sql).await.map_err(map_error)?;
        let columns: Vec<ColumnMeta> = result
            .columns_ref()
            .iter()
            .map(|col| ColumnMeta {
                table: col.table_str().into_owned(),
                name: col.name_str().into_owned(),
                column_type: col.column_type() as u8,
                flags: col.flags().bits(),
            })
            .collect();

        let outcome = if columns.is_empty() {
            QueryOutcome::Ok(OkStatus {
                affected_rows: result.affected_rows(),
                last_insert_id: result.last_insert_id().unwrap_or(0),
                warnings: result.warnings(),
                info: result.info().into_owned(),
            })
        } else {
            let rows: Vec<Row> = result.collect().await.map_err(map_error)?;
            QueryOutcome::Rows(ResultSet {
                columns,
                rows: rows.iter().map(row_values).collect(),
            })
        };

        // Only the first result set is relayed.
        result.drop_result().await.map_err(map_error)?;
        Ok(outcome)
    }

    async fn ping(&mut self) -> bool {
        match self.conn.as_mut() {
            Some(conn) => conn.ping().await.is_ok(),
            None => false,
        }
    }

    async fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            let id = conn.id();
            if let Err(e) = conn.disconnect().await {
                tracing::debug!(connection_id = id, error = %e, "upstream disconnect failed");
            }
        }
    }
}

fn row_values(row: &Row) -> Vec<Option<Vec<u8>>> {
    (0..row.len())
        .map(|i| row.as_ref(i).and_then(text_value))
        .collect()
}

/// Text-protocol rendering of a driver value. Text results only ever carry
/// `Bytes` and `NULL`; the remaining arms cover values the driver decoded.
fn text_value(value: &Value) -> Option<Vec<u8>> {
    let text = match value {
        Value::NULL => return None,
        Value::Bytes(bytes) => return Some(bytes.clone()),
        Value::Int(v) => v.to_string(),
        Value::UInt(v) => v.to_string(),
        Value::Float(v) => v.to_string(),
        Value::Double(v) => v.to_string(),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let mut text = format!(
                "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
            );
            if *micros > 0 {
                text.push_str(&format!(".{micros:06}"));
            }
            text
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let sign = if *negative { "-" } else { "" };
            let hours = u64::from(*days) * 24 + u64::from(*hours);
            let mut text = format!("{sign}{hours:02}:{minutes:02}:{seconds:02}");
            if *micros > 0 {
                text.push_str(&format!(".{micros:06}"));
            }
            text
        }
    };
    Some(text.into_bytes())
}

fn map_error(err: mysql_async::Error) -> UpstreamError {
    match err {
        mysql_async::Error::Server(e) => UpstreamError::Server {
            message: e.message,
            code: None,
            sql_state: Some(e.state),
            errno: Some(e.code),
        },
        mysql_async::Error::Io(e) => UpstreamError::ConnectionLost(e.to_string()),
        mysql_async::Error::Driver(DriverError::ConnectionClosed) => {
            UpstreamError::ConnectionLost("connection closed by server".to_string())
        }
        other => UpstreamError::Driver(other.to_string()),
    }
}
