//! Upstream connector seam: how the proxy talks to the real MySQL server.
//!
//! The lifecycle manager only ever sees [`UpstreamConnector`] and boxed
//! [`UpstreamConnection`]s, so tests substitute a scripted in-process server
//! while production uses [`mysql::MysqlConnector`].

pub mod mysql;

use async_trait::async_trait;

use crate::config::UpstreamOptions;

/// Column metadata of a row set, in MySQL wire terms.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ColumnMeta {
    pub table: String,
    pub name: String,
    /// MySQL column type code (`MYSQL_TYPE_*`).
    pub column_type: u8,
    /// MySQL column flag bits.
    pub flags: u16,
}

impl ColumnMeta {
    /// A `VAR_STRING` column with no table, as produced by `SELECT <expr>`.
    pub fn text(name: impl Into<String>) -> Self {
        Self {
            table: String::new(),
            name: name.into(),
            column_type: 0xfd,
            flags: 0,
        }
    }
}

/// A tabular result: column metadata plus text-protocol values (`None` is NULL).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultSet {
    pub columns: Vec<ColumnMeta>,
    pub rows: Vec<Vec<Option<Vec<u8>>>>,
}

impl ResultSet {
    /// Value at `(row, column)` as UTF-8, `None` for NULL or out of range.
    pub fn text(&self, row: usize, column: usize) -> Option<&str> {
        self.rows
            .get(row)?
            .get(column)?
            .as_deref()
            .and_then(|v| std::str::from_utf8(v).ok())
    }
}

/// Driver-reported status of a statement that produced no rows.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct OkStatus {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub warnings: u16,
    pub info: String,
}

/// Outcome of one upstream query.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum QueryOutcome {
    Rows(ResultSet),
    Ok(OkStatus),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    /// The server rejected the statement. The connection is still usable.
    #[error("{message}")]
    Server {
        message: String,
        /// Symbolic error name, when the driver reports one.
        code: Option<String>,
        sql_state: Option<String>,
        errno: Option<u16>,
    },

    /// The connection to the server is gone.
    #[error("upstream connection lost: {0}")]
    ConnectionLost(String),

    /// Any other driver failure.
    #[error("upstream driver error: {0}")]
    Driver(String),
}

impl UpstreamError {
    pub fn server(errno: u16, sql_state: &str, message: impl Into<String>) -> Self {
        UpstreamError::Server {
            message: message.into(),
            code: None,
            sql_state: Some(sql_state.to_string()),
            errno: Some(errno),
        }
    }

    pub fn is_connection_lost(&self) -> bool {
        matches!(self, UpstreamError::ConnectionLost(_))
    }
}

/// One open connection to the real server.
#[async_trait]
pub trait UpstreamConnection: Send + std::fmt::Debug {
    /// Execute one statement over the text protocol.
    async fn query(&mut self, sql: &str) -> Result<QueryOutcome, UpstreamError>;
    /// Close-detection probe. Returns `true` if the connection is alive.
    async fn ping(&mut self) -> bool;
    /// Disconnect. Safe to call more than once.
    async fn close(&mut self);
}

/// Opens upstream connections. Injected so tests can replace the server.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(
        &self,
        options: &UpstreamOptions,
    ) -> Result<Box<dyn UpstreamConnection>, UpstreamError>;
}
