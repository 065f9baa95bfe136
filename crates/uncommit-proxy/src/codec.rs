//! Client-side wire protocol via `opensrv-mysql`.
//!
//! One [`ClientShim`] is created per accepted connection once it has been
//! assigned to a group. `AsyncMysqlIntermediary::run_on` drives it: sends the
//! handshake, then dispatches each command to the shim until the client quits.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use opensrv_mysql::{
    AsyncMysqlShim, Column, ColumnFlags, ColumnType, ErrorKind, InitWriter, OkResponse,
    ParamParser, QueryResultWriter, StatementMetaWriter,
};
use tokio::io::AsyncWrite;

use crate::context::ClientContext;
use crate::hooks::ProxyHooks;
use crate::lifecycle::ProxyInner;
use crate::pipeline;
use crate::response::{CONNECTION_ERROR, ErrorResponse, Response};
use crate::upstream::{ColumnMeta, OkStatus};

const PREPARED_UNSUPPORTED: &[u8] = b"Prepared statements are not supported";

pub(crate) struct ClientShim<H: ProxyHooks> {
    proxy: Arc<ProxyInner<H>>,
    ctx: ClientContext<H::State>,
}

impl<H: ProxyHooks> ClientShim<H> {
    pub(crate) fn new(proxy: Arc<ProxyInner<H>>, ctx: ClientContext<H::State>) -> Self {
        Self { proxy, ctx }
    }
}

#[async_trait]
impl<H, W> AsyncMysqlShim<W> for ClientShim<H>
where
    H: ProxyHooks,
    W: AsyncWrite + Send + Unpin,
{
    type Error = io::Error;

    fn version(&self) -> String {
        self.proxy.server_version().to_string()
    }

    fn connect_id(&self) -> u32 {
        self.ctx.id.wire_id()
    }

    async fn on_prepare<'a>(
        &'a mut self,
        _query: &'a str,
        info: StatementMetaWriter<'a, W>,
    ) -> Result<(), Self::Error> {
        info.error(ErrorKind::ER_UNKNOWN_COM_ERROR, PREPARED_UNSUPPORTED)
            .await
    }

    async fn on_execute<'a>(
        &'a mut self,
        _id: u32,
        _params: ParamParser<'a>,
        results: QueryResultWriter<'a, W>,
    ) -> Result<(), Self::Error> {
        results
            .error(ErrorKind::ER_UNKNOWN_COM_ERROR, PREPARED_UNSUPPORTED)
            .await
    }

    async fn on_close<'a>(&'a mut self, _stmt: u32)
    where
        W: 'async_trait,
    {
    }

    async fn on_query<'a>(
        &'a mut self,
        query: &'a str,
        results: QueryResultWriter<'a, W>,
    ) -> Result<(), Self::Error> {
        let group = self.proxy.lookup_group(self.ctx.group.as_ref(), self.ctx.id).await;
        let outcome =
            pipeline::intercept(self.proxy.hooks(), &mut self.ctx, group.as_ref(), query).await;
        if outcome.upstream_lost {
            if let Some(group) = &group {
                self.proxy.report_upstream_lost(group);
            }
        }
        write_response(outcome.response, results).await
    }

    /// COM_INIT_DB goes straight to the upstream, bypassing `on_query`.
    async fn on_init<'a>(
        &'a mut self,
        database: &'a str,
        w: InitWriter<'a, W>,
    ) -> Result<(), Self::Error> {
        let Some(group) = self.proxy.lookup_group(self.ctx.group.as_ref(), self.ctx.id).await else {
            return w
                .error(ErrorKind::ER_UNKNOWN_ERROR, CONNECTION_ERROR.as_bytes())
                .await;
        };

        let sql = format!("USE `{}`", database.replace('`', "``"));
        match pipeline::forward(&group.upstream, &[sql]).await {
            Ok(_) => {
                tracing::debug!(conn = %self.ctx.id, database, "default database changed");
                w.ok().await
            }
            Err(e) => {
                if e.is_connection_lost() {
                    self.proxy.report_upstream_lost(&group);
                }
                let err = ErrorResponse::from(&e);
                w.error(error_kind(err.errno), err.message.as_bytes()).await
            }
        }
    }
}

async fn write_response<W>(response: Response, results: QueryResultWriter<'_, W>) -> io::Result<()>
where
    W: AsyncWrite + Send + Unpin,
{
    match response {
        Response::Ok(status) => results.completed(ok_response(&status)).await,
        Response::Rows(set) if set.columns.is_empty() => {
            results.completed(OkResponse::default()).await
        }
        Response::Rows(set) => {
            let columns: Vec<Column> = set.columns.iter().map(column).collect();
            let mut rows = results.start(&columns).await?;
            for row in &set.rows {
                rows.write_row(row.iter().map(|value| value.as_deref())).await?;
            }
            rows.finish().await
        }
        Response::Error(err) => {
            results
                .error(error_kind(err.errno), err.message.as_bytes())
                .await
        }
    }
}

fn ok_response(status: &OkStatus) -> OkResponse {
    let mut ok = OkResponse::default();
    ok.affected_rows = status.affected_rows;
    ok.last_insert_id = status.last_insert_id;
    ok.warnings = status.warnings;
    ok.info = status.info.clone();
    ok
}

fn column(meta: &ColumnMeta) -> Column {
    Column {
        table: meta.table.clone(),
        column: meta.name.clone(),
        coltype: column_type(meta.column_type),
        colflags: ColumnFlags::from_bits_truncate(meta.flags),
    }
}

/// Map a MySQL column type code onto the codec's column type.
fn column_type(code: u8) -> ColumnType {
    match code {
        0x00 => ColumnType::MYSQL_TYPE_DECIMAL,
        0x01 => ColumnType::MYSQL_TYPE_TINY,
        0x02 => ColumnType::MYSQL_TYPE_SHORT,
        0x03 => ColumnType::MYSQL_TYPE_LONG,
        0x04 => ColumnType::MYSQL_TYPE_FLOAT,
        0x05 => ColumnType::MYSQL_TYPE_DOUBLE,
        0x06 => ColumnType::MYSQL_TYPE_NULL,
        0x07 => ColumnType::MYSQL_TYPE_TIMESTAMP,
        0x08 => ColumnType::MYSQL_TYPE_LONGLONG,
        0x09 => ColumnType::MYSQL_TYPE_INT24,
        0x0a => ColumnType::MYSQL_TYPE_DATE,
        0x0b => ColumnType::MYSQL_TYPE_TIME,
        0x0c => ColumnType::MYSQL_TYPE_DATETIME,
        0x0d => ColumnType::MYSQL_TYPE_YEAR,
        0x0f => ColumnType::MYSQL_TYPE_VARCHAR,
        0x10 => ColumnType::MYSQL_TYPE_BIT,
        0xf5 => ColumnType::MYSQL_TYPE_JSON,
        0xf6 => ColumnType::MYSQL_TYPE_NEWDECIMAL,
        0xf7 => ColumnType::MYSQL_TYPE_ENUM,
        0xf8 => ColumnType::MYSQL_TYPE_SET,
        0xf9 => ColumnType::MYSQL_TYPE_TINY_BLOB,
        0xfa => ColumnType::MYSQL_TYPE_MEDIUM_BLOB,
        0xfb => ColumnType::MYSQL_TYPE_LONG_BLOB,
        0xfc => ColumnType::MYSQL_TYPE_BLOB,
        0xfd => ColumnType::MYSQL_TYPE_VAR_STRING,
        0xfe => ColumnType::MYSQL_TYPE_STRING,
        0xff => ColumnType::MYSQL_TYPE_GEOMETRY,
        _ => ColumnType::MYSQL_TYPE_VAR_STRING,
    }
}

/// Map a server error number onto the codec's error kind, which also fixes
/// the SQL state sent on the wire. The codec's table spans 1000..=1885 and
/// panics outside it.
fn error_kind(errno: Option<u16>) -> ErrorKind {
    match errno {
        Some(errno @ 1000..=1885) => ErrorKind::from(errno),
        _ => ErrorKind::ER_UNKNOWN_ERROR,
    }
}
