//! The uncommittable proxy: emulator hooks over the `mysql_async` connector.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use uncommit_proxy::{
    ConnectionId, GroupKey, MySqlProxy, MysqlConnector, ProxyConfig, ProxyError, ProxyResult,
    UpstreamConnector,
};

use crate::emulator::UncommittableHooks;

/// A [`MySqlProxy`] running [`UncommittableHooks`].
///
/// Always in isolation mode: each client's savepoint lives on its own
/// upstream connection.
pub struct UncommittableProxy {
    proxy: MySqlProxy<UncommittableHooks>,
}

impl UncommittableProxy {
    pub fn new(config: ProxyConfig) -> ProxyResult<Self> {
        Self::with_connector(config, Arc::new(MysqlConnector))
    }

    pub fn with_connector(
        config: ProxyConfig,
        connector: Arc<dyn UpstreamConnector>,
    ) -> ProxyResult<Self> {
        if config.proxy.group_connections {
            tracing::warn!("connection grouping is not available in uncommittable mode, ignoring");
        }
        let hooks = UncommittableHooks::new().map_err(|e| ProxyError::Config(e.to_string()))?;
        let proxy = MySqlProxy::new(config.with_grouping(false), hooks, connector)?;
        Ok(Self { proxy })
    }

    pub async fn listen(&self) -> ProxyResult<SocketAddr> {
        self.proxy.listen().await
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.proxy.local_addr().await
    }

    pub async fn group_count(&self) -> usize {
        self.proxy.group_count().await
    }

    pub async fn membership(&self) -> BTreeMap<GroupKey, Vec<ConnectionId>> {
        self.proxy.membership().await
    }

    /// Stop accepting and drop every upstream connection, abandoning all
    /// open ambient transactions.
    pub async fn close(&self) {
        self.proxy.close().await
    }

    pub fn inner(&self) -> &MySqlProxy<UncommittableHooks> {
        &self.proxy
    }
}
