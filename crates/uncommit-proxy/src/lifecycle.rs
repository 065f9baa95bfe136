//! Connection lifecycle manager: the listening proxy.
//!
//! Owns the group registry and pairs every accepted client with a group's
//! upstream connection. Disconnects on either side are propagated to the
//! other.
//!
//! # Architecture
//!
//! ```text
//! accept
//!   → on_conn(ctx)                     error → drop socket
//!   → group_key(ctx, mode)             (gate for key held from here)
//!     → group exists   → add member
//!     → no group       → connect upstream → on_proxy_conn
//!                        error → close both sides, register nothing
//!                        ok    → register group + watchdog
//!   → handshake + serve queries until client quits or is force-closed
//!   → remove member; last member → deregister group, close upstream
//!
//! watchdog ping fails / pipeline sees lost upstream
//!   → on_upstream_disconnect: force-close members, deregister group
//! ```
//!
//! Accept handling and disconnect handling for the same group key are
//! serialized by a per-key gate.

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use opensrv_mysql::AsyncMysqlIntermediary;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, OwnedMutexGuard, watch};
use tokio::task::JoinHandle;

use crate::codec::ClientShim;
use crate::config::{GroupingMode, ProxyConfig, Timings};
use crate::context::{ClientContext, ConnectionId, GroupKey};
use crate::error::{ProxyError, ProxyResult};
use crate::hooks::ProxyHooks;
use crate::registry::{
    self, ClientHandle, ConnectionGroup, GroupHandle, GroupId, GroupRegistry, SharedUpstream,
};
use crate::upstream::UpstreamConnector;

// ── Per-key gates ────────────────────────────────────────────────────

/// One async mutex per group key. Unheld gates are pruned on acquire.
#[derive(Default)]
struct KeyGates {
    gates: Mutex<HashMap<GroupKey, Arc<Mutex<()>>>>,
}

impl KeyGates {
    async fn acquire(&self, key: &GroupKey) -> OwnedMutexGuard<()> {
        let gate = {
            let mut gates = self.gates.lock().await;
            gates.retain(|_, gate| Arc::strong_count(gate) > 1);
            Arc::clone(gates.entry(key.clone()).or_default())
        };
        gate.lock_owned().await
    }
}

// ── ProxyInner ───────────────────────────────────────────────────────

/// State shared by the listener, every connection task, and the watchdogs.
pub(crate) struct ProxyInner<H: ProxyHooks> {
    config: ProxyConfig,
    timings: Timings,
    mode: GroupingMode,
    hooks: H,
    connector: Arc<dyn UpstreamConnector>,
    registry: Mutex<GroupRegistry>,
    gates: KeyGates,
    next_conn: AtomicU64,
    next_group: AtomicU64,
    closed: AtomicBool,
}

impl<H: ProxyHooks> ProxyInner<H> {
    pub(crate) fn hooks(&self) -> &H {
        &self.hooks
    }

    pub(crate) fn server_version(&self) -> &str {
        &self.config.proxy.server_version
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Group currently serving `member`, if it is still registered.
    pub(crate) async fn lookup_group(
        &self,
        key: Option<&GroupKey>,
        member: ConnectionId,
    ) -> Option<GroupHandle> {
        let key = key?;
        let registry = self.registry.lock().await;
        registry
            .get(key)
            .filter(|group| group.contains(member))
            .map(ConnectionGroup::handle)
    }

    /// Schedule teardown of a group whose upstream was found dead.
    pub(crate) fn report_upstream_lost(self: &Arc<Self>, group: &GroupHandle) {
        let proxy = Arc::clone(self);
        let key = group.key.clone();
        let id = group.id;
        tokio::spawn(async move {
            proxy.on_upstream_disconnect(&key, id).await;
        });
    }

    // ── Accept path ──────────────────────────────────────────────────

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let id = ConnectionId(self.next_conn.fetch_add(1, Ordering::Relaxed));
        let mut ctx = ClientContext::new(id, Some(peer));

        if let Err(e) = self.hooks.on_conn(&mut ctx).await {
            tracing::warn!(conn = %id, %peer, error = %e, "on_conn hook failed, closing client");
            return;
        }

        let key = self.hooks.group_key(&ctx, self.mode);
        ctx.group = Some(key.clone());
        let (handle, close_rx) = ClientHandle::new(id, Some(peer));

        if let Err(e) = self.join_group(&key, handle).await {
            match e {
                ProxyError::ShuttingDown => {
                    tracing::debug!(conn = %id, "proxy closed during accept")
                }
                e => tracing::error!(conn = %id, group = %key, error = %e, "cannot pair client with upstream"),
            }
            return;
        }

        self.serve(stream, ctx, close_rx).await;
        self.on_client_disconnect(&key, id).await;
    }

    /// Add `member` to the group under `key`, creating the group (and its
    /// upstream connection) when there is none.
    ///
    /// `closed` is only read under the registry lock, the same lock `close`
    /// sets it under, so no group is registered after `close` drained.
    async fn join_group(self: &Arc<Self>, key: &GroupKey, member: ClientHandle) -> ProxyResult<()> {
        let _gate = self.gates.acquire(key).await;

        let member = {
            let mut registry = self.registry.lock().await;
            if self.is_closed() {
                return Err(ProxyError::ShuttingDown);
            }
            match registry.add_member(key, member) {
                Ok(()) => {
                    tracing::debug!(group = %key, "client joined existing group");
                    return Ok(());
                }
                Err(member) => member,
            }
        };

        let connect = self.connector.connect(&self.config.upstream);
        let mut upstream = tokio::time::timeout(self.timings.connect_timeout, connect)
            .await
            .map_err(|_| ProxyError::UpstreamTimeout(self.timings.connect_timeout))?
            .map_err(ProxyError::UpstreamConnect)?;

        if let Err(e) = self.hooks.on_proxy_conn(upstream.as_mut()).await {
            upstream.close().await;
            return Err(e.into());
        }

        let id = GroupId(self.next_group.fetch_add(1, Ordering::Relaxed));
        let group = ConnectionGroup::new(id, key.clone(), upstream, member);
        let mut registry = self.registry.lock().await;
        if self.is_closed() {
            drop(registry);
            group.teardown().await;
            return Err(ProxyError::ShuttingDown);
        }

        // The gate is held, so no other group can have appeared under `key`.
        let registered = registry.get_or_create(key, || group);
        let handle = registered.handle();
        let stop = registered.subscribe_stop();
        drop(registry);
        if handle.id != id {
            tracing::warn!(group = %key, "group appeared while connecting, new upstream dropped");
            return Ok(());
        }

        if let Some(interval) = self.timings.health_check_interval {
            tokio::spawn(watch_upstream(Arc::downgrade(self), handle, interval, stop));
        }
        tracing::info!(group = %key, id = %id, "connection group created");
        Ok(())
    }

    async fn serve(
        self: &Arc<Self>,
        stream: TcpStream,
        ctx: ClientContext<H::State>,
        close_rx: watch::Receiver<bool>,
    ) {
        let id = ctx.id;
        let shim = ClientShim::new(Arc::clone(self), ctx);
        let (reader, writer) = stream.into_split();

        tokio::select! {
            result = AsyncMysqlIntermediary::run_on(shim, reader, writer) => match result {
                Ok(()) => tracing::debug!(conn = %id, "client disconnected"),
                Err(e) => tracing::debug!(conn = %id, error = %e, "client connection ended"),
            },
            () = registry::closed(close_rx) => {
                tracing::debug!(conn = %id, "client connection force-closed");
            }
        }
    }

    // ── Disconnect paths ─────────────────────────────────────────────

    /// Drop `id` from its group. The last member out closes the upstream.
    async fn on_client_disconnect(&self, key: &GroupKey, id: ConnectionId) {
        let _gate = self.gates.acquire(key).await;
        let emptied = {
            let mut registry = self.registry.lock().await;
            match registry.remove_member(key, id) {
                Some(true) => registry.remove(key),
                Some(false) => {
                    tracing::debug!(conn = %id, group = %key, "client left group");
                    None
                }
                None => None,
            }
        };
        if let Some(group) = emptied {
            group.teardown().await;
        }
    }

    /// Tear down generation `id` of the group under `key`. Later calls, or
    /// calls for an already replaced generation, do nothing.
    async fn on_upstream_disconnect(&self, key: &GroupKey, id: GroupId) {
        let _gate = self.gates.acquire(key).await;
        let group = self.registry.lock().await.remove_if(key, id);
        match group {
            Some(group) => {
                tracing::info!(group = %key, members = group.len(), "upstream connection lost");
                group.teardown().await;
            }
            None => tracing::debug!(group = %key, "upstream loss already handled"),
        }
    }
}

/// Ping the group's upstream every `interval` until the group stops.
async fn watch_upstream<H: ProxyHooks>(
    proxy: Weak<ProxyInner<H>>,
    group: GroupHandle,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    return;
                }
                continue;
            }
        }

        if ping(&group.upstream).await {
            continue;
        }
        tracing::warn!(group = %group.key, "upstream ping failed");
        if let Some(proxy) = proxy.upgrade() {
            proxy.on_upstream_disconnect(&group.key, group.id).await;
        }
        return;
    }
}

async fn ping(upstream: &SharedUpstream) -> bool {
    upstream.lock().await.ping().await
}

// ── MySqlProxy ───────────────────────────────────────────────────────

struct ListenerTask {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// An intercepting MySQL proxy with hooks `H`.
///
/// ```no_run
/// # async fn run() -> uncommit_proxy::ProxyResult<()> {
/// use std::sync::Arc;
/// use uncommit_proxy::{MySqlProxy, Passthrough, ProxyConfig, MysqlConnector};
///
/// let proxy = MySqlProxy::new(ProxyConfig::default(), Passthrough, Arc::new(MysqlConnector))?;
/// let addr = proxy.listen().await?;
/// println!("listening on {addr}");
/// proxy.close().await;
/// # Ok(())
/// # }
/// ```
pub struct MySqlProxy<H: ProxyHooks> {
    inner: Arc<ProxyInner<H>>,
    listener: Mutex<Option<ListenerTask>>,
}

impl<H: ProxyHooks> MySqlProxy<H> {
    pub fn new(
        config: ProxyConfig,
        hooks: H,
        connector: Arc<dyn UpstreamConnector>,
    ) -> ProxyResult<Self> {
        let timings = config.timings()?;
        let mode = config.grouping_mode();
        Ok(Self {
            inner: Arc::new(ProxyInner {
                config,
                timings,
                mode,
                hooks,
                connector,
                registry: Mutex::new(GroupRegistry::new()),
                gates: KeyGates::default(),
                next_conn: AtomicU64::new(1),
                next_group: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
            listener: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.inner.config
    }

    pub fn hooks(&self) -> &H {
        &self.inner.hooks
    }

    /// Bind the configured address and start accepting clients.
    pub async fn listen(&self) -> ProxyResult<SocketAddr> {
        let mut slot = self.listener.lock().await;
        if let Some(task) = slot.as_ref() {
            return Err(ProxyError::AlreadyListening(task.addr));
        }
        if self.inner.is_closed() {
            return Err(ProxyError::ShuttingDown);
        }

        let addr = self.inner.config.listen.address();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ProxyError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(accept_loop(Arc::clone(&self.inner), listener, shutdown_rx));

        tracing::info!(addr = %local, mode = %self.inner.mode, "proxy listening");
        *slot = Some(ListenerTask {
            addr: local,
            shutdown,
            handle,
        });
        Ok(local)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|task| task.addr)
    }

    /// Number of registered connection groups.
    pub async fn group_count(&self) -> usize {
        self.inner.registry.lock().await.count()
    }

    /// Member connections of every registered group.
    pub async fn membership(&self) -> BTreeMap<GroupKey, Vec<ConnectionId>> {
        self.inner.registry.lock().await.membership()
    }

    /// Stop accepting and tear down every group. Idempotent.
    pub async fn close(&self) {
        let groups = {
            let mut registry = self.inner.registry.lock().await;
            self.inner.closed.store(true, Ordering::SeqCst);
            registry.drain()
        };

        if let Some(task) = self.listener.lock().await.take() {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                tracing::warn!(error = %e, "accept loop ended abnormally");
            }
            tracing::info!(addr = %task.addr, "proxy listener stopped");
        }

        if !groups.is_empty() {
            tracing::info!(groups = groups.len(), "closing connection groups");
        }
        for group in groups {
            group.teardown().await;
        }
    }
}

async fn accept_loop<H: ProxyHooks>(
    proxy: Arc<ProxyInner<H>>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "accepted client connection");
                    tokio::spawn(Arc::clone(&proxy).handle_connection(stream, peer));
                }
                Err(e) => tracing::warn!(error = %e, "accept failed"),
            },
            _ = shutdown.changed() => return,
        }
    }
}
