//! Shared fixtures: a scripted in-process upstream and `mysql_async` clients.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mysql_async::{Conn, OptsBuilder};
use tokio::sync::Semaphore;
use uncommit_proxy::{
    ColumnMeta, MySqlProxy, OkStatus, ProxyConfig, ProxyHooks, QueryOutcome, ResultSet,
    UpstreamConnection, UpstreamConnector, UpstreamError, UpstreamOptions,
};

// ── Scripted upstream ────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Log {
    connects: usize,
    closes: usize,
    queries: Vec<String>,
    finished: Vec<String>,
    pending_connects: usize,
    alive: Vec<Arc<AtomicBool>>,
}

/// Connector whose connections answer:
/// - `select <v> [as <name>], …` with one text row (`@@vars` and `null` as NULL)
/// - `fail…` with a 1064 parse error
/// - `slow…` with OK, once [`release_slow_queries`](Self::release_slow_queries) is called
/// - anything else with OK, one affected row
#[derive(Clone, Debug)]
pub struct MockConnector {
    log: Arc<Mutex<Log>>,
    refuse: Arc<AtomicBool>,
    hold: Arc<AtomicBool>,
    connect_gate: Arc<Semaphore>,
    slow_gate: Arc<Semaphore>,
}

impl Default for MockConnector {
    fn default() -> Self {
        Self {
            log: Arc::default(),
            refuse: Arc::default(),
            hold: Arc::default(),
            connect_gate: Arc::new(Semaphore::new(0)),
            slow_gate: Arc::new(Semaphore::new(0)),
        }
    }
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Park every later connect attempt until [`release_connections`](Self::release_connections).
    pub fn hold_connections(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release_connections(&self) {
        self.hold.store(false, Ordering::SeqCst);
        self.connect_gate.add_permits(64);
    }

    /// Connect attempts currently parked.
    pub fn pending_connects(&self) -> usize {
        self.log.lock().unwrap().pending_connects
    }

    pub fn release_slow_queries(&self) {
        self.slow_gate.add_permits(64);
    }

    /// Statements whose execution ran to completion.
    pub fn finished(&self) -> Vec<String> {
        self.log.lock().unwrap().finished.clone()
    }

    /// Make every later connect attempt fail.
    pub fn refuse_connections(&self) {
        self.refuse.store(true, Ordering::SeqCst);
    }

    pub fn connects(&self) -> usize {
        self.log.lock().unwrap().connects
    }

    pub fn closes(&self) -> usize {
        self.log.lock().unwrap().closes
    }

    pub fn queries(&self) -> Vec<String> {
        self.log.lock().unwrap().queries.clone()
    }

    /// Simulate the server dropping every open connection.
    pub fn kill_all(&self) {
        for alive in &self.log.lock().unwrap().alive {
            alive.store(false, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl UpstreamConnector for MockConnector {
    async fn connect(
        &self,
        _options: &UpstreamOptions,
    ) -> Result<Box<dyn UpstreamConnection>, UpstreamError> {
        if self.hold.load(Ordering::SeqCst) {
            self.log.lock().unwrap().pending_connects += 1;
            let _permit = self.connect_gate.acquire().await;
            self.log.lock().unwrap().pending_connects -= 1;
        }
        if self.refuse.load(Ordering::SeqCst) {
            return Err(UpstreamError::Driver("connection refused".to_string()));
        }
        let alive = Arc::new(AtomicBool::new(true));
        let mut log = self.log.lock().unwrap();
        log.connects += 1;
        log.alive.push(Arc::clone(&alive));
        Ok(Box::new(MockUpstream {
            log: Arc::clone(&self.log),
            alive,
            slow_gate: Arc::clone(&self.slow_gate),
        }))
    }
}

#[derive(Debug)]
struct MockUpstream {
    log: Arc<Mutex<Log>>,
    alive: Arc<AtomicBool>,
    slow_gate: Arc<Semaphore>,
}

#[async_trait]
impl UpstreamConnection for MockUpstream {
    async fn query(&mut self, sql: &str) -> Result<QueryOutcome, UpstreamError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(UpstreamError::ConnectionLost("server has gone away".to_string()));
        }
        self.log.lock().unwrap().queries.push(sql.to_string());
        let outcome = self.answer(sql).await;
        self.log.lock().unwrap().finished.push(sql.to_string());
        outcome
    }

    async fn ping(&mut self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn close(&mut self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            self.log.lock().unwrap().closes += 1;
        }
    }
}

impl MockUpstream {
    async fn answer(&self, sql: &str) -> Result<QueryOutcome, UpstreamError> {
        if sql.starts_with("slow") {
            let _permit = self.slow_gate.acquire().await;
        }

        let sql = sql.trim();
        if sql.get(..4).is_some_and(|p| p.eq_ignore_ascii_case("fail")) {
            return Err(UpstreamError::server(
                1064,
                "42000",
                format!("You have an error in your SQL syntax near '{sql}'"),
            ));
        }
        if let Some(list) = strip_prefix_ignore_case(sql, "select ") {
            return Ok(QueryOutcome::Rows(select_row(list)));
        }
        Ok(QueryOutcome::Ok(OkStatus {
            affected_rows: 1,
            ..OkStatus::default()
        }))
    }
}

fn strip_prefix_ignore_case<'a>(sql: &'a str, prefix: &str) -> Option<&'a str> {
    let head = sql.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &sql[prefix.len()..])
}

fn select_row(list: &str) -> ResultSet {
    let mut set = ResultSet::default();
    let mut row = Vec::new();
    for item in list.split(',').map(str::trim) {
        let (value, name) = match item.split_once(" as ") {
            Some((value, name)) => (value.trim(), name.trim()),
            None => (item, item),
        };
        set.columns.push(ColumnMeta::text(name));
        if value.starts_with("@@") || value.eq_ignore_ascii_case("null") {
            row.push(None);
        } else {
            row.push(Some(value.trim_matches('\'').as_bytes().to_vec()));
        }
    }
    set.rows.push(row);
    set
}

// ── Proxy + clients ──────────────────────────────────────────────────

/// Route proxy logs to the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn test_config(grouping: bool) -> ProxyConfig {
    let mut config = ProxyConfig::default()
        .with_listen_port(0)
        .with_grouping(grouping);
    config.proxy.health_check_interval = "50ms".to_string();
    config.proxy.connect_timeout = "2s".to_string();
    config
}

pub async fn start_proxy<H: ProxyHooks>(
    hooks: H,
    connector: &MockConnector,
    grouping: bool,
) -> (MySqlProxy<H>, SocketAddr) {
    init_tracing();
    let proxy = MySqlProxy::new(test_config(grouping), hooks, Arc::new(connector.clone())).unwrap();
    let addr = proxy.listen().await.unwrap();
    (proxy, addr)
}

/// Client options that skip the driver's post-connect settings probe.
pub fn client_opts(addr: SocketAddr) -> OptsBuilder {
    OptsBuilder::default()
        .ip_or_hostname(addr.ip().to_string())
        .tcp_port(addr.port())
        .user(Some("root"))
        .pass(Some("root"))
        .prefer_socket(false)
        .max_allowed_packet(Some(16 * 1024 * 1024))
        .wait_timeout(Some(28_800))
}

pub async fn client(addr: SocketAddr) -> Conn {
    Conn::new(client_opts(addr)).await.unwrap()
}

/// Poll until the proxy has `expected` groups. Returns false on timeout.
pub async fn wait_for_groups<H: ProxyHooks>(proxy: &MySqlProxy<H>, expected: usize) -> bool {
    for _ in 0..300 {
        if proxy.group_count().await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll a synchronous condition. Returns false on timeout.
pub async fn wait_for(check: impl Fn() -> bool) -> bool {
    for _ in 0..300 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Poll until `expected` clients are members of some group. Returns false on timeout.
pub async fn wait_for_members<H: ProxyHooks>(proxy: &MySqlProxy<H>, expected: usize) -> bool {
    for _ in 0..300 {
        let members: usize = proxy.membership().await.values().map(Vec::len).sum();
        if members == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
