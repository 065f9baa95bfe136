//! Proxy configuration, loadable from TOML.
//!
//! ```toml
//! [listen]
//! host = "127.0.0.1"
//! port = 3307
//!
//! [upstream]
//! host = "127.0.0.1"
//! port = 3306
//! user = "root"
//! password = ""
//! database = "test"
//!
//! [proxy]
//! group_connections = false
//! health_check_interval = "5s"
//! connect_timeout = "5s"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ProxyError, ProxyResult};

/// Top-level proxy configuration. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub listen: ListenConfig,
    pub upstream: UpstreamOptions,
    pub proxy: ProxySettings,
}

/// Where the proxy accepts client connections. Port `0` binds an ephemeral port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ListenConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3307,
        }
    }
}

impl ListenConfig {
    /// `host:port` form accepted by `TcpListener::bind`.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Connection options for the real MySQL server. Opaque to the core; only the
/// upstream connector interprets them.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamOptions {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: Option<String>,
}

impl Default for UpstreamOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3306,
            user: "root".to_string(),
            password: String::new(),
            database: None,
        }
    }
}

impl std::fmt::Debug for UpstreamOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamOptions")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .finish()
    }
}

/// Behavior knobs for the proxy itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    /// Share one upstream connection between every client (grouping mode).
    pub group_connections: bool,
    /// How often each group pings its upstream connection. `"0s"` disables.
    pub health_check_interval: String,
    /// Upper bound on opening an upstream connection.
    pub connect_timeout: String,
    /// Server version string sent in the handshake.
    pub server_version: String,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            group_connections: false,
            health_check_interval: "5s".to_string(),
            connect_timeout: "5s".to_string(),
            server_version: "8.0.32-uncommit".to_string(),
        }
    }
}

/// How client connections are mapped onto groups.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum GroupingMode {
    /// One group, and one upstream connection, per client connection.
    #[default]
    Isolated,
    /// A single group shared by every client connection.
    Shared,
}

impl From<bool> for GroupingMode {
    fn from(group_connections: bool) -> Self {
        if group_connections {
            GroupingMode::Shared
        } else {
            GroupingMode::Isolated
        }
    }
}

impl std::fmt::Display for GroupingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupingMode::Isolated => write!(f, "isolated"),
            GroupingMode::Shared => write!(f, "shared"),
        }
    }
}

/// Durations resolved from their string form.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Timings {
    /// `None` when health checks are disabled.
    pub health_check_interval: Option<Duration>,
    pub connect_timeout: Duration,
}

impl ProxyConfig {
    pub fn from_file(path: &Path) -> ProxyResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> ProxyResult<Self> {
        let config: ProxyConfig =
            toml::from_str(content).map_err(|e| ProxyError::Config(e.to_string()))?;
        config.timings()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ProxyResult<String> {
        toml::to_string_pretty(self).map_err(|e| ProxyError::Config(e.to_string()))
    }

    pub fn grouping_mode(&self) -> GroupingMode {
        GroupingMode::from(self.proxy.group_connections)
    }

    /// Builder-style override of the grouping flag.
    pub fn with_grouping(mut self, group_connections: bool) -> Self {
        self.proxy.group_connections = group_connections;
        self
    }

    /// Builder-style override of the listen port.
    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen.port = port;
        self
    }

    pub fn with_upstream(mut self, upstream: UpstreamOptions) -> Self {
        self.upstream = upstream;
        self
    }

    pub fn timings(&self) -> ProxyResult<Timings> {
        let interval = parse_setting("health_check_interval", &self.proxy.health_check_interval)?;
        let connect_timeout = parse_setting("connect_timeout", &self.proxy.connect_timeout)?;
        if connect_timeout.is_zero() {
            return Err(ProxyError::Config(
                "connect_timeout must be greater than zero".to_string(),
            ));
        }
        Ok(Timings {
            health_check_interval: (!interval.is_zero()).then_some(interval),
            connect_timeout,
        })
    }
}

fn parse_setting(name: &str, value: &str) -> ProxyResult<Duration> {
    parse_duration(value)
        .ok_or_else(|| ProxyError::Config(format!("invalid duration for {name}: {value:?}")))
}

/// Parse a duration string like "5s", "500ms", "2m", or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.parse().ok().map(Duration::from_millis);
    }
    let (digits, scale) = match s.strip_suffix('m') {
        Some(mins) => (mins, 60),
        None => (s.strip_suffix('s').unwrap_or(s), 1),
    };
    let secs = digits.parse::<u64>().ok()?.checked_mul(scale)?;
    Some(Duration::from_secs(secs))
}
