//! Per-connection context handed to policy hooks.

use std::fmt;
use std::net::SocketAddr;

/// Accept-time identifier of a client connection. Monotonic, never reused
/// within one proxy instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl ConnectionId {
    /// Connection id advertised in the handshake (the wire field is 32 bits).
    pub fn wire_id(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key identifying a connection group. Connections with the same key share
/// one upstream connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKey(String);

impl GroupKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Key of the single group used in grouping mode.
    pub fn shared() -> Self {
        Self("shared".to_string())
    }

    /// Key of the private group owned by one connection in isolation mode.
    pub fn isolated(id: ConnectionId) -> Self {
        Self(format!("conn-{}", id.0))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Everything the proxy knows about one client connection, plus the hook's
/// own per-connection state `S`.
///
/// Owned by the connection's task; hooks receive it by reference.
#[derive(Debug)]
pub struct ClientContext<S> {
    pub id: ConnectionId,
    pub peer: Option<SocketAddr>,
    /// Set once the connection has been assigned to a group.
    pub group: Option<GroupKey>,
    pub state: S,
}

impl<S: Default> ClientContext<S> {
    pub fn new(id: ConnectionId, peer: Option<SocketAddr>) -> Self {
        Self {
            id,
            peer,
            group: None,
            state: S::default(),
        }
    }
}
