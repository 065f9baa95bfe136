//! uncommit-proxy: an intercepting MySQL proxy.
//!
//! Clients speak the MySQL protocol to the proxy; every query goes through
//! a [`ProxyHooks`] implementation that may rewrite it into a sequence of
//! statements before it is run on the real server. Client connections are
//! grouped onto upstream connections: one per client (isolation mode) or a
//! single shared one (grouping mode).
//!
//! - [`lifecycle`]: the listening proxy, group assignment, disconnect propagation
//! - [`registry`]: group key → upstream connection + member clients
//! - [`pipeline`]: rewrite, forward, relay the last result
//! - [`hooks`]: the policy extension points
//! - [`upstream`]: the connector seam and its `mysql_async` implementation

mod codec;
pub mod config;
pub mod context;
pub mod error;
pub mod hooks;
pub mod lifecycle;
pub mod pipeline;
pub mod registry;
pub mod response;
pub mod upstream;

pub use config::{GroupingMode, ProxyConfig, UpstreamOptions};
pub use context::{ClientContext, ConnectionId, GroupKey};
pub use error::{ProxyError, ProxyResult};
pub use hooks::{HookError, Passthrough, ProxyHooks, QueryRewrite};
pub use lifecycle::MySqlProxy;
pub use response::{ErrorResponse, Response};
pub use upstream::mysql::MysqlConnector;
pub use upstream::{
    ColumnMeta, OkStatus, QueryOutcome, ResultSet, UpstreamConnection, UpstreamConnector,
    UpstreamError,
};
