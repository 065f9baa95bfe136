//! Policy hooks: the extension points a consumer plugs into the proxy.
//!
//! ```text
//! accept ──▶ on_conn(ctx) ──▶ group_key(ctx, mode)
//!                               │ new group
//!                               ▼
//!                        on_proxy_conn(upstream)
//!
//! COM_QUERY ──▶ on_query(ctx, sql) ──▶ [sql₁, …, sqlₙ] ──▶ upstream
//! ```
//!
//! Every hook has a default, so an empty `impl ProxyHooks for X {}` (with a
//! `State` type) is a transparent proxy.

use async_trait::async_trait;

use crate::config::GroupingMode;
use crate::context::{ClientContext, GroupKey};
use crate::upstream::{UpstreamConnection, UpstreamError};

/// Failure returned by a hook.
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    /// The hook refused. The message is sent verbatim to the client when
    /// refusing a query.
    #[error("{0}")]
    Rejected(String),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HookError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        HookError::Rejected(reason.into())
    }
}

/// Ordered statements to run upstream in place of one client query.
///
/// All but the last run for effect; the last one's result goes back to the
/// client. An empty rewrite is answered with a plain OK.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryRewrite(Vec<String>);

impl QueryRewrite {
    /// Forward the client query unchanged.
    pub fn identity(query: &str) -> Self {
        Self(vec![query.to_string()])
    }

    /// Forward nothing.
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn queries(&self) -> &[String] {
        &self.0
    }

    pub fn into_queries(self) -> Vec<String> {
        self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<S: Into<String>> FromIterator<S> for QueryRewrite {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

impl From<Vec<String>> for QueryRewrite {
    fn from(queries: Vec<String>) -> Self {
        Self(queries)
    }
}

#[async_trait]
pub trait ProxyHooks: Send + Sync + 'static {
    /// Per-connection state carried in [`ClientContext::state`].
    type State: Default + Send + 'static;

    /// Runs once per accepted client, before group assignment. An error
    /// closes the connection.
    async fn on_conn(&self, _ctx: &mut ClientContext<Self::State>) -> Result<(), HookError> {
        Ok(())
    }

    /// Runs once per newly opened upstream connection, before its group is
    /// registered. An error closes both sides.
    async fn on_proxy_conn(&self, _upstream: &mut dyn UpstreamConnection) -> Result<(), HookError> {
        Ok(())
    }

    /// Rewrites one client query. Defaults to the identity rewrite.
    async fn on_query(
        &self,
        _ctx: &mut ClientContext<Self::State>,
        query: &str,
    ) -> Result<QueryRewrite, HookError> {
        Ok(QueryRewrite::identity(query))
    }

    /// Derives the group a connection joins.
    fn group_key(&self, ctx: &ClientContext<Self::State>, mode: GroupingMode) -> GroupKey {
        match mode {
            GroupingMode::Isolated => GroupKey::isolated(ctx.id),
            GroupingMode::Shared => GroupKey::shared(),
        }
    }
}

/// Hooks that change nothing: every query is forwarded as received.
#[derive(Clone, Copy, Debug, Default)]
pub struct Passthrough;

impl ProxyHooks for Passthrough {
    type State = ();
}
