//! Query interception pipeline.
//!
//! ```text
//! query ──▶ group lookup ──▶ hooks.on_query ──▶ forward ──▶ Response
//!              │ missing          │ rejected        │ failed
//!              ▼                  ▼                 ▼
//!       "Connection error"   hook message     upstream error
//! ```
//!
//! Nothing here ends the client connection: every failure becomes an error
//! response. A lost upstream is flagged so the caller can tear the group down.

use crate::context::ClientContext;
use crate::hooks::ProxyHooks;
use crate::registry::{GroupHandle, SharedUpstream};
use crate::response::{ErrorResponse, Response};
use crate::upstream::{QueryOutcome, UpstreamError};

/// Result of intercepting one client query.
#[derive(Debug, PartialEq, Eq)]
pub struct Intercepted {
    pub response: Response,
    /// Forwarding failed because the upstream connection is gone.
    pub upstream_lost: bool,
}

impl Intercepted {
    fn reply(response: Response) -> Self {
        Self {
            response,
            upstream_lost: false,
        }
    }
}

/// Run `queries` on the group's upstream in order.
///
/// Every statement but the last runs for effect; the first failure aborts
/// the rest. Returns `None` for an empty sequence. The upstream stays locked
/// for the whole sequence so statements from other members never interleave.
pub async fn forward(
    upstream: &SharedUpstream,
    queries: &[String],
) -> Result<Option<QueryOutcome>, UpstreamError> {
    let Some((last, effects)) = queries.split_last() else {
        return Ok(None);
    };
    let mut conn = upstream.lock().await;
    for sql in effects {
        conn.query(sql).await?;
    }
    conn.query(last).await.map(Some)
}

/// Rewrite `query` with the hooks, forward it, and build the client response.
pub async fn intercept<H: ProxyHooks>(
    hooks: &H,
    ctx: &mut ClientContext<H::State>,
    group: Option<&GroupHandle>,
    query: &str,
) -> Intercepted {
    let Some(group) = group else {
        tracing::warn!(conn = %ctx.id, "no connection group for client");
        return Intercepted::reply(Response::connection_error());
    };

    let rewrite = match hooks.on_query(ctx, query).await {
        Ok(rewrite) => rewrite,
        Err(e) => {
            tracing::debug!(conn = %ctx.id, error = %e, "query rejected by hook");
            return Intercepted::reply(Response::Error(ErrorResponse::from(&e)));
        }
    };

    match forward(&group.upstream, rewrite.queries()).await {
        Ok(Some(outcome)) => Intercepted::reply(outcome.into()),
        Ok(None) => Intercepted::reply(Response::ack()),
        Err(e) => {
            tracing::debug!(
                conn = %ctx.id,
                group = %group.key,
                error = %e,
                "forwarding failed"
            );
            Intercepted {
                upstream_lost: e.is_connection_lost(),
                response: Response::Error(ErrorResponse::from(&e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex as StdMutex};

    use async_trait::async_trait;
    use tokio::sync::Mutex;

    use crate::context::{ConnectionId, GroupKey};
    use crate::hooks::{HookError, Passthrough, QueryRewrite};
    use crate::registry::GroupId;
    use crate::upstream::{ColumnMeta, OkStatus, ResultSet, UpstreamConnection};

    // ── Scripted upstream ────────────────────────────────────────────

    #[derive(Debug, Default)]
    struct ScriptedUpstream {
        executed: Arc<StdMutex<Vec<String>>>,
        failures: HashMap<String, UpstreamError>,
    }

    #[async_trait]
    impl UpstreamConnection for ScriptedUpstream {
        async fn query(&mut self, sql: &str) -> Result<QueryOutcome, UpstreamError> {
            self.executed.lock().unwrap().push(sql.to_string());
            if let Some(err) = self.failures.get(sql) {
                return Err(err.clone());
            }
            match sql.strip_prefix("select ") {
                Some(value) => Ok(QueryOutcome::Rows(ResultSet {
                    columns: vec![ColumnMeta::text("a")],
                    rows: vec![vec![Some(value.as_bytes().to_vec())]],
                })),
                None => Ok(QueryOutcome::Ok(OkStatus {
                    affected_rows: 1,
                    ..OkStatus::default()
                })),
            }
        }

        async fn ping(&mut self) -> bool {
            true
        }

        async fn close(&mut self) {}
    }

    fn group_with(upstream: ScriptedUpstream) -> GroupHandle {
        let upstream: Box<dyn UpstreamConnection> = Box::new(upstream);
        GroupHandle {
            id: GroupId(1),
            key: GroupKey::shared(),
            upstream: Arc::new(Mutex::new(upstream)),
        }
    }

    /// Hooks returning a fixed rewrite, or rejecting.
    struct FixedHooks(Result<Vec<&'static str>, &'static str>);

    #[async_trait]
    impl ProxyHooks for FixedHooks {
        type State = ();

        async fn on_query(
            &self,
            _ctx: &mut ClientContext<()>,
            _query: &str,
        ) -> Result<QueryRewrite, HookError> {
            match &self.0 {
                Ok(queries) => Ok(queries.iter().copied().collect()),
                Err(reason) => Err(HookError::rejected(*reason)),
            }
        }
    }

    fn ctx() -> ClientContext<()> {
        ClientContext::new(ConnectionId(1), None)
    }

    // ── forward ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn forward_empty_sequence_returns_none() {
        let upstream = ScriptedUpstream::default();
        let executed = Arc::clone(&upstream.executed);
        let group = group_with(upstream);
        assert_eq!(forward(&group.upstream, &[]).await.unwrap(), None);
        assert!(executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forward_returns_only_last_result() {
        let upstream = ScriptedUpstream::default();
        let executed = Arc::clone(&upstream.executed);
        let group = group_with(upstream);
        let queries = vec!["select 1".to_string(), "select 2".to_string()];

        let outcome = forward(&group.upstream, &queries).await.unwrap();
        match outcome {
            Some(QueryOutcome::Rows(rows)) => assert_eq!(rows.text(0, 0), Some("2")),
            other => panic!("expected rows, got {other:?}"),
        }
        assert_eq!(*executed.lock().unwrap(), queries);
    }

    #[tokio::test]
    async fn forward_stops_at_first_failure() {
        let mut upstream = ScriptedUpstream::default();
        upstream.failures.insert(
            "RELEASE SAVEPOINT s1".to_string(),
            UpstreamError::server(1305, "42000", "SAVEPOINT s1 does not exist"),
        );
        let executed = Arc::clone(&upstream.executed);
        let group = group_with(upstream);
        let queries = vec!["RELEASE SAVEPOINT s1".to_string(), "SAVEPOINT s1".to_string()];

        let err = forward(&group.upstream, &queries).await.unwrap_err();
        assert!(matches!(err, UpstreamError::Server { errno: Some(1305), .. }));
        assert_eq!(*executed.lock().unwrap(), vec!["RELEASE SAVEPOINT s1"]);
    }

    // ── intercept ────────────────────────────────────────────────────

    #[tokio::test]
    async fn missing_group_is_connection_error() {
        let result = intercept(&Passthrough, &mut ctx(), None, "select 1").await;
        assert_eq!(result.response, Response::connection_error());
        assert!(!result.upstream_lost);
    }

    #[tokio::test]
    async fn identity_rewrite_relays_rows() {
        let group = group_with(ScriptedUpstream::default());
        let result = intercept(&Passthrough, &mut ctx(), Some(&group), "select 7").await;
        match result.response {
            Response::Rows(rows) => {
                assert_eq!(rows.columns[0].name, "a");
                assert_eq!(rows.text(0, 0), Some("7"));
            }
            other => panic!("expected rows, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn write_statement_relays_ok_status() {
        let group = group_with(ScriptedUpstream::default());
        let result = intercept(&Passthrough, &mut ctx(), Some(&group), "insert into t values (1)").await;
        assert_eq!(
            result.response,
            Response::Ok(OkStatus {
                affected_rows: 1,
                ..OkStatus::default()
            })
        );
    }

    #[tokio::test]
    async fn empty_rewrite_acknowledges_without_forwarding() {
        let upstream = ScriptedUpstream::default();
        let executed = Arc::clone(&upstream.executed);
        let group = group_with(upstream);
        let result = intercept(&FixedHooks(Ok(vec![])), &mut ctx(), Some(&group), "COMMIT").await;
        assert_eq!(result.response, Response::ack());
        assert!(executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn multiple_queries_apply_side_effects_and_return_last() {
        let upstream = ScriptedUpstream::default();
        let executed = Arc::clone(&upstream.executed);
        let group = group_with(upstream);
        let hooks = FixedHooks(Ok(vec!["insert into t values (1)", "select 1", "select 2"]));

        let result = intercept(&hooks, &mut ctx(), Some(&group), "anything").await;
        match result.response {
            Response::Rows(rows) => assert_eq!(rows.text(0, 0), Some("2")),
            other => panic!("expected rows, got {other:?}"),
        }
        assert_eq!(executed.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn rejection_is_returned_and_nothing_forwarded() {
        let upstream = ScriptedUpstream::default();
        let executed = Arc::clone(&upstream.executed);
        let group = group_with(upstream);
        let hooks = FixedHooks(Err("Invalid query: DROP TABLE x"));

        let result = intercept(&hooks, &mut ctx(), Some(&group), "DROP TABLE x").await;
        assert_eq!(
            result.response,
            Response::Error(ErrorResponse::message("Invalid query: DROP TABLE x"))
        );
        assert!(executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn server_error_is_translated() {
        let mut upstream = ScriptedUpstream::default();
        upstream.failures.insert(
            "selec 1".to_string(),
            UpstreamError::server(1064, "42000", "You have an error in your SQL syntax"),
        );
        let group = group_with(upstream);

        let result = intercept(&Passthrough, &mut ctx(), Some(&group), "selec 1").await;
        match result.response {
            Response::Error(err) => {
                assert_eq!(err.errno, Some(1064));
                assert_eq!(err.sql_state.as_deref(), Some("42000"));
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(!result.upstream_lost);
    }

    #[tokio::test]
    async fn lost_upstream_is_flagged() {
        let mut upstream = ScriptedUpstream::default();
        upstream.failures.insert(
            "select 1".to_string(),
            UpstreamError::ConnectionLost("broken pipe".to_string()),
        );
        let group = group_with(upstream);

        let result = intercept(&Passthrough, &mut ctx(), Some(&group), "select 1").await;
        assert!(result.response.is_error());
        assert!(result.upstream_lost);
    }
}
