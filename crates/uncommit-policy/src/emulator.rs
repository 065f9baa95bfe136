//! Savepoint-based transaction emulation.
//!
//! Every upstream connection is opened inside an ambient `BEGIN` that is
//! never committed. Client transaction statements are mapped onto a single
//! savepoint inside it, so nothing a client does survives its connection:
//!
//! ```text
//! client                in_transaction    upstream
//! ─────────────────────────────────────────────────────────────────
//! BEGIN                 false → true      SAVEPOINT s1
//! BEGIN                 true              RELEASE SAVEPOINT s1; SAVEPOINT s1
//! COMMIT                true              RELEASE SAVEPOINT s1
//! COMMIT                false             (nothing)
//! ROLLBACK              true  → false     ROLLBACK TO SAVEPOINT s1
//! ROLLBACK              false             (nothing)
//! SELECT/INSERT/…       any               unchanged
//! anything else         any               rejected
//! ```

use async_trait::async_trait;
use regex::Regex;
use uncommit_proxy::{ClientContext, HookError, ProxyHooks, QueryRewrite, UpstreamConnection};

const SAVEPOINT: &str = "SAVEPOINT s1";
const RELEASE_SAVEPOINT: &str = "RELEASE SAVEPOINT s1";
const ROLLBACK_TO_SAVEPOINT: &str = "ROLLBACK TO SAVEPOINT s1";

/// Per-connection transaction state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransactionState {
    pub in_transaction: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Statement {
    Begin,
    Commit,
    Rollback,
    /// `SELECT`, `INSERT`, `UPDATE` or `DELETE`.
    Crud,
    Disallowed,
}

#[derive(Debug, Clone)]
pub struct UncommittableHooks {
    begin: Regex,
    commit: Regex,
    rollback: Regex,
    crud: Regex,
}

impl UncommittableHooks {
    pub fn new() -> Result<Self, regex::Error> {
        Ok(Self {
            begin: Regex::new(r"(?i)^\s*(BEGIN|START\s+TRANSACTION)\b")?,
            commit: Regex::new(r"(?i)^\s*COMMIT\b")?,
            rollback: Regex::new(r"(?i)^\s*ROLLBACK\b")?,
            crud: Regex::new(r"(?i)^\s*(SELECT|INSERT|UPDATE|DELETE)\b")?,
        })
    }

    pub fn classify(&self, query: &str) -> Statement {
        if self.begin.is_match(query) {
            Statement::Begin
        } else if self.commit.is_match(query) {
            Statement::Commit
        } else if self.rollback.is_match(query) {
            Statement::Rollback
        } else if self.crud.is_match(query) {
            Statement::Crud
        } else {
            Statement::Disallowed
        }
    }

    /// Map one client statement onto the upstream statements to run.
    pub fn rewrite(
        &self,
        state: &mut TransactionState,
        query: &str,
    ) -> Result<QueryRewrite, HookError> {
        let queries: Vec<&str> = match (self.classify(query), state.in_transaction) {
            (Statement::Begin, true) => vec![RELEASE_SAVEPOINT, SAVEPOINT],
            (Statement::Begin, false) => {
                state.in_transaction = true;
                vec![SAVEPOINT]
            }
            (Statement::Commit, true) => vec![RELEASE_SAVEPOINT],
            (Statement::Rollback, true) => {
                state.in_transaction = false;
                vec![ROLLBACK_TO_SAVEPOINT]
            }
            (Statement::Commit | Statement::Rollback, false) => vec![],
            (Statement::Crud, _) => return Ok(QueryRewrite::identity(query)),
            (Statement::Disallowed, _) => {
                return Err(HookError::rejected(format!("Invalid query: {query}")));
            }
        };
        Ok(queries.into_iter().collect())
    }
}

#[async_trait]
impl ProxyHooks for UncommittableHooks {
    type State = TransactionState;

    async fn on_proxy_conn(&self, upstream: &mut dyn UpstreamConnection) -> Result<(), HookError> {
        upstream.query("BEGIN").await?;
        tracing::debug!("ambient transaction opened");
        Ok(())
    }

    async fn on_query(
        &self,
        ctx: &mut ClientContext<TransactionState>,
        query: &str,
    ) -> Result<QueryRewrite, HookError> {
        let rewrite = self.rewrite(&mut ctx.state, query);
        if let Err(e) = &rewrite {
            tracing::debug!(conn = %ctx.id, error = %e, "statement not allowed");
        }
        rewrite
    }
}
