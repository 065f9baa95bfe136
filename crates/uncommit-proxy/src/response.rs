//! What goes back to the client for one query.

use crate::hooks::HookError;
use crate::upstream::{OkStatus, QueryOutcome, ResultSet, UpstreamError};

/// Message sent when a connection's group cannot be resolved.
pub const CONNECTION_ERROR: &str = "Connection error";

/// Error packet payload.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ErrorResponse {
    pub message: String,
    pub code: Option<String>,
    pub sql_state: Option<String>,
    pub errno: Option<u16>,
}

impl ErrorResponse {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }
}

impl From<&UpstreamError> for ErrorResponse {
    fn from(err: &UpstreamError) -> Self {
        match err {
            UpstreamError::Server {
                message,
                code,
                sql_state,
                errno,
            } => ErrorResponse {
                message: message.clone(),
                code: code.clone(),
                sql_state: sql_state.clone(),
                errno: *errno,
            },
            other => ErrorResponse::message(other.to_string()),
        }
    }
}

impl From<&HookError> for ErrorResponse {
    fn from(err: &HookError) -> Self {
        match err {
            HookError::Upstream(upstream) => ErrorResponse::from(upstream),
            other => ErrorResponse::message(other.to_string()),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Ok(OkStatus),
    Rows(ResultSet),
    Error(ErrorResponse),
}

impl Response {
    /// Plain acknowledgement with no status.
    pub fn ack() -> Self {
        Response::Ok(OkStatus::default())
    }

    pub fn connection_error() -> Self {
        Response::Error(ErrorResponse::message(CONNECTION_ERROR))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Response::Error(_))
    }
}

impl From<QueryOutcome> for Response {
    fn from(outcome: QueryOutcome) -> Self {
        match outcome {
            QueryOutcome::Rows(rows) => Response::Rows(rows),
            QueryOutcome::Ok(status) => Response::Ok(status),
        }
    }
}
