//! Error taxonomy (spec §7). `TransportError` crosses the transport boundary;
//! `HubError` crosses the HTTP boundary and carries its own status/kind
//! mapping, mirroring the MuxError pattern this is grounded on.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("transport not connected")]
    NotConnected,
    #[error("request timed out")]
    Timeout,
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("agent error: {0}")]
    AgentError(String),
    #[error("connection lost mid-request")]
    ConnectionLost,
    #[error("request cancelled")]
    Cancelled,
}

impl TransportError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::NotConnected => "not_connected",
            TransportError::Timeout => "timeout",
            TransportError::Protocol(_) => "protocol",
            TransportError::AgentError(_) => "agent_error",
            TransportError::ConnectionLost => "connection_lost",
            TransportError::Cancelled => "cancelled",
        }
    }
}

impl From<beszel_core::UnknownAction> for TransportError {
    fn from(value: beszel_core::UnknownAction) -> Self {
        TransportError::Protocol(value.to_string())
    }
}

#[derive(thiserror::Error, Debug)]
pub enum HubError {
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("persistence error")]
    Persistence(#[source] anyhow::Error),
    #[error("internal error")]
    Internal(#[source] anyhow::Error),
}

impl HubError {
    pub fn kind(&self) -> &'static str {
        match self {
            HubError::Unauthorized => "unauthorized",
            HubError::NotFound => "not_found",
            HubError::BadRequest(_) => "bad_request",
            HubError::Transport(e) => e.kind(),
            HubError::Persistence(_) => "persistence",
            HubError::Internal(_) => "internal",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            HubError::Unauthorized => StatusCode::UNAUTHORIZED,
            HubError::NotFound => StatusCode::NOT_FOUND,
            HubError::BadRequest(_) => StatusCode::BAD_REQUEST,
            HubError::Transport(_) => StatusCode::BAD_GATEWAY,
            HubError::Persistence(_) | HubError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    kind: &'static str,
    message: String,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

impl IntoResponse for HubError {
    fn into_response(self) -> Response {
        if matches!(self, HubError::Persistence(_) | HubError::Internal(_)) {
            tracing::error!(kind = self.kind(), error = ?self, "request failed");
        }
        let body =
            ErrorResponse { error: ErrorBody { kind: self.kind(), message: self.to_string() } };
        (self.http_status(), Json(body)).into_response()
    }
}
