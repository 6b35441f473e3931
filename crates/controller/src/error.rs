// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// The five error kinds recognized across the core: retryable, terminal and
/// reported, skip and continue, node offline, and fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Database locked or a write would block. Callers retry with backoff;
    /// on exhaustion the operation is dropped and logged, never propagated
    /// as a session failure.
    #[error("transient: {0}")]
    Transient(String),

    /// Duplicate segment, unknown course, invalid session transition.
    /// Reported to the UI as a structured failure.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// Malformed frame or unknown command on the wire protocol. The
    /// connection stays open.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A write to a cone's connection failed; the node is now considered
    /// offline.
    #[error("transport error: {0}")]
    Transport(String),

    /// Fatal at startup, e.g. the heartbeat listener cannot bind.
    #[error("operational error: {0}")]
    Operational(String),
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Transient(_) => ErrorCode::TransientLocked,
            Self::Constraint(_) => ErrorCode::ConstraintViolation,
            Self::Protocol(_) => ErrorCode::ProtocolError,
            Self::Transport(_) => ErrorCode::TransportError,
            Self::Operational(_) => ErrorCode::Operational,
        }
    }
}

/// Stable machine-readable error identifiers shared between the facade's
/// HTTP responses and internal logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    TransientLocked,
    ConstraintViolation,
    AlreadyExists,
    ProtocolError,
    TransportError,
    Operational,
    NotFound,
    Internal,
}

impl ErrorCode {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::TransientLocked => 503,
            Self::ConstraintViolation => 409,
            Self::AlreadyExists => 200,
            Self::ProtocolError => 400,
            Self::TransportError => 502,
            Self::Operational => 500,
            Self::NotFound => 404,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransientLocked => "TRANSIENT_LOCKED",
            Self::ConstraintViolation => "CONSTRAINT_VIOLATION",
            Self::AlreadyExists => "ALREADY_EXISTS",
            Self::ProtocolError => "PROTOCOL_ERROR",
            Self::TransportError => "TRANSPORT_ERROR",
            Self::Operational => "OPERATIONAL",
            Self::NotFound => "NOT_FOUND",
            Self::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Body shape for every non-2xx facade response.
#[derive(Debug, Serialize)]
struct ErrorBody {
    error: ErrorCode,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let code = self.code();
        let status = StatusCode::from_u16(code.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(ErrorBody { error: code, message: self.to_string() })).into_response()
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
