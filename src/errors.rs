//! Error types.
//!
//! [`StartupError`] is the tagged error of the bootstrap/recovery
//! orchestrator; every variant is terminal.  [`ApiError`] is what the HTTP
//! handlers return, rendered as a JSON error body.

use std::path::PathBuf;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use thiserror::Error;

use crate::config::ConfigError;
use crate::consensus::ConsensusError;
use crate::discovery::DiscoveryError;
use crate::storage::snap::SnapError;
use crate::storage::wal::WalError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// Everything that can stop a node or proxy from starting (or keep it
/// running).  `main` logs the category and message and exits non-zero.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot create directory {path}: {source}")]
    Filesystem {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("discovery failed: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error(transparent)]
    Recovery(#[from] RecoveryError),

    #[error("cannot create log: {0}")]
    LogCreate(WalError),

    #[error("cannot initialize consensus: {0}")]
    Consensus(#[from] ConsensusError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{0}")]
    Serve(String),
}

impl StartupError {
    /// Stable category tag for log lines.
    pub fn category(&self) -> &'static str {
        match self {
            StartupError::Config(_) => "config",
            StartupError::Filesystem { .. } | StartupError::LogCreate(_) => "filesystem",
            StartupError::Discovery(_) => "discovery",
            StartupError::Recovery(_) => "recovery",
            StartupError::Consensus(_) => "consensus",
            StartupError::Transport(_) => "transport",
            StartupError::Serve(_) => "serve",
        }
    }
}

/// The recovery path refuses to run with ambiguous state.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("cannot load snapshot: {0}")]
    Snapshot(#[from] SnapError),

    #[error("cannot restore store from snapshot: {0}")]
    Store(#[from] StoreError),

    #[error("cannot read log: {0}")]
    Wal(#[from] WalError),

    #[error("unexpected nodeid {0}: nodeid should always be zero until it is saved into the log")]
    UnexpectedNodeId(u64),
}

/// Error body returned to HTTP clients.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody<'a> {
    error_code: u32,
    message: String,
    cause: &'a str,
}

/// Errors surfaced by the client, peer, and proxy handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Key not found")]
    KeyNotFound { key: String },

    #[error("Value is Required in PUT form")]
    ValueRequired { key: String },

    #[error("{message}")]
    BadRequest { message: String },

    #[error("request timed out")]
    Timeout,

    #[error("{message}")]
    Unavailable { message: String },

    #[error("method not allowed in read-only mode")]
    NotImplemented,

    #[error("internal error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    /// Numeric code carried in the JSON body.
    pub fn code(&self) -> u32 {
        match self {
            ApiError::KeyNotFound { .. } => 100,
            ApiError::ValueRequired { .. } => 200,
            ApiError::BadRequest { .. } => 210,
            ApiError::Timeout => 300,
            ApiError::Unavailable { .. } => 301,
            ApiError::NotImplemented => 400,
            ApiError::Internal(_) => 500,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::KeyNotFound { .. } => StatusCode::NOT_FOUND,
            ApiError::ValueRequired { .. } => StatusCode::BAD_REQUEST,
            ApiError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            ApiError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ApiError::Unavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::NotImplemented => StatusCode::NOT_IMPLEMENTED,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn cause(&self) -> &str {
        match self {
            ApiError::KeyNotFound { key } | ApiError::ValueRequired { key } => key,
            _ => "",
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::KeyNotFound(key) => ApiError::KeyNotFound { key },
            other => ApiError::Internal(other.into()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Internal(err) = &self {
            tracing::error!("internal error: {err:#}");
        }
        let body = ErrorBody {
            error_code: self.code(),
            message: self.to_string(),
            cause: self.cause(),
        };
        (self.status_code(), axum::Json(body)).into_response()
    }
}
