//! Error handling for the proxy.
//!
//! A single crate-wide [`Error`] enum covers both infrastructure failures
//! (I/O, network, parsing) and the upstream error taxonomy the retry engine
//! dispatches on:
//!
//! 1. **`RetriableResponse`**: an RPC-level error whose `(code, message)`
//!    classifies as retriable; carries the last response so the final attempt
//!    can return its body to the caller.
//! 2. **`Upstream`**: a terminal upstream condition (non-200 status with no
//!    retriable payload, or an unparseable body).
//! 3. **`NoNodesAvailable` / `ChainNotFound`**: pre-upstream configuration
//!    errors, never retried.

use crate::rpc::models::RpcResponse;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    // Essential external errors that cannot be consolidated
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("chain not found: {0:?}")]
    ChainNotFound(String),

    #[error("no nodes available for chain {0:?}")]
    NoNodesAvailable(String),

    /// The upstream answered with an RPC-level error that another node may
    /// not produce. Drives pool rotation in the retry engine.
    #[error("retriable upstream error response")]
    RetriableResponse(Box<RpcResponse>),

    /// Terminal upstream failure; `response` holds the decoded (or raw)
    /// body when one was received.
    #[error("{message} (status {status})")]
    Upstream {
        message: String,
        status: u16,
        response: Option<Box<RpcResponse>>,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// The last upstream response attached to this error, if any.
    #[must_use]
    pub fn last_response(&self) -> Option<&RpcResponse> {
        match self {
            Self::RetriableResponse(resp) => Some(resp),
            Self::Upstream {
                response: Some(resp),
                ..
            } => Some(resp),
            _ => None,
        }
    }

    /// The HTTP status associated with this error; `0` when there is none
    /// (transport failures, pre-upstream errors).
    #[must_use]
    pub fn last_status(&self) -> u16 {
        match self {
            Self::Upstream { status, .. } => *status,
            _ => 0,
        }
    }
}
