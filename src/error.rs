//! Failure taxonomy for access checks.
//!
//! A missing course or subscription row is not an error: the collaborators
//! report it as `None` or an empty list. Only a store that cannot answer
//! produces a [`CheckError`], and every caller turns it into a denial.

use std::fmt::Display;

use axum::http::StatusCode;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CheckError {
    /// The backing store or network could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    /// The check needs an identity and none is signed in.
    #[error("no authenticated identity")]
    Unauthenticated,
}

impl From<anyhow::Error> for CheckError {
    fn from(err: anyhow::Error) -> Self {
        CheckError::Transport(err.to_string())
    }
}

pub type CheckResult<T> = Result<T, CheckError>;

/// Body sent for any failure whose detail stays in the logs.
pub const INTERNAL_ERROR: &str = "internal_error";

/// Logs a store or crypto failure and hands the client a fixed 500.
pub fn internal_error(err: impl Display) -> (StatusCode, String) {
    error!(%err, "request failed");
    (StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR.to_string())
}

/// Same for upstream provider failures, answered with 502.
pub fn upstream_error(err: impl Display) -> (StatusCode, String) {
    error!(%err, "upstream request failed");
    (StatusCode::BAD_GATEWAY, "upstream_error".to_string())
}
