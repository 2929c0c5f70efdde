//! Error taxonomy for the gateway (spec §7).
//!
//! Every public verb returns [`GatewayResult<T>`]. The HTTP adapter
//! (`src/http.rs`) maps each variant to the status codes in spec §6.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// The error taxonomy from spec §7.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Bad input, e.g. a zero amount or malformed descriptor.
    #[error("validation: {0}")]
    Validation(String),

    /// Intent, token, or address not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// The requested operation is illegal for the entity's current state,
    /// e.g. assigning an address to an expired intent.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// HMAC signature mismatch on a magic-link token.
    #[error("auth failure: {0}")]
    Auth(String),

    /// A magic-link token's `exp` has passed.
    #[error("expired: {0}")]
    Expired(String),

    /// A uniqueness constraint would be violated, e.g. a duplicate
    /// `(txid,vout)` upsert racing another writer, or a derivation-index
    /// race between two concurrent `ensureAssigned` calls.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A transient failure: RPC timeout, indexer 5xx, DB serialization
    /// failure. Safe to retry.
    #[error("transient: {0}")]
    Transient(String),

    /// A non-retryable failure: RPC auth failure, malformed descriptor.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl GatewayError {
    /// True if the failure is plausibly resolved by retrying later (used by
    /// the reconciler's backoff loop and the scheduler's error handling,
    /// spec §7).
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::Transient(_))
    }
}

/// Classifies a [`reqwest::Error`] the same way the teacher's RPC client
/// classifies connection failures: decode/connect/timeout/5xx are
/// transient, everything else (builder, redirect, 4xx status) is fatal.
impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_decode() {
            GatewayError::Transient(err.to_string())
        } else if err.is_status() {
            let status = err.status().map(|s| s.as_u16()).unwrap_or(0);
            if status == 401 || status == 403 {
                GatewayError::Fatal(format!("auth rejected by remote: {err}"))
            } else if status >= 500 {
                GatewayError::Transient(err.to_string())
            } else {
                GatewayError::Validation(err.to_string())
            }
        } else {
            GatewayError::Fatal(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Transient(format!("malformed response: {err}"))
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for GatewayError {
    fn from(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                GatewayError::Conflict(db_err.message().to_string())
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                GatewayError::Transient(err.to_string())
            }
            sqlx::Error::RowNotFound => GatewayError::NotFound("row not found".to_string()),
            _ => GatewayError::Transient(err.to_string()),
        }
    }
}
