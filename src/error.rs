use thiserror::Error;

use crate::types::ActionKind;

/// Failures raised by the browser driver itself.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("no active page; the browser has not been started")]
    NoActivePage,
    #[error("browser launch failed: {0}")]
    Launch(String),
    #[error("browser protocol call failed: {0}")]
    Protocol(String),
    #[error("{operation} timed out after {millis} ms")]
    Timeout { operation: &'static str, millis: u64 },
}

impl DriverError {
    pub fn protocol(err: impl std::fmt::Display) -> Self {
        DriverError::Protocol(err.to_string())
    }
}

/// Failures surfaced by the interaction layer.
///
/// Only an absent page or a tier that was attempted and failed without any
/// later tier rescuing it end up here; inapplicable tiers are never errors.
#[derive(Debug, Error)]
pub enum InteractionError {
    #[error("no active page")]
    NoActivePage,
    #[error("{kind} could not be performed: {cause}")]
    Exhausted { kind: ActionKind, cause: DriverError },
}

impl InteractionError {
    /// Maps a driver failure for `kind`, keeping page absence distinct.
    pub fn from_driver(kind: ActionKind, err: DriverError) -> Self {
        match err {
            DriverError::NoActivePage => InteractionError::NoActivePage,
            cause => InteractionError::Exhausted { kind, cause },
        }
    }
}

/// Failures of the decision service call, all of which end the session as a
/// synthetic `fail` decision.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("decision request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("decision service returned {status}: {message}")]
    Status { status: u16, message: String },
    #[error("decision service timed out after {millis} ms")]
    Timeout { millis: u64 },
    #[error("decision service returned no content")]
    EmptyContent,
    #[error("decision payload is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("decision payload rejected: {0}")]
    Invalid(String),
}

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("report io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("report serialization failed: {0}")]
    Json(#[from] serde_json::Error),
}
