// src/error.rs
//! Error taxonomy shared by the poll path and the webhook path.
//!
//! Self-throttling has no variant: the scheduler resolves it by waiting,
//! so callers never observe it as an error.

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Upstream answered 429. The unit of work is skipped until the next trigger.
    #[error("provider rate limited on endpoint '{endpoint}'")]
    ProviderRateLimited { endpoint: String },

    /// Network failure, 5xx or any other upstream rejection.
    #[error("provider error on endpoint '{endpoint}': {message}")]
    Provider { endpoint: String, message: String },

    #[error("request on endpoint '{endpoint}' timed out after {timeout_ms}ms")]
    RequestTimeout { endpoint: String, timeout_ms: u64 },

    /// Self-imposed wait for a fresh rate window would exceed the configured ceiling.
    #[error("scheduler wait of {wait_ms}ms on endpoint '{endpoint}' exceeds ceiling of {max_wait_ms}ms")]
    SchedulerTimeout {
        endpoint: String,
        wait_ms: u64,
        max_wait_ms: u64,
    },

    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("invalid item id '{0}': expected a non-empty decimal string")]
    InvalidId(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn provider(endpoint: impl Into<String>, message: impl ToString) -> Self {
        Error::Provider {
            endpoint: endpoint.into(),
            message: message.to_string(),
        }
    }

    pub fn persistence(message: impl ToString) -> Self {
        Error::Persistence(message.to_string())
    }

    /// Errors that are resolved by simply waiting for the next tick or delivery.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::ProviderRateLimited { .. }
                | Error::Provider { .. }
                | Error::RequestTimeout { .. }
                | Error::SchedulerTimeout { .. }
                | Error::Persistence(_)
        )
    }

    /// Short stable label for logs and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::ProviderRateLimited { .. } => "provider_rate_limited",
            Error::Provider { .. } => "provider_error",
            Error::RequestTimeout { .. } => "request_timeout",
            Error::SchedulerTimeout { .. } => "scheduler_timeout",
            Error::Persistence(_) => "persistence",
            Error::MalformedPayload(_) => "malformed_payload",
            Error::InvalidId(_) => "invalid_id",
            Error::Config(_) => "config",
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Persistence(e.to_string())
    }
}
