use std::time::Duration;
use thiserror::Error;

/// Wording the daemons use when a route query comes back empty.
const NO_ROUTE_MARKERS: &[&str] = &[
    "unable to find a path to destination",
    "route not found",
    "Could not find a route",
    "no route found",
];

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("pattern '{pattern}' not found in {prefix} output after {timeout:?}")]
    PatternTimeout {
        prefix: String,
        pattern: String,
        timeout: Duration,
        /// Lines appended while the wait was outstanding.
        recent: Vec<String>,
    },

    #[error("{prefix} exited while waiting for pattern '{pattern}'")]
    ProcessTerminated {
        prefix: String,
        pattern: String,
        recent: Vec<String>,
    },

    #[error("invalid log pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("rpc call '{method}' failed: {message}")]
    Rpc { method: String, message: String },

    #[error("payment failed: {detail}")]
    PaymentFailed { detail: String },

    #[error("{implementation} does not support '{operation}'")]
    Unsupported {
        implementation: &'static str,
        operation: &'static str,
    },

    #[error("timed out after {timeout:?} waiting for {what}")]
    PollTimeout { what: String, timeout: Duration },

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HarnessError {
    pub fn rpc(method: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rpc {
            method: method.into(),
            message: message.into(),
        }
    }

    /// Errors after which the scenario cannot continue.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Spawn { .. } | Self::ProcessTerminated { .. })
    }

    /// Errors a caller may reasonably retry with a longer deadline.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::PatternTimeout { .. } | Self::PollTimeout { .. } | Self::Rpc { .. }
        )
    }

    /// True when the daemon reported that no route exists (yet).
    pub fn is_no_route(&self) -> bool {
        match self {
            Self::Rpc { message, .. } | Self::PaymentFailed { detail: message } => {
                let lower = message.to_lowercase();
                NO_ROUTE_MARKERS
                    .iter()
                    .any(|marker| lower.contains(&marker.to_lowercase()))
            }
            _ => false,
        }
    }

    /// Captured process output attached to the error, if any.
    pub fn captured_log(&self) -> &[String] {
        match self {
            Self::PatternTimeout { recent, .. } | Self::ProcessTerminated { recent, .. } => recent,
            _ => &[],
        }
    }
}

pub type Result<T> = std::result::Result<T, HarnessError>;
