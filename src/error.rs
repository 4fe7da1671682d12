//! Error taxonomy shared by the pool, the fetcher and the lifecycle controller.

use std::fmt;

use thiserror::Error;

use crate::reservation::LifecycleState;

/// Normalized failure kinds for remote configuration retrieval.
///
/// Every scheme handler maps its protocol-specific failures onto these so
/// callers never branch on the transfer protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    NotFound,
    ServerError,
    Unreachable,
    AuthFailed,
    Timeout,
    UnsupportedScheme,
}

impl FetchErrorKind {
    /// Transient kinds are the only ones the lifecycle controller retries.
    pub fn is_transient(self) -> bool {
        matches!(self, FetchErrorKind::Unreachable | FetchErrorKind::Timeout)
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FetchErrorKind::NotFound => "not found",
            FetchErrorKind::ServerError => "server error",
            FetchErrorKind::Unreachable => "unreachable",
            FetchErrorKind::AuthFailed => "authentication failed",
            FetchErrorKind::Timeout => "timed out",
            FetchErrorKind::UnsupportedScheme => "unsupported scheme",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("connection to appliance failed: {0}")]
    Connection(String),

    #[error("failed to fetch {uri} ({kind}): {message}")]
    RemoteFetch {
        kind: FetchErrorKind,
        uri: String,
        message: String,
    },

    #[error("resource conflict: {0}")]
    ResourceConflict(String),

    #[error("appliance rejected command '{command}': {output}")]
    ApplianceCommand { command: String, output: String },

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("cannot {operation} while reservation is {state}")]
    InvalidState {
        operation: &'static str,
        state: LifecycleState,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("management API error: {0}")]
    ManagementApi(String),
}

impl DriverError {
    pub fn fetch(kind: FetchErrorKind, uri: &str, message: impl Into<String>) -> Self {
        DriverError::RemoteFetch {
            kind,
            uri: uri.to_string(),
            message: message.into(),
        }
    }

    /// The fetch failure kind, if this is a fetch error.
    pub fn fetch_kind(&self) -> Option<FetchErrorKind> {
        match self {
            DriverError::RemoteFetch { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether a bounded retry of a fetch is permitted for this error.
    pub fn is_transient_fetch(&self) -> bool {
        self.fetch_kind().is_some_and(FetchErrorKind::is_transient)
    }
}

pub type DriverResult<T> = Result<T, DriverError>;
