use std::path::PathBuf;

use thiserror::Error;

use crate::monitor::TransportError;

/// Errors surfaced by the hook.
///
/// Only [`HookError::Network`] is worth retrying. Everything else means the
/// request or the configuration is wrong and will stay wrong.
#[derive(Error, Debug)]
pub enum HookError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("monitoring service rejected credentials (HTTP {status}): {body}")]
    Auth { status: u16, body: String },

    #[error("monitoring service rejected request (HTTP {status}): {body}")]
    Validation { status: u16, body: String },

    #[error("monitoring service unreachable: {0}")]
    Network(String),

    #[error("failed to read log file {}: {source}", path.display())]
    LogRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("host identity unavailable: {0}")]
    HostIdentity(String),

    #[error("phase {phase} requires a target vmid")]
    MissingTarget { phase: String },
}

impl HookError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, HookError::Network(_))
    }

    /// Map an HTTP status code to an error, or `None` for 2xx.
    pub fn from_status(status: u16, body: impl Into<String>) -> Option<Self> {
        let body = body.into();
        match status {
            200..=299 => None,
            401 | 403 => Some(HookError::Auth { status, body }),
            408 | 429 => Some(HookError::Network(format!("HTTP {}: {}", status, body))),
            400..=499 => Some(HookError::Validation { status, body }),
            _ => Some(HookError::Network(format!("HTTP {}: {}", status, body))),
        }
    }
}

impl From<TransportError> for HookError {
    fn from(err: TransportError) -> Self {
        HookError::Network(err.to_string())
    }
}

impl From<figment::Error> for HookError {
    fn from(err: figment::Error) -> Self {
        HookError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(HookError::from_status(200, "OK").is_none());
        assert!(HookError::from_status(201, "").is_none());
        assert!(matches!(
            HookError::from_status(401, "bad key"),
            Some(HookError::Auth { status: 401, .. })
        ));
        assert!(matches!(
            HookError::from_status(403, ""),
            Some(HookError::Auth { .. })
        ));
        assert!(matches!(
            HookError::from_status(400, "invalid json"),
            Some(HookError::Validation { status: 400, .. })
        ));
        assert!(matches!(
            HookError::from_status(404, "not found"),
            Some(HookError::Validation { .. })
        ));
        assert!(matches!(
            HookError::from_status(429, ""),
            Some(HookError::Network(_))
        ));
        assert!(matches!(
            HookError::from_status(503, "maintenance"),
            Some(HookError::Network(_))
        ));
    }

    #[test]
    fn test_only_network_is_retryable() {
        assert!(HookError::Network("refused".into()).is_retryable());
        assert!(!HookError::Config("x".into()).is_retryable());
        assert!(
            !HookError::Auth {
                status: 401,
                body: String::new()
            }
            .is_retryable()
        );
        assert!(
            !HookError::Validation {
                status: 422,
                body: String::new()
            }
            .is_retryable()
        );
    }
}
