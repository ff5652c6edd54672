//! Error types shared by connectors.

use std::fmt;
use thiserror::Error;

/// Boxed error used for sources and delivery outcomes.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error categories tell the host what to do next.
///
/// # Categories
///
/// - **Transient**: call again (read timeout, dial failure, publish failure)
/// - **Permanent**: fix configuration or call order before retrying
/// - **Terminal**: the connector is closed, stop calling it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Transient,
    Permanent,
    Terminal,
}

impl ErrorCategory {
    /// Whether repeating the same call can succeed without intervention.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::Transient)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Transient => write!(f, "transient"),
            ErrorCategory::Permanent => write!(f, "permanent"),
            ErrorCategory::Terminal => write!(f, "terminal"),
        }
    }
}

/// Error returned by [`Service`](crate::Service), [`Async`](crate::Async)
/// and [`AsyncSink`](crate::AsyncSink) implementations.
#[derive(Debug, Error)]
pub enum ConnectorError {
    /// No connection handle is present
    #[error("not connected to target source or sink")]
    NotConnected,

    /// The caller's deadline expired; nothing was consumed
    #[error("action timed out")]
    Timeout,

    /// The connector was shut down and will not deliver again
    #[error("type was closed")]
    Closed,

    /// A per-call argument was rejected
    #[error("validation error: {0}")]
    Validation(String),

    /// Configuration could not be turned into a usable connector
    #[error("configuration error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Dial, discovery or health check failure
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// The transport rejected a publish
    #[error("publish error: {0}")]
    Publish(String),
}

impl ConnectorError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Configuration error whose message is taken from `source`.
    pub fn config_from(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Config {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Connection error whose message is taken from `source`.
    pub fn connection_from(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Connection {
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ConnectorError::Timeout => ErrorCategory::Transient,
            ConnectorError::Connection { .. } => ErrorCategory::Transient,
            ConnectorError::Publish(_) => ErrorCategory::Transient,

            ConnectorError::NotConnected => ErrorCategory::Permanent,
            ConnectorError::Validation(_) => ErrorCategory::Permanent,
            ConnectorError::Config { .. } => ErrorCategory::Permanent,

            ConnectorError::Closed => ErrorCategory::Terminal,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, ConnectorError::Timeout)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, ConnectorError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_error_category() {
        assert_eq!(ConnectorError::Timeout.category(), ErrorCategory::Transient);
        assert_eq!(
            ConnectorError::connection("dial tcp 127.0.0.1:4150: connection refused").category(),
            ErrorCategory::Transient
        );
        assert_eq!(ConnectorError::NotConnected.category(), ErrorCategory::Permanent);
        assert_eq!(
            ConnectorError::validation("topic is required").category(),
            ErrorCategory::Permanent
        );
        assert_eq!(ConnectorError::Closed.category(), ErrorCategory::Terminal);
    }

    #[test]
    fn test_is_retryable() {
        assert!(ConnectorError::Timeout.category().is_retryable());
        assert!(!ConnectorError::config("bad").category().is_retryable());
        assert!(!ConnectorError::Closed.category().is_retryable());
    }

    #[test]
    fn test_config_from_keeps_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = ConnectorError::config_from(io);

        assert_eq!(err.to_string(), "configuration error: no such file");
        assert!(err.source().is_some());
    }
}
