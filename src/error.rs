//! Error types for the resilience core

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the resilience core
pub type Result<T> = std::result::Result<T, Error>;

/// Resilience core errors
#[derive(Error, Debug)]
pub enum Error {
    /// Circuit breaker is not permitting calls
    #[error("Circuit '{name}' is open, retry in {}ms", .retry_after.as_millis())]
    CircuitOpen {
        /// Breaker (dependency) name
        name: String,
        /// Time left until the breaker moves to half-open
        retry_after: Duration,
    },

    /// All retry attempts failed
    #[error("Retries exhausted for '{name}' after {attempts} attempts: {source}")]
    RetryExhausted {
        /// Retry policy name
        name: String,
        /// Number of attempts made
        attempts: u32,
        /// Last underlying failure
        #[source]
        source: Box<Error>,
    },

    /// No connection slot became free in time
    #[error("Pool '{pool}' timed out after {}ms waiting for a connection slot", .waited.as_millis())]
    PoolTimeout {
        /// Pool name
        pool: String,
        /// Time spent waiting
        waited: Duration,
    },

    /// Pool was closed
    #[error("Pool '{0}' is closed")]
    PoolClosed(String),

    /// Connection could not be established or was lost
    #[error("Connection error: {0}")]
    Connection(String),

    /// Operation timed out
    #[error("Operation timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// Designated transient failure reported by the operation
    #[error("Transient error: {0}")]
    Transient(String),

    /// Caller-visible deadline of a whole adapter call elapsed
    #[error("Deadline of {}ms exceeded", .0.as_millis())]
    DeadlineExceeded(Duration),

    /// Non-retryable failure raised by the operation itself
    #[error("Application error: {0}")]
    Application(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Health check not registered
    #[error("Health check not found: {0}")]
    CheckNotFound(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create an application (non-retryable) error
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Whether a retry policy should try again after this error
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Connection(_)
            | Self::Timeout(_)
            | Self::Transient(_)
            | Self::PoolTimeout { .. } => true,
            Self::Http(e) => e.is_connect() || e.is_timeout(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::Interrupted
            ),
            _ => false,
        }
    }

    /// Whether this error was produced by the resilience layer rather than
    /// by the wrapped operation
    #[must_use]
    pub fn is_resilience_error(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. }
                | Self::RetryExhausted { .. }
                | Self::PoolTimeout { .. }
                | Self::PoolClosed(_)
                | Self::DeadlineExceeded(_)
        )
    }

    /// Whether an adapter may substitute a fallback value for this error
    #[must_use]
    pub fn allows_fallback(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::RetryExhausted { .. } | Self::DeadlineExceeded(_)
        )
    }

    /// Number of failures this outcome counts for in a circuit breaker.
    ///
    /// An exhausted retry episode counts once per failed attempt.
    #[must_use]
    pub fn failure_weight(&self) -> u32 {
        match self {
            Self::RetryExhausted { attempts, .. } => (*attempts).max(1),
            _ => 1,
        }
    }

    /// Innermost error, unwrapping retry exhaustion
    #[must_use]
    pub fn root_cause(&self) -> &Error {
        match self {
            Self::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(Error::connection("refused").is_retryable());
        assert!(Error::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(Error::Transient("429".into()).is_retryable());
        assert!(
            Error::PoolTimeout {
                pool: "p".into(),
                waited: Duration::from_millis(5)
            }
            .is_retryable()
        );
        assert!(!Error::application("bad symbol").is_retryable());
        assert!(!Error::PoolClosed("p".into()).is_retryable());
        assert!(!Error::DeadlineExceeded(Duration::from_secs(1)).is_retryable());
        assert!(Error::Io(io::Error::from(io::ErrorKind::ConnectionReset)).is_retryable());
        assert!(!Error::Io(io::Error::from(io::ErrorKind::NotFound)).is_retryable());
    }

    #[test]
    fn test_failure_weight_and_root_cause() {
        let err = Error::RetryExhausted {
            name: "binance".into(),
            attempts: 3,
            source: Box::new(Error::connection("reset")),
        };
        assert_eq!(err.failure_weight(), 3);
        assert!(matches!(err.root_cause(), Error::Connection(_)));
        assert!(err.allows_fallback());
        assert!(err.is_resilience_error());

        let app = Error::application("rejected");
        assert_eq!(app.failure_weight(), 1);
        assert!(!app.allows_fallback());
        assert!(!app.is_resilience_error());
    }

    #[test]
    fn test_display_messages() {
        let err = Error::CircuitOpen {
            name: "redis".into(),
            retry_after: Duration::from_millis(1500),
        };
        assert_eq!(err.to_string(), "Circuit 'redis' is open, retry in 1500ms");

        let err = Error::PoolTimeout {
            pool: "http".into(),
            waited: Duration::from_millis(250),
        };
        assert!(err.to_string().contains("250ms"));
    }
}
