//! Error taxonomy for the tunnel system.
//!
//! Every observable failure falls into one of a small set of categories;
//! the reverse proxy maps them onto HTTP status codes and the server
//! decides retryability from them.

use thiserror::Error;

/// Errors surfaced by the tunnel core.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Invalid or missing configuration; fatal at startup.
    #[error("configuration error: {0}")]
    Config(String),

    /// Authentication failed. The message is for logs only; peers never
    /// learn which sub-condition failed.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// TCP- or SSH-layer I/O failure affecting a single connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// The requested device has no live tunnel.
    #[error("device not connected: {0}")]
    NotConnected(String),

    /// Malformed envelope or unknown command type.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Port range exhausted or channel limit reached.
    #[error("resource exhausted: {0}")]
    Resource(String),

    /// A command reply or keepalive missed its deadline.
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    /// The device answered `success: false`; the message is passed
    /// through verbatim.
    #[error("device error: {0}")]
    Device(String),
}

/// Result type using [`TunnelError`].
pub type TunnelResult<T> = Result<T, TunnelError>;

/// Coarse category of a [`TunnelError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Auth,
    Transport,
    NotConnected,
    Protocol,
    Resource,
    Timeout,
    Device,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorCategory::Config => write!(f, "config"),
            ErrorCategory::Auth => write!(f, "auth"),
            ErrorCategory::Transport => write!(f, "transport"),
            ErrorCategory::NotConnected => write!(f, "not_connected"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Resource => write!(f, "resource"),
            ErrorCategory::Timeout => write!(f, "timeout"),
            ErrorCategory::Device => write!(f, "device"),
        }
    }
}

impl TunnelError {
    /// The category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            TunnelError::Config(_) => ErrorCategory::Config,
            TunnelError::Auth(_) => ErrorCategory::Auth,
            TunnelError::Transport(_) => ErrorCategory::Transport,
            TunnelError::NotConnected(_) => ErrorCategory::NotConnected,
            TunnelError::Protocol(_) => ErrorCategory::Protocol,
            TunnelError::Resource(_) => ErrorCategory::Resource,
            TunnelError::Timeout(_) => ErrorCategory::Timeout,
            TunnelError::Device(_) => ErrorCategory::Device,
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TunnelError::Transport(_) | TunnelError::NotConnected(_) | TunnelError::Timeout(_)
        )
    }

    /// The HTTP status code the proxy reports for this error.
    pub fn http_status(&self) -> u16 {
        match self {
            TunnelError::Config(_) => 500,
            TunnelError::Auth(_) => 401,
            TunnelError::Transport(_) => 502,
            TunnelError::NotConnected(_) => 502,
            TunnelError::Protocol(_) => 400,
            TunnelError::Resource(_) => 503,
            TunnelError::Timeout(_) => 504,
            TunnelError::Device(_) => 502,
        }
    }
}

impl From<std::io::Error> for TunnelError {
    fn from(err: std::io::Error) -> Self {
        TunnelError::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for TunnelError {
    fn from(err: serde_json::Error) -> Self {
        TunnelError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_category_display() {
        assert_eq!(
            TunnelError::Auth("bad key".into()).category().to_string(),
            "auth"
        );
        assert_eq!(
            TunnelError::Resource("no port".into())
                .category()
                .to_string(),
            "resource"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(TunnelError::Transport("reset".into()).is_retryable());
        assert!(TunnelError::Timeout("keepalive".into()).is_retryable());
        assert!(TunnelError::NotConnected("dev-A".into()).is_retryable());
        assert!(!TunnelError::Auth("unknown device".into()).is_retryable());
        assert!(!TunnelError::Protocol("bad envelope".into()).is_retryable());
    }

    #[test]
    fn test_http_status_mapping() {
        assert_eq!(TunnelError::Auth("x".into()).http_status(), 401);
        assert_eq!(TunnelError::NotConnected("x".into()).http_status(), 502);
        assert_eq!(TunnelError::Timeout("x".into()).http_status(), 504);
        assert_eq!(TunnelError::Resource("x".into()).http_status(), 503);
    }
}
