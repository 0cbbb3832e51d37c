//! Error taxonomy for the remote-store client.
//!
//! Each variant maps to one recovery action: `AuthRequired` and `Transport`
//! are retried by the client, everything else surfaces immediately.

use std::io;

use thiserror::Error;

use tkv_common::TkvError;

/// Result type for the remote-store client.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the remote-store client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Malformed reply framing.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server understood the command and rejected it.
    #[error("server error: {0}")]
    Server(String),

    /// The server rejected the session; a fresh login is needed.
    #[error("authentication required: {0}")]
    AuthRequired(String),

    /// Socket-level failure while connecting, writing or reading.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// Every pooled connection is lent out and the pool is at its ceiling.
    #[error("connection pool exhausted: {max} connections in use")]
    PoolExhausted { max: usize },

    /// A reply could not be turned into the requested type.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// The configured server address does not resolve.
    #[error("invalid address: {0}")]
    InvalidAddress(String),

    /// The options document could not be parsed.
    #[error("invalid options: {0}")]
    Config(String),

    /// The client (or its pool) has been closed.
    #[error("client closed")]
    Closed,

    /// The retry bound was hit; `source` is the last failure.
    #[error("gave up after {attempts} attempts: {source}")]
    RetriesExhausted {
        attempts: usize,
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// Builds a server-side error from reply text, detecting session rejection.
    pub fn from_server_text(text: impl Into<String>) -> Self {
        let text = text.into();
        let upper = text.to_ascii_uppercase();
        if upper.contains("AUTH") || upper.starts_with("WRONGPASS") {
            ClientError::AuthRequired(text)
        } else {
            ClientError::Server(text)
        }
    }

    /// Returns true when the client may retry the call after recovery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ClientError::AuthRequired(_) | ClientError::Transport(_))
    }

    /// Returns a short, stable name for the variant (used in log fields).
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Protocol(_) => "protocol",
            ClientError::Server(_) => "server",
            ClientError::AuthRequired(_) => "auth_required",
            ClientError::Transport(_) => "transport",
            ClientError::PoolExhausted { .. } => "pool_exhausted",
            ClientError::Conversion(_) => "conversion",
            ClientError::InvalidAddress(_) => "invalid_address",
            ClientError::Config(_) => "config",
            ClientError::Closed => "closed",
            ClientError::RetriesExhausted { .. } => "retries_exhausted",
        }
    }
}

impl From<TkvError> for ClientError {
    fn from(err: TkvError) -> Self {
        match err {
            TkvError::PoolExhausted { max } => ClientError::PoolExhausted { max },
            TkvError::Create(message) => ClientError::Transport(io::Error::new(io::ErrorKind::Other, message)),
            TkvError::Closed => ClientError::Closed,
            TkvError::Serialize(message) | TkvError::Conversion(message) => ClientError::Conversion(message),
            TkvError::Config(message) => ClientError::Config(message),
        }
    }
}

impl From<serde_json::Error> for ClientError {
    fn from(err: serde_json::Error) -> Self {
        ClientError::Conversion(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_auth_rejections() {
        assert!(matches!(
            ClientError::from_server_text("NOAUTH Authentication required."),
            ClientError::AuthRequired(_)
        ));
        assert!(matches!(
            ClientError::from_server_text("WRONGPASS invalid username-password pair"),
            ClientError::AuthRequired(_)
        ));
        assert!(matches!(
            ClientError::from_server_text("ERR unknown command 'FOO'"),
            ClientError::Server(_)
        ));
    }

    #[test]
    fn only_auth_and_transport_retry() {
        assert!(ClientError::AuthRequired("NOAUTH".into()).is_retryable());
        assert!(ClientError::Transport(io::ErrorKind::BrokenPipe.into()).is_retryable());
        assert!(!ClientError::Server("ERR".into()).is_retryable());
        assert!(!ClientError::PoolExhausted { max: 1 }.is_retryable());
        assert!(!ClientError::Conversion("bad".into()).is_retryable());
    }

    #[test]
    fn pool_errors_keep_their_meaning() {
        let err: ClientError = TkvError::PoolExhausted { max: 8 }.into();
        assert!(matches!(err, ClientError::PoolExhausted { max: 8 }));
        let err: ClientError = TkvError::Closed.into();
        assert_eq!(err.kind(), "closed");
    }

    #[test]
    fn retries_exhausted_reports_last_failure() {
        let err = ClientError::RetriesExhausted {
            attempts: 3,
            source: Box::new(ClientError::AuthRequired("NOAUTH".into())),
        };
        assert_eq!(err.to_string(), "gave up after 3 attempts: authentication required: NOAUTH");
        assert!(std::error::Error::source(&err).is_some());
    }
}
