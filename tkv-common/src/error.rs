//! # Error Types
//!
//! Purpose: A single error enum for the local side of TierKV (pool, local TTL
//! cache, facade). Remote-store failures have their own taxonomy in
//! `tkv-client`.
//!
//! ## Design Principles
//! 1. **Closed Set**: Callers match on variants, never on message text.
//! 2. **Cheap to Compare**: Variants carry owned strings so the enum stays
//!    `Clone + PartialEq` for tests.
//! 3. **No Retry Here**: Every variant surfaces immediately to the caller.

use thiserror::Error;

/// Result alias used across the local components.
pub type TkvResult<T> = Result<T, TkvError>;

/// Errors raised by the pool, the local cache and the facade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TkvError {
    /// No pooled resource is free and the pool is at its ceiling.
    #[error("pool exhausted: {max} resources already lent out")]
    PoolExhausted { max: usize },

    /// The pool factory failed to construct a new resource.
    #[error("failed to create pooled resource: {0}")]
    Create(String),

    /// The pool or cache has been closed.
    #[error("resource closed")]
    Closed,

    /// A value could not be serialized before storage.
    #[error("serialization failed: {0}")]
    Serialize(String),

    /// A stored value could not be turned back into the requested type.
    #[error("conversion failed: {0}")]
    Conversion(String),

    /// A configuration document could not be parsed.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl TkvError {
    /// Returns a short, stable name for the variant (used in log fields).
    pub fn kind(&self) -> &'static str {
        match self {
            TkvError::PoolExhausted { .. } => "pool_exhausted",
            TkvError::Create(_) => "create",
            TkvError::Closed => "closed",
            TkvError::Serialize(_) => "serialize",
            TkvError::Conversion(_) => "conversion",
            TkvError::Config(_) => "config",
        }
    }
}

impl From<serde_json::Error> for TkvError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_syntax() || err.is_eof() {
            TkvError::Conversion(err.to_string())
        } else {
            TkvError::Serialize(err.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_mentions_ceiling() {
        let err = TkvError::PoolExhausted { max: 4 };
        assert_eq!(err.to_string(), "pool exhausted: 4 resources already lent out");
        assert_eq!(err.kind(), "pool_exhausted");
    }

    #[test]
    fn json_syntax_error_maps_to_conversion() {
        let err: TkvError = serde_json::from_str::<u32>("not json").unwrap_err().into();
        assert!(matches!(err, TkvError::Conversion(_)));
    }
}
