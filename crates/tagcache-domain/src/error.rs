//! Error handling types

use thiserror::Error;

/// Result type alias for operations that can fail
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the tagcache workspace
///
/// Variants fall into three groups with different handling expectations:
///
/// - **Bind-time faults** ([`Error::Configuration`]): unusable substrate
///   location, missing required option, path too long. Fatal, surfaced
///   before any cache operation runs.
/// - **Caller bugs** ([`Error::InvalidIdentifier`], [`Error::InvalidTag`],
///   [`Error::InvalidData`], [`Error::Frozen`]): programming errors, fatal,
///   never retried.
/// - **Substrate errors** ([`Error::Substrate`]): transient I/O, SQL, or
///   network failures. Recoverable by the caller; this layer performs no
///   automatic retry.
///
/// Cache misses are not errors. `get` returns `Ok(None)` and `has`/`remove`
/// return `Ok(false)` for missing or expired entries.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration or bind-time error
    #[error("Configuration error: {message}")]
    Configuration {
        /// Description of the configuration error
        message: String,
        /// Optional source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Entry identifier rejected by the shared validator
    #[error("Invalid entry identifier: {identifier:?}")]
    InvalidIdentifier {
        /// The rejected identifier
        identifier: String,
    },

    /// Tag rejected by the shared validator
    #[error("Invalid tag: {tag:?}")]
    InvalidTag {
        /// The rejected tag
        tag: String,
    },

    /// Payload rejected at `set` time
    #[error("Invalid data: {message}")]
    InvalidData {
        /// Description of the invalid payload
        message: String,
    },

    /// Mutating operation attempted on a frozen cache
    #[error("Cache {identity:?} is frozen, {operation} is not allowed")]
    Frozen {
        /// Identity of the frozen cache
        identity: String,
        /// The rejected operation
        operation: &'static str,
    },

    /// Substrate operation error (filesystem, database, key-value server)
    #[error("Substrate error: {message}")]
    Substrate {
        /// Description of the substrate error
        message: String,
        /// Optional source error
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
        /// Whether the caller may reasonably retry the operation
        retryable: bool,
    },
}

impl Error {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    /// Create a configuration error with source
    pub fn configuration_with_source<
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    >(
        message: S,
        source: E,
    ) -> Self {
        Self::Configuration {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create an invalid identifier error
    pub fn invalid_identifier<S: Into<String>>(identifier: S) -> Self {
        Self::InvalidIdentifier {
            identifier: identifier.into(),
        }
    }

    /// Create an invalid tag error
    pub fn invalid_tag<S: Into<String>>(tag: S) -> Self {
        Self::InvalidTag { tag: tag.into() }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData {
            message: message.into(),
        }
    }

    /// Create a frozen-cache violation error
    pub fn frozen<S: Into<String>>(identity: S, operation: &'static str) -> Self {
        Self::Frozen {
            identity: identity.into(),
            operation,
        }
    }

    /// Create a retryable substrate error
    pub fn substrate<S: Into<String>>(message: S) -> Self {
        Self::Substrate {
            message: message.into(),
            source: None,
            retryable: true,
        }
    }

    /// Create a retryable substrate error with source
    pub fn substrate_with_source<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        message: S,
        source: E,
    ) -> Self {
        Self::Substrate {
            message: message.into(),
            source: Some(Box::new(source)),
            retryable: true,
        }
    }

    /// Whether the caller may retry the failed operation
    ///
    /// Only substrate errors are retryable; configuration errors and caller
    /// bugs never are.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Substrate { retryable: true, .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(Error::substrate("connection reset").is_retryable());
        assert!(!Error::configuration("missing server list").is_retryable());
        assert!(!Error::invalid_identifier("../etc").is_retryable());
        assert!(!Error::frozen("PageCache", "set").is_retryable());
    }

    #[test]
    fn frozen_error_names_operation() {
        let err = Error::frozen("PageCache", "remove");
        assert!(err.to_string().contains("remove"));
        assert!(err.to_string().contains("PageCache"));
    }
}
