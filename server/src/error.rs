//! Error types for the Parley server.
//!
//! Module-local failures have their own enums next to the code that produces
//! them ([`AuthError`], [`DeliveryError`], [`BroadcastError`]). This module
//! defines configuration errors and the top-level [`ServerError`] that wraps
//! everything a caller of the crate may need to surface.
//!
//! # Error Types
//!
//! - [`ConfigError`] - Configuration-related errors (missing values, parse failures)
//! - [`ServerError`] - Top-level server errors encompassing all failure modes
//!
//! Per-connection conditions that are *not* errors from the server's point of
//! view (takeover, heartbeat timeout, a failed delivery to one peer) are
//! described by [`DisconnectReason`](crate::types::DisconnectReason) and are
//! only ever logged.
//!
//! [`AuthError`]: crate::auth::AuthError
//! [`DeliveryError`]: crate::connection::DeliveryError
//! [`BroadcastError`]: crate::broadcast::BroadcastError

use thiserror::Error;

use crate::auth::AuthError;
use crate::broadcast::BroadcastError;

/// Errors that occur during configuration loading and validation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("invalid value for {var}: {message}")]
    InvalidValue {
        /// The environment variable that has an invalid value.
        var: String,
        /// Description of why the value is invalid.
        message: String,
    },
}

impl ConfigError {
    /// Creates a new missing configuration error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use parley_server::error::ConfigError;
    ///
    /// let err = ConfigError::missing("PARLEY_JWT_SECRET");
    /// assert!(matches!(err, ConfigError::MissingEnvVar(_)));
    /// ```
    pub fn missing(var: impl Into<String>) -> Self {
        Self::MissingEnvVar(var.into())
    }

    /// Creates a new invalid configuration error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use parley_server::error::ConfigError;
    ///
    /// let err = ConfigError::invalid("PORT", "must be a number between 1 and 65535");
    /// assert!(matches!(err, ConfigError::InvalidValue { .. }));
    /// ```
    pub fn invalid(var: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            var: var.into(),
            message: message.into(),
        }
    }
}

/// Top-level error type for the Parley server.
///
/// # Error Categories
///
/// - **Configuration errors**: Problems loading or validating server config
/// - **Authentication errors**: Missing, malformed, or rejected credentials
/// - **Broadcast errors**: Fan-out attempted while the hub is not running
#[derive(Error, Debug)]
pub enum ServerError {
    /// Configuration error during server initialization.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The handshake credential was rejected.
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// A broadcast could not be dispatched.
    #[error("broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),
}

impl ServerError {
    /// Returns `true` if this error indicates a client-side problem.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Returns `true` if this error indicates a server-side problem.
    pub fn is_server_error(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Broadcast(_))
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::*;

    #[test]
    fn config_error_missing_displays_correctly() {
        let err = ConfigError::missing("PARLEY_JWT_SECRET");
        assert_eq!(
            err.to_string(),
            "missing required environment variable: PARLEY_JWT_SECRET"
        );
    }

    #[test]
    fn config_error_invalid_displays_correctly() {
        let err = ConfigError::invalid("PORT", "must be a positive integer");
        assert_eq!(
            err.to_string(),
            "invalid value for PORT: must be a positive integer"
        );
    }

    #[test]
    fn server_error_config_displays_correctly() {
        let err = ServerError::from(ConfigError::missing("PARLEY_INGEST_TOKEN"));
        assert_eq!(
            err.to_string(),
            "configuration error: missing required environment variable: PARLEY_INGEST_TOKEN"
        );
    }

    #[test]
    fn server_error_auth_uses_close_reason() {
        let err = ServerError::from(AuthError::TokenRequired);
        assert_eq!(err.to_string(), "authentication failed: Token required");
        assert!(err.is_client_error());
        assert!(!err.is_server_error());
    }

    #[test]
    fn server_error_broadcast_is_server_side() {
        let err = ServerError::from(BroadcastError::NotStarted);
        assert!(err.is_server_error());
        assert!(!err.is_client_error());
    }

    #[test]
    fn from_config_error_works_with_question_mark() {
        fn inner() -> Result<(), ServerError> {
            let _: () = Err(ConfigError::missing("KEY"))?;
            Ok(())
        }

        assert!(matches!(inner(), Err(ServerError::Config(_))));
    }

    #[test]
    fn server_error_source_returns_wrapped_error() {
        let config_err = ConfigError::missing("KEY");
        let err = ServerError::Config(config_err.clone());

        let source = err.source().expect("config error has a source");
        assert_eq!(source.to_string(), config_err.to_string());

        let auth = ServerError::from(AuthError::InvalidToken);
        assert_eq!(auth.source().map(ToString::to_string), Some("Invalid token".to_string()));
    }
}
