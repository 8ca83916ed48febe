//! Handshake authentication for WebSocket clients.
//!
//! Every socket arriving on `/ws` carries a credential in its query string.
//! This module turns that credential into an [`Identity`] (user id plus device
//! slot) or rejects it with an [`AuthError`] whose message doubles as the
//! close reason sent to the client.
//!
//! # Overview
//!
//! 1. The client connects to `/ws?token=<jwt>&deviceId=<slot>`
//! 2. [`Authenticator::authenticate`] checks the token is present
//! 3. A [`TokenVerifier`] decodes and verifies it, yielding the user id
//! 4. The device id defaults to `"default"` when absent
//!
//! Token issuance lives outside this crate. The server only verifies.
//!
//! # Example
//!
//! ```rust
//! use std::sync::Arc;
//! use parley_server::auth::{Authenticator, HandshakeParams, InsecureVerifier, AuthError};
//!
//! let auth = Authenticator::new(Arc::new(InsecureVerifier));
//!
//! let params = HandshakeParams {
//!     token: Some("42".to_string()),
//!     device_id: Some("phone".to_string()),
//! };
//! let identity = auth.authenticate(&params).unwrap();
//! assert_eq!(identity.user_id, 42);
//! assert_eq!(identity.device_id, "phone");
//!
//! let missing = HandshakeParams::default();
//! assert_eq!(auth.authenticate(&missing), Err(AuthError::TokenRequired));
//! ```

use std::fmt;
use std::sync::Arc;

use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, trace};

use crate::types::{Identity, UserId};

/// Reasons a handshake credential is rejected.
///
/// The `Display` text of each variant is the close reason sent to the client
/// alongside the policy-violation close code.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// No token was supplied in the handshake.
    #[error("Token required")]
    TokenRequired,

    /// The token could not be decoded at all.
    #[error("Invalid token")]
    InvalidToken,

    /// The token decoded but failed verification (signature, expiry).
    #[error("Authentication failed")]
    AuthenticationFailed,
}

impl AuthError {
    /// The close reason sent to the client.
    pub fn close_reason(&self) -> &'static str {
        match self {
            Self::TokenRequired => "Token required",
            Self::InvalidToken => "Invalid token",
            Self::AuthenticationFailed => "Authentication failed",
        }
    }

    /// Returns `true` if the token was malformed rather than merely rejected.
    pub fn is_format_error(&self) -> bool {
        matches!(self, Self::InvalidToken)
    }
}

/// Query parameters presented on the WebSocket upgrade request.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HandshakeParams {
    /// Opaque credential (required).
    pub token: Option<String>,

    /// Client-chosen device slot (optional).
    #[serde(rename = "deviceId")]
    pub device_id: Option<String>,
}

/// Verifies an opaque credential and returns the user it belongs to.
pub trait TokenVerifier: Send + Sync {
    /// Returns the user id encoded in `token`.
    ///
    /// # Errors
    ///
    /// [`AuthError::InvalidToken`] when the token is malformed,
    /// [`AuthError::AuthenticationFailed`] when it is well formed but rejected.
    fn verify(&self, token: &str) -> Result<UserId, AuthError>;
}

/// Claims carried by a handshake JWT.
#[derive(Debug, Deserialize)]
struct HandshakeClaims {
    #[serde(rename = "userId")]
    user_id: UserId,
}

/// HS256 JWT verifier using a shared secret.
///
/// Tokens must carry a numeric `userId` claim and an `exp` claim.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    /// Creates a verifier for tokens signed with `secret`.
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = true;

        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

impl fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtVerifier")
            .field("algorithm", &Algorithm::HS256)
            .finish_non_exhaustive()
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        decode::<HandshakeClaims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims.user_id)
            .map_err(|err| {
                trace!(error = %err, "JWT verification failed");
                match err.kind() {
                    ErrorKind::InvalidToken
                    | ErrorKind::Base64(_)
                    | ErrorKind::Json(_)
                    | ErrorKind::Utf8(_)
                    | ErrorKind::MissingRequiredClaim(_) => AuthError::InvalidToken,
                    _ => AuthError::AuthenticationFailed,
                }
            })
    }
}

/// Development verifier that reads the token as a decimal user id.
///
/// Only used when `PARLEY_UNSAFE_NO_AUTH=true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsecureVerifier;

impl TokenVerifier for InsecureVerifier {
    fn verify(&self, token: &str) -> Result<UserId, AuthError> {
        token.trim().parse().map_err(|_| AuthError::InvalidToken)
    }
}

/// Stateless handshake authenticator.
#[derive(Clone)]
pub struct Authenticator {
    verifier: Arc<dyn TokenVerifier>,
}

impl Authenticator {
    /// Creates an authenticator backed by `verifier`.
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { verifier }
    }

    /// Validates the handshake and returns the device slot it claims.
    ///
    /// # Errors
    ///
    /// Returns an [`AuthError`]; the caller must close the socket with a
    /// policy-violation code and must not register it.
    pub fn authenticate(&self, params: &HandshakeParams) -> Result<Identity, AuthError> {
        let token = match params.token.as_deref().map(str::trim) {
            Some(token) if !token.is_empty() => token,
            _ => {
                debug!("Handshake without token");
                return Err(AuthError::TokenRequired);
            }
        };

        let user_id = self.verifier.verify(token)?;
        Ok(Identity::new(user_id, params.device_id.as_deref()))
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator").finish_non_exhaustive()
    }
}

/// Compares a presented bearer token with the expected one in constant time.
///
/// Returns `false` for an empty `provided` value.
pub fn validate_bearer(provided: &str, expected: &str) -> bool {
    if provided.is_empty() {
        return false;
    }
    provided.as_bytes().ct_eq(expected.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde::Serialize;

    const SECRET: &str = "test-secret";

    #[derive(Serialize)]
    struct Claims {
        #[serde(rename = "userId")]
        user_id: i64,
        exp: u64,
    }

    fn now_secs() -> u64 {
        chrono::Utc::now().timestamp() as u64
    }

    fn mint(user_id: i64, exp: u64, secret: &str) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            &Claims { user_id, exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn jwt_auth() -> Authenticator {
        Authenticator::new(Arc::new(JwtVerifier::new(SECRET)))
    }

    fn params(token: Option<&str>, device: Option<&str>) -> HandshakeParams {
        HandshakeParams {
            token: token.map(str::to_string),
            device_id: device.map(str::to_string),
        }
    }

    #[test]
    fn valid_jwt_yields_identity() {
        let token = mint(7, now_secs() + 3600, SECRET);
        let identity = jwt_auth()
            .authenticate(&params(Some(&token), Some("phone")))
            .unwrap();
        assert_eq!(identity, Identity::new(7, Some("phone")));
    }

    #[test]
    fn missing_device_defaults() {
        let token = mint(7, now_secs() + 3600, SECRET);
        let identity = jwt_auth().authenticate(&params(Some(&token), None)).unwrap();
        assert_eq!(identity.device_id, "default");
    }

    #[test]
    fn missing_token_is_token_required() {
        assert_eq!(
            jwt_auth().authenticate(&params(None, Some("phone"))),
            Err(AuthError::TokenRequired)
        );
        assert_eq!(
            jwt_auth().authenticate(&params(Some(""), None)),
            Err(AuthError::TokenRequired)
        );
    }

    #[test]
    fn garbage_token_is_invalid_token() {
        assert_eq!(
            jwt_auth().authenticate(&params(Some("not-a-jwt"), None)),
            Err(AuthError::InvalidToken)
        );
    }

    #[test]
    fn wrong_secret_is_authentication_failed() {
        let token = mint(7, now_secs() + 3600, "some-other-secret");
        assert_eq!(
            jwt_auth().authenticate(&params(Some(&token), None)),
            Err(AuthError::AuthenticationFailed)
        );
    }

    #[test]
    fn expired_token_is_authentication_failed() {
        let token = mint(7, now_secs() - 3600, SECRET);
        assert_eq!(
            jwt_auth().authenticate(&params(Some(&token), None)),
            Err(AuthError::AuthenticationFailed)
        );
    }

    #[test]
    fn insecure_verifier_parses_user_id() {
        assert_eq!(InsecureVerifier.verify(" 12 "), Ok(12));
        assert_eq!(InsecureVerifier.verify("abc"), Err(AuthError::InvalidToken));
    }

    #[test]
    fn close_reasons_match_display() {
        for err in [
            AuthError::TokenRequired,
            AuthError::InvalidToken,
            AuthError::AuthenticationFailed,
        ] {
            assert_eq!(err.to_string(), err.close_reason());
        }
        assert!(AuthError::InvalidToken.is_format_error());
        assert!(!AuthError::AuthenticationFailed.is_format_error());
    }

    #[test]
    fn validate_bearer_compares_exactly() {
        assert!(validate_bearer("secret", "secret"));
        assert!(!validate_bearer("secret2", "secret"));
        assert!(!validate_bearer("", "secret"));
        assert!(!validate_bearer("", ""));
    }
}
