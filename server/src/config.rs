//! Server configuration module.
//!
//! Parses configuration from environment variables for the Parley server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `PARLEY_JWT_SECRET` | Yes* | - | HS256 secret used to verify handshake tokens |
//! | `PARLEY_INGEST_TOKEN` | Yes* | - | Bearer token for `/events` and `/stats` |
//! | `PORT` | No | 8080 | HTTP server port |
//! | `PARLEY_HEARTBEAT_INTERVAL_SECS` | No | 30 | Seconds between liveness pings |
//! | `PARLEY_SEND_TIMEOUT_MS` | No | 5000 | Upper bound for a single socket write |
//! | `PARLEY_OUTBOUND_CAPACITY` | No | 64 | Frames buffered per connection |
//! | `PARLEY_UNSAFE_NO_AUTH` | No | false | Disable all authentication (dev only) |
//!
//! *Not required if `PARLEY_UNSAFE_NO_AUTH=true`

use std::env;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use crate::error::ConfigError;

/// Default HTTP server port.
const DEFAULT_PORT: u16 = 8080;

/// Default interval between heartbeat pings (30 seconds).
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default upper bound for one socket write (5 seconds).
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_millis(5_000);

/// Default number of outbound frames buffered per connection.
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

/// Server configuration parsed from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Shared secret for verifying handshake JWTs.
    pub jwt_secret: Option<String>,

    /// Bearer token the persistence layer presents on `/events` and `/stats`.
    pub ingest_token: Option<String>,

    /// HTTP server port.
    pub port: u16,

    /// Interval between liveness pings on each connection.
    pub heartbeat_interval: Duration,

    /// Upper bound for a single frame write on a socket.
    pub send_timeout: Duration,

    /// Capacity of each connection's outbound frame queue.
    pub outbound_capacity: usize,

    /// When true, disables all authentication (development only).
    pub unsafe_no_auth: bool,
}

impl Default for Config {
    /// Development defaults: authentication disabled, standard timings.
    fn default() -> Self {
        Self {
            jwt_secret: None,
            ingest_token: None,
            port: DEFAULT_PORT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            unsafe_no_auth: true,
        }
    }
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - Required environment variables are missing (when `PARLEY_UNSAFE_NO_AUTH` is not true)
    /// - A numeric variable does not parse or is zero
    ///
    /// # Example
    ///
    /// ```no_run
    /// use parley_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        let unsafe_no_auth = parse_bool_env("PARLEY_UNSAFE_NO_AUTH");
        let port = parse_env_or("PORT", DEFAULT_PORT)?;
        let heartbeat_secs = parse_env_or(
            "PARLEY_HEARTBEAT_INTERVAL_SECS",
            DEFAULT_HEARTBEAT_INTERVAL.as_secs(),
        )?;
        let send_timeout_ms = parse_env_or(
            "PARLEY_SEND_TIMEOUT_MS",
            DEFAULT_SEND_TIMEOUT.as_millis() as u64,
        )?;
        let outbound_capacity = parse_env_or("PARLEY_OUTBOUND_CAPACITY", DEFAULT_OUTBOUND_CAPACITY)?;

        let config = Self {
            jwt_secret: non_empty_env("PARLEY_JWT_SECRET"),
            ingest_token: non_empty_env("PARLEY_INGEST_TOKEN"),
            port,
            heartbeat_interval: Duration::from_secs(heartbeat_secs),
            send_timeout: Duration::from_millis(send_timeout_ms),
            outbound_capacity,
            unsafe_no_auth,
        };

        config.validate()?;

        if config.unsafe_no_auth {
            warn!(
                "PARLEY_UNSAFE_NO_AUTH is enabled - handshake tokens are read as plain user ids \
                 and ingestion is unauthenticated. Do not use in production!"
            );
        }

        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Timings and capacities must be non-zero. Unless `unsafe_no_auth` is
    /// set, both the JWT secret and the ingest token must be present.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::invalid(
                "PARLEY_HEARTBEAT_INTERVAL_SECS",
                "must be greater than zero",
            ));
        }

        if self.send_timeout.is_zero() {
            return Err(ConfigError::invalid(
                "PARLEY_SEND_TIMEOUT_MS",
                "must be greater than zero",
            ));
        }

        if self.outbound_capacity == 0 {
            return Err(ConfigError::invalid(
                "PARLEY_OUTBOUND_CAPACITY",
                "must be greater than zero",
            ));
        }

        if self.unsafe_no_auth {
            return Ok(());
        }

        if self.jwt_secret.is_none() {
            return Err(ConfigError::missing("PARLEY_JWT_SECRET"));
        }

        if self.ingest_token.is_none() {
            return Err(ConfigError::missing("PARLEY_INGEST_TOKEN"));
        }

        Ok(())
    }
}

/// Parse a boolean environment variable.
///
/// Returns `true` if the variable is set to "true" (case-insensitive),
/// `false` otherwise.
fn parse_bool_env(name: &str) -> bool {
    env::var(name)
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// Reads a variable, treating an empty value the same as an absent one.
fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Parse a numeric environment variable, falling back to `default` when unset.
fn parse_env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|err: T::Err| ConfigError::invalid(name, err.to_string())),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(env::VarError::NotUnicode(_)) => {
            Err(ConfigError::invalid(name, "contains invalid unicode"))
        }
    }
}
