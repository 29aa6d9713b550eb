//! # Configuration
//!
//! Startup configuration for the authentication core. Values are read from
//! `PHLOW_*` environment variables by [`Config::from_env`] or constructed
//! directly by embedding hosts. Validation happens once, before any request
//! is served; an invalid configuration is fatal.

use std::env;
use std::time::Duration;

use jsonwebtoken::Algorithm;

use crate::breaker::BreakerSettings;
use crate::error::{Error, Result};
use crate::token;

/// Default TTL for cached DID documents and verified-role rows.
const DEFAULT_CACHE_TTL_MS: u64 = 3_600_000;

/// Default shared-store call budget. Exceeding it degrades the call to the
/// in-memory backend.
const DEFAULT_STORE_TIMEOUT_MS: u64 = 1_000;

/// Rate limiter settings shared by both backends.
#[derive(Clone, Debug)]
pub struct RateLimitSettings {
    /// Maximum admissions per key in any trailing window.
    pub max_requests: u32,

    /// Trailing window length.
    pub window: Duration,

    /// Shared-store URL. Absent means in-memory only.
    pub shared_store_url: Option<String>,

    /// Per-call budget for the shared-store backend.
    pub store_timeout: Duration,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window: Duration::from_secs(60),
            shared_store_url: None,
            store_timeout: Duration::from_millis(DEFAULT_STORE_TIMEOUT_MS),
        }
    }
}

/// Per-dependency circuit breaker settings.
#[derive(Clone, Debug, Default)]
pub struct BreakerConfig {
    /// Breaker for registry store calls.
    pub registry: BreakerSettings,

    /// Breaker for DID resolution.
    pub did_resolver: BreakerSettings,

    /// Breaker for peer role-credential messaging.
    pub peer_messaging: BreakerSettings,
}

/// The validated configuration the [`crate::pipeline::Authenticator`] is
/// built from.
#[derive(Clone, Debug)]
pub struct Config {
    /// This agent's unique id; the expected `aud` of inbound tokens.
    pub agent_id: String,

    /// Human-readable agent name, surfaced in the discovery document.
    pub agent_name: String,

    /// Public base URL of this agent's service, if it has one.
    pub service_url: Option<String>,

    /// PEM-encoded private key used to mint outbound tokens.
    pub private_key: String,

    /// PEM-encoded public key, published in the agent card.
    pub public_key: String,

    /// Registry store endpoint, consumed by the host's store adapter.
    pub registry_url: Option<String>,

    /// Registry store credential, consumed by the host's store adapter.
    pub registry_api_key: Option<String>,

    /// The one signing algorithm tokens are issued and accepted with.
    pub algorithm: Algorithm,

    /// Rate limiter settings.
    pub rate_limit: RateLimitSettings,

    /// Circuit breaker settings per named dependency.
    pub breakers: BreakerConfig,

    /// TTL for cached DID documents.
    pub did_cache_ttl: Duration,

    /// Cap on how long a verified role row stays valid.
    pub verified_role_ttl: Duration,
}

impl Config {
    /// A configuration with defaults for everything beyond identity and key
    /// material.
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>, agent_name: impl Into<String>,
        private_key: impl Into<String>, public_key: impl Into<String>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            agent_name: agent_name.into(),
            service_url: None,
            private_key: private_key.into(),
            public_key: public_key.into(),
            registry_url: None,
            registry_api_key: None,
            algorithm: Algorithm::RS256,
            rate_limit: RateLimitSettings::default(),
            breakers: BreakerConfig::default(),
            did_cache_ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
            verified_role_ttl: Duration::from_millis(DEFAULT_CACHE_TTL_MS),
        }
    }

    /// Read configuration from `PHLOW_*` environment variables.
    ///
    /// # Errors
    ///
    /// Fails with `ConfigurationInvalid` when a required variable is missing
    /// or a value does not parse or validate.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(
            required("PHLOW_AGENT_ID")?,
            required("PHLOW_AGENT_NAME")?,
            required("PHLOW_PRIVATE_KEY")?,
            required("PHLOW_PUBLIC_KEY")?,
        );
        config.service_url = optional("PHLOW_SERVICE_URL");
        config.registry_url = Some(required("PHLOW_REGISTRY_URL")?);
        config.registry_api_key = Some(required("PHLOW_REGISTRY_API_KEY")?);

        if let Some(alg) = optional("PHLOW_TOKEN_ALGORITHM") {
            config.algorithm = alg
                .parse()
                .map_err(|_| Error::ConfigurationInvalid(format!("unknown algorithm: {alg}")))?;
        }
        if let Some(max) = optional("PHLOW_RATE_LIMIT_MAX") {
            config.rate_limit.max_requests = parse_number(&max, "PHLOW_RATE_LIMIT_MAX")?;
        }
        if let Some(window) = optional("PHLOW_RATE_LIMIT_WINDOW_MS") {
            config.rate_limit.window =
                Duration::from_millis(parse_number(&window, "PHLOW_RATE_LIMIT_WINDOW_MS")?);
        }
        config.rate_limit.shared_store_url = optional("PHLOW_RATE_LIMIT_SHARED_URL");
        if let Some(timeout) = optional("PHLOW_RATE_LIMIT_TIMEOUT_MS") {
            config.rate_limit.store_timeout =
                Duration::from_millis(parse_number(&timeout, "PHLOW_RATE_LIMIT_TIMEOUT_MS")?);
        }

        config.breakers.registry = breaker_from_env("REGISTRY")?;
        config.breakers.did_resolver = breaker_from_env("DID_RESOLVER")?;
        config.breakers.peer_messaging = breaker_from_env("PEER_MESSAGING")?;

        if let Some(ttl) = optional("PHLOW_DID_CACHE_TTL_MS") {
            config.did_cache_ttl =
                Duration::from_millis(parse_number(&ttl, "PHLOW_DID_CACHE_TTL_MS")?);
        }
        if let Some(ttl) = optional("PHLOW_VERIFIED_ROLE_TTL_MS") {
            config.verified_role_ttl =
                Duration::from_millis(parse_number(&ttl, "PHLOW_VERIFIED_ROLE_TTL_MS")?);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Fails with `ConfigurationInvalid` naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.agent_id.trim().is_empty() {
            return Err(Error::ConfigurationInvalid("agent_id must not be empty".to_string()));
        }
        if self.agent_name.trim().is_empty() {
            return Err(Error::ConfigurationInvalid("agent_name must not be empty".to_string()));
        }
        token::encoding_key(self.algorithm, &self.private_key)
            .map_err(|_| Error::ConfigurationInvalid("private_key is not a usable PEM key".to_string()))?;
        token::decoding_key(self.algorithm, &self.public_key)
            .map_err(|_| Error::ConfigurationInvalid("public_key is not a usable PEM key".to_string()))?;

        if self.rate_limit.max_requests == 0 {
            return Err(Error::ConfigurationInvalid("rate_limit.max_requests must be at least 1".to_string()));
        }
        if self.rate_limit.window.is_zero() {
            return Err(Error::ConfigurationInvalid("rate_limit.window must be non-zero".to_string()));
        }
        if self.rate_limit.store_timeout.is_zero() {
            return Err(Error::ConfigurationInvalid("rate_limit.store_timeout must be non-zero".to_string()));
        }
        for (name, settings) in [
            ("registry", &self.breakers.registry),
            ("did_resolver", &self.breakers.did_resolver),
            ("peer_messaging", &self.breakers.peer_messaging),
        ] {
            if settings.failure_threshold == 0 {
                return Err(Error::ConfigurationInvalid(format!(
                    "breaker {name}: failure_threshold must be at least 1"
                )));
            }
            if settings.operation_timeout.is_zero() {
                return Err(Error::ConfigurationInvalid(format!(
                    "breaker {name}: operation_timeout must be non-zero"
                )));
            }
        }
        if self.verified_role_ttl.is_zero() {
            return Err(Error::ConfigurationInvalid("verified_role_ttl must be non-zero".to_string()));
        }
        Ok(())
    }
}

fn breaker_from_env(name: &str) -> Result<BreakerSettings> {
    let mut settings = BreakerSettings::default();
    if let Some(threshold) = optional(&format!("PHLOW_BREAKER_{name}_FAILURE_THRESHOLD")) {
        settings.failure_threshold = parse_number(&threshold, "failure threshold")?;
    }
    if let Some(recovery) = optional(&format!("PHLOW_BREAKER_{name}_RECOVERY_MS")) {
        settings.recovery = Duration::from_millis(parse_number(&recovery, "recovery")?);
    }
    if let Some(timeout) = optional(&format!("PHLOW_BREAKER_{name}_TIMEOUT_MS")) {
        settings.operation_timeout = Duration::from_millis(parse_number(&timeout, "timeout")?);
    }
    Ok(settings)
}

fn required(name: &str) -> Result<String> {
    env::var(name).map_err(|_| Error::ConfigurationInvalid(format!("{name} is not set")))
}

fn optional(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.is_empty())
}

fn parse_number<T: std::str::FromStr>(value: &str, what: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::ConfigurationInvalid(format!("{what}: invalid number: {value}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = include_str!("../tests/fixtures/alice.key.pem");
    const PUB: &str = include_str!("../tests/fixtures/alice.pub.pem");

    #[test]
    fn defaults_validate() {
        let config = Config::new("alice", "Alice", KEY, PUB);
        config.validate().expect("defaults should validate");
        assert_eq!(config.algorithm, Algorithm::RS256);
        assert_eq!(config.breakers.registry.failure_threshold, 5);
        assert_eq!(config.did_cache_ttl, Duration::from_millis(3_600_000));
    }

    #[test]
    fn rejects_empty_agent_id() {
        let config = Config::new("", "Alice", KEY, PUB);
        let err = config.validate().expect_err("empty agent id should fail");
        assert!(matches!(err, Error::ConfigurationInvalid(_)));
    }

    #[test]
    fn rejects_bad_key_material() {
        let config = Config::new("alice", "Alice", "not a key", PUB);
        config.validate().expect_err("garbage private key should fail");

        let config = Config::new("alice", "Alice", KEY, "not a key");
        config.validate().expect_err("garbage public key should fail");
    }

    #[test]
    fn rejects_zero_rate_limit() {
        let mut config = Config::new("alice", "Alice", KEY, PUB);
        config.rate_limit.max_requests = 0;
        config.validate().expect_err("zero max_requests should fail");
    }
}
