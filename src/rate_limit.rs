//! # Rate Limiter
//!
//! Sliding-window admission control: at most `max_requests` per key in any
//! trailing window. Two backends share the algorithm: a per-process map of
//! timestamp queues, and a shared ordered-set store for deployments where
//! several replicas must count together. Shared-store trouble degrades the
//! affected call to the in-memory backend rather than failing the request.
//!
//! Keying: authentication admissions use a token digest prefix (identical
//! agents with different tokens count separately, and the limiter never
//! stores a raw token); role-credential requests use the agent id.

pub mod memory;
pub mod shared;

use serde_json::json;

use crate::config::RateLimitSettings;
use crate::core::sha256_hex;
use crate::error::{Error, Result};
use crate::observability::{self, EventKind};

/// One admission decision.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The request is within the window.
    Admitted {
        /// Slots left in the window after this admission.
        remaining: u32,
    },
    /// The window is full.
    Denied {
        /// Always zero; present for symmetry with host rate-limit headers.
        remaining: u32,
        /// Unix-millisecond instant at which the oldest admission leaves
        /// the window.
        reset_at: i64,
    },
}

/// The sliding-window rate limiter with optional shared-store backend.
pub struct RateLimiter {
    settings: RateLimitSettings,
    memory: memory::MemoryBackend,
    shared: Option<shared::SharedBackend>,
}

impl RateLimiter {
    /// A limiter backed only by process memory.
    #[must_use]
    pub fn in_memory(settings: RateLimitSettings) -> Self {
        Self { settings, memory: memory::MemoryBackend::new(), shared: None }
    }

    /// A limiter that counts through the shared ordered-set store, with the
    /// in-memory backend as its degradation path.
    ///
    /// # Errors
    ///
    /// Fails when the store URL does not parse or the connection cannot be
    /// established.
    pub async fn with_shared_store(settings: RateLimitSettings, url: &str) -> anyhow::Result<Self> {
        let shared = shared::SharedBackend::connect(url, settings.store_timeout).await?;
        Ok(Self { settings, memory: memory::MemoryBackend::new(), shared: Some(shared) })
    }

    /// Whether the shared-store backend is attached.
    #[must_use]
    pub const fn is_shared(&self) -> bool {
        self.shared.is_some()
    }

    /// Decide admission for `key` under the limiter `name`.
    pub async fn check(&self, name: &str, key: &str) -> Admission {
        let now = chrono::Utc::now().timestamp_millis();
        let window_ms = i64::try_from(self.settings.window.as_millis()).unwrap_or(i64::MAX);

        if let Some(shared) = &self.shared {
            let namespaced = format!("phlow:rl:{name}:{key}");
            match shared.admit(&namespaced, now, self.settings.max_requests, window_ms).await {
                Ok(admission) => return admission,
                Err(err) => {
                    tracing::warn!(limiter = name, error = %err, "shared rate-limit store degraded");
                    observability::metrics().record_rate_limit_degraded();
                    observability::emit(
                        EventKind::RateLimitBackendDegraded,
                        observability::object(json!({ "limiter": name })),
                    );
                }
            }
        }

        self.memory.admit(&format!("{name}:{key}"), now, self.settings.max_requests, window_ms)
    }

    /// Admit or deny, raising `RateLimitExceeded` on denial.
    ///
    /// # Errors
    ///
    /// `RateLimitExceeded` carrying the window-reset instant.
    pub async fn admit(&self, name: &str, key: &str) -> Result<()> {
        match self.check(name, key).await {
            Admission::Admitted { .. } => {
                observability::metrics().record_rate_limit(true);
                Ok(())
            }
            Admission::Denied { reset_at, .. } => {
                observability::metrics().record_rate_limit(false);
                observability::emit(
                    EventKind::RateLimitDenied,
                    observability::object(json!({ "limiter": name, "key": key })),
                );
                Err(Error::RateLimitExceeded { reset_at })
            }
        }
    }

    /// Number of live in-memory buckets, for the stats surface.
    #[must_use]
    pub fn memory_buckets(&self) -> usize {
        self.memory.len()
    }
}

/// The limiter key for a bearer token: a digest prefix, never the token.
#[must_use]
pub fn token_key(token: &str) -> String {
    let mut digest = sha256_hex(token.as_bytes());
    digest.truncate(32);
    digest
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn settings(max: u32, window: Duration) -> RateLimitSettings {
        RateLimitSettings { max_requests: max, window, ..RateLimitSettings::default() }
    }

    #[tokio::test]
    async fn denies_over_limit_and_raises() {
        let limiter = RateLimiter::in_memory(settings(3, Duration::from_secs(60)));

        for _ in 0..3 {
            limiter.admit("auth", "key-1").await.expect("should admit within limit");
        }
        let err = limiter.admit("auth", "key-1").await.expect_err("fourth should deny");
        assert!(matches!(err, Error::RateLimitExceeded { .. }));

        // A different key is unaffected.
        limiter.admit("auth", "key-2").await.expect("other key should admit");
    }

    #[tokio::test]
    async fn limiter_names_are_separate() {
        let limiter = RateLimiter::in_memory(settings(1, Duration::from_secs(60)));
        limiter.admit("auth", "bob").await.expect("auth should admit");
        limiter.admit("role", "bob").await.expect("role uses its own bucket");
    }

    #[test]
    fn token_keying() {
        let key = token_key("header.payload.signature");
        assert_eq!(key.len(), 32);
        assert_ne!(key, token_key("header.payload.signature2"));
        assert!(!key.contains('.'), "raw token must not appear in the key");
    }
}
