//! # Registry Client
//!
//! A narrow adapter over the external store: agent cards in, audit records
//! and verified-role rows out. Every call runs through the `registry`
//! circuit breaker; store failures surface as `RegistryUnavailable`, and a
//! missing row is `None`, not an error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::AgentCard;
use crate::breaker::CircuitBreaker;
use crate::error::{Error, Result};
use crate::provider::Registry;

/// One append-only audit record.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct AuthEvent {
    /// The agent the event concerns.
    pub agent_id: String,

    /// When the event occurred.
    pub timestamp: DateTime<Utc>,

    /// Event type, e.g. `auth_success` or `auth_failure`.
    pub event_type: String,

    /// Whether the underlying operation succeeded.
    pub success: bool,

    /// Free-form attributes (failure kind, request id, token hash).
    pub metadata: Map<String, Value>,
}

impl AuthEvent {
    /// An event stamped with the current time.
    #[must_use]
    pub fn new(agent_id: impl Into<String>, event_type: impl Into<String>, success: bool) -> Self {
        Self {
            agent_id: agent_id.into(),
            timestamp: Utc::now(),
            event_type: event_type.into(),
            success,
            metadata: Map::new(),
        }
    }

    /// Attach an attribute.
    #[must_use]
    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// A cached, verified role assertion. Unique per `(agent_id, role)`.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct VerifiedRole {
    /// The agent the role was verified for.
    pub agent_id: String,

    /// The verified role.
    pub role: String,

    /// When verification happened.
    pub verified_at: DateTime<Utc>,

    /// When the cached verification lapses; `None` only for rows written
    /// by earlier deployments without a TTL.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,

    /// Hex SHA-256 of the canonical presentation that proved the role.
    pub credential_hash: String,

    /// The credential issuer's DID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuer_did: Option<String>,

    /// Free-form row metadata.
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl VerifiedRole {
    /// Whether the row should be treated as absent.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expiry| expiry <= now)
    }
}

/// Look up an agent card.
///
/// # Errors
///
/// `RegistryUnavailable` on store failure, `CircuitOpen` /
/// `OperationTimeout` from the breaker.
pub async fn agent_card(
    registry: &impl Registry, breaker: &CircuitBreaker, agent_id: &str,
) -> Result<Option<AgentCard>> {
    breaker
        .call(|| async {
            registry
                .agent_card(agent_id)
                .await
                .map_err(|e| Error::RegistryUnavailable(e.to_string()))
        })
        .await
}

/// Look up a verified-role row, treating expired rows as absent.
///
/// # Errors
///
/// As [`agent_card`].
pub async fn verified_role(
    registry: &impl Registry, breaker: &CircuitBreaker, agent_id: &str, role: &str,
) -> Result<Option<VerifiedRole>> {
    let row = breaker
        .call(|| async {
            registry
                .verified_role(agent_id, role)
                .await
                .map_err(|e| Error::RegistryUnavailable(e.to_string()))
        })
        .await?;
    Ok(row.filter(|row| !row.is_expired(Utc::now())))
}

/// Insert or replace a verified-role row.
///
/// # Errors
///
/// As [`agent_card`].
pub async fn upsert_verified_role(
    registry: &impl Registry, breaker: &CircuitBreaker, row: &VerifiedRole,
) -> Result<()> {
    breaker
        .call(|| async {
            registry
                .upsert_verified_role(row)
                .await
                .map_err(|e| Error::RegistryUnavailable(e.to_string()))
        })
        .await
}

/// Append an audit record, best-effort: failures are logged and swallowed,
/// never failing the request that produced them.
pub async fn record_event(registry: &impl Registry, breaker: &CircuitBreaker, event: AuthEvent) {
    let outcome = breaker
        .call(|| async {
            registry
                .record_event(&event)
                .await
                .map_err(|e| Error::RegistryUnavailable(e.to_string()))
        })
        .await;

    if let Err(err) = outcome {
        tracing::debug!(agent_id = %event.agent_id, error = %err, "audit record dropped");
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn row(expires_at: Option<DateTime<Utc>>) -> VerifiedRole {
        VerifiedRole {
            agent_id: "bob".to_string(),
            role: "admin".to_string(),
            verified_at: Utc::now(),
            expires_at,
            credential_hash: "abc".to_string(),
            issuer_did: Some("did:example:issuer1".to_string()),
            metadata: Map::new(),
        }
    }

    #[test]
    fn expiry() {
        let now = Utc::now();
        assert!(!row(None).is_expired(now), "no expiry means valid");
        assert!(!row(Some(now + TimeDelta::seconds(10))).is_expired(now));
        assert!(row(Some(now)).is_expired(now), "expiry boundary counts as expired");
        assert!(row(Some(now - TimeDelta::seconds(10))).is_expired(now));
    }

    #[test]
    fn event_builder() {
        let event = AuthEvent::new("bob", "auth_failure", false)
            .with("error", serde_json::json!("token_expired"));
        assert_eq!(event.event_type, "auth_failure");
        assert!(!event.success);
        assert_eq!(event.metadata["error"], "token_expired");
    }
}
