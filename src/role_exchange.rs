//! # Role-Credential Exchange
//!
//! A two-message protocol between a verifying service and a peer agent:
//! the service sends a `role-credential-request` carrying a fresh nonce,
//! the peer answers with a `role-credential-response` echoing that nonce
//! and wrapping a signed presentation (or an error). Verified roles are
//! cached in the registry store so repeat requests stay local.
//!
//! The responder path ([`CredentialStore::handle_role_request`]) is a
//! separate entry point with no edge back into the pipeline: it depends
//! only on held credentials and holder key material.

use std::time::Duration;

use chrono::{TimeDelta, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::breaker::CircuitBreaker;
use crate::core::generate;
use crate::error::{Error, Result};
use crate::observability::{self, EventKind};
use crate::provider::{PeerTransport, Provider};
use crate::rate_limit::RateLimiter;
use crate::registry::{self, VerifiedRole};
use crate::w3c_vc::verify::CredentialVerifier;
use crate::w3c_vc::{VerifiableCredential, VerifiablePresentation, proof};

/// Message type of a role-credential request.
pub const REQUEST_TYPE: &str = "role-credential-request";

/// Message type of a role-credential response.
pub const RESPONSE_TYPE: &str = "role-credential-response";

/// The verifying side's request for a role proof.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoleRequest {
    /// Always [`REQUEST_TYPE`].
    #[serde(rename = "type")]
    pub type_: String,

    /// The role a proof is requested for.
    pub required_role: String,

    /// Free-form context for the peer (requesting agent, purpose).
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub context: Map<String, Value>,

    /// Fresh 128-bit nonce binding request and response.
    pub nonce: String,
}

impl RoleRequest {
    /// A request for `required_role` with a fresh nonce.
    #[must_use]
    pub fn new(required_role: impl Into<String>) -> Self {
        Self {
            type_: REQUEST_TYPE.to_string(),
            required_role: required_role.into(),
            context: Map::new(),
            nonce: generate::nonce(),
        }
    }

    /// Attach a context attribute.
    #[must_use]
    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

/// The peer's answer: a presentation or an error, always echoing the
/// request nonce.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RoleResponse {
    /// Always [`RESPONSE_TYPE`].
    #[serde(rename = "type")]
    pub type_: String,

    /// The request nonce, echoed.
    pub nonce: String,

    /// The holder-signed presentation, on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presentation: Option<VerifiablePresentation>,

    /// Why no presentation could be produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RoleResponse {
    /// A success response.
    #[must_use]
    pub fn presentation(nonce: impl Into<String>, vp: VerifiablePresentation) -> Self {
        Self {
            type_: RESPONSE_TYPE.to_string(),
            nonce: nonce.into(),
            presentation: Some(vp),
            error: None,
        }
    }

    /// An error response.
    #[must_use]
    pub fn error(nonce: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_: RESPONSE_TYPE.to_string(),
            nonce: nonce.into(),
            presentation: None,
            error: Some(message.into()),
        }
    }
}

/// The verifying side of the exchange, assembled by the pipeline.
pub struct RoleExchange<'a, P: Provider> {
    /// The host provider (registry + transport + resolver).
    pub provider: &'a P,

    /// The `registry` breaker, for cache reads and upserts.
    pub registry_breaker: &'a CircuitBreaker,

    /// The `peerMessaging` breaker, counting remote exchange failures.
    pub peer_breaker: &'a CircuitBreaker,

    /// Presentation verification against DID-resolved issuer keys.
    pub verifier: CredentialVerifier<'a, P>,

    /// Rate limiter; exchange attempts are keyed by agent id.
    pub limiter: &'a RateLimiter,

    /// Cap on how long a verified role stays cached.
    pub cache_ttl: Duration,
}

impl<P: Provider> RoleExchange<'_, P> {
    /// Obtain a verified role for `agent_id`: from the cache when fresh,
    /// otherwise via the two-message exchange, verification, and a cache
    /// upsert.
    ///
    /// # Errors
    ///
    /// Local failures (`RoleAbsent`, credential verification kinds) and
    /// remote failures (`NonceMismatch`, `RoleCredentialRefused`,
    /// breaker/timeout kinds), plus `RateLimitExceeded` when the peer is
    /// being asked too often.
    pub async fn obtain(&self, agent_id: &str, required_role: &str) -> Result<VerifiedRole> {
        if let Some(row) =
            registry::verified_role(self.provider, self.registry_breaker, agent_id, required_role)
                .await?
        {
            return Ok(row);
        }

        // Cache miss: one peer round trip, rate limited per agent.
        self.limiter.admit("role", agent_id).await?;

        let request = RoleRequest::new(required_role);
        let outcome = self
            .peer_breaker
            .call(|| async {
                let response = self
                    .provider
                    .exchange(agent_id, &request)
                    .await
                    .map_err(|e| Error::RoleCredentialRefused(format!("peer unreachable: {e}")))?;

                // Nonce binding: an unbound response is a remote failure,
                // counted by the breaker like any other.
                if response.nonce != request.nonce {
                    return Err(Error::NonceMismatch);
                }
                if let Some(message) = response.error {
                    return Err(Error::RoleCredentialRefused(message));
                }
                response.presentation.ok_or_else(|| {
                    Error::CredentialMalformed(
                        "response carries neither presentation nor error".to_string(),
                    )
                })
            })
            .await;
        observability::metrics().record_peer_call(outcome.is_ok());
        let presentation = outcome?;

        self.verifier.verify(&presentation).await?;

        let credential = presentation
            .verifiable_credential
            .iter()
            .find(|vc| vc.has_role(required_role))
            .ok_or_else(|| Error::RoleAbsent(required_role.to_string()))?;

        let row = self.role_row(agent_id, required_role, credential, &presentation)?;

        // The row is advisory cache state: failing to write it must not
        // fail a request that has otherwise verified.
        if let Err(err) =
            registry::upsert_verified_role(self.provider, self.registry_breaker, &row).await
        {
            tracing::warn!(agent_id, role = required_role, error = %err, "verified-role upsert dropped");
        }

        observability::emit(
            EventKind::RoleVerified,
            observability::object(json!({
                "agentId": agent_id,
                "role": required_role,
                "issuer": row.issuer_did.clone(),
            })),
        );

        Ok(row)
    }

    fn role_row(
        &self, agent_id: &str, role: &str, credential: &VerifiableCredential,
        presentation: &VerifiablePresentation,
    ) -> Result<VerifiedRole> {
        let now = Utc::now();
        let ttl_expiry = now
            + TimeDelta::from_std(self.cache_ttl)
                .unwrap_or_else(|_| TimeDelta::try_hours(1).unwrap_or_default());
        let expires_at = match credential.expiration_date {
            Some(credential_expiry) => credential_expiry.min(ttl_expiry),
            None => ttl_expiry,
        };

        Ok(VerifiedRole {
            agent_id: agent_id.to_string(),
            role: role.to_string(),
            verified_at: now,
            expires_at: Some(expires_at),
            credential_hash: presentation.content_hash()?,
            issuer_did: Some(credential.issuer.clone()),
            metadata: Map::new(),
        })
    }
}

/// The responding side: credentials an agent holds, plus the key material
/// to present them with.
#[derive(Clone)]
pub struct CredentialStore {
    holder_did: String,
    verification_method: String,
    signing_key: SigningKey,
    credentials: Vec<VerifiableCredential>,
}

impl CredentialStore {
    /// A store for the holder identified by `holder_did`, signing
    /// presentations with `signing_key` under `verification_method`.
    #[must_use]
    pub fn new(
        holder_did: impl Into<String>, verification_method: impl Into<String>,
        signing_key: SigningKey,
    ) -> Self {
        Self {
            holder_did: holder_did.into(),
            verification_method: verification_method.into(),
            signing_key,
            credentials: Vec::new(),
        }
    }

    /// Add a held credential.
    #[must_use]
    pub fn with_credential(mut self, credential: VerifiableCredential) -> Self {
        self.credentials.push(credential);
        self
    }

    /// Answer a `role-credential-request`. The request nonce is echoed in
    /// every response, error responses included.
    #[must_use]
    pub fn handle_role_request(&self, request: &RoleRequest) -> RoleResponse {
        let Some(credential) =
            self.credentials.iter().find(|vc| vc.has_role(&request.required_role))
        else {
            return RoleResponse::error(
                &request.nonce,
                format!("no credential for role {}", request.required_role),
            );
        };

        let presentation = VerifiablePresentation::builder()
            .add_credential(credential.clone())
            .holder(&self.holder_did)
            .build()
            .and_then(|vp| proof::sign_presentation(vp, &self.signing_key, &self.verification_method));

        match presentation {
            Ok(vp) => RoleResponse::presentation(&request.nonce, vp),
            Err(err) => RoleResponse::error(&request.nonce, err.to_string()),
        }
    }
}

impl std::fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialStore")
            .field("holder_did", &self.holder_did)
            .field("credentials", &self.credentials.len())
            .finish_non_exhaustive()
    }
}
