//! # Authentication Pipeline
//!
//! The request-time orchestrator and the only component hosts invoke. One
//! call, [`Authenticator::authenticate`], runs the full admission state
//! machine: rate limiting, registry lookup, token verification, permission
//! checking, and (when asked) the role-credential exchange. The order is
//! deliberate: rate limiting before any cryptographic work, the registry
//! lookup before signature verification (it supplies the public key), the
//! cheap permission check before the potentially-networked role exchange.
//!
//! On success the caller receives an immutable [`AuthContext`]; on failure
//! one error from the closed taxonomy, already mapped to an HTTP status by
//! [`crate::error::Error::status`].

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentCard, DiscoveryDocument};
use crate::breaker::{BreakerRegistry, BreakerStats, CircuitBreaker};
use crate::config::Config;
use crate::core::{generate, sha256_hex};
use crate::did::DidCache;
use crate::error::{Error, Result};
use crate::observability::{self, EventKind, MetricsSnapshot, RequestContext};
use crate::provider::Provider;
use crate::rate_limit::{self, RateLimiter};
use crate::registry::{self, AuthEvent};
use crate::role_exchange::RoleExchange;
use crate::token::{Claims, TokenCodec, VerifyOptions};
use crate::w3c_vc::verify::CredentialVerifier;

/// Per-request authentication options.
#[derive(Clone, Debug, Default)]
pub struct AuthOptions {
    /// Role the peer must prove via a Verifiable Credential.
    pub required_role: Option<String>,

    /// Permissions the token must carry, compared by exact inclusion.
    pub required_permissions: Vec<String>,

    /// Overall deadline for this request, supplied by the host.
    pub deadline: Option<Duration>,

    /// The inbound request's cancellation signal.
    pub cancel: Option<CancellationToken>,
}

/// The product of successful authentication. Owned by the pipeline for the
/// request's duration; the caller receives it read-only.
#[derive(Clone, Debug)]
pub struct AuthContext {
    /// The authenticated peer's card.
    pub agent: AgentCard,

    /// The verified token claims.
    pub claims: Claims,

    /// The raw bearer token, for onward calls made on the peer's behalf.
    pub token: String,

    /// Roles proven by credential during this or an earlier request.
    pub verified_roles: HashSet<String>,

    /// Correlation id, also carried on every event this request emitted.
    pub request_id: String,
}

/// An authentication outcome paired with its request id, for hosts that
/// echo the id in a correlation header on both success and failure.
#[derive(Debug)]
pub struct AuthOutcome {
    /// The request's correlation id.
    pub request_id: String,

    /// The authentication result.
    pub result: Result<AuthContext>,
}

/// A point-in-time operational snapshot for host health endpoints.
#[derive(Clone, Debug, Serialize)]
pub struct AuthenticatorStats {
    /// Every breaker's state.
    pub breakers: Vec<BreakerStats>,

    /// Whether the shared rate-limit store is attached.
    pub shared_rate_limit: bool,

    /// Live in-memory rate-limit buckets.
    pub rate_limit_buckets: usize,

    /// Process-wide counters.
    pub metrics: MetricsSnapshot,
}

/// The assembled authentication core.
pub struct Authenticator<P: Provider> {
    config: Config,
    codec: TokenCodec,
    limiter: RateLimiter,
    breakers: BreakerRegistry,
    registry_breaker: Arc<CircuitBreaker>,
    audit_breaker: Arc<CircuitBreaker>,
    did_breaker: Arc<CircuitBreaker>,
    peer_breaker: Arc<CircuitBreaker>,
    did_cache: DidCache,
    provider: P,
}

impl<P: Provider> Authenticator<P> {
    /// Assemble the core from validated configuration and a host provider.
    ///
    /// An unreachable shared rate-limit store degrades to the in-memory
    /// backend with a warning; a malformed configuration is fatal.
    ///
    /// # Errors
    ///
    /// `ConfigurationInvalid` when validation fails.
    pub async fn new(config: Config, provider: P) -> Result<Self> {
        config.validate()?;

        let limiter = match &config.rate_limit.shared_store_url {
            Some(url) => {
                match RateLimiter::with_shared_store(config.rate_limit.clone(), url).await {
                    Ok(limiter) => limiter,
                    Err(err) => {
                        tracing::warn!(error = %err, "shared rate-limit store unavailable at startup");
                        observability::metrics().record_rate_limit_degraded();
                        observability::emit(
                            EventKind::RateLimitBackendDegraded,
                            observability::object(json!({ "at": "startup" })),
                        );
                        RateLimiter::in_memory(config.rate_limit.clone())
                    }
                }
            }
            None => RateLimiter::in_memory(config.rate_limit.clone()),
        };

        let breakers = BreakerRegistry::new();
        let registry_breaker = breakers.get_or_create("registry", config.breakers.registry);
        // Audit appends get their own breaker so a flapping audit table
        // cannot fail-fast agent-card lookups.
        let audit_breaker = breakers.get_or_create("registryAudit", config.breakers.registry);
        let did_breaker = breakers.get_or_create("didResolver", config.breakers.did_resolver);
        let peer_breaker = breakers.get_or_create("peerMessaging", config.breakers.peer_messaging);
        let did_cache = DidCache::new(config.did_cache_ttl);

        Ok(Self {
            codec: TokenCodec::new(config.algorithm),
            config,
            limiter,
            breakers,
            registry_breaker,
            audit_breaker,
            did_breaker,
            peer_breaker,
            did_cache,
            provider,
        })
    }

    /// Authenticate one inbound request.
    ///
    /// `token` is the raw bearer string; `agent_id` is the peer's id from
    /// the `X-Phlow-Agent-Id` header.
    ///
    /// # Errors
    ///
    /// One kind from the closed taxonomy; see the module docs for the
    /// step-by-step mapping.
    pub async fn authenticate(
        &self, token: &str, agent_id: &str, options: AuthOptions,
    ) -> Result<AuthContext> {
        self.authenticate_request(token, agent_id, options).await.result
    }

    /// As [`Self::authenticate`], but the request id travels with the
    /// outcome even on failure, so the host can set its correlation
    /// header on error responses too.
    pub async fn authenticate_request(
        &self, token: &str, agent_id: &str, options: AuthOptions,
    ) -> AuthOutcome {
        let request_id = generate::request_id();
        let context =
            RequestContext { request_id: request_id.clone(), agent_id: agent_id.to_string() };

        let result = observability::with_context(context, async {
            let started = Instant::now();
            let result =
                self.guarded(&options, self.run(token, agent_id, &options, &request_id)).await;
            self.conclude(token, agent_id, &request_id, started, result).await
        })
        .await;

        AuthOutcome { request_id, result }
    }

    /// Apply the host deadline and cancellation signal around the core
    /// steps. Cancellation propagates by drop into whichever suspension
    /// point is active.
    async fn guarded<F>(&self, options: &AuthOptions, fut: F) -> Result<AuthContext>
    where
        F: Future<Output = Result<AuthContext>>,
    {
        let deadline = options.deadline;
        let deadlined = async move {
            match deadline {
                Some(limit) => match tokio::time::timeout(limit, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::OperationTimeout("request deadline".to_string())),
                },
                None => fut.await,
            }
        };

        match &options.cancel {
            Some(cancel) => match cancel.run_until_cancelled(deadlined).await {
                Some(result) => result,
                None => Err(Error::Cancelled),
            },
            None => deadlined.await,
        }
    }

    /// Steps S2–S6.
    async fn run(
        &self, token: &str, agent_id: &str, options: &AuthOptions, request_id: &str,
    ) -> Result<AuthContext> {
        // Rate limiting first: a denied request costs no cryptography and
        // no registry traffic. This admission is deliberately not rolled
        // back when a later step fails.
        self.limiter.admit("auth", &rate_limit::token_key(token)).await?;

        let card = registry::agent_card(&self.provider, &self.registry_breaker, agent_id)
            .await?
            .ok_or_else(|| Error::AgentUnknown(agent_id.to_string()))?;
        card.validate(self.codec.algorithm())?;

        let claims = self.codec.verify(
            token,
            &card.public_key,
            &VerifyOptions {
                audience: Some(&self.config.agent_id),
                issuer: Some(agent_id),
                ..VerifyOptions::default()
            },
        )?;

        if !options.required_permissions.is_empty() {
            let missing: Vec<String> = options
                .required_permissions
                .iter()
                .filter(|permission| !claims.permissions.contains(*permission))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(Error::PermissionsInsufficient { missing });
            }
        }

        let mut verified_roles = HashSet::new();
        if let Some(role) = &options.required_role {
            let exchange = RoleExchange {
                provider: &self.provider,
                registry_breaker: self.registry_breaker.as_ref(),
                peer_breaker: self.peer_breaker.as_ref(),
                verifier: CredentialVerifier {
                    resolver: &self.provider,
                    cache: &self.did_cache,
                    breaker: self.did_breaker.as_ref(),
                },
                limiter: &self.limiter,
                cache_ttl: self.config.verified_role_ttl,
            };
            let row = exchange.obtain(agent_id, role).await?;
            verified_roles.insert(row.role);
        }

        Ok(AuthContext {
            agent: card,
            claims,
            token: token.to_string(),
            verified_roles,
            request_id: request_id.to_string(),
        })
    }

    /// Step S7 and its failure twin: metrics, the structured event, and
    /// the best-effort audit record.
    async fn conclude(
        &self, token: &str, agent_id: &str, request_id: &str, started: Instant,
        result: Result<AuthContext>,
    ) -> Result<AuthContext> {
        let token_hash = sha256_hex(token.as_bytes());

        match &result {
            Ok(context) => {
                observability::metrics().record_auth("success", started.elapsed());
                let roles: Vec<&String> = context.verified_roles.iter().collect();
                observability::emit(
                    EventKind::AuthSuccess,
                    observability::object(json!({
                        "agentId": agent_id,
                        "requestId": request_id,
                        "tokenHash": token_hash,
                        "verifiedRoles": roles,
                    })),
                );
                let event = AuthEvent::new(agent_id, "auth_success", true)
                    .with("requestId", json!(request_id))
                    .with("tokenHash", json!(token_hash));
                registry::record_event(&self.provider, &self.audit_breaker, event).await;
            }
            Err(err) => {
                observability::metrics().record_auth(err.kind(), started.elapsed());
                observability::emit(
                    EventKind::AuthFailure,
                    observability::object(json!({
                        "agentId": agent_id,
                        "requestId": request_id,
                        "error": err.kind(),
                    })),
                );
                // A cancelled request gets no post-cancel store traffic;
                // its side effects stay confined to observability.
                if !matches!(err, Error::Cancelled) {
                    let event = AuthEvent::new(agent_id, "auth_failure", false)
                        .with("requestId", json!(request_id))
                        .with("error", json!(err.kind()));
                    registry::record_event(&self.provider, &self.audit_breaker, event).await;
                }
            }
        }

        result
    }

    /// Sign a bearer token for this agent's own outbound calls.
    ///
    /// # Errors
    ///
    /// `ConfigurationInvalid` for an unparsable TTL or unusable key.
    pub fn mint_token(
        &self, audience: &str, permissions: impl IntoIterator<Item = String>, ttl: &str,
    ) -> Result<String> {
        let claims = Claims {
            sub: self.config.agent_id.clone(),
            iss: self.config.agent_id.clone(),
            aud: audience.to_string(),
            permissions: permissions.into_iter().collect(),
            ..Claims::default()
        };
        self.codec.sign_with_ttl(&claims, &self.config.private_key, ttl)
    }

    /// This agent's card, as peers would see it in the registry.
    #[must_use]
    pub fn self_card(&self) -> AgentCard {
        AgentCard {
            agent_id: self.config.agent_id.clone(),
            name: self.config.agent_name.clone(),
            public_key: self.config.public_key.clone(),
            service_url: self.config.service_url.clone(),
            ..AgentCard::default()
        }
    }

    /// The `/.well-known/agent.json` document for the host to serve.
    #[must_use]
    pub fn discovery_document(&self) -> DiscoveryDocument {
        DiscoveryDocument::from(&self.self_card())
    }

    /// Operational snapshot for host health endpoints.
    #[must_use]
    pub fn stats(&self) -> AuthenticatorStats {
        AuthenticatorStats {
            breakers: self.breakers.stats(),
            shared_rate_limit: self.limiter.is_shared(),
            rate_limit_buckets: self.limiter.memory_buckets(),
            metrics: observability::metrics().snapshot(),
        }
    }

    /// Tear the core down: in-flight requests are caller-owned futures, so
    /// this only releases the shared-store connection.
    pub fn shutdown(self) {
        tracing::info!(agent_id = %self.config.agent_id, "authentication core shut down");
        drop(self);
    }
}

impl<P: Provider> std::fmt::Debug for Authenticator<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Authenticator")
            .field("agent_id", &self.config.agent_id)
            .field("algorithm", &self.codec.algorithm())
            .finish_non_exhaustive()
    }
}
