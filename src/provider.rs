//! # Providers
//!
//! The host boundary. A deployment supplies one `Provider` implementation
//! combining registry-store access, DID resolution, and peer messaging;
//! the pipeline is generic over it and everything else stays in-process.
//! Implementations return `anyhow::Result`; the core wraps failures into
//! its own error taxonomy at the call site.

use std::future::Future;

use crate::agent::AgentCard;
use crate::did::DidResolver;
use crate::registry::{AuthEvent, VerifiedRole};
use crate::role_exchange::{RoleRequest, RoleResponse};

/// Access to the external registry store.
///
/// A missing row is `Ok(None)`, never an error. All four operations are
/// issued through the `registry` circuit breaker by the core.
pub trait Registry: Send + Sync {
    /// The agent card for `agent_id`.
    fn agent_card(
        &self, agent_id: &str,
    ) -> impl Future<Output = anyhow::Result<Option<AgentCard>>> + Send;

    /// Append an audit record. Best-effort from the pipeline's view.
    fn record_event(&self, event: &AuthEvent) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// The cached verified-role row for `(agent_id, role)`.
    fn verified_role(
        &self, agent_id: &str, role: &str,
    ) -> impl Future<Output = anyhow::Result<Option<VerifiedRole>>> + Send;

    /// Insert or replace the verified-role row keyed by
    /// `(agent_id, role)`.
    fn upsert_verified_role(
        &self, row: &VerifiedRole,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;
}

/// Request/response messaging to a peer agent, used for the two-message
/// role-credential exchange. Delivery is at-most-once; the nonce guards
/// against duplicates at the application layer.
pub trait PeerTransport: Send + Sync {
    /// Send `request` to `agent_id` and await its response.
    fn exchange(
        &self, agent_id: &str, request: &RoleRequest,
    ) -> impl Future<Output = anyhow::Result<RoleResponse>> + Send;
}

/// The full provider the pipeline consumes.
pub trait Provider: Registry + DidResolver + PeerTransport + Clone {}

/// A blanket implementation for the `Provider` trait so that any type
/// implementing the required super traits is considered a `Provider`.
impl<T> Provider for T where T: Registry + DidResolver + PeerTransport + Clone {}
