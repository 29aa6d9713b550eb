//! # Errors
//!
//! The closed error taxonomy for the authentication core. Every failure a
//! caller can observe is one of these kinds; hosts map them to transport
//! status codes with [`Error::status`] and to client-visible bodies with
//! [`ErrorResponse`] without matching on message text.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A convenience `Result` using the crate [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Every failure kind the core can surface.
#[derive(Error, Debug)]
pub enum Error {
    /// The bearer token is not three base64url segments, or a segment does
    /// not decode.
    #[error("malformed token: {0}")]
    TokenMalformed(String),

    /// The token signature does not validate under the agent's public key,
    /// or the token's header algorithm differs from the configured one.
    #[error("token signature rejected: {0}")]
    TokenSignatureInvalid(String),

    /// The token's `exp` plus any leeway is in the past.
    #[error("token expired")]
    TokenExpired,

    /// An audience, issuer, or subject constraint was violated.
    #[error("token claim mismatch: {0}")]
    TokenClaimMismatch(String),

    /// The presented agent id has no card in the registry.
    #[error("unknown agent: {0}")]
    AgentUnknown(String),

    /// The token's permissions do not include every required permission.
    #[error("insufficient permissions")]
    PermissionsInsufficient {
        /// The required permissions absent from the token.
        missing: Vec<String>,
    },

    /// The peer holds no credential for the required role.
    #[error("no credential for role: {0}")]
    RoleAbsent(String),

    /// The peer answered a role-credential request with an error instead of
    /// a presentation.
    #[error("role credential refused: {0}")]
    RoleCredentialRefused(String),

    /// A role-credential response did not echo the request nonce.
    #[error("role-credential response nonce does not match request")]
    NonceMismatch,

    /// A credential's `expirationDate` is not in the future.
    #[error("credential expired")]
    CredentialExpired,

    /// A credential proof does not validate under the issuer's resolved key.
    #[error("credential signature rejected: {0}")]
    CredentialSignatureInvalid(String),

    /// A presentation or credential failed schema-level validation.
    #[error("malformed credential: {0}")]
    CredentialMalformed(String),

    /// A credential issuer's DID could not be resolved.
    #[error("issuer could not be resolved: {0}")]
    IssuerUnresolved(String),

    /// A proof's `verificationMethod` is absent from the resolved DID
    /// document.
    #[error("verification method not found: {0}")]
    VerificationMethodNotFound(String),

    /// The sliding-window rate limit denied the request.
    #[error("rate limit exceeded")]
    RateLimitExceeded {
        /// Unix-millisecond instant at which a slot frees up.
        reset_at: i64,
    },

    /// The named circuit breaker is open and failed the call fast.
    #[error("circuit open: {0}")]
    CircuitOpen(String),

    /// An operation exceeded its configured or requested deadline.
    #[error("operation timed out: {0}")]
    OperationTimeout(String),

    /// The host cancelled the inbound request.
    #[error("request cancelled")]
    Cancelled,

    /// The registry store failed for a reason other than a missing row.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// Configuration failed validation at startup. Fatal.
    #[error("invalid configuration: {0}")]
    ConfigurationInvalid(String),
}

impl Error {
    /// The stable kind string carried in client-visible responses and audit
    /// events. Never includes request-specific detail.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::TokenMalformed(_) => "token_malformed",
            Self::TokenSignatureInvalid(_) => "token_signature_invalid",
            Self::TokenExpired => "token_expired",
            Self::TokenClaimMismatch(_) => "token_claim_mismatch",
            Self::AgentUnknown(_) => "agent_unknown",
            Self::PermissionsInsufficient { .. } => "permissions_insufficient",
            Self::RoleAbsent(_) => "role_absent",
            Self::RoleCredentialRefused(_) => "role_credential_refused",
            Self::NonceMismatch => "nonce_mismatch",
            Self::CredentialExpired => "credential_expired",
            Self::CredentialSignatureInvalid(_) => "credential_signature_invalid",
            Self::CredentialMalformed(_) => "credential_malformed",
            Self::IssuerUnresolved(_) => "issuer_unresolved",
            Self::VerificationMethodNotFound(_) => "verification_method_not_found",
            Self::RateLimitExceeded { .. } => "rate_limit_exceeded",
            Self::CircuitOpen(_) => "circuit_open",
            Self::OperationTimeout(_) => "operation_timeout",
            Self::Cancelled => "cancelled",
            Self::RegistryUnavailable(_) => "registry_unavailable",
            Self::ConfigurationInvalid(_) => "configuration_invalid",
        }
    }

    /// The HTTP status the host should answer with.
    #[must_use]
    pub const fn status(&self) -> u16 {
        match self {
            Self::TokenMalformed(_)
            | Self::TokenSignatureInvalid(_)
            | Self::TokenExpired
            | Self::TokenClaimMismatch(_)
            | Self::AgentUnknown(_) => 401,
            Self::PermissionsInsufficient { .. }
            | Self::RoleAbsent(_)
            | Self::RoleCredentialRefused(_)
            | Self::NonceMismatch
            | Self::CredentialExpired
            | Self::CredentialSignatureInvalid(_)
            | Self::CredentialMalformed(_)
            | Self::IssuerUnresolved(_)
            | Self::VerificationMethodNotFound(_) => 403,
            Self::RateLimitExceeded { .. } => 429,
            Self::CircuitOpen(_)
            | Self::OperationTimeout(_)
            | Self::RegistryUnavailable(_)
            | Self::Cancelled => 503,
            Self::ConfigurationInvalid(_) => 500,
        }
    }

    /// Whether the breaker treats this error as a dependency failure.
    /// Caller-initiated cancellation never trips a breaker.
    #[must_use]
    pub const fn counts_as_breaker_failure(&self) -> bool {
        !matches!(self, Self::Cancelled)
    }
}

/// The client-visible error body: a stable kind plus human-readable text,
/// never implementation error detail.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct ErrorResponse {
    /// Stable kind string from [`Error::kind`].
    pub error: String,

    /// Human-readable description.
    pub message: String,
}

impl From<&Error> for ErrorResponse {
    fn from(err: &Error) -> Self {
        Self {
            error: err.kind().to_string(),
            message: err.to_string(),
        }
    }
}
