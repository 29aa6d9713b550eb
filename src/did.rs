//! # DID Resolution
//!
//! A decentralized identifier resolves to a document listing the public
//! keys that verify credentials issued under it. Resolution itself is a
//! host concern (registries, `did:web` fetches, or a local key table all
//! work), so the core only defines the [`DidResolver`] boundary, a minimal
//! document model, and a TTL cache in front of the resolver.

use std::future::Future;
use std::time::{Duration, Instant};

use base64ct::{Base64UrlUnpadded, Encoding};
use dashmap::DashMap;
use ed25519_dalek::VerifyingKey;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::breaker::CircuitBreaker;
use crate::error::{Error, Result};
use crate::observability::{self, EventKind};

/// A resolved DID document, reduced to what credential verification needs.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Document {
    /// The DID the document describes.
    pub id: String,

    /// Public keys usable to verify proofs referencing this DID.
    pub verification_method: Vec<VerificationMethod>,
}

impl Document {
    /// Locate the verification method a proof references, accepting either
    /// the full DID URL or its bare fragment.
    #[must_use]
    pub fn verification_method(&self, reference: &str) -> Option<&VerificationMethod> {
        self.verification_method.iter().find(|vm| {
            if vm.id == reference {
                return true;
            }
            // A `#fragment` reference is relative to this document.
            if let Some(fragment) = reference.strip_prefix('#') {
                return vm.id == format!("{}#{fragment}", self.id) || vm.id == fragment;
            }
            // A full DID URL may reference a method stored by bare fragment.
            reference
                .strip_prefix(&self.id)
                .and_then(|rest| rest.strip_prefix('#'))
                .is_some_and(|fragment| vm.id == fragment)
        })
    }
}

/// One verification method within a DID document.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct VerificationMethod {
    /// The method's DID URL, e.g. `did:example:issuer1#key-1`.
    pub id: String,

    /// Method type, e.g. `Ed25519VerificationKey2020`.
    #[serde(rename = "type")]
    pub type_: String,

    /// The DID controlling this key.
    pub controller: String,

    /// The public key as a JWK.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_key_jwk: Option<PublicKeyJwk>,
}

impl VerificationMethod {
    /// The Ed25519 key this method carries.
    ///
    /// # Errors
    ///
    /// Fails with `CredentialSignatureInvalid` when the JWK is absent, not
    /// an `OKP`/`Ed25519` key, or its bytes do not form a valid point.
    pub fn ed25519_key(&self) -> Result<VerifyingKey> {
        let jwk = self
            .public_key_jwk
            .as_ref()
            .ok_or_else(|| Error::CredentialSignatureInvalid("verification method has no key".to_string()))?;
        if jwk.kty != "OKP" || jwk.crv != "Ed25519" {
            return Err(Error::CredentialSignatureInvalid(format!(
                "unsupported key type {}/{}",
                jwk.kty, jwk.crv
            )));
        }
        let bytes = Base64UrlUnpadded::decode_vec(&jwk.x)
            .map_err(|_| Error::CredentialSignatureInvalid("key bytes are not base64url".to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::CredentialSignatureInvalid("key must be 32 bytes".to_string()))?;
        VerifyingKey::from_bytes(&bytes)
            .map_err(|_| Error::CredentialSignatureInvalid("key bytes rejected".to_string()))
    }
}

/// A JSON Web Key, restricted to the `OKP`/`Ed25519` shape used for
/// credential proofs.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct PublicKeyJwk {
    /// Key type; `OKP` for Ed25519.
    pub kty: String,

    /// Curve name.
    pub crv: String,

    /// Public key bytes, base64url.
    pub x: String,
}

impl PublicKeyJwk {
    /// The JWK for an Ed25519 verifying key.
    #[must_use]
    pub fn from_ed25519(key: &VerifyingKey) -> Self {
        Self {
            kty: "OKP".to_string(),
            crv: "Ed25519".to_string(),
            x: Base64UrlUnpadded::encode_string(key.as_bytes()),
        }
    }
}

/// Host-supplied DID resolution.
pub trait DidResolver: Send + Sync {
    /// Resolve `did` to its document.
    fn resolve(&self, did: &str) -> impl Future<Output = anyhow::Result<Document>> + Send;
}

/// TTL cache in front of a [`DidResolver`], with resolution routed through
/// the `didResolver` circuit breaker. Emits a `did_resolve` event per
/// lookup carrying the cache outcome.
#[derive(Debug)]
pub struct DidCache {
    entries: DashMap<String, (Document, Instant)>,
    ttl: Duration,
}

impl DidCache {
    /// An empty cache holding documents for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self { entries: DashMap::new(), ttl }
    }

    /// Resolve `did`, serving from cache when fresh.
    ///
    /// # Errors
    ///
    /// `IssuerUnresolved` when the resolver fails, `CircuitOpen` /
    /// `OperationTimeout` from the breaker.
    pub async fn resolve<R: DidResolver>(
        &self, resolver: &R, breaker: &CircuitBreaker, did: &str,
    ) -> Result<Document> {
        if let Some(entry) = self.entries.get(did) {
            let (document, cached_at) = entry.value();
            if cached_at.elapsed() < self.ttl {
                let document = document.clone();
                drop(entry);
                self.record(did, true);
                return Ok(document);
            }
        }

        let document = breaker
            .call(|| async {
                resolver
                    .resolve(did)
                    .await
                    .map_err(|e| Error::IssuerUnresolved(e.to_string()))
            })
            .await?;

        self.entries.insert(did.to_string(), (document.clone(), Instant::now()));
        self.record(did, false);
        Ok(document)
    }

    fn record(&self, did: &str, cache_hit: bool) {
        observability::metrics().record_did_resolution(cache_hit);
        observability::emit(
            EventKind::DidResolve,
            observability::object(json!({ "did": did, "cache": if cache_hit { "hit" } else { "miss" } })),
        );
    }
}
