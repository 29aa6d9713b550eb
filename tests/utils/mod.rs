//! Shared test fixtures: an in-memory provider, deterministic key
//! material, and a fast-recovery configuration.
#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;

use phlow::agent::AgentCard;
use phlow::breaker::BreakerSettings;
use phlow::config::Config;
use phlow::core::OneMany;
use phlow::did::{DidResolver, Document, PublicKeyJwk, VerificationMethod};
use phlow::provider::{PeerTransport, Registry};
use phlow::registry::{AuthEvent, VerifiedRole};
use phlow::role_exchange::{CredentialStore, RoleRequest, RoleResponse};
use phlow::token::{Claims, TokenCodec};
use phlow::w3c_vc::{CredentialSubject, VerifiableCredential, proof};

pub const ALICE_KEY: &str = include_str!("../fixtures/alice.key.pem");
pub const ALICE_PUB: &str = include_str!("../fixtures/alice.pub.pem");
pub const BOB_KEY: &str = include_str!("../fixtures/bob.key.pem");
pub const BOB_PUB: &str = include_str!("../fixtures/bob.pub.pem");

pub const ISSUER_DID: &str = "did:example:issuer1";
pub const BOB_DID: &str = "did:example:bob";

pub fn init_tracer() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

pub fn issuer_signing_key() -> SigningKey {
    SigningKey::from_bytes(&[42u8; 32])
}

pub fn holder_signing_key() -> SigningKey {
    SigningKey::from_bytes(&[9u8; 32])
}

pub fn issuer_document() -> Document {
    Document {
        id: ISSUER_DID.to_string(),
        verification_method: vec![VerificationMethod {
            id: format!("{ISSUER_DID}#key-1"),
            type_: "Ed25519VerificationKey2020".to_string(),
            controller: ISSUER_DID.to_string(),
            public_key_jwk: Some(PublicKeyJwk::from_ed25519(
                &issuer_signing_key().verifying_key(),
            )),
        }],
    }
}

/// A credential for `role`, issued to Bob and signed by the test issuer.
pub fn role_credential(role: &str) -> VerifiableCredential {
    let vc = VerifiableCredential {
        issuer: ISSUER_DID.to_string(),
        credential_subject: CredentialSubject {
            id: Some(BOB_DID.to_string()),
            role: Some(OneMany::One(role.to_string())),
            ..CredentialSubject::default()
        },
        ..VerifiableCredential::default()
    };
    proof::sign_credential(vc, &issuer_signing_key(), &format!("{ISSUER_DID}#key-1"))
        .expect("should sign credential")
}

/// Bob's credential store, holding one credential per given role.
pub fn bob_store(roles: &[&str]) -> CredentialStore {
    let mut store =
        CredentialStore::new(BOB_DID, format!("{BOB_DID}#key-1"), holder_signing_key());
    for role in roles {
        store = store.with_credential(role_credential(role));
    }
    store
}

/// How the fake peer transport behaves.
#[derive(Clone)]
pub enum PeerMode {
    /// Answer through the given credential store.
    Respond(CredentialStore),
    /// Answer correctly but with a fabricated nonce.
    WrongNonce(CredentialStore),
    /// Present the store's first credential regardless of the asked role.
    WrongRole(CredentialStore, String),
    /// Fail at the transport level.
    Unreachable,
}

/// In-memory provider: registry tables, DID documents, and a scripted
/// peer, with call counters for ordering assertions.
#[derive(Clone)]
pub struct ProviderImpl {
    pub cards: Arc<DashMap<String, AgentCard>>,
    pub roles: Arc<DashMap<(String, String), VerifiedRole>>,
    pub events: Arc<Mutex<Vec<AuthEvent>>>,
    pub documents: Arc<DashMap<String, Document>>,
    pub peer_mode: Arc<Mutex<PeerMode>>,
    pub registry_calls: Arc<AtomicU64>,
    pub peer_calls: Arc<AtomicU64>,
    pub registry_down: Arc<AtomicBool>,
    pub registry_delay: Arc<Mutex<Duration>>,
}

impl ProviderImpl {
    pub fn new() -> Self {
        Self {
            cards: Arc::new(DashMap::new()),
            roles: Arc::new(DashMap::new()),
            events: Arc::new(Mutex::new(Vec::new())),
            documents: Arc::new(DashMap::new()),
            peer_mode: Arc::new(Mutex::new(PeerMode::Unreachable)),
            registry_calls: Arc::new(AtomicU64::new(0)),
            peer_calls: Arc::new(AtomicU64::new(0)),
            registry_down: Arc::new(AtomicBool::new(false)),
            registry_delay: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// A provider with Bob registered and the issuer document resolvable.
    pub fn with_bob() -> Self {
        let provider = Self::new();
        provider.cards.insert(
            "bob".to_string(),
            AgentCard {
                agent_id: "bob".to_string(),
                name: "Bob".to_string(),
                public_key: BOB_PUB.to_string(),
                ..AgentCard::default()
            },
        );
        provider.documents.insert(ISSUER_DID.to_string(), issuer_document());
        provider
    }

    pub fn set_peer_mode(&self, mode: PeerMode) {
        *self.peer_mode.lock() = mode;
    }

    pub fn audit_events(&self, event_type: &str) -> Vec<AuthEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.event_type == event_type)
            .cloned()
            .collect()
    }
}

impl Registry for ProviderImpl {
    async fn agent_card(&self, agent_id: &str) -> anyhow::Result<Option<AgentCard>> {
        self.registry_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.registry_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.registry_down.load(Ordering::SeqCst) {
            anyhow::bail!("registry offline");
        }
        Ok(self.cards.get(agent_id).map(|entry| entry.value().clone()))
    }

    async fn record_event(&self, event: &AuthEvent) -> anyhow::Result<()> {
        if self.registry_down.load(Ordering::SeqCst) {
            anyhow::bail!("registry offline");
        }
        self.events.lock().push(event.clone());
        Ok(())
    }

    async fn verified_role(&self, agent_id: &str, role: &str) -> anyhow::Result<Option<VerifiedRole>> {
        if self.registry_down.load(Ordering::SeqCst) {
            anyhow::bail!("registry offline");
        }
        Ok(self
            .roles
            .get(&(agent_id.to_string(), role.to_string()))
            .map(|entry| entry.value().clone()))
    }

    async fn upsert_verified_role(&self, row: &VerifiedRole) -> anyhow::Result<()> {
        if self.registry_down.load(Ordering::SeqCst) {
            anyhow::bail!("registry offline");
        }
        self.roles.insert((row.agent_id.clone(), row.role.clone()), row.clone());
        Ok(())
    }
}

impl DidResolver for ProviderImpl {
    async fn resolve(&self, did: &str) -> anyhow::Result<Document> {
        self.documents
            .get(did)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| anyhow::anyhow!("unknown DID: {did}"))
    }
}

impl PeerTransport for ProviderImpl {
    async fn exchange(&self, _agent_id: &str, request: &RoleRequest) -> anyhow::Result<RoleResponse> {
        self.peer_calls.fetch_add(1, Ordering::SeqCst);
        let mode = self.peer_mode.lock().clone();
        match mode {
            PeerMode::Respond(store) => Ok(store.handle_role_request(request)),
            PeerMode::WrongNonce(store) => {
                let mut response = store.handle_role_request(request);
                response.nonce = "0000feedfacedeadbeef0000".to_string();
                Ok(response)
            }
            PeerMode::WrongRole(store, role) => {
                let substituted = RoleRequest { required_role: role, ..request.clone() };
                Ok(store.handle_role_request(&substituted))
            }
            PeerMode::Unreachable => anyhow::bail!("peer unreachable"),
        }
    }
}

/// Alice's configuration with test-friendly breaker and limiter settings.
pub fn test_config() -> Config {
    let mut config = Config::new("alice", "Alice", ALICE_KEY, ALICE_PUB);
    let fast = BreakerSettings {
        failure_threshold: 3,
        recovery: Duration::from_millis(50),
        operation_timeout: Duration::from_millis(500),
    };
    config.breakers.registry = fast;
    config.breakers.did_resolver = fast;
    config.breakers.peer_messaging = fast;
    config.rate_limit.max_requests = 100;
    config.rate_limit.window = Duration::from_secs(60);
    config
}

/// A valid bearer token from Bob to Alice.
pub fn bob_token(permissions: &[&str]) -> String {
    let claims = Claims {
        sub: "bob".to_string(),
        iss: "bob".to_string(),
        aud: "alice".to_string(),
        permissions: permissions.iter().map(ToString::to_string).collect(),
        ..Claims::default()
    };
    TokenCodec::new(jsonwebtoken::Algorithm::RS256)
        .sign(&claims, BOB_KEY, Duration::from_secs(600))
        .expect("should sign token")
}

/// A token with arbitrary claims, signed with Bob's key outside the codec
/// (for expiry and claim-mismatch scenarios).
pub fn bob_token_raw(claims: &Claims) -> String {
    let key = jsonwebtoken::EncodingKey::from_rsa_pem(BOB_KEY.as_bytes()).expect("should load key");
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
        claims,
        &key,
    )
    .expect("should encode")
}
