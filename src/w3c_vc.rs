//! # W3C Verifiable Credentials
//!
//! The W3C-shaped structures role assertions travel in: a credential binds
//! a role to a subject under an issuer's signature, and a presentation
//! wraps one or more credentials under the holder's signature for delivery
//! to a verifier.
//!
//! The model is deliberately narrow (just the fields role exchange needs)
//! but stays wire-compatible with the broader data model: `@context`
//! entries may be strings or objects, `type` one or many, and unknown
//! subject claims are preserved.

pub mod proof;
pub mod verify;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::core::{Kind, OneMany, sha256_hex};
use crate::error::{Error, Result};

/// The base context every credential and presentation carries.
pub const BASE_CONTEXT: &str = "https://www.w3.org/2018/credentials/v1";

/// A credential binding one or more roles to a subject.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerifiableCredential {
    /// The @context property maps property URIs into short-form aliases.
    /// An ordered set whose first item is the base credentials context.
    #[serde(rename = "@context")]
    pub context: Vec<Kind<Value>>,

    /// An optional unique identifier for the credential.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The credential type(s); includes `VerifiableCredential`.
    #[serde(rename = "type")]
    pub type_: OneMany<String>,

    /// The issuer's DID. Resolved to locate the proof verification key.
    pub issuer: String,

    /// Claims about the credential subject.
    pub credential_subject: CredentialSubject,

    /// When the credential was issued.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub issuance_date: Option<DateTime<Utc>>,

    /// When the credential ceases to be valid, if ever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<DateTime<Utc>>,

    /// The issuer's proof over the credential's canonical form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<Proof>,
}

impl Default for VerifiableCredential {
    fn default() -> Self {
        Self {
            context: vec![Kind::String(BASE_CONTEXT.to_string())],
            id: Some(format!("urn:uuid:{}", Uuid::new_v4())),
            type_: OneMany::One("VerifiableCredential".to_string()),
            issuer: String::new(),
            credential_subject: CredentialSubject::default(),
            issuance_date: Some(Utc::now()),
            expiration_date: None,
            proof: None,
        }
    }
}

impl VerifiableCredential {
    /// The roles asserted by `credentialSubject.role`, string or array.
    #[must_use]
    pub fn roles(&self) -> Vec<&str> {
        self.credential_subject
            .role
            .as_ref()
            .map(|role| role.as_slice().iter().map(String::as_str).collect())
            .unwrap_or_default()
    }

    /// Whether the credential asserts `role`.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles().contains(&role)
    }

    /// The deterministic signing input: the credential serialized with its
    /// proof removed. Signer and verifier both use this form.
    ///
    /// # Errors
    ///
    /// Fails with `CredentialMalformed` when serialization fails.
    pub fn canonical_form(&self) -> Result<Vec<u8>> {
        let unsigned = Self { proof: None, ..self.clone() };
        serde_json::to_vec(&unsigned)
            .map_err(|e| Error::CredentialMalformed(format!("credential does not serialize: {e}")))
    }
}

/// Claims about the subject referenced by a credential.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct CredentialSubject {
    /// A URI uniquely identifying the subject, typically the agent's DID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The role(s) this credential asserts for the subject.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<OneMany<String>>,

    /// Further claims about the subject.
    #[serde(flatten)]
    pub claims: Map<String, Value>,
}

/// A presentation combines credentials for delivery to a verifier, under
/// the holder's signature.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VerifiablePresentation {
    /// The @context property, as on [`VerifiableCredential`].
    #[serde(rename = "@context")]
    pub context: Vec<Kind<Value>>,

    /// An optional unique identifier for the presentation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// The presentation type(s); includes `VerifiablePresentation`.
    #[serde(rename = "type")]
    pub type_: OneMany<String>,

    /// The wrapped credentials.
    pub verifiable_credential: Vec<VerifiableCredential>,

    /// A URI for the entity generating the presentation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder: Option<String>,

    /// The holder's proof over the presentation's canonical form.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proof: Option<Proof>,
}

impl VerifiablePresentation {
    /// Returns a new [`VpBuilder`].
    #[must_use]
    pub fn builder() -> VpBuilder {
        VpBuilder::new()
    }

    /// The deterministic signing input: the presentation serialized with
    /// its own proof removed. Credential proofs stay in place.
    ///
    /// # Errors
    ///
    /// Fails with `CredentialMalformed` when serialization fails.
    pub fn canonical_form(&self) -> Result<Vec<u8>> {
        let unsigned = Self { proof: None, ..self.clone() };
        serde_json::to_vec(&unsigned)
            .map_err(|e| Error::CredentialMalformed(format!("presentation does not serialize: {e}")))
    }

    /// Hex SHA-256 over the canonical form, recorded with cached verified
    /// roles so a later audit can tie the row to the exact presentation.
    ///
    /// # Errors
    ///
    /// As [`Self::canonical_form`].
    pub fn content_hash(&self) -> Result<String> {
        Ok(sha256_hex(&self.canonical_form()?))
    }
}

impl TryFrom<VpBuilder> for VerifiablePresentation {
    type Error = Error;

    fn try_from(builder: VpBuilder) -> Result<Self> {
        builder.build()
    }
}

/// A Data Integrity proof block.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Proof {
    /// The proof suite, e.g. `Ed25519Signature2020`.
    #[serde(rename = "type")]
    pub type_: String,

    /// When the proof was created.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,

    /// DID URL of the key that verifies `proofValue`.
    pub verification_method: String,

    /// Why the proof was created, e.g. `assertionMethod`.
    pub proof_purpose: String,

    /// The signature, base64url over the canonical form.
    pub proof_value: String,
}

/// [`VpBuilder`] is used to build a [`VerifiablePresentation`].
#[derive(Clone, Debug)]
pub struct VpBuilder {
    vp: VerifiablePresentation,
}

impl Default for VpBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl VpBuilder {
    /// Returns a new [`VpBuilder`] with sensible defaults.
    #[must_use]
    pub fn new() -> Self {
        Self {
            vp: VerifiablePresentation {
                context: vec![Kind::String(BASE_CONTEXT.to_string())],
                id: Some(format!("urn:uuid:{}", Uuid::new_v4())),
                type_: OneMany::One("VerifiablePresentation".to_string()),
                verifiable_credential: vec![],
                holder: None,
                proof: None,
            },
        }
    }

    /// Adds an entry to the `@context` property.
    #[must_use]
    pub fn add_context(mut self, context: Kind<Value>) -> Self {
        self.vp.context.push(context);
        self
    }

    /// Adds a type to the `type` property.
    #[must_use]
    pub fn add_type(mut self, type_: impl Into<String>) -> Self {
        self.vp.type_.add(type_.into());
        self
    }

    /// Adds a credential to the presentation.
    #[must_use]
    pub fn add_credential(mut self, vc: VerifiableCredential) -> Self {
        self.vp.verifiable_credential.push(vc);
        self
    }

    /// Sets the `holder` property.
    #[must_use]
    pub fn holder(mut self, holder: impl Into<String>) -> Self {
        self.vp.holder = Some(holder.into());
        self
    }

    /// Turns this builder into a [`VerifiablePresentation`].
    ///
    /// # Errors
    ///
    /// Fails with `CredentialMalformed` when no credential has been added.
    pub fn build(self) -> Result<VerifiablePresentation> {
        if self.vp.verifiable_credential.is_empty() {
            return Err(Error::CredentialMalformed(
                "presentation requires at least one credential".to_string(),
            ));
        }
        Ok(self.vp)
    }
}
