//! # Presentation Verification
//!
//! Cryptographic validation of a presentation: every wrapped credential
//! must carry a proof that validates under a key resolved from its
//! issuer's DID. The verifier performs no I/O beyond DID resolution, and
//! for a fixed clock its outcome is a pure function of its inputs.

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{VerifiablePresentation, proof};
use crate::breaker::CircuitBreaker;
use crate::did::{DidCache, DidResolver};
use crate::error::{Error, Result};

/// A role assertion extracted from a verified credential.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct VerifiedRoleClaim {
    /// The asserted role.
    pub role: String,

    /// The DID of the issuer whose signature covered the assertion.
    pub issuer: String,
}

/// Verifies presentations against issuer keys resolved through the
/// breaker-wrapped DID resolver.
#[derive(Debug)]
pub struct CredentialVerifier<'a, R: DidResolver> {
    /// Host DID resolution.
    pub resolver: &'a R,

    /// TTL cache over resolved documents.
    pub cache: &'a DidCache,

    /// The `didResolver` circuit breaker.
    pub breaker: &'a CircuitBreaker,
}

impl<R: DidResolver> CredentialVerifier<'_, R> {
    /// Verify every credential in `vp` and return the asserted roles.
    ///
    /// # Errors
    ///
    /// - `CredentialMalformed`: structural problems (wrong type, no
    ///   credentials, missing proof or issuer).
    /// - `CredentialExpired`: a credential's `expirationDate` has passed.
    /// - `IssuerUnresolved` / `CircuitOpen` / `OperationTimeout`: DID
    ///   resolution trouble.
    /// - `VerificationMethodNotFound`: the proof references a key the
    ///   resolved document does not list.
    /// - `CredentialSignatureInvalid`: a proof does not validate. One bad
    ///   credential fails the whole presentation.
    pub async fn verify(&self, vp: &VerifiablePresentation) -> Result<Vec<VerifiedRoleClaim>> {
        self.verify_at(vp, Utc::now()).await
    }

    /// [`Self::verify`] against an explicit clock.
    pub async fn verify_at(
        &self, vp: &VerifiablePresentation, now: DateTime<Utc>,
    ) -> Result<Vec<VerifiedRoleClaim>> {
        if !vp.type_.contains(&"VerifiablePresentation".to_string()) {
            return Err(Error::CredentialMalformed(
                "type must include VerifiablePresentation".to_string(),
            ));
        }
        if vp.verifiable_credential.is_empty() {
            return Err(Error::CredentialMalformed("presentation wraps no credentials".to_string()));
        }

        let mut claims = Vec::new();
        for vc in &vp.verifiable_credential {
            if let Some(expiry) = vc.expiration_date {
                if expiry <= now {
                    return Err(Error::CredentialExpired);
                }
            }
            if vc.issuer.is_empty() {
                return Err(Error::IssuerUnresolved("credential names no issuer".to_string()));
            }
            let vc_proof = vc
                .proof
                .as_ref()
                .ok_or_else(|| Error::CredentialMalformed("credential has no proof".to_string()))?;

            let document = self.cache.resolve(self.resolver, self.breaker, &vc.issuer).await?;
            let method = document.verification_method(&vc_proof.verification_method).ok_or_else(
                || Error::VerificationMethodNotFound(vc_proof.verification_method.clone()),
            )?;

            proof::verify_credential(vc, &method.ed25519_key()?)?;

            for role in vc.roles() {
                claims.push(VerifiedRoleClaim { role: role.to_string(), issuer: vc.issuer.clone() });
            }
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;
    use ed25519_dalek::SigningKey;

    use super::*;
    use crate::breaker::{BreakerRegistry, BreakerSettings};
    use crate::core::OneMany;
    use crate::did::{Document, PublicKeyJwk, VerificationMethod};
    use crate::w3c_vc::{CredentialSubject, VerifiableCredential};
    use std::time::Duration;

    const ISSUER: &str = "did:example:issuer1";

    #[derive(Clone)]
    struct StaticResolver {
        document: Document,
    }

    impl DidResolver for StaticResolver {
        async fn resolve(&self, did: &str) -> anyhow::Result<Document> {
            if did == self.document.id {
                Ok(self.document.clone())
            } else {
                Err(anyhow::anyhow!("unknown DID: {did}"))
            }
        }
    }

    fn issuer_key() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    fn issuer_document() -> Document {
        Document {
            id: ISSUER.to_string(),
            verification_method: vec![VerificationMethod {
                id: format!("{ISSUER}#key-1"),
                type_: "Ed25519VerificationKey2020".to_string(),
                controller: ISSUER.to_string(),
                public_key_jwk: Some(PublicKeyJwk::from_ed25519(&issuer_key().verifying_key())),
            }],
        }
    }

    fn signed_role_vc(role: &str) -> VerifiableCredential {
        let vc = VerifiableCredential {
            issuer: ISSUER.to_string(),
            credential_subject: CredentialSubject {
                id: Some("did:example:bob".to_string()),
                role: Some(OneMany::One(role.to_string())),
                ..CredentialSubject::default()
            },
            ..VerifiableCredential::default()
        };
        proof::sign_credential(vc, &issuer_key(), &format!("{ISSUER}#key-1"))
            .expect("should sign")
    }

    fn presentation(credentials: Vec<VerifiableCredential>) -> VerifiablePresentation {
        let mut builder = VerifiablePresentation::builder().holder("did:example:bob");
        for vc in credentials {
            builder = builder.add_credential(vc);
        }
        builder.build().expect("should build")
    }

    async fn run(vp: &VerifiablePresentation) -> Result<Vec<VerifiedRoleClaim>> {
        let resolver = StaticResolver { document: issuer_document() };
        let cache = DidCache::new(Duration::from_secs(60));
        let breaker =
            BreakerRegistry::new().get_or_create("didResolver", BreakerSettings::default());
        let verifier =
            CredentialVerifier { resolver: &resolver, cache: &cache, breaker: breaker.as_ref() };
        verifier.verify(vp).await
    }

    #[tokio::test]
    async fn valid_presentation_yields_roles() {
        let vp = presentation(vec![signed_role_vc("admin")]);
        let claims = run(&vp).await.expect("should verify");
        assert_eq!(
            claims,
            vec![VerifiedRoleClaim { role: "admin".to_string(), issuer: ISSUER.to_string() }]
        );
    }

    #[tokio::test]
    async fn one_bad_credential_fails_the_presentation() {
        let mut forged = signed_role_vc("admin");
        forged.credential_subject.role = Some(OneMany::One("superadmin".to_string()));
        let vp = presentation(vec![signed_role_vc("auditor"), forged]);

        let err = run(&vp).await.expect_err("forged credential should fail");
        assert!(matches!(err, Error::CredentialSignatureInvalid(_)));
    }

    #[tokio::test]
    async fn expired_credential_fails() {
        let mut vc = signed_role_vc("admin");
        vc.expiration_date = Some(Utc::now() - TimeDelta::seconds(1));
        // Re-sign so only the expiry is at fault.
        let vc = proof::sign_credential(vc, &issuer_key(), &format!("{ISSUER}#key-1"))
            .expect("should sign");
        let vp = presentation(vec![vc]);

        let err = run(&vp).await.expect_err("expired credential should fail");
        assert!(matches!(err, Error::CredentialExpired));
    }

    #[tokio::test]
    async fn unknown_issuer_fails() {
        let mut vc = signed_role_vc("admin");
        vc.issuer = "did:example:unknown".to_string();
        let vp = presentation(vec![vc]);

        let err = run(&vp).await.expect_err("unresolvable issuer should fail");
        assert!(matches!(err, Error::IssuerUnresolved(_)));
    }

    #[tokio::test]
    async fn unknown_verification_method_fails() {
        let mut vc = signed_role_vc("admin");
        if let Some(proof) = vc.proof.as_mut() {
            proof.verification_method = format!("{ISSUER}#key-9");
        }
        let vp = presentation(vec![vc]);

        let err = run(&vp).await.expect_err("unlisted method should fail");
        assert!(matches!(err, Error::VerificationMethodNotFound(_)));
    }

    #[tokio::test]
    async fn wrong_presentation_type_is_malformed() {
        let mut vp = presentation(vec![signed_role_vc("admin")]);
        vp.type_ = OneMany::One("SomethingElse".to_string());

        let err = run(&vp).await.expect_err("wrong type should fail");
        assert!(matches!(err, Error::CredentialMalformed(_)));
    }
}
