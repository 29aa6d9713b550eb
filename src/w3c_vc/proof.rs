//! # Securing Credentials
//!
//! Credentials and presentations are secured with embedded Data Integrity
//! proofs: an Ed25519 signature over the document's canonical form, carried
//! in a `proof` block alongside the document itself. The issuer signs
//! credentials; the holder signs the presentation that wraps them.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use super::{Proof, VerifiableCredential, VerifiablePresentation};
use crate::error::{Error, Result};

/// The proof suite produced and accepted by this crate.
pub const PROOF_TYPE: &str = "Ed25519Signature2020";

/// The proof purpose asserted on credential and presentation proofs.
pub const PROOF_PURPOSE: &str = "assertionMethod";

/// Sign `vc` with the issuer key, attaching a proof that verifies under
/// `verification_method`.
///
/// # Errors
///
/// Fails with `CredentialMalformed` when the credential does not
/// serialize.
pub fn sign_credential(
    vc: VerifiableCredential, key: &SigningKey, verification_method: &str,
) -> Result<VerifiableCredential> {
    let mut vc = VerifiableCredential { proof: None, ..vc };
    let signature = key.sign(&vc.canonical_form()?);
    vc.proof = Some(proof_block(verification_method, &signature));
    Ok(vc)
}

/// Sign `vp` with the holder key, attaching a proof that verifies under
/// `verification_method`. Credential proofs inside are left untouched.
///
/// # Errors
///
/// Fails with `CredentialMalformed` when the presentation does not
/// serialize.
pub fn sign_presentation(
    vp: VerifiablePresentation, key: &SigningKey, verification_method: &str,
) -> Result<VerifiablePresentation> {
    let mut vp = VerifiablePresentation { proof: None, ..vp };
    let signature = key.sign(&vp.canonical_form()?);
    vp.proof = Some(proof_block(verification_method, &signature));
    Ok(vp)
}

/// Check `vc`'s proof under the issuer's resolved key.
///
/// # Errors
///
/// - `CredentialMalformed`: no proof block, or an unsupported suite.
/// - `CredentialSignatureInvalid`: the value does not decode or does not
///   verify over the canonical form.
pub fn verify_credential(vc: &VerifiableCredential, key: &VerifyingKey) -> Result<()> {
    let proof = vc
        .proof
        .as_ref()
        .ok_or_else(|| Error::CredentialMalformed("credential has no proof".to_string()))?;
    verify_proof(proof, &vc.canonical_form()?, key)
}

/// Check `vp`'s own proof under the holder's key.
///
/// # Errors
///
/// As [`verify_credential`].
pub fn verify_presentation(vp: &VerifiablePresentation, key: &VerifyingKey) -> Result<()> {
    let proof = vp
        .proof
        .as_ref()
        .ok_or_else(|| Error::CredentialMalformed("presentation has no proof".to_string()))?;
    verify_proof(proof, &vp.canonical_form()?, key)
}

fn proof_block(verification_method: &str, signature: &Signature) -> Proof {
    Proof {
        type_: PROOF_TYPE.to_string(),
        created: Some(Utc::now()),
        verification_method: verification_method.to_string(),
        proof_purpose: PROOF_PURPOSE.to_string(),
        proof_value: Base64UrlUnpadded::encode_string(&signature.to_bytes()),
    }
}

fn verify_proof(proof: &Proof, signing_input: &[u8], key: &VerifyingKey) -> Result<()> {
    if proof.type_ != PROOF_TYPE {
        return Err(Error::CredentialMalformed(format!("unsupported proof suite: {}", proof.type_)));
    }

    let bytes = Base64UrlUnpadded::decode_vec(&proof.proof_value)
        .map_err(|_| Error::CredentialSignatureInvalid("proof value is not base64url".to_string()))?;
    let signature = Signature::from_slice(&bytes)
        .map_err(|_| Error::CredentialSignatureInvalid("proof value is not a signature".to_string()))?;

    key.verify(signing_input, &signature)
        .map_err(|_| Error::CredentialSignatureInvalid("proof does not verify".to_string()))
}

#[cfg(test)]
mod tests {
    use crate::core::OneMany;
    use crate::w3c_vc::CredentialSubject;

    use super::*;

    fn issuer_key() -> SigningKey {
        SigningKey::from_bytes(&[42u8; 32])
    }

    fn role_vc() -> VerifiableCredential {
        VerifiableCredential {
            issuer: "did:example:issuer1".to_string(),
            credential_subject: CredentialSubject {
                id: Some("did:example:bob".to_string()),
                role: Some(OneMany::One("admin".to_string())),
                ..CredentialSubject::default()
            },
            ..VerifiableCredential::default()
        }
    }

    #[test]
    fn credential_sign_verify() {
        let key = issuer_key();
        let vc = sign_credential(role_vc(), &key, "did:example:issuer1#key-1")
            .expect("should sign");

        let proof = vc.proof.as_ref().expect("proof should be attached");
        assert_eq!(proof.type_, PROOF_TYPE);
        assert_eq!(proof.verification_method, "did:example:issuer1#key-1");

        verify_credential(&vc, &key.verifying_key()).expect("should verify");
    }

    #[test]
    fn tampered_credential_fails() {
        let key = issuer_key();
        let mut vc = sign_credential(role_vc(), &key, "did:example:issuer1#key-1")
            .expect("should sign");

        vc.credential_subject.role = Some(OneMany::One("superadmin".to_string()));
        let err = verify_credential(&vc, &key.verifying_key())
            .expect_err("tampered role should fail");
        assert!(matches!(err, Error::CredentialSignatureInvalid(_)));
    }

    #[test]
    fn wrong_key_fails() {
        let vc = sign_credential(role_vc(), &issuer_key(), "did:example:issuer1#key-1")
            .expect("should sign");

        let other = SigningKey::from_bytes(&[7u8; 32]);
        let err = verify_credential(&vc, &other.verifying_key())
            .expect_err("wrong key should fail");
        assert!(matches!(err, Error::CredentialSignatureInvalid(_)));
    }

    #[test]
    fn missing_proof_is_malformed() {
        let err = verify_credential(&role_vc(), &issuer_key().verifying_key())
            .expect_err("unsigned credential should fail");
        assert!(matches!(err, Error::CredentialMalformed(_)));
    }

    #[test]
    fn presentation_sign_verify() {
        let issuer = issuer_key();
        let holder = SigningKey::from_bytes(&[9u8; 32]);

        let vc = sign_credential(role_vc(), &issuer, "did:example:issuer1#key-1")
            .expect("should sign credential");
        let vp = crate::w3c_vc::VerifiablePresentation::builder()
            .add_credential(vc)
            .holder("did:example:bob")
            .build()
            .expect("should build");
        let vp = sign_presentation(vp, &holder, "did:example:bob#key-1")
            .expect("should sign presentation");

        verify_presentation(&vp, &holder.verifying_key()).expect("should verify");

        // The wrapped credential still verifies under the issuer key.
        verify_credential(&vp.verifiable_credential[0], &issuer.verifying_key())
            .expect("credential proof should survive wrapping");
    }
}
