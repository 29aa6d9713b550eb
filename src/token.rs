//! # Token Codec
//!
//! Signs and verifies the asymmetric bearer tokens agents present to one
//! another: three base64url segments (header / payload / signature) in
//! JWS compact form, RS256 by default.
//!
//! The algorithm is fixed when the codec is constructed. The verifier
//! inspects the raw header before any cryptography runs and rejects tokens
//! whose declared algorithm differs from the configured one, `none`
//! included, so an attacker cannot select a weaker scheme than the
//! deployment was configured with.

use std::collections::HashSet;
use std::time::Duration;

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::core::parse_duration;
use crate::error::{Error, Result};

/// The decoded payload of a bearer token.
///
/// `sub` and `iss` are both the issuing agent's id: agents only ever issue
/// tokens about themselves.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Claims {
    /// Subject: the issuing agent's id.
    pub sub: String,

    /// Issuer: same agent id as `sub`.
    pub iss: String,

    /// Audience: the target agent's id.
    pub aud: String,

    /// Issued-at, Unix seconds.
    pub iat: i64,

    /// Expiry, Unix seconds.
    pub exp: i64,

    /// Permissions granted to the bearer, compared by exact string
    /// inclusion.
    #[serde(default)]
    pub permissions: HashSet<String>,

    /// Free-form token metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Map<String, Value>>,
}

/// Constraints applied by [`TokenCodec::verify`].
#[derive(Clone, Debug, Default)]
pub struct VerifyOptions<'a> {
    /// Required `aud` value, typically the verifying agent's own id.
    pub audience: Option<&'a str>,

    /// Required `iss` value, typically the id the peer presented.
    pub issuer: Option<&'a str>,

    /// Accept tokens whose `exp` has passed. Other checks still apply.
    pub allow_expired: bool,

    /// Clock skew tolerance for the expiry check, in seconds. Zero unless
    /// the deployment opts in.
    pub leeway_seconds: u64,
}

/// The bearer-token signer/verifier, pinned to one algorithm.
#[derive(Clone, Debug)]
pub struct TokenCodec {
    algorithm: Algorithm,
}

impl TokenCodec {
    /// A codec for the given asymmetric algorithm.
    #[must_use]
    pub const fn new(algorithm: Algorithm) -> Self {
        Self { algorithm }
    }

    /// The configured algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Sign `claims` with the PEM-encoded private key, filling `iat` with
    /// the current time and `exp` with `iat + ttl`.
    ///
    /// # Errors
    ///
    /// Fails with `TokenClaimMismatch` when `sub != iss` and with
    /// `ConfigurationInvalid` when the key does not match the configured
    /// algorithm.
    pub fn sign(&self, claims: &Claims, private_key_pem: &str, ttl: Duration) -> Result<String> {
        if claims.sub != claims.iss {
            return Err(Error::TokenClaimMismatch("sub and iss must match".to_string()));
        }

        let now = Utc::now().timestamp();
        let claims = Claims {
            iat: now,
            exp: now + i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX),
            ..claims.clone()
        };

        let key = encoding_key(self.algorithm, private_key_pem)?;
        jsonwebtoken::encode(&Header::new(self.algorithm), &claims, &key)
            .map_err(|_| Error::ConfigurationInvalid("token signing failed".to_string()))
    }

    /// [`Self::sign`] with the TTL in `s|m|h|d` suffix notation.
    ///
    /// # Errors
    ///
    /// As [`Self::sign`], plus `ConfigurationInvalid` for an unparsable TTL.
    pub fn sign_with_ttl(&self, claims: &Claims, private_key_pem: &str, ttl: &str) -> Result<String> {
        self.sign(claims, private_key_pem, parse_duration(ttl)?)
    }

    /// Verify `token` under the PEM-encoded public key and return its
    /// claims.
    ///
    /// # Errors
    ///
    /// - `TokenMalformed`: not three segments, or a segment does not decode.
    /// - `TokenSignatureInvalid`: header algorithm differs from the
    ///   configured one (`none` included), the key is unusable, or the
    ///   signature does not validate.
    /// - `TokenExpired`: `exp + leeway` has passed and `allow_expired` is
    ///   not set.
    /// - `TokenClaimMismatch`: audience/issuer constraints violated, or
    ///   `sub != iss`, or `iat > exp`.
    pub fn verify(&self, token: &str, public_key_pem: &str, options: &VerifyOptions<'_>) -> Result<Claims> {
        check_header(token, self.algorithm)?;

        let key = decoding_key(self.algorithm, public_key_pem)
            .map_err(|_| Error::TokenSignatureInvalid("verification key rejected".to_string()))?;

        let mut validation = Validation::new(self.algorithm);
        validation.leeway = options.leeway_seconds;
        validation.validate_exp = !options.allow_expired;
        validation.validate_aud = options.audience.is_some();
        if let Some(audience) = options.audience {
            validation.set_audience(&[audience]);
        }
        if let Some(issuer) = options.issuer {
            validation.set_issuer(&[issuer]);
        }

        let decoded = jsonwebtoken::decode::<Claims>(token, &key, &validation)
            .map_err(map_decode_error)?;
        let claims = decoded.claims;

        if claims.sub != claims.iss {
            return Err(Error::TokenClaimMismatch("sub and iss must match".to_string()));
        }
        if claims.iat > claims.exp {
            return Err(Error::TokenClaimMismatch("iat is after exp".to_string()));
        }

        Ok(claims)
    }
}

/// Decode a token's claims without verifying its signature.
///
/// Used for expiry inspection and test tooling only; admitting a request on
/// the basis of these claims is never correct.
///
/// # Errors
///
/// Fails with `TokenMalformed` when the payload segment does not decode.
pub fn decode_unsafe(token: &str) -> Result<Claims> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(Error::TokenMalformed("expected three token segments".to_string()));
    }
    let payload = Base64UrlUnpadded::decode_vec(segments[1])
        .map_err(|_| Error::TokenMalformed("payload is not base64url".to_string()))?;
    serde_json::from_slice(&payload)
        .map_err(|_| Error::TokenMalformed("payload is not a claims object".to_string()))
}

/// Build the signing key for `algorithm` from a PEM string.
///
/// # Errors
///
/// Fails with `ConfigurationInvalid` for symmetric algorithms or unusable
/// key material.
pub fn encoding_key(algorithm: Algorithm, pem: &str) -> Result<EncodingKey> {
    let result = match algorithm {
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 | Algorithm::PS256
        | Algorithm::PS384 | Algorithm::PS512 => EncodingKey::from_rsa_pem(pem.as_bytes()),
        Algorithm::ES256 | Algorithm::ES384 => EncodingKey::from_ec_pem(pem.as_bytes()),
        Algorithm::EdDSA => EncodingKey::from_ed_pem(pem.as_bytes()),
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            return Err(Error::ConfigurationInvalid(
                "symmetric algorithms are not supported".to_string(),
            ));
        }
    };
    result.map_err(|_| Error::ConfigurationInvalid("private key PEM rejected".to_string()))
}

/// Build the verification key for `algorithm` from a PEM string.
///
/// # Errors
///
/// As [`encoding_key`].
pub fn decoding_key(algorithm: Algorithm, pem: &str) -> Result<DecodingKey> {
    let result = match algorithm {
        Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 | Algorithm::PS256
        | Algorithm::PS384 | Algorithm::PS512 => DecodingKey::from_rsa_pem(pem.as_bytes()),
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem.as_bytes()),
        Algorithm::EdDSA => DecodingKey::from_ed_pem(pem.as_bytes()),
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => {
            return Err(Error::ConfigurationInvalid(
                "symmetric algorithms are not supported".to_string(),
            ));
        }
    };
    result.map_err(|_| Error::ConfigurationInvalid("public key PEM rejected".to_string()))
}

/// The name a configured algorithm declares in a token header.
const fn algorithm_name(algorithm: Algorithm) -> &'static str {
    match algorithm {
        Algorithm::HS256 => "HS256",
        Algorithm::HS384 => "HS384",
        Algorithm::HS512 => "HS512",
        Algorithm::RS256 => "RS256",
        Algorithm::RS384 => "RS384",
        Algorithm::RS512 => "RS512",
        Algorithm::PS256 => "PS256",
        Algorithm::PS384 => "PS384",
        Algorithm::PS512 => "PS512",
        Algorithm::ES256 => "ES256",
        Algorithm::ES384 => "ES384",
        Algorithm::EdDSA => "EdDSA",
    }
}

#[derive(Deserialize)]
struct RawHeader {
    alg: String,
}

/// Structural and algorithm checks on the raw header, before any signature
/// work.
fn check_header(token: &str, algorithm: Algorithm) -> Result<()> {
    let segments: Vec<&str> = token.split('.').collect();
    if segments.len() != 3 {
        return Err(Error::TokenMalformed("expected three token segments".to_string()));
    }

    let header = Base64UrlUnpadded::decode_vec(segments[0])
        .map_err(|_| Error::TokenMalformed("header is not base64url".to_string()))?;
    let header: RawHeader = serde_json::from_slice(&header)
        .map_err(|_| Error::TokenMalformed("header is not a JSON object".to_string()))?;

    if header.alg.eq_ignore_ascii_case("none") {
        return Err(Error::TokenSignatureInvalid("the none algorithm is not accepted".to_string()));
    }
    if header.alg != algorithm_name(algorithm) {
        return Err(Error::TokenSignatureInvalid(format!(
            "header algorithm {} differs from configured {}",
            header.alg,
            algorithm_name(algorithm)
        )));
    }
    Ok(())
}

fn map_decode_error(err: jsonwebtoken::errors::Error) -> Error {
    use jsonwebtoken::errors::ErrorKind;

    match err.kind() {
        ErrorKind::ExpiredSignature => Error::TokenExpired,
        ErrorKind::InvalidSignature | ErrorKind::Crypto(_) => {
            Error::TokenSignatureInvalid("signature verification failed".to_string())
        }
        ErrorKind::InvalidAlgorithm | ErrorKind::InvalidAlgorithmName => {
            Error::TokenSignatureInvalid("algorithm not accepted".to_string())
        }
        ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidEcdsaKey | ErrorKind::InvalidKeyFormat => {
            Error::TokenSignatureInvalid("verification key rejected".to_string())
        }
        ErrorKind::InvalidAudience => Error::TokenClaimMismatch("audience".to_string()),
        ErrorKind::InvalidIssuer => Error::TokenClaimMismatch("issuer".to_string()),
        ErrorKind::InvalidSubject => Error::TokenClaimMismatch("subject".to_string()),
        ErrorKind::ImmatureSignature => Error::TokenClaimMismatch("token not yet valid".to_string()),
        ErrorKind::MissingRequiredClaim(claim) => {
            Error::TokenClaimMismatch(format!("missing claim: {claim}"))
        }
        _ => Error::TokenMalformed("token does not decode".to_string()),
    }
}
