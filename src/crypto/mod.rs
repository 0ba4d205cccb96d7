//! Cryptographic primitives: ES256 keys, JWK parse/serialize, SHA-256, base64url, random bytes.
//!
//! The process holds exactly one OAuth signing key (the `private_key_jwt`
//! client-authentication key); DPoP keys are per-session and generated fresh
//! by the OAuth Client Core, not held here.

use base64::Engine;
use p256::ecdsa::{signature::Signer, Signature, SigningKey as EcdsaSigningKey};
use p256::elliptic_curve::sec1::ToEncodedPoint;
use p256::pkcs8::DecodePrivateKey;
use p256::SecretKey;
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

const URL_SAFE_NO_PAD: base64::engine::GeneralPurpose = base64::engine::general_purpose::URL_SAFE_NO_PAD;

/// base64url without padding, per RFC 4648 §5.
pub fn base64url_encode(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn base64url_decode(s: &str) -> AppResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(s)
        .map_err(|e| AppError::Crypto(format!("invalid base64url: {e}")))
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Fill a buffer of `N` bytes from the OS CSPRNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut buf = [0u8; N];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

pub fn random_bytes_vec(n: usize) -> Vec<u8> {
    let mut buf = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut buf);
    buf
}

/// The process-wide ES256 key used for `private_key_jwt` client authentication.
#[derive(Clone)]
pub struct OAuthSigningKey {
    pub kid: String,
    secret_key: SecretKey,
}

impl OAuthSigningKey {
    pub fn new(kid: String, secret_key: SecretKey) -> Self {
        Self { kid, secret_key }
    }

    /// Parse from the `OAUTH_PRIVATE_JWK` environment convention: a JWK JSON
    /// object, optionally prefixed with `base64:` (the whole JSON blob
    /// base64-encoded, for env vars that dislike embedded quotes).
    pub fn from_env_value(raw: &str, kid: &str) -> AppResult<Self> {
        let json_str = if let Some(b64) = raw.strip_prefix("base64:") {
            let decoded = base64::engine::general_purpose::STANDARD
                .decode(b64)
                .map_err(|e| AppError::Config(format!("invalid base64 OAUTH_PRIVATE_JWK: {e}")))?;
            String::from_utf8(decoded)
                .map_err(|e| AppError::Config(format!("OAUTH_PRIVATE_JWK is not valid utf-8: {e}")))?
        } else {
            raw.to_string()
        };

        let jwk: serde_json::Value = serde_json::from_str(&json_str)
            .map_err(|e| AppError::Config(format!("OAUTH_PRIVATE_JWK is not valid JSON: {e}")))?;

        let kty = jwk.get("kty").and_then(|v| v.as_str()).unwrap_or("");
        let crv = jwk.get("crv").and_then(|v| v.as_str()).unwrap_or("");
        if kty != "EC" || crv != "P-256" {
            return Err(AppError::Config(
                "OAUTH_PRIVATE_JWK must be an EC P-256 key".to_string(),
            ));
        }
        let d = jwk
            .get("d")
            .and_then(|v| v.as_str())
            .ok_or_else(|| AppError::Config("OAUTH_PRIVATE_JWK missing private component d".to_string()))?;
        let d_bytes = base64url_decode(d)?;
        let secret_key = SecretKey::from_slice(&d_bytes)
            .map_err(|e| AppError::Crypto(format!("invalid EC private key bytes: {e}")))?;

        let kid = jwk
            .get("kid")
            .and_then(|v| v.as_str())
            .unwrap_or(kid)
            .to_string();

        Ok(Self { kid, secret_key })
    }

    /// Load from a PKCS8 PEM string (used by dev-profile configs that keep a
    /// key file on disk rather than an inline JWK).
    pub fn from_pkcs8_pem(pem: &str, kid: &str) -> AppResult<Self> {
        let secret_key = SecretKey::from_pkcs8_pem(pem)
            .map_err(|e| AppError::Crypto(format!("failed to parse PKCS8 key: {e}")))?;
        Ok(Self {
            kid: kid.to_string(),
            secret_key,
        })
    }

    pub fn ecdsa_signing_key(&self) -> EcdsaSigningKey {
        EcdsaSigningKey::from(&self.secret_key)
    }

    /// Sign `signing_input` with ES256, returning the fixed-size 64-byte
    /// `r || s` representation JWS compact serialization expects.
    pub fn sign_es256(&self, signing_input: &[u8]) -> Vec<u8> {
        let signing_key = self.ecdsa_signing_key();
        let signature: Signature = signing_key.sign(signing_input);
        signature.to_bytes().to_vec()
    }

    /// The public JWK, never containing the private component `d`.
    pub fn public_jwk(&self) -> serde_json::Value {
        public_jwk_for(&self.secret_key, Some(&self.kid))
    }

    pub fn to_jwks(&self) -> serde_json::Value {
        serde_json::json!({ "keys": [self.public_jwk()] })
    }
}

/// Render the public JWK for any P-256 secret key. Shared by the OAuth
/// signing key (JWKS endpoint) and the per-session DPoP key (proof header).
pub fn public_jwk_for(secret_key: &SecretKey, kid: Option<&str>) -> serde_json::Value {
    let public_key = secret_key.public_key();
    let encoded = public_key.to_encoded_point(false);
    let x = encoded.x().map(|b| base64url_encode(b)).unwrap_or_default();
    let y = encoded.y().map(|b| base64url_encode(b)).unwrap_or_default();

    let mut jwk = serde_json::json!({
        "kty": "EC",
        "crv": "P-256",
        "x": x,
        "y": y,
    });
    if let Some(kid) = kid {
        jwk["kid"] = serde_json::Value::String(kid.to_string());
        jwk["use"] = serde_json::Value::String("sig".to_string());
    }
    jwk
}

/// Serialize a P-256 private key to the multibase-ish compact form this
/// crate persists alongside OAuth requests/sessions: base64url of the raw
/// 32-byte scalar. Not a "real" multibase encoding, but matches the logical
/// `dpop_private_key_multibase` column in shape (an opaque, round-trippable
/// string) without inventing an external multibase dependency.
pub fn serialize_secret_key(secret_key: &SecretKey) -> String {
    base64url_encode(&secret_key.to_bytes())
}

pub fn deserialize_secret_key(s: &str) -> AppResult<SecretKey> {
    let bytes = base64url_decode(s)?;
    SecretKey::from_slice(&bytes).map_err(|e| AppError::Crypto(format!("invalid stored DPoP key: {e}")))
}

/// Generate a fresh per-session ES256 DPoP key.
pub fn generate_p256_key() -> SecretKey {
    SecretKey::random(&mut rand::thread_rng())
}

/// Sign over an arbitrary P-256 secret key, for callers (DPoP) that hold a
/// bare `SecretKey` rather than an `OAuthSigningKey`.
pub fn sign_es256_raw(secret_key: &SecretKey, signing_input: &[u8]) -> Vec<u8> {
    let signing_key = EcdsaSigningKey::from(secret_key);
    let signature: Signature = signing_key.sign(signing_input);
    signature.to_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64url_roundtrip() {
        let data = b"hello world";
        let encoded = base64url_encode(data);
        assert!(!encoded.contains('='));
        assert_eq!(base64url_decode(&encoded).unwrap(), data);
    }

    #[test]
    fn sha256_known_vector() {
        let digest = sha256(b"abc");
        let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        assert_eq!(
            hex,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn public_jwk_never_has_private_component() {
        let key = generate_p256_key();
        let jwk = public_jwk_for(&key, Some("test-kid"));
        assert!(jwk.get("d").is_none());
        assert_eq!(jwk["kty"], "EC");
        assert_eq!(jwk["crv"], "P-256");
    }

    #[test]
    fn secret_key_serialize_roundtrip() {
        let key = generate_p256_key();
        let serialized = serialize_secret_key(&key);
        let restored = deserialize_secret_key(&serialized).unwrap();
        assert_eq!(key.to_bytes(), restored.to_bytes());
    }

    #[test]
    fn jwk_from_env_rejects_non_ec() {
        let raw = serde_json::json!({"kty": "RSA", "crv": "P-256", "d": "x"}).to_string();
        assert!(OAuthSigningKey::from_env_value(&raw, "k1").is_err());
    }
}
