//! Token Sealer: AES-256-GCM seal/unseal of `{did, session_id, exp}`.
//!
//! The sealed token is the only artifact a user agent ever sees; it carries
//! no information beyond what's needed to look up the real session row, and
//! unsealing it without the process's seal key is computationally infeasible.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::crypto::{base64url_decode, base64url_encode, random_bytes_vec};
use crate::error::{AppError, AppResult};

const NONCE_LEN: usize = 12;

#[derive(Serialize, Deserialize)]
struct SealedPayload {
    did: String,
    sid: String,
    exp: i64,
}

/// Unsealed contents of a sealed token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsealedToken {
    pub did: String,
    pub session_id: String,
    pub exp: DateTime<Utc>,
}

/// Process-wide symmetric key used to seal/unseal session tokens.
///
/// Constructed once at startup (see `Config::singleton` discussion in
/// `SPEC_FULL.md` §9 — the same initialize-once discipline governs this key
/// as it does the cookie-store secret); subsequent use is read-only.
#[derive(Clone)]
pub struct TokenSealer {
    key: Key<Aes256Gcm>,
}

impl TokenSealer {
    /// `key_bytes` must be exactly 32 bytes (AES-256 key size).
    pub fn new(key_bytes: &[u8]) -> AppResult<Self> {
        if key_bytes.len() != 32 {
            return Err(AppError::Config(format!(
                "seal key must be 32 bytes, got {}",
                key_bytes.len()
            )));
        }
        Ok(Self {
            key: *Key::<Aes256Gcm>::from_slice(key_bytes),
        })
    }

    /// Seal `{did, session_id, exp=now+ttl}` into an opaque, non-deterministic token.
    pub fn seal(
        &self,
        did: &str,
        session_id: &str,
        ttl: chrono::Duration,
    ) -> AppResult<String> {
        if did.is_empty() {
            return Err(AppError::InputValidation("did must not be empty".to_string()));
        }
        if session_id.is_empty() {
            return Err(AppError::InputValidation(
                "session_id must not be empty".to_string(),
            ));
        }

        let exp = Utc::now() + ttl;
        let payload = SealedPayload {
            did: did.to_string(),
            sid: session_id.to_string(),
            exp: exp.timestamp(),
        };
        let plaintext = serde_json::to_vec(&payload)?;

        let nonce_bytes = random_bytes_vec(NONCE_LEN);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let cipher = Aes256Gcm::new(&self.key);
        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_ref())
            .map_err(|_| AppError::Crypto("token sealing failed".to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(base64url_encode(&out))
    }

    /// Unseal a token, rejecting it if malformed, tampered, or expired.
    pub fn unseal(&self, token: &str) -> AppResult<UnsealedToken> {
        if token.is_empty() {
            return Err(AppError::InputValidation("empty sealed token".to_string()));
        }

        let raw = base64url_decode(token)?;
        if raw.len() < NONCE_LEN {
            return Err(AppError::Crypto("sealed token too short".to_string()));
        }
        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        let cipher = Aes256Gcm::new(&self.key);
        let plaintext = cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| AppError::Crypto("sealed token authentication failed".to_string()))?;

        let payload: SealedPayload = serde_json::from_slice(&plaintext)
            .map_err(|_| AppError::Crypto("sealed token payload malformed".to_string()))?;
        if payload.did.is_empty() || payload.sid.is_empty() {
            return Err(AppError::Crypto(
                "sealed token missing did/session_id".to_string(),
            ));
        }

        let exp = DateTime::<Utc>::from_timestamp(payload.exp, 0)
            .ok_or_else(|| AppError::Crypto("sealed token exp malformed".to_string()))?;
        if exp <= Utc::now() {
            return Err(AppError::Security("sealed token expired".to_string()));
        }

        Ok(UnsealedToken {
            did: payload.did,
            session_id: payload.sid,
            exp,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sealer() -> TokenSealer {
        TokenSealer::new(&[7u8; 32]).unwrap()
    }

    #[test]
    fn seal_unseal_roundtrip() {
        let sealer = sealer();
        let token = sealer
            .seal("did:plc:abc", "sess-1", chrono::Duration::seconds(60))
            .unwrap();
        let unsealed = sealer.unseal(&token).unwrap();
        assert_eq!(unsealed.did, "did:plc:abc");
        assert_eq!(unsealed.session_id, "sess-1");
    }

    #[test]
    fn two_seals_are_not_equal() {
        let sealer = sealer();
        let t1 = sealer
            .seal("did:plc:abc", "sess-1", chrono::Duration::seconds(60))
            .unwrap();
        let t2 = sealer
            .seal("did:plc:abc", "sess-1", chrono::Duration::seconds(60))
            .unwrap();
        assert_ne!(t1, t2);
    }

    #[test]
    fn tampered_token_fails_authentication() {
        let sealer = sealer();
        let token = sealer
            .seal("did:plc:abc", "sess-1", chrono::Duration::seconds(60))
            .unwrap();
        let mut raw = base64url_decode(&token).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xFF;
        let tampered = base64url_encode(&raw);
        assert!(sealer.unseal(&tampered).is_err());
    }

    #[test]
    fn expired_token_rejected() {
        let sealer = sealer();
        let token = sealer
            .seal("did:plc:abc", "sess-1", chrono::Duration::seconds(-1))
            .unwrap();
        let err = sealer.unseal(&token).unwrap_err();
        assert!(matches!(err, AppError::Security(_)));
    }

    #[test]
    fn empty_did_or_session_rejected() {
        let sealer = sealer();
        assert!(sealer.seal("", "sess-1", chrono::Duration::seconds(60)).is_err());
        assert!(sealer
            .seal("did:plc:abc", "", chrono::Duration::seconds(60))
            .is_err());
    }

    #[test]
    fn wrong_key_cannot_unseal() {
        let sealer_a = TokenSealer::new(&[1u8; 32]).unwrap();
        let sealer_b = TokenSealer::new(&[2u8; 32]).unwrap();
        let token = sealer_a
            .seal("did:plc:abc", "sess-1", chrono::Duration::seconds(60))
            .unwrap();
        assert!(sealer_b.unseal(&token).is_err());
    }
}
