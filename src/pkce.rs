//! PKCE (RFC 7636) verifier/challenge and opaque state/nonce generation.

use crate::crypto::{base64url_encode, random_bytes, sha256};

/// A generated PKCE pair: the verifier kept server-side and the S256
/// challenge sent in the PAR request.
pub struct Pkce {
    pub verifier: String,
    pub challenge: String,
}

/// 32 random bytes, base64url-nopad verifier; challenge = base64url(SHA-256(verifier)).
pub fn generate_pkce() -> Pkce {
    let verifier_bytes = random_bytes::<32>();
    let verifier = base64url_encode(&verifier_bytes);
    let challenge = base64url_encode(&sha256(verifier.as_bytes()));
    Pkce {
        verifier,
        challenge,
    }
}

/// 32 random bytes, base64url-nopad. Used for both the OAuth `state`
/// parameter and the DPoP-unrelated mobile CSRF token.
pub fn generate_state() -> String {
    base64url_encode(&random_bytes::<32>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_challenge_matches_s256_of_verifier() {
        let pkce = generate_pkce();
        let expected = base64url_encode(&sha256(pkce.verifier.as_bytes()));
        assert_eq!(pkce.challenge, expected);
    }

    #[test]
    fn pkce_and_state_are_unpredictable() {
        let a = generate_pkce();
        let b = generate_pkce();
        assert_ne!(a.verifier, b.verifier);
        assert_ne!(generate_state(), generate_state());
    }

    #[test]
    fn values_are_url_safe() {
        let pkce = generate_pkce();
        assert!(!pkce.verifier.contains('+') && !pkce.verifier.contains('/'));
        assert!(!pkce.verifier.contains('='));
    }
}
