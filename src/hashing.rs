//! One-way hashing and PKCE transforms shared by the code/token stores.
//!
//! Stored secrets (authorization codes, access/refresh tokens) are never
//! persisted in plaintext (§3 invariant v); this module is the single place
//! that computes the hash that goes in their place.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use sha2::{Digest, Sha256};

/// SHA-256 hex digest of `value`, used as the stored representation of a
/// plaintext secret (code, access token, refresh token).
#[must_use]
pub fn sha256_hex(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(digest)
}

/// PKCE `S256` transform: `base64url(sha256(verifier))` with padding stripped
/// (§4.5 step 3, §8 scenario 1).
#[must_use]
pub fn pkce_s256_challenge(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Generate a URL-safe random token with at least `bytes` bytes of entropy
/// (§4.5 "≥32 bytes", §4.8.5 "≥48 bytes").
#[must_use]
pub fn random_url_safe_token(bytes: usize) -> String {
    use rand::RngCore;
    let mut buf = vec![0_u8; bytes];
    rand::rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pkce_s256_matches_known_vector() {
        // GIVEN: the RFC 7636 appendix B verifier/challenge pair used in §8 scenario 1
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";

        // WHEN: transformed
        let challenge = pkce_s256_challenge(verifier);

        // THEN: matches the expected challenge exactly
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn random_token_has_requested_entropy() {
        let token = random_url_safe_token(32);
        // 32 bytes base64url (no padding) encodes to 43 characters
        assert_eq!(token.len(), 43);
    }

    #[test]
    fn sha256_hex_is_deterministic() {
        assert_eq!(sha256_hex("abc"), sha256_hex("abc"));
        assert_ne!(sha256_hex("abc"), sha256_hex("abd"));
    }
}
