//! Authorization code persistence (C5, §4.5).
//!
//! `create` mints a random plaintext code, stores only its hash, and returns
//! the plaintext exactly once. `consume` performs the single atomic
//! lookup-verify-flip step §5 requires for replay safety: the whole
//! operation runs under one entry's lock in the underlying map, so a second
//! concurrent caller either sees `consumed == true` already or blocks behind
//! the first caller's flip — either way only one `consume` can succeed.

use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;

use crate::domain::{AuthorizationCode, CodeChallengeMethod};
use crate::error::{Error, Result};
use crate::hashing::{pkce_s256_challenge, random_url_safe_token, sha256_hex};

/// Inputs to [`CodeStore::create`].
pub struct NewCode {
    /// Client this code is issued to.
    pub client_id: String,
    /// Redirect URI that must match exactly at exchange.
    pub redirect_uri: String,
    /// Requested scope.
    pub scope: Vec<String>,
    /// PKCE challenge.
    pub code_challenge: String,
    /// PKCE method.
    pub code_challenge_method: CodeChallengeMethod,
    /// Opaque `state` echoed back to the client.
    pub state: Option<String>,
    /// Time-to-live, clamped to 10 minutes by the caller (§3).
    pub ttl: Duration,
}

/// Persistence for one-time authorization codes (C5).
#[async_trait::async_trait]
pub trait CodeStore: Send + Sync + 'static {
    /// Mint and persist a new code. Returns the plaintext code exactly once.
    async fn create(&self, new_code: NewCode) -> String;

    /// Locate, verify, and atomically consume a code (§4.5, §5.1).
    ///
    /// # Errors
    ///
    /// - `invalid_grant` — no matching active code for `client_id`/hash, or already used.
    /// - `invalid_grant` with message `"expired"` — code is past `expires_at`.
    /// - `invalid_grant` with message `"redirect_uri mismatch"` — step 2 failed.
    /// - `invalid_grant` with message `"pkce_mismatch"` — step 3 failed.
    async fn consume(
        &self,
        code_plaintext: &str,
        client_id: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<AuthorizationCode>;
}

/// In-memory code store keyed by the code's SHA-256 hash.
pub struct InMemoryCodeStore {
    by_hash: DashMap<String, AuthorizationCode>,
}

impl InMemoryCodeStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { by_hash: DashMap::new() }
    }
}

impl Default for InMemoryCodeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl CodeStore for InMemoryCodeStore {
    async fn create(&self, new_code: NewCode) -> String {
        let plaintext = random_url_safe_token(32);
        let hash = sha256_hex(&plaintext);
        let record = AuthorizationCode {
            code_id: uuid::Uuid::new_v4().to_string(),
            code_hash: hash.clone(),
            client_id: new_code.client_id,
            redirect_uri: new_code.redirect_uri,
            scope: new_code.scope,
            code_challenge: new_code.code_challenge,
            code_challenge_method: new_code.code_challenge_method,
            state: new_code.state,
            expires_at: Utc::now() + chrono::Duration::from_std(new_code.ttl).unwrap_or(chrono::Duration::minutes(10)),
            consumed: false,
        };
        self.by_hash.insert(hash, record);
        plaintext
    }

    async fn consume(
        &self,
        code_plaintext: &str,
        client_id: &str,
        redirect_uri: &str,
        code_verifier: &str,
    ) -> Result<AuthorizationCode> {
        let hash = sha256_hex(code_plaintext);

        // Single entry lock covers locate + verify + flip (§5.1).
        let Some(mut entry) = self.by_hash.get_mut(&hash) else {
            return Err(Error::invalid_grant("authorization code not found"));
        };

        if entry.client_id != client_id {
            return Err(Error::invalid_grant("authorization code issued to a different client"));
        }
        if entry.consumed {
            return Err(Error::invalid_grant("authorization code already used"));
        }
        if entry.is_expired(Utc::now()) {
            return Err(Error::invalid_grant("authorization code expired"));
        }
        if entry.redirect_uri != redirect_uri {
            return Err(Error::invalid_grant("redirect_uri mismatch"));
        }
        if !verify_pkce(&entry.code_challenge, entry.code_challenge_method, code_verifier) {
            return Err(Error::invalid_grant("pkce_mismatch"));
        }

        entry.consumed = true;
        Ok(entry.clone())
    }
}

/// Verify a PKCE `code_verifier` against the stored `challenge`/`method`
/// (§4.5 step 3).
#[must_use]
pub fn verify_pkce(challenge: &str, method: CodeChallengeMethod, verifier: &str) -> bool {
    match method {
        CodeChallengeMethod::S256 => pkce_s256_challenge(verifier) == challenge,
        CodeChallengeMethod::Plain => verifier == challenge,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_code(method: CodeChallengeMethod, challenge: &str) -> NewCode {
        NewCode {
            client_id: "client-1".to_string(),
            redirect_uri: "https://agent.example/callback".to_string(),
            scope: vec!["read:web".to_string()],
            code_challenge: challenge.to_string(),
            code_challenge_method: method,
            state: Some("xyz".to_string()),
            ttl: Duration::from_secs(600),
        }
    }

    #[tokio::test]
    async fn s256_happy_path_then_replay_fails() {
        // GIVEN: a code bound to the §8 scenario-1 S256 challenge
        let store = InMemoryCodeStore::new();
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
        let plaintext = store.create(new_code(CodeChallengeMethod::S256, challenge)).await;

        // WHEN: exchanged with the matching verifier
        let result =
            store.consume(&plaintext, "client-1", "https://agent.example/callback", verifier).await;

        // THEN: succeeds and flips consumed
        assert!(result.is_ok());

        // WHEN: exchanged again
        let replay =
            store.consume(&plaintext, "client-1", "https://agent.example/callback", verifier).await;

        // THEN: rejected as already used
        assert!(replay.is_err());
    }

    #[tokio::test]
    async fn wrong_verifier_rejected() {
        let store = InMemoryCodeStore::new();
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
        let plaintext = store.create(new_code(CodeChallengeMethod::S256, challenge)).await;

        let result =
            store.consume(&plaintext, "client-1", "https://agent.example/callback", "wrong-verifier").await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn redirect_uri_mismatch_rejected() {
        let store = InMemoryCodeStore::new();
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
        let plaintext = store.create(new_code(CodeChallengeMethod::S256, challenge)).await;

        let result = store.consume(&plaintext, "client-1", "https://evil.example/callback", verifier).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn plain_method_requires_exact_equality() {
        let store = InMemoryCodeStore::new();
        let plaintext = store.create(new_code(CodeChallengeMethod::Plain, "literal-verifier")).await;

        let ok = store.consume(&plaintext, "client-1", "https://agent.example/callback", "literal-verifier").await;
        assert!(ok.is_ok());
    }

    #[tokio::test]
    async fn expired_code_rejected() {
        let store = InMemoryCodeStore::new();
        let mut nc = new_code(CodeChallengeMethod::Plain, "v");
        nc.ttl = Duration::from_secs(0);
        let plaintext = store.create(nc).await;

        tokio::time::sleep(Duration::from_millis(5)).await;

        let result = store.consume(&plaintext, "client-1", "https://agent.example/callback", "v").await;
        assert!(result.is_err());
    }
}
