//! JWT signing key provider (§6 "Key provider: returns current JWKS and the
//! active signing key + kid").
//!
//! The signing key is process-wide and read-only (§5 "Resource policy");
//! rotation happens out-of-band by rewriting [`crate::config::KeyConfig`]
//! and restarting, during which both the old and new `kid` verify (via
//! `retired_keys`) until every outstanding token signed under the old key
//! has expired.

use std::collections::HashMap;

use jsonwebtoken::{DecodingKey, EncodingKey};
use serde_json::Value;

use crate::config::KeyConfig;
use crate::error::{Error, Result};

/// Holds the active RS256 signing key plus every `kid` this process can
/// still verify (active + retired), and the JWKS document to publish.
pub struct KeyProvider {
    active_kid: String,
    encoding_key: EncodingKey,
    decoding_keys: HashMap<String, DecodingKey>,
    jwks_document: Value,
}

impl KeyProvider {
    /// Load the active private key and every public key (active + retired)
    /// named in `config`.
    ///
    /// # Errors
    /// `server_error` if the private key file is missing/unreadable, or if
    /// the active key has no `public_jwk` / no decodable public key path.
    pub fn load(config: &KeyConfig) -> Result<Self> {
        let private_pem = config
            .private_key_path
            .as_deref()
            .map(std::fs::read)
            .transpose()
            .map_err(|e| Error::server_error().with_details(serde_json::json!({ "key_load_error": e.to_string() })))?
            .ok_or_else(|| Error::server_error().with_details(serde_json::json!({ "key_load_error": "no private_key_path configured" })))?;

        let encoding_key = EncodingKey::from_rsa_pem(&private_pem)?;

        let mut decoding_keys = HashMap::new();
        let mut jwk_keys = Vec::new();

        if let Some(public_path) = &config.public_key_path {
            let public_pem = std::fs::read(public_path)
                .map_err(|e| Error::server_error().with_details(serde_json::json!({ "key_load_error": e.to_string() })))?;
            decoding_keys.insert(config.active_kid.clone(), DecodingKey::from_rsa_pem(&public_pem)?);
        }
        if let Some(jwk) = &config.active_jwk {
            jwk_keys.push(jwk.clone());
        }

        for retired in &config.retired_keys {
            let public_pem = std::fs::read(&retired.public_key_path)
                .map_err(|e| Error::server_error().with_details(serde_json::json!({ "key_load_error": e.to_string() })))?;
            decoding_keys.insert(retired.kid.clone(), DecodingKey::from_rsa_pem(&public_pem)?);
            jwk_keys.push(retired.jwk.clone());
        }

        if !decoding_keys.contains_key(&config.active_kid) {
            return Err(Error::server_error().with_details(serde_json::json!({
                "key_load_error": "no public key material for active_kid",
            })));
        }

        Ok(Self {
            active_kid: config.active_kid.clone(),
            encoding_key,
            decoding_keys,
            jwks_document: serde_json::json!({ "keys": jwk_keys }),
        })
    }

    /// Build a provider from raw key bytes, for tests that don't want to
    /// touch the filesystem.
    #[must_use]
    pub fn from_keys(kid: &str, private_pem: &[u8], public_pem: &[u8]) -> Result<Self> {
        let encoding_key = EncodingKey::from_rsa_pem(private_pem)?;
        let decoding_key = DecodingKey::from_rsa_pem(public_pem)?;
        let mut decoding_keys = HashMap::new();
        decoding_keys.insert(kid.to_string(), decoding_key);
        Ok(Self {
            active_kid: kid.to_string(),
            encoding_key,
            decoding_keys,
            jwks_document: serde_json::json!({ "keys": [] }),
        })
    }

    /// The `kid` new signatures are minted under.
    #[must_use]
    pub fn active_kid(&self) -> &str {
        &self.active_kid
    }

    /// The encoding key for the active `kid`.
    #[must_use]
    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    /// Resolve a decoding key by `kid` (§4.8.6 step 2).
    #[must_use]
    pub fn decoding_key(&self, kid: &str) -> Option<&DecodingKey> {
        self.decoding_keys.get(kid)
    }

    /// The full JWKS document for `/.well-known/jwks.json`.
    #[must_use]
    pub fn jwks_document(&self) -> &Value {
        &self.jwks_document
    }
}
