//! `.well-known/openid-configuration` discovery document (§G).

use serde::Serialize;

/// The fields a client needs to discover this issuer's endpoints and
/// supported values (§G: beyond the bare minimum named in §6).
#[derive(Debug, Serialize)]
pub struct DiscoveryDocument {
    pub issuer: String,
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub introspection_endpoint: String,
    pub revocation_endpoint: String,
    pub jwks_uri: String,
    pub grant_types_supported: Vec<&'static str>,
    pub response_types_supported: Vec<&'static str>,
    pub code_challenge_methods_supported: Vec<&'static str>,
    pub scopes_supported: Vec<String>,
}

impl DiscoveryDocument {
    #[must_use]
    pub fn build(issuer: &str, scopes_supported: Vec<String>) -> Self {
        Self {
            issuer: issuer.to_string(),
            authorization_endpoint: format!("{issuer}/api/oauth/authorize"),
            token_endpoint: format!("{issuer}/api/oauth/token"),
            introspection_endpoint: format!("{issuer}/api/oauth/introspect"),
            revocation_endpoint: format!("{issuer}/api/oauth/revoke"),
            jwks_uri: format!("{issuer}/.well-known/jwks.json"),
            grant_types_supported: vec!["authorization_code", "client_credentials", "refresh_token"],
            response_types_supported: vec!["code"],
            code_challenge_methods_supported: vec!["S256", "plain"],
            scopes_supported,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoints_are_derived_from_issuer() {
        let doc = DiscoveryDocument::build("https://authority.example", vec!["read:web".to_string()]);
        assert_eq!(doc.token_endpoint, "https://authority.example/api/oauth/token");
        assert_eq!(doc.jwks_uri, "https://authority.example/.well-known/jwks.json");
        assert_eq!(doc.code_challenge_methods_supported, vec!["S256", "plain"]);
    }
}
