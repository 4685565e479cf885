//! Configuration management
//!
//! A [`Config`] is assembled once at startup by merging, in order, a YAML
//! file (if given) and `AUTHORITY_`-prefixed environment variables (nested
//! keys separated by `__`, e.g. `AUTHORITY_SERVER__PORT`). Sub-configs follow
//! the figment/serde pattern: every field has a default so a bare `Config`
//! (no file, no env) still boots a usable (if empty-catalog) server.
//!
//! Hot-reloadable parts of the configuration (currently: the scope expansion
//! policy document, see [`crate::expansion_policy`]) are not stored here —
//! `Config` is the immutable snapshot captured at startup; anything that
//! changes without a restart lives behind its own pointer-swap cell.

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Top-level configuration for the agent token authority.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config. Paths support `~`
    /// expansion; loaded in order, later files override earlier ones.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// HTTP server bind configuration.
    pub server: ServerConfig,
    /// Token issuer identity and TTLs.
    pub issuer: IssuerConfig,
    /// JWT signing key material.
    pub keys: KeyConfig,
    /// External policy decision service (C4).
    pub decision_gateway: DecisionGatewayConfig,
    /// Scope expansion policy document location (C3).
    pub scope_expansion: ScopeExpansionPolicyConfig,
    /// Client ids permitted to present `launch_reason=system_job`.
    pub system_clients: SystemClientsConfig,
    /// Bootstrap catalog of scopes/policies/agents loaded at startup.
    pub bootstrap: BootstrapConfig,
}

impl Config {
    /// Load configuration from an optional YAML file plus environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be
    /// parsed, or if environment overrides don't match the schema.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::config(format!("config file not found: {}", p.display())));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed("AUTHORITY_").split("__"));

        let mut config: Self = figment.extract().map_err(|e| Error::config(e.to_string()))?;
        config.load_env_files();
        Ok(config)
    }

    /// Load environment files (`.env` syntax) into the process environment.
    /// Files that don't exist are silently skipped; this mirrors secret
    /// injection in deployments where `AUTHORITY_KEYS__PRIVATE_KEY_PATH`
    /// style vars live outside the YAML file.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if let Some(rest) = path_str.strip_prefix('~') {
                dirs::home_dir().map_or_else(|| path_str.clone(), |home| format!("{}{rest}", home.display()))
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => tracing::info!("loaded env file: {expanded}"),
                    Err(e) => tracing::warn!("failed to load env file {expanded}: {e}"),
                }
            } else {
                tracing::debug!("env file not found (skipped): {expanded}");
            }
        }
    }
}

/// HTTP server bind configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind to.
    pub host: String,
    /// Port to listen on.
    pub port: u16,
    /// Per-request timeout applied by the `tower` timeout layer.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Graceful shutdown grace period.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size, in bytes.
    pub max_body_size: usize,
    /// CORS: allow any origin. Disable for production deployments fronted by
    /// a reverse proxy that sets its own CORS policy.
    pub permissive_cors: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8443,
            request_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024,
            permissive_cors: true,
        }
    }
}

/// Token issuer identity and lifetime configuration (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssuerConfig {
    /// `iss` claim value and discovery document base URL.
    pub issuer: String,
    /// Optional `aud` claim; omitted from claims when unset.
    pub audience: Option<String>,
    /// Access token lifetime. Default 3 minutes.
    #[serde(with = "humantime_serde")]
    pub access_token_expiry: Duration,
    /// Refresh token lifetime. Default 7 days.
    #[serde(with = "humantime_serde")]
    pub refresh_token_expiry: Duration,
    /// Authorization code lifetime, clamped to 10 minutes max (§3).
    #[serde(with = "humantime_serde")]
    pub authorization_code_expiry: Duration,
    /// Maximum clock-skew leeway a caller may request for `nbf`/`iat`
    /// checks during introspection (§4.8.6, §9). Requests above this are
    /// clamped, never disabled outright.
    #[serde(with = "humantime_serde")]
    pub max_clock_skew_leeway: Duration,
}

impl Default for IssuerConfig {
    fn default() -> Self {
        Self {
            issuer: "https://authority.example.invalid".to_string(),
            audience: None,
            access_token_expiry: Duration::from_secs(180),
            refresh_token_expiry: Duration::from_secs(7 * 24 * 3600),
            authorization_code_expiry: Duration::from_secs(600),
            max_clock_skew_leeway: Duration::from_secs(30),
        }
    }
}

impl IssuerConfig {
    /// [`Self::access_token_expiry`] as a [`chrono::Duration`] for
    /// arithmetic against [`chrono::DateTime<Utc>`][chrono::Utc] timestamps.
    #[must_use]
    pub fn access_token_expiry_duration(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.access_token_expiry).unwrap_or(chrono::Duration::seconds(180))
    }

    /// [`Self::refresh_token_expiry`] as a [`chrono::Duration`].
    #[must_use]
    pub fn refresh_token_expiry_duration(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.refresh_token_expiry).unwrap_or(chrono::Duration::days(7))
    }

    /// [`Self::max_clock_skew_leeway`], clamped to itself (callers pass this
    /// through [`std::cmp::min`] against a caller-requested leeway).
    #[must_use]
    pub fn max_clock_skew_leeway_duration(&self) -> Duration {
        self.max_clock_skew_leeway
    }
}

/// JWT signing key material (§6 key provider interface).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KeyConfig {
    /// PEM-encoded RSA private key path for the active signing key.
    pub private_key_path: Option<String>,
    /// PEM-encoded RSA public key path for the active signing key.
    pub public_key_path: Option<String>,
    /// `kid` of the active signing key.
    pub active_kid: String,
    /// The active key's public JWK document (`n`/`e`/`kty`/...), published
    /// verbatim at `/.well-known/jwks.json`. Key *generation* is out of
    /// scope (§1 Non-goals); this is pasted in from whatever ceremony
    /// produced the PEM pair, keeping this crate off a bespoke
    /// PEM-to-JWK conversion.
    pub active_jwk: Option<serde_json::Value>,
    /// Additional retired keys accepted during rotation overlap but never
    /// selected for new signatures.
    #[serde(default)]
    pub retired_keys: Vec<RetiredKeyConfig>,
}

impl Default for KeyConfig {
    fn default() -> Self {
        Self {
            private_key_path: None,
            public_key_path: None,
            active_kid: "default".to_string(),
            active_jwk: None,
            retired_keys: Vec::new(),
        }
    }
}

/// A retired signing key kept around to verify tokens minted before rotation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetiredKeyConfig {
    /// `kid` this entry verifies.
    pub kid: String,
    /// PEM-encoded RSA public key path.
    pub public_key_path: String,
    /// This key's public JWK document.
    pub jwk: serde_json::Value,
}

/// External policy decision service configuration (C4, §6 `ENABLE_OPA_POLICIES`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionGatewayConfig {
    /// Whether decisions are routed to the remote service at all.
    pub enabled: bool,
    /// Decision service host.
    pub host: String,
    /// Decision service port.
    pub port: u16,
    /// Base path under which `POST /v1/data/<rule>` lives.
    pub policy_path: String,
    /// Request timeout; on expiry the gateway fails closed (deny).
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for DecisionGatewayConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "127.0.0.1".to_string(),
            port: 8181,
            policy_path: "/v1/data".to_string(),
            timeout: Duration::from_secs(1),
        }
    }
}

/// Location of the scope-expansion-policy document (C3 §4.3), hot-reloaded
/// by [`crate::expansion_policy::spawn_watcher`] without a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeExpansionPolicyConfig {
    /// Path to the YAML document. When `None`, the policy is the
    /// conservative default (deny everything beyond the empty set).
    pub path: Option<String>,
}

impl Default for ScopeExpansionPolicyConfig {
    fn default() -> Self {
        Self { path: None }
    }
}

/// Client ids permitted to present `launch_reason=system_job` (§6).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SystemClientsConfig {
    /// The allow-listed client ids.
    #[serde(default)]
    pub system_client_ids: Vec<String>,
}

/// Declarative bootstrap catalog loaded at startup (§3 "Scopes and Policies
/// are created at bootstrap from declarative configuration").
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Scope definitions to seed the scope catalog with.
    #[serde(default)]
    pub scopes: Vec<BootstrapScope>,
    /// Policy definitions to seed the policy catalog with.
    #[serde(default)]
    pub policies: Vec<serde_json::Value>,
    /// Declarative "implied" scope expansions consulted by `ScopeEngine::expand`.
    #[serde(default)]
    pub implied_expansions: Vec<ImpliedExpansion>,
    /// Agent clients available for client-credentials grants.
    #[serde(default)]
    pub agents: Vec<BootstrapAgent>,
}

/// One entry of the declarative scope catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapScope {
    /// Scope name, e.g. `read:web`.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Scope category.
    #[serde(default)]
    pub category: String,
    /// Whether the scope is sensitive (drives `requires_approval` defaults).
    #[serde(default)]
    pub is_sensitive: bool,
    /// Whether the scope requires human consent before issuance.
    #[serde(default)]
    pub requires_approval: bool,
    /// Whether the scope is granted by default when none is requested.
    #[serde(default)]
    pub is_default: bool,
}

/// A declarative "implied" scope expansion: holding `implies` grants `scope`
/// too, applied by `ScopeEngine::expand`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImpliedExpansion {
    /// The scope that, once held, implies another.
    pub implies: String,
    /// The scope name implied.
    pub scope: String,
}

/// One bootstrap agent client (ambient addition, §3 "Agent client").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapAgent {
    /// Client id.
    pub client_id: String,
    /// SHA-256 hex digest of the client secret (see `hashing::sha256_hex`); never plaintext.
    pub client_secret_hash: String,
    /// Tool names this agent may be granted.
    #[serde(default)]
    pub tool_names: Vec<String>,
    /// OIDC-A agent type claim.
    #[serde(default)]
    pub agent_type: Option<String>,
    /// OIDC-A agent model claim.
    #[serde(default)]
    pub agent_model: Option<String>,
    /// OIDC-A agent provider claim.
    #[serde(default)]
    pub agent_provider: Option<String>,
    /// Trust level assigned to tokens this agent is issued.
    #[serde(default)]
    pub trust_level: Option<String>,
    /// Redirect URIs registered for the authorization-code flow.
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_conservative_issuer() {
        // GIVEN/WHEN: the zero-value config
        let config = Config::default();

        // THEN: sane defaults, nothing wired to an external decision service
        assert!(!config.decision_gateway.enabled);
        assert_eq!(config.issuer.access_token_expiry, Duration::from_secs(180));
        assert_eq!(config.issuer.refresh_token_expiry, Duration::from_secs(7 * 24 * 3600));
    }

    #[test]
    fn load_without_path_uses_env_and_defaults() {
        // GIVEN: no config file
        // WHEN: loaded
        let config = Config::load(None).expect("load should succeed with no file");

        // THEN: defaults populate every sub-config
        assert_eq!(config.server.port, 8443);
    }

    #[test]
    fn load_rejects_missing_file() {
        // GIVEN: a path that does not exist
        let path = Path::new("/nonexistent/authority-config.yaml");

        // WHEN/THEN: load fails rather than silently ignoring the path
        assert!(Config::load(Some(path)).is_err());
    }
}
