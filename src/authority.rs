//! Token Authority (C8, §4.8).
//!
//! Orchestrates the three grant flows, signs and verifies access tokens, and
//! enforces lineage/scope-inheritance invariants across C2–C7. Every public
//! method here is the one place a grant-flow or verification algorithm from
//! §4.8 is implemented; the HTTP layer only translates wire shapes to/from
//! these request/response structs.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use subtle::ConstantTimeEq;

use crate::audit::{self, AuditSink};
use crate::config::IssuerConfig;
use crate::decision_gateway::{GatewayDecision, PolicyDecisionGateway};
use crate::delegation::DelegationEngine;
use crate::domain::{
    AgentClient, AuditKind, AuditStatus, CodeChallengeMethod, IssuedToken, LaunchReason, ScopeInheritanceType,
};
use crate::error::{Error, Result};
use crate::hashing::{self, sha256_hex};
use crate::keys::KeyProvider;
use crate::policy::PolicyEngine;
use crate::scope::ScopeEngine;
use crate::store::code_store::NewCode;
use crate::store::{AgentStore, CodeStore, TokenStore};

/// The claim set minted into every access token (§4.8.5).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub jti: String,
    pub sub: String,
    pub iss: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
    pub scope: Vec<String>,
    pub granted_tools: Vec<String>,
    pub task_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_token_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegator_sub: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_instance_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_trust_level: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_capabilities: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegation_chain: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegation_purpose: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delegation_constraints: Option<Value>,
    pub launch_reason: LaunchReason,
}

/// The wire token response shape (§6).
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub scope: String,
    pub task_id: String,
    pub granted_tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_task_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_token_id: Option<String>,
}

/// Input to [`TokenAuthority::authorize`] (§4.8.1).
pub struct AuthorizeRequest {
    pub response_type: String,
    pub client_id: String,
    pub redirect_uri: String,
    pub scope: Vec<String>,
    pub state: Option<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
}

/// Outcome of [`TokenAuthority::authorize`]: either a consent prompt (no side
/// effects) or a redirect carrying the freshly minted code.
#[derive(Debug, Clone)]
pub enum AuthorizeOutcome {
    ConsentRequired { client_id: String, scope: Vec<String> },
    Redirect { url: String },
}

/// Input to [`TokenAuthority::exchange_code`] (§4.8.2).
pub struct ExchangeCodeRequest {
    pub client_id: String,
    pub code: String,
    pub redirect_uri: String,
    pub code_verifier: String,
    pub delegation_grant_id: Option<String>,
    pub launch_reason: LaunchReason,
}

/// Input to [`TokenAuthority::client_credentials`] (§4.8.3).
pub struct ClientCredentialsRequest {
    pub client_id: String,
    pub client_secret: String,
    pub agent_type: Option<String>,
    pub agent_model: Option<String>,
    pub agent_provider: Option<String>,
    pub agent_instance_id: Option<String>,
    pub delegation_grant_id: Option<String>,
    pub parent_token: Option<String>,
    pub parent_tokens: Vec<String>,
    pub required_tools: Vec<String>,
    pub scope: Vec<String>,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub task_id: Option<String>,
    pub launch_reason: LaunchReason,
}

/// Input to [`TokenAuthority::refresh`] (§4.8.4).
pub struct RefreshRequest {
    pub client_id: String,
    pub refresh_token: String,
    pub scope: Option<Vec<String>>,
    pub code_verifier: Option<String>,
    pub delegation_grant_id: Option<String>,
}

/// Result of [`TokenAuthority::introspect`] (§4.8.6).
#[derive(Debug, Clone, Default)]
pub struct IntrospectionResult {
    pub active: bool,
    pub token: Option<IssuedToken>,
    pub claims: Option<AccessTokenClaims>,
}

/// One claimed ancestor passed to [`TokenAuthority::verify_token_chain`].
pub struct ClaimedParent {
    pub token: String,
    pub task_id: Option<String>,
}

/// Where a verified claimed parent sits relative to the token under check
/// (§8 scenario 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainRole {
    DirectParent,
    Ancestor,
}

/// One verified entry in a multi-parent chain.
#[derive(Debug, Clone)]
pub struct ChainEntry {
    pub token_id: String,
    pub role: ChainRole,
}

struct MintParams {
    client_id: String,
    scope: Vec<String>,
    granted_tools: Vec<String>,
    task_id: String,
    parent_task_id: Option<String>,
    parent_token_id: Option<String>,
    scope_inheritance_type: ScopeInheritanceType,
    code_challenge: Option<String>,
    code_challenge_method: Option<CodeChallengeMethod>,
    delegator_sub: Option<String>,
    agent_type: Option<String>,
    agent_model: Option<String>,
    agent_provider: Option<String>,
    agent_instance_id: Option<String>,
    agent_trust_level: Option<String>,
    launch_reason: LaunchReason,
}

/// Orchestrator integrating C2–C7, the key provider, and the audit sink
/// (C8).
pub struct TokenAuthority {
    scopes: Arc<ScopeEngine>,
    policy: Arc<PolicyEngine>,
    gateway: Arc<PolicyDecisionGateway>,
    codes: Arc<dyn CodeStore>,
    tokens: Arc<dyn TokenStore>,
    delegations: Arc<DelegationEngine>,
    agents: Arc<dyn AgentStore>,
    audit: Arc<dyn AuditSink>,
    keys: Arc<KeyProvider>,
    issuer: IssuerConfig,
    system_client_ids: HashSet<String>,
}

impl TokenAuthority {
    /// Build the authority from every collaborator it orchestrates.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        scopes: Arc<ScopeEngine>,
        policy: Arc<PolicyEngine>,
        gateway: Arc<PolicyDecisionGateway>,
        codes: Arc<dyn CodeStore>,
        tokens: Arc<dyn TokenStore>,
        delegations: Arc<DelegationEngine>,
        agents: Arc<dyn AgentStore>,
        audit: Arc<dyn AuditSink>,
        keys: Arc<KeyProvider>,
        issuer: IssuerConfig,
        system_client_ids: HashSet<String>,
    ) -> Self {
        Self { scopes, policy, gateway, codes, tokens, delegations, agents, audit, keys, issuer, system_client_ids }
    }

    // ── 4.8.1 Authorization flow ────────────────────────────────────────

    /// # Errors
    /// `unsupported_response_type`/`invalid_request`/`invalid_client` on
    /// malformed input or an unknown/inactive client.
    pub async fn authorize(&self, request: AuthorizeRequest) -> Result<AuthorizeOutcome> {
        if request.response_type != "code" {
            return Err(Error::unsupported_response_type("response_type must be \"code\""));
        }
        if request.code_challenge.trim().is_empty() {
            return Err(Error::invalid_request("code_challenge is required"));
        }
        let method = parse_code_challenge_method(&request.code_challenge_method)?;
        if request.redirect_uri.trim().is_empty() {
            return Err(Error::invalid_request("redirect_uri is required"));
        }

        let client = self
            .agents
            .get(&request.client_id)
            .await
            .filter(|c| c.is_active)
            .ok_or_else(|| Error::invalid_client("unknown or inactive client"))?;

        if self.policy.requires_human_approval(&client.client_id, &request.scope, &request.response_type).await {
            return Ok(AuthorizeOutcome::ConsentRequired { client_id: client.client_id, scope: request.scope });
        }

        let code = self
            .codes
            .create(NewCode {
                client_id: client.client_id,
                redirect_uri: request.redirect_uri.clone(),
                scope: request.scope,
                code_challenge: request.code_challenge,
                code_challenge_method: method,
                state: request.state.clone(),
                ttl: self.issuer.authorization_code_expiry,
            })
            .await;

        let url = append_redirect_params(&request.redirect_uri, &code, request.state.as_deref())?;
        Ok(AuthorizeOutcome::Redirect { url })
    }

    // ── 4.8.2 Code exchange ──────────────────────────────────────────────

    /// # Errors
    /// `access_denied` if the gate denies; whatever [`CodeStore::consume`]
    /// or [`DelegationEngine::validate_grant`] raise otherwise.
    pub async fn exchange_code(&self, request: ExchangeCodeRequest) -> Result<TokenResponse> {
        self.gate("allow_auth_code", &request.client_id).await?;

        let code_record =
            self.codes.consume(&request.code, &request.client_id, &request.redirect_uri, &request.code_verifier).await?;

        let mut scope = code_record.scope;
        let mut delegator_sub = None;
        if let Some(grant_id) = &request.delegation_grant_id {
            let grant = self.delegations.validate_grant(grant_id, &request.client_id, None).await?;
            delegator_sub = Some(grant.principal_id.clone());
            let grant_scope: HashSet<&str> = grant.scope.iter().map(String::as_str).collect();
            scope.retain(|s| grant_scope.contains(s.as_str()));
        }

        let client = self
            .agents
            .get(&request.client_id)
            .await
            .ok_or_else(|| Error::invalid_client("unknown client"))?;

        self.mint(MintParams {
            client_id: client.client_id.clone(),
            scope,
            granted_tools: Vec::new(),
            task_id: uuid::Uuid::new_v4().to_string(),
            parent_task_id: None,
            parent_token_id: None,
            scope_inheritance_type: ScopeInheritanceType::Restricted,
            code_challenge: None,
            code_challenge_method: None,
            delegator_sub,
            agent_type: client.agent_type.clone(),
            agent_model: client.agent_model.clone(),
            agent_provider: client.agent_provider.clone(),
            agent_instance_id: None,
            agent_trust_level: client.trust_level.clone(),
            launch_reason: request.launch_reason,
        })
        .await
    }

    // ── 4.8.3 Client-credentials grant ──────────────────────────────────

    /// # Errors
    /// `invalid_client` on bad credentials; `invalid_scope` if requested
    /// scope/tools exceed a resolved parent or delegation grant;
    /// `unauthorized_client` if `launch_reason=system_job` is asserted by a
    /// client not in `SYSTEM_CLIENT_IDS`.
    pub async fn client_credentials(&self, request: ClientCredentialsRequest) -> Result<TokenResponse> {
        self.gate("allow_client_credentials", &request.client_id).await?;

        if request.launch_reason == LaunchReason::SystemJob && !self.system_client_ids.contains(&request.client_id) {
            return Err(Error::unauthorized_client("client is not allow-listed for launch_reason=system_job"));
        }

        let client = self
            .agents
            .get(&request.client_id)
            .await
            .filter(|c| c.is_active)
            .ok_or_else(|| Error::invalid_client("unknown or inactive client"))?;
        if !verify_client_secret(&client, &request.client_secret) {
            return Err(Error::invalid_client("bad client secret"));
        }

        if request.code_challenge.trim().is_empty() {
            return Err(Error::invalid_request("code_challenge is required"));
        }
        let method = parse_code_challenge_method(&request.code_challenge_method)?;

        let parent = self.resolve_parent(request.parent_token.as_deref(), &request.parent_tokens).await?;

        let mut scope = request.scope;
        let mut delegator_sub = None;
        if let Some(grant_id) = &request.delegation_grant_id {
            let grant = self.delegations.validate_grant(grant_id, &request.client_id, None).await?;
            let grant_scope: HashSet<&str> = grant.scope.iter().map(String::as_str).collect();
            let exceeded: Vec<String> = scope.iter().filter(|s| !grant_scope.contains(s.as_str())).cloned().collect();
            if !exceeded.is_empty() {
                return Err(Error::invalid_scope(&scope, &grant.scope, &exceeded));
            }
            delegator_sub = Some(grant.principal_id.clone());
        }

        let scope_inheritance_type = if let Some(parent) = &parent {
            let exceeded: Vec<String> = scope.iter().filter(|s| !parent.scope_set().contains(s.as_str())).cloned().collect();
            if exceeded.is_empty() {
                ScopeInheritanceType::Restricted
            } else if self.policy.is_scope_expansion_allowed(&exceeded, &parent.scope, Some(&request.client_id)) {
                ScopeInheritanceType::Inherited
            } else {
                return Err(Error::invalid_scope(&scope, &parent.scope, &exceeded));
            }
        } else {
            ScopeInheritanceType::Restricted
        };

        let agent_tools = client.tool_name_set();
        let mut granted_tools: Vec<String> =
            request.required_tools.iter().filter(|t| agent_tools.contains(t.as_str())).cloned().collect();
        if let Some(parent) = &parent {
            let parent_tools = parent.tools_set();
            granted_tools.retain(|t| parent_tools.contains(t.as_str()));
        }

        let task_id = request.task_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let (parent_task_id, parent_token_id) =
            parent.as_ref().map_or((None, None), |p| (Some(p.task_id.clone()), Some(p.token_id.clone())));

        self.mint(MintParams {
            client_id: client.client_id.clone(),
            scope,
            granted_tools,
            task_id,
            parent_task_id,
            parent_token_id,
            scope_inheritance_type,
            code_challenge: Some(request.code_challenge),
            code_challenge_method: Some(method),
            delegator_sub,
            agent_type: request.agent_type.or_else(|| client.agent_type.clone()),
            agent_model: request.agent_model.or_else(|| client.agent_model.clone()),
            agent_provider: request.agent_provider.or_else(|| client.agent_provider.clone()),
            agent_instance_id: request.agent_instance_id,
            agent_trust_level: client.trust_level.clone(),
            launch_reason: request.launch_reason,
        })
        .await
    }

    /// Resolve the bounding parent token for a client-credentials grant from
    /// either `parent_token` or `parent_tokens[]` (§4.8.3, §4.8.6 "multi-parent
    /// chain"). When several are claimed, every one after the first must be
    /// reachable in the first's ancestry (this crate's reading of the open
    /// question on multi-parent reachability — see DESIGN.md).
    async fn resolve_parent(&self, parent_token: Option<&str>, parent_tokens: &[String]) -> Result<Option<IssuedToken>> {
        if let Some(token_str) = parent_token {
            let introspection = self.introspect(token_str, None).await;
            let token = introspection.token.ok_or_else(|| Error::invalid_grant("parent_token failed verification"))?;
            return Ok(Some(token));
        }

        if parent_tokens.is_empty() {
            return Ok(None);
        }

        let mut resolved = Vec::with_capacity(parent_tokens.len());
        for token_str in parent_tokens {
            let introspection = self.introspect(token_str, None).await;
            let token = introspection
                .token
                .ok_or_else(|| Error::invalid_grant("parent_tokens entry failed verification"))?;
            resolved.push(token);
        }

        let direct = resolved[0].clone();
        let ancestry = self.tokens.ancestors(&direct.token_id, None).await;
        let ancestor_ids: HashSet<&str> = ancestry.iter().map(|t| t.token_id.as_str()).collect();
        for extra in &resolved[1..] {
            if !ancestor_ids.contains(extra.token_id.as_str()) {
                return Err(Error::invalid_grant("claimed parent is not reachable in the direct parent's ancestry")
                    .with_details(json!({ "reason": "not_in_chain" })));
            }
        }

        Ok(Some(direct))
    }

    // ── 4.8.4 Refresh ────────────────────────────────────────────────────

    /// # Errors
    /// `invalid_grant` if the refresh token is unknown, stale, revoked, or
    /// fails PKCE re-verification; `invalid_scope` if a widened `scope` is
    /// not covered by an expansion exception.
    pub async fn refresh(&self, request: RefreshRequest) -> Result<TokenResponse> {
        self.gate("allow_refresh", &request.client_id).await?;

        let refresh_hash = sha256_hex(&request.refresh_token);
        let existing = self
            .tokens
            .find_by_refresh_hash(&request.client_id, &refresh_hash)
            .await
            .filter(|t| t.refresh_token_hash.as_deref() == Some(refresh_hash.as_str()))
            .ok_or_else(|| Error::invalid_grant("refresh token not found or already rotated"))?;

        if existing.is_revoked {
            return Err(Error::invalid_grant("token has been revoked"));
        }
        let refresh_expires_at = existing.issued_at + self.issuer.refresh_token_expiry_duration();
        if Utc::now() >= refresh_expires_at {
            return Err(Error::invalid_grant("refresh token expired"));
        }

        if let Some(challenge) = &existing.code_challenge {
            let method = existing.code_challenge_method.unwrap_or(CodeChallengeMethod::S256);
            let verifier = request
                .code_verifier
                .as_deref()
                .ok_or_else(|| Error::invalid_grant("code_verifier is required to refresh this token"))?;
            if !crate::store::code_store::verify_pkce(challenge, method, verifier) {
                return Err(Error::invalid_grant("pkce_mismatch"));
            }
        }

        let scope = match request.scope {
            None => existing.scope.clone(),
            Some(requested) => {
                let current: HashSet<&str> = existing.scope.iter().map(String::as_str).collect();
                let exceeded: Vec<String> = requested.iter().filter(|s| !current.contains(s.as_str())).cloned().collect();
                if exceeded.is_empty() {
                    requested
                } else if self.policy.is_scope_expansion_allowed(&exceeded, &existing.scope, Some(&request.client_id)) {
                    requested
                } else {
                    return Err(Error::invalid_scope(&requested, &existing.scope, &exceeded));
                }
            }
        };

        let delegator_sub = match &request.delegation_grant_id {
            Some(grant_id) => {
                let grant = self.delegations.validate_grant(grant_id, &request.client_id, None).await?;
                Some(grant.principal_id)
            }
            None => existing.delegator_sub.clone(),
        };

        let now = Utc::now();
        let claims = AccessTokenClaims {
            jti: existing.token_id.clone(),
            sub: existing.client_id.clone(),
            iss: self.issuer.issuer.clone(),
            aud: self.issuer.audience.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: (now + self.issuer.access_token_expiry_duration()).timestamp(),
            scope: scope.clone(),
            granted_tools: existing.granted_tools.clone(),
            task_id: existing.task_id.clone(),
            parent_task_id: existing.parent_task_id.clone(),
            parent_token_id: existing.parent_token_id.clone(),
            delegator_sub: delegator_sub.clone(),
            agent_type: existing.agent_type.clone(),
            agent_model: existing.agent_model.clone(),
            agent_provider: existing.agent_provider.clone(),
            agent_instance_id: existing.agent_instance_id.clone(),
            agent_trust_level: existing.agent_trust_level.clone(),
            agent_capabilities: None,
            delegation_chain: None,
            delegation_purpose: None,
            delegation_constraints: None,
            launch_reason: existing.launch_reason,
        };

        let access_token = self.sign(&claims)?;
        let refresh_token = hashing::random_url_safe_token(48);

        let mut updated = existing;
        updated.access_token_hash = sha256_hex(&access_token);
        updated.refresh_token_hash = Some(sha256_hex(&refresh_token));
        updated.scope = scope.clone();
        updated.delegator_sub = delegator_sub;
        updated.issued_at = now;
        updated.expires_at = now + self.issuer.access_token_expiry_duration();

        // Compare-and-swap on the refresh hash just read: if a concurrent
        // refresh already rotated this token, this caller loses and must
        // fail rather than silently clobbering the winner's new hash (§5).
        if !self.tokens.rotate_refresh(&updated.token_id, &refresh_hash, updated.clone()).await {
            return Err(Error::invalid_grant("refresh token not found or already rotated"));
        }

        audit::emit(
            self.audit.as_ref(),
            AuditKind::Token,
            "refreshed",
            AuditStatus::Success,
            vec![updated.token_id.clone()],
            json!({ "client_id": request.client_id }),
        )
        .await;

        Ok(TokenResponse {
            access_token,
            refresh_token: Some(refresh_token),
            token_type: "Bearer",
            expires_in: self.issuer.access_token_expiry_duration().num_seconds(),
            scope: scope.join(" "),
            task_id: updated.task_id,
            granted_tools: updated.granted_tools,
            parent_task_id: updated.parent_task_id,
            parent_token_id: updated.parent_token_id,
        })
    }

    // ── 4.8.5 Minting ────────────────────────────────────────────────────

    async fn mint(&self, params: MintParams) -> Result<TokenResponse> {
        let token_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let expires_at = now + self.issuer.access_token_expiry_duration();

        let claims = AccessTokenClaims {
            jti: token_id.clone(),
            sub: params.client_id.clone(),
            iss: self.issuer.issuer.clone(),
            aud: self.issuer.audience.clone(),
            iat: now.timestamp(),
            nbf: now.timestamp(),
            exp: expires_at.timestamp(),
            scope: params.scope.clone(),
            granted_tools: params.granted_tools.clone(),
            task_id: params.task_id.clone(),
            parent_task_id: params.parent_task_id.clone(),
            parent_token_id: params.parent_token_id.clone(),
            delegator_sub: params.delegator_sub.clone(),
            agent_type: params.agent_type.clone(),
            agent_model: params.agent_model.clone(),
            agent_provider: params.agent_provider.clone(),
            agent_instance_id: params.agent_instance_id.clone(),
            agent_trust_level: params.agent_trust_level.clone(),
            agent_capabilities: None,
            delegation_chain: None,
            delegation_purpose: None,
            delegation_constraints: None,
            launch_reason: params.launch_reason,
        };

        let access_token = self.sign(&claims)?;
        let refresh_token = hashing::random_url_safe_token(48);

        let record = IssuedToken {
            token_id: token_id.clone(),
            client_id: params.client_id,
            access_token_hash: sha256_hex(&access_token),
            refresh_token_hash: Some(sha256_hex(&refresh_token)),
            scope: params.scope.clone(),
            granted_tools: params.granted_tools.clone(),
            task_id: params.task_id.clone(),
            parent_task_id: params.parent_task_id.clone(),
            parent_token_id: params.parent_token_id.clone(),
            task_description: None,
            scope_inheritance_type: params.scope_inheritance_type,
            code_challenge: params.code_challenge,
            code_challenge_method: params.code_challenge_method,
            issued_at: now,
            expires_at,
            is_revoked: false,
            revoked_at: None,
            revocation_reason: None,
            delegator_sub: params.delegator_sub,
            agent_type: params.agent_type,
            agent_model: params.agent_model,
            agent_provider: params.agent_provider,
            agent_instance_id: params.agent_instance_id,
            agent_trust_level: params.agent_trust_level,
            launch_reason: params.launch_reason,
        };

        self.tokens.persist(record.clone()).await;

        audit::emit(
            self.audit.as_ref(),
            AuditKind::Token,
            "issued",
            AuditStatus::Success,
            vec![record.token_id.clone()],
            json!({ "client_id": record.client_id }),
        )
        .await;

        Ok(TokenResponse {
            access_token,
            refresh_token: Some(refresh_token),
            token_type: "Bearer",
            expires_in: self.issuer.access_token_expiry_duration().num_seconds(),
            scope: record.scope.join(" "),
            task_id: record.task_id,
            granted_tools: record.granted_tools,
            parent_task_id: record.parent_task_id,
            parent_token_id: record.parent_token_id,
        })
    }

    fn sign(&self, claims: &AccessTokenClaims) -> Result<String> {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = Some(self.keys.active_kid().to_string());
        jsonwebtoken::encode(&header, claims, self.keys.encoding_key()).map_err(Error::from)
    }

    // ── 4.8.6 Verification ───────────────────────────────────────────────

    /// `introspect` per §4.8.6 steps 1–5. Never raises: every failure mode
    /// collapses to `IntrospectionResult { active: false, .. }`.
    pub async fn introspect(&self, access_token: &str, leeway_override: Option<Duration>) -> IntrospectionResult {
        if access_token.split('.').count() != 3 {
            return IntrospectionResult::default();
        }

        let Ok(header) = jsonwebtoken::decode_header(access_token) else {
            return IntrospectionResult::default();
        };
        let Some(kid) = header.kid else {
            return IntrospectionResult::default();
        };
        let Some(decoding_key) = self.keys.decoding_key(&kid) else {
            return IntrospectionResult::default();
        };

        let leeway = leeway_override
            .unwrap_or(self.issuer.max_clock_skew_leeway_duration())
            .min(self.issuer.max_clock_skew_leeway_duration());
        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = leeway.as_secs();
        if let Some(audience) = &self.issuer.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }

        let Ok(decoded) = jsonwebtoken::decode::<AccessTokenClaims>(access_token, decoding_key, &validation) else {
            return IntrospectionResult::default();
        };
        let claims = decoded.claims;

        let Some(record) = self.tokens.get_by_id(&claims.jti).await else {
            return IntrospectionResult::default();
        };
        if record.is_revoked || !record.is_valid(Utc::now()) {
            return IntrospectionResult { active: false, token: Some(record), claims: Some(claims) };
        }

        if record.access_token_hash != sha256_hex(access_token) {
            // Defense-in-depth anchor only — the signed claim set is
            // authoritative (§4.8.6 step 5, §9 design note).
            audit::emit(
                self.audit.as_ref(),
                AuditKind::Token,
                "verification",
                AuditStatus::Success,
                vec![record.token_id.clone()],
                json!({ "note": "access_token_hash mismatch; honored on valid signature" }),
            )
            .await;
        }

        IntrospectionResult { active: true, token: Some(record), claims: Some(claims) }
    }

    /// §4.8.6 `verify_task_lineage`.
    pub async fn verify_task_lineage(
        &self,
        token: &IssuedToken,
        parent_token: Option<&IssuedToken>,
        task_id: Option<&str>,
        parent_task_id: Option<&str>,
    ) -> bool {
        if parent_token.is_none() && task_id.is_none() && parent_task_id.is_none() {
            return token.is_valid(Utc::now());
        }

        if (parent_token.is_some() || parent_task_id.is_some()) && token.parent_token_id.is_none() {
            self.audit_lineage_mismatch(token, "parent_token_id", "<none>").await;
            return false;
        }

        if let Some(parent) = parent_token {
            if token.parent_token_id.as_deref() != Some(parent.token_id.as_str()) {
                self.audit_lineage_mismatch(token, "parent_token_id", &parent.token_id).await;
                return false;
            }
            if token.parent_task_id.as_deref() != Some(parent.task_id.as_str()) {
                self.audit_lineage_mismatch(token, "parent_task_id", &parent.task_id).await;
                return false;
            }
        } else if let Some(expected) = parent_task_id {
            if token.parent_task_id.as_deref() != Some(expected) {
                self.audit_lineage_mismatch(token, "parent_task_id", expected).await;
                return false;
            }
        }

        if let Some(expected) = task_id {
            if token.task_id != expected {
                self.audit_lineage_mismatch(token, "task_id", expected).await;
                return false;
            }
        }

        true
    }

    async fn audit_lineage_mismatch(&self, token: &IssuedToken, field: &str, expected: &str) {
        audit::emit(
            self.audit.as_ref(),
            AuditKind::Token,
            "verification",
            AuditStatus::Denied,
            vec![token.token_id.clone()],
            json!({ "reason": "lineage_mismatch", "field": field, "expected": expected }),
        )
        .await;
    }

    /// The scopes `token` carries beyond what `parent_token` grants.
    #[must_use]
    pub fn scope_inheritance_exceeded(&self, token: &IssuedToken, parent_token: &IssuedToken) -> Vec<String> {
        token.scope.iter().filter(|s| !parent_token.scope_set().contains(s.as_str())).cloned().collect()
    }

    /// §4.8.6 `verify_scope_inheritance`.
    #[must_use]
    pub fn verify_scope_inheritance(&self, token: &IssuedToken, parent_token: &IssuedToken, check_expansions: bool) -> bool {
        let exceeded = self.scope_inheritance_exceeded(token, parent_token);
        if exceeded.is_empty() {
            return true;
        }
        if !check_expansions {
            return false;
        }
        self.policy.is_scope_expansion_allowed(&exceeded, &parent_token.scope, Some(&token.client_id))
    }

    /// §4.8.6 "Multi-parent chain" / §8 scenario 5.
    ///
    /// # Errors
    /// `invalid_grant` with `reason` in `{not_in_chain, task_id_mismatch}`.
    pub async fn verify_token_chain(&self, token: &IssuedToken, claims: &[ClaimedParent]) -> Result<Vec<ChainEntry>> {
        let ancestry = self.tokens.ancestors(&token.token_id, None).await;
        let ancestor_ids: HashSet<&str> =
            ancestry.iter().filter(|t| t.token_id != token.token_id).map(|t| t.token_id.as_str()).collect();

        let mut entries = Vec::with_capacity(claims.len());
        for claim in claims {
            let introspection = self.introspect(&claim.token, None).await;
            let candidate = introspection
                .token
                .filter(|t| t.is_valid(Utc::now()))
                .ok_or_else(|| chain_error("claimed parent token failed verification", "not_in_chain"))?;

            if let Some(expected_task) = &claim.task_id {
                if &candidate.task_id != expected_task {
                    return Err(chain_error("claimed parent task_id mismatch", "task_id_mismatch"));
                }
            }

            let role = if token.parent_token_id.as_deref() == Some(candidate.token_id.as_str()) {
                ChainRole::DirectParent
            } else if ancestor_ids.contains(candidate.token_id.as_str()) {
                ChainRole::Ancestor
            } else {
                return Err(chain_error("claimed parent is not reachable from this token", "not_in_chain"));
            };

            entries.push(ChainEntry { token_id: candidate.token_id, role });
        }

        Ok(entries)
    }

    // ── 4.8.7 Revocation & cascade ───────────────────────────────────────

    /// Revoke by `token_id` or by presenting the token string itself
    /// (resolved via `introspect`). Returns every token id transitioned.
    ///
    /// # Errors
    /// `invalid_grant` if a token string is supplied and fails verification.
    pub async fn revoke(&self, token_ref: &str, reason: Option<String>, cascade: bool) -> Result<Vec<String>> {
        let token_id = if token_ref.split('.').count() == 3 {
            self.introspect(token_ref, None)
                .await
                .token
                .map(|t| t.token_id)
                .ok_or_else(|| Error::invalid_grant("token not found"))?
        } else {
            token_ref.to_string()
        };

        let transitioned = self.tokens.revoke(&token_id, reason, cascade).await;

        audit::emit(
            self.audit.as_ref(),
            AuditKind::Token,
            "revoked",
            AuditStatus::Success,
            transitioned.clone(),
            json!({ "cascade": cascade }),
        )
        .await;

        Ok(transitioned)
    }

    async fn gate(&self, rule: &str, client_id: &str) -> Result<()> {
        let input = json!({ "client_id": client_id });
        match self.gateway.query(rule, &input).await {
            GatewayDecision::Allow => Ok(()),
            GatewayDecision::Deny => Err(Error::denied_by_policy(rule)),
        }
    }
}

fn chain_error(message: &'static str, reason: &'static str) -> Error {
    Error::invalid_grant(message).with_details(json!({ "reason": reason }))
}

fn parse_code_challenge_method(raw: &str) -> Result<CodeChallengeMethod> {
    match raw.to_ascii_uppercase().as_str() {
        "S256" => Ok(CodeChallengeMethod::S256),
        "PLAIN" => Ok(CodeChallengeMethod::Plain),
        _ => Err(Error::invalid_request(format!("unsupported code_challenge_method: {raw}"))),
    }
}

fn verify_client_secret(client: &AgentClient, provided_secret: &str) -> bool {
    let expected = sha256_hex(provided_secret);
    let (a, b) = (expected.as_bytes(), client.client_secret_hash.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    bool::from(a.ct_eq(b))
}

fn append_redirect_params(redirect_uri: &str, code: &str, state: Option<&str>) -> Result<String> {
    let mut url =
        url::Url::parse(redirect_uri).map_err(|_| Error::invalid_request("redirect_uri is not a valid URL"))?;
    {
        let mut pairs = url.query_pairs_mut();
        pairs.append_pair("code", code);
        if let Some(state) = state {
            pairs.append_pair("state", state);
        }
    }
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::config::{DecisionGatewayConfig, ScopeExpansionPolicyConfig};
    use crate::domain::{AgentClient, PrincipalType};
    use crate::expansion_policy::{ExpansionPolicy, ExpansionPolicyCell};
    use crate::store::{InMemoryAgentStore, InMemoryCodeStore, InMemoryDelegationStore, InMemoryPolicyStore, InMemoryTokenStore};
    use std::time::Duration as StdDuration;

    const TEST_PRIVATE_KEY: &str = include_str!("../tests/fixtures/test_rsa_private.pem");
    const TEST_PUBLIC_KEY: &str = include_str!("../tests/fixtures/test_rsa_public.pem");

    fn issuer_config() -> IssuerConfig {
        IssuerConfig {
            issuer: "https://authority.test.invalid".to_string(),
            audience: None,
            access_token_expiry: StdDuration::from_secs(180),
            refresh_token_expiry: StdDuration::from_secs(604_800),
            authorization_code_expiry: StdDuration::from_secs(600),
            max_clock_skew_leeway: StdDuration::from_secs(30),
        }
    }

    fn authority() -> (TokenAuthority, Arc<InMemoryAgentStore>, Arc<InMemoryTokenStore>) {
        let agents = Arc::new(InMemoryAgentStore::new());
        let tokens = Arc::new(InMemoryTokenStore::new());
        let scope_store = Arc::new(crate::store::InMemoryScopeStore::new());
        let scopes = Arc::new(ScopeEngine::new(scope_store, vec![]));
        let policy_store = Arc::new(InMemoryPolicyStore::new());
        let expansion = ExpansionPolicyCell::new(ExpansionPolicy::default());
        let policy = Arc::new(PolicyEngine::new(policy_store, expansion));
        let gateway = Arc::new(PolicyDecisionGateway::new(DecisionGatewayConfig { enabled: false, ..Default::default() }));
        let codes: Arc<dyn CodeStore> = Arc::new(InMemoryCodeStore::new());
        let audit: Arc<dyn AuditSink> = Arc::new(InMemoryAuditSink::default());
        let delegations = Arc::new(DelegationEngine::new(Arc::new(InMemoryDelegationStore::new()), audit.clone()));
        let keys = Arc::new(
            KeyProvider::from_keys("test-kid", TEST_PRIVATE_KEY.as_bytes(), TEST_PUBLIC_KEY.as_bytes()).unwrap(),
        );
        let _ = ScopeExpansionPolicyConfig::default();

        let authority = TokenAuthority::new(
            scopes,
            policy,
            gateway,
            codes,
            tokens.clone() as Arc<dyn TokenStore>,
            delegations,
            agents.clone() as Arc<dyn AgentStore>,
            audit,
            keys,
            issuer_config(),
            HashSet::new(),
        );
        (authority, agents, tokens)
    }

    fn agent(client_id: &str, secret: &str) -> AgentClient {
        AgentClient {
            client_id: client_id.to_string(),
            client_secret_hash: sha256_hex(secret),
            is_active: true,
            tool_names: vec!["search".to_string(), "fetch".to_string()],
            agent_type: Some("worker".to_string()),
            agent_model: None,
            agent_provider: None,
            trust_level: None,
            redirect_uris: vec!["https://agent.example/callback".to_string()],
        }
    }

    #[tokio::test]
    async fn authorize_then_exchange_happy_path_then_replay_fails() {
        // GIVEN: §8 scenario 1's PKCE vector and a registered client
        let (authority, agents, _tokens) = authority();
        agents.put(agent("client-1", "secret")).await;

        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";

        // WHEN: authorized
        let outcome = authority
            .authorize(AuthorizeRequest {
                response_type: "code".to_string(),
                client_id: "client-1".to_string(),
                redirect_uri: "https://agent.example/callback".to_string(),
                scope: vec!["read:web".to_string()],
                state: Some("xyz".to_string()),
                code_challenge: challenge.to_string(),
                code_challenge_method: "S256".to_string(),
            })
            .await
            .unwrap();

        let AuthorizeOutcome::Redirect { url } = outcome else { panic!("expected redirect") };
        let parsed = url::Url::parse(&url).unwrap();
        let code = parsed.query_pairs().find(|(k, _)| k == "code").unwrap().1.to_string();

        // WHEN: exchanged
        let response = authority
            .exchange_code(ExchangeCodeRequest {
                client_id: "client-1".to_string(),
                code: code.clone(),
                redirect_uri: "https://agent.example/callback".to_string(),
                code_verifier: verifier.to_string(),
                delegation_grant_id: None,
                launch_reason: LaunchReason::UserInteractive,
            })
            .await
            .unwrap();

        // THEN: token issues and is active
        assert_eq!(response.scope, "read:web");
        let introspection = authority.introspect(&response.access_token, None).await;
        assert!(introspection.active);

        // WHEN: the same code is exchanged again
        let replay = authority
            .exchange_code(ExchangeCodeRequest {
                client_id: "client-1".to_string(),
                code,
                redirect_uri: "https://agent.example/callback".to_string(),
                code_verifier: verifier.to_string(),
                delegation_grant_id: None,
                launch_reason: LaunchReason::UserInteractive,
            })
            .await;
        assert!(replay.is_err());
    }

    #[tokio::test]
    async fn client_credentials_scope_must_subset_parent_or_be_covered_by_expansion() {
        // GIVEN: a parent token scoped to read:web only
        let (authority, agents, _tokens) = authority();
        agents.put(agent("client-1", "secret")).await;

        let parent_response = authority
            .client_credentials(ClientCredentialsRequest {
                client_id: "client-1".to_string(),
                client_secret: "secret".to_string(),
                agent_type: None,
                agent_model: None,
                agent_provider: None,
                agent_instance_id: None,
                delegation_grant_id: None,
                parent_token: None,
                parent_tokens: vec![],
                required_tools: vec![],
                scope: vec!["read:web".to_string()],
                code_challenge: "challenge".to_string(),
                code_challenge_method: "plain".to_string(),
                task_id: None,
                launch_reason: LaunchReason::UserInteractive,
            })
            .await
            .unwrap();

        // WHEN: a child requests write:web with no expansion rule (§8 scenario 2)
        let denied = authority
            .client_credentials(ClientCredentialsRequest {
                client_id: "client-1".to_string(),
                client_secret: "secret".to_string(),
                agent_type: None,
                agent_model: None,
                agent_provider: None,
                agent_instance_id: None,
                delegation_grant_id: None,
                parent_token: Some(parent_response.access_token.clone()),
                parent_tokens: vec![],
                required_tools: vec![],
                scope: vec!["write:web".to_string()],
                code_challenge: "challenge2".to_string(),
                code_challenge_method: "plain".to_string(),
                task_id: None,
                launch_reason: LaunchReason::UserInteractive,
            })
            .await;

        // THEN: rejected as invalid_scope
        assert!(denied.is_err());
        assert_eq!(denied.unwrap_err().code(), crate::error::ErrorCode::InvalidScope);
    }

    #[tokio::test]
    async fn cascade_revoke_reflects_in_introspection() {
        // GIVEN: A -> B lineage minted through client_credentials
        let (authority, agents, _tokens) = authority();
        agents.put(agent("client-1", "secret")).await;

        let a = authority
            .client_credentials(ClientCredentialsRequest {
                client_id: "client-1".to_string(),
                client_secret: "secret".to_string(),
                agent_type: None,
                agent_model: None,
                agent_provider: None,
                agent_instance_id: None,
                delegation_grant_id: None,
                parent_token: None,
                parent_tokens: vec![],
                required_tools: vec![],
                scope: vec!["read:web".to_string()],
                code_challenge: "c1".to_string(),
                code_challenge_method: "plain".to_string(),
                task_id: None,
                launch_reason: LaunchReason::UserInteractive,
            })
            .await
            .unwrap();

        let b = authority
            .client_credentials(ClientCredentialsRequest {
                client_id: "client-1".to_string(),
                client_secret: "secret".to_string(),
                agent_type: None,
                agent_model: None,
                agent_provider: None,
                agent_instance_id: None,
                delegation_grant_id: None,
                parent_token: Some(a.access_token.clone()),
                parent_tokens: vec![],
                required_tools: vec![],
                scope: vec!["read:web".to_string()],
                code_challenge: "c2".to_string(),
                code_challenge_method: "plain".to_string(),
                task_id: None,
                launch_reason: LaunchReason::UserInteractive,
            })
            .await
            .unwrap();

        // WHEN: A is cascade-revoked
        authority.revoke(&a.access_token, None, true).await.unwrap();

        // THEN: B is no longer active and its reason names the ancestor
        let introspection = authority.introspect(&b.access_token, None).await;
        assert!(!introspection.active);
        let record = introspection.token.unwrap();
        assert!(record.revocation_reason.unwrap().starts_with("parent token revoked"));
    }

    #[tokio::test]
    async fn delegation_grant_binds_scope_and_revokes_with_it() {
        // GIVEN: §8 scenario 6's grant
        let agents = Arc::new(InMemoryAgentStore::new());
        agents.put(agent("client-1", "secret")).await;

        let delegation_store = Arc::new(InMemoryDelegationStore::new());
        let audit: Arc<dyn AuditSink> = Arc::new(InMemoryAuditSink::default());
        let delegations = DelegationEngine::new(delegation_store, audit);
        let grant = delegations
            .create_grant(crate::delegation::NewGrant {
                principal_type: PrincipalType::User,
                principal_id: "user-1".to_string(),
                delegate_id: "client-1".to_string(),
                scope: vec!["read:x".to_string(), "write:x".to_string()],
                max_depth: 1,
                constraints: None,
                ttl_seconds: 3600,
            })
            .await
            .unwrap();

        let authority = TokenAuthority::new(
            Arc::new(ScopeEngine::new(Arc::new(crate::store::InMemoryScopeStore::new()), vec![])),
            Arc::new(PolicyEngine::new(Arc::new(InMemoryPolicyStore::new()), ExpansionPolicyCell::new(ExpansionPolicy::default()))),
            Arc::new(PolicyDecisionGateway::new(DecisionGatewayConfig { enabled: false, ..Default::default() })),
            Arc::new(InMemoryCodeStore::new()),
            Arc::new(InMemoryTokenStore::new()),
            Arc::new(delegations),
            agents.clone() as Arc<dyn AgentStore>,
            Arc::new(InMemoryAuditSink::default()),
            Arc::new(KeyProvider::from_keys("test-kid", TEST_PRIVATE_KEY.as_bytes(), TEST_PUBLIC_KEY.as_bytes()).unwrap()),
            issuer_config(),
            HashSet::new(),
        );

        let granted = authority
            .client_credentials(ClientCredentialsRequest {
                client_id: "client-1".to_string(),
                client_secret: "secret".to_string(),
                agent_type: None,
                agent_model: None,
                agent_provider: None,
                agent_instance_id: None,
                delegation_grant_id: Some(grant.grant_id.clone()),
                parent_token: None,
                parent_tokens: vec![],
                required_tools: vec![],
                scope: vec!["read:x".to_string()],
                code_challenge: "c1".to_string(),
                code_challenge_method: "plain".to_string(),
                task_id: None,
                launch_reason: LaunchReason::AgentDelegated,
            })
            .await
            .unwrap();
        assert_eq!(granted.scope, "read:x");

        let exceeded = authority
            .client_credentials(ClientCredentialsRequest {
                client_id: "client-1".to_string(),
                client_secret: "secret".to_string(),
                agent_type: None,
                agent_model: None,
                agent_provider: None,
                agent_instance_id: None,
                delegation_grant_id: Some(grant.grant_id.clone()),
                parent_token: None,
                parent_tokens: vec![],
                required_tools: vec![],
                scope: vec!["admin:x".to_string()],
                code_challenge: "c2".to_string(),
                code_challenge_method: "plain".to_string(),
                task_id: None,
                launch_reason: LaunchReason::AgentDelegated,
            })
            .await;
        assert!(exceeded.is_err());
    }
}
