//! Core data model (§3): scopes, policies, authorization codes, issued
//! tokens, delegation grants, audit records, and agent clients.
//!
//! These types are intentionally storage-agnostic — they carry no database
//! identifiers beyond their own opaque ids, and no ORM annotations.
//! The [`crate::store`] traits own persistence; this module owns shape.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

/// A scope category (§3 `Scope.category`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeCategory {
    /// Read-only access.
    Read,
    /// Mutating access.
    Write,
    /// Administrative access.
    Admin,
    /// Invocation of a specific tool.
    Tool,
}

/// A named permission atom of the form `resource:action[:qualifier...]` (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scope {
    /// Opaque storage id.
    pub id: String,
    /// Globally unique scope name, e.g. `read:web`.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// Scope category.
    pub category: ScopeCategory,
    /// Whether the scope is sensitive (drives default approval requirements).
    #[serde(default)]
    pub is_sensitive: bool,
    /// Whether issuance of this scope requires human consent.
    #[serde(default)]
    pub requires_approval: bool,
    /// Whether this scope is granted when a client requests none explicitly.
    #[serde(default)]
    pub is_default: bool,
    /// Soft-delete flag; inactive scopes are excluded from `list`/`expand`.
    #[serde(default = "default_true")]
    pub is_active: bool,
}

fn default_true() -> bool {
    true
}

/// The flattened view `Scope::registry()` hands back (§4.2): a scope name
/// split on `:` into resource / action / trailing qualifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeParts {
    /// The scope's full name, unchanged.
    pub name: String,
    /// First segment.
    pub resource: String,
    /// Second segment.
    pub action: String,
    /// Any segments after the second.
    pub qualifiers: Vec<String>,
}

/// A policy's effect (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Grants the decision.
    Allow,
    /// Denies the decision; deny-overrides (§4.3, §8 property 8).
    Deny,
    /// Requires human consent before proceeding.
    ConsentRequired,
}

/// A condition-tree comparison operator (§4.1, exhaustive).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Contains,
    OneOf,
    ContainsAny,
    ContainsAll,
    Startswith,
    Endswith,
    Regex,
    RegexNot,
    Ilike,
    NotIlike,
    Wildcard,
    LenEq,
    LenLt,
    LenGt,
    Empty,
    NotEmpty,
    Between,
    NotBetween,
    IpInCidr,
    IpNotInCidr,
    Before,
    After,
    Within,
}

/// A recursive condition tree (§3, §4.1).
///
/// `And` is vacuously true over an empty list; `Or` is vacuously false.
/// `Custom` transparently unwraps its inner tree (§4.1 "if the tree has a
/// `custom` wrapper as its top-level key, it is transparently unwrapped").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    /// Conjunction.
    And(Vec<Condition>),
    /// Disjunction.
    Or(Vec<Condition>),
    /// Negation.
    Not(Box<Condition>),
    /// A top-level wrapper that unwraps transparently.
    Custom(Box<Condition>),
    /// A single comparison against the attribute context.
    Leaf(Leaf),
}

/// A single condition-tree leaf (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leaf {
    /// Dotted attribute path resolved against the context, e.g. `agent.trust_level`.
    pub attribute: String,
    /// The comparison operator.
    pub operator: Operator,
    /// A literal comparison value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    /// A second dotted attribute path to compare against instead of a literal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<String>,
}

/// A stored policy (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Policy {
    /// Opaque storage id.
    pub id: String,
    /// Globally unique policy name.
    pub name: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: String,
    /// The decision this policy renders when matched.
    pub effect: Effect,
    /// The condition tree gating this policy.
    pub conditions: Condition,
    /// Evaluation order; lower values take precedence (§4.3).
    pub priority: i64,
    /// Soft-delete flag.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Scope names this policy is associated with (`scopes[*]→Scope`, §3).
    #[serde(default)]
    pub scopes: Vec<String>,
}

/// PKCE code challenge method (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CodeChallengeMethod {
    /// `challenge == verifier`.
    Plain,
    /// `challenge == base64url(sha256(verifier))` with padding stripped.
    S256,
}

/// A one-time authorization code bound to a PKCE challenge (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationCode {
    /// Opaque storage id.
    pub code_id: String,
    /// SHA-256 hash of the plaintext code; the plaintext is never stored.
    pub code_hash: String,
    /// The client this code was issued to.
    pub client_id: String,
    /// Redirect URI registered at the authorize step; must match at exchange.
    pub redirect_uri: String,
    /// Requested scope.
    pub scope: Vec<String>,
    /// PKCE code challenge.
    pub code_challenge: String,
    /// PKCE method.
    pub code_challenge_method: CodeChallengeMethod,
    /// Opaque `state` echoed back to the client.
    #[serde(default)]
    pub state: Option<String>,
    /// Expiry instant (≤10 minutes from issuance, §3).
    pub expires_at: chrono::DateTime<chrono::Utc>,
    /// Flipped exactly once at successful exchange (§3, §5.1).
    #[serde(default)]
    pub consumed: bool,
}

impl AuthorizationCode {
    /// Whether `now` is past `expires_at`.
    #[must_use]
    pub fn is_expired(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Scope inheritance classification carried on an issued token (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeInheritanceType {
    /// Scope is a strict subset of the parent's scope.
    Restricted,
    /// Scope was widened beyond the parent's via an expansion policy exception.
    Inherited,
}

/// Rationale under which a token is minted (GLOSSARY "Launch reason").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LaunchReason {
    /// A human is driving the session interactively.
    UserInteractive,
    /// An unattended scheduled/system job. Gated by `SYSTEM_CLIENT_IDS` (§6).
    SystemJob,
    /// Minted on behalf of another agent via a delegation grant.
    AgentDelegated,
}

/// An issued access/refresh token pair's persisted record (§3).
///
/// Invariants enforced by [`crate::authority::TokenAuthority`], not by this
/// type: scope/tool monotonicity across lineage, revocation monotonicity,
/// and that plaintext tokens never round-trip through this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IssuedToken {
    /// Opaque token id; doubles as the JWT `jti` claim.
    pub token_id: String,
    /// Client this token was issued to.
    pub client_id: String,
    /// One-way hash of the plaintext access token.
    pub access_token_hash: String,
    /// One-way hash of the plaintext refresh token, if one was issued.
    #[serde(default)]
    pub refresh_token_hash: Option<String>,
    /// Granted scope.
    pub scope: Vec<String>,
    /// Granted tool names.
    #[serde(default)]
    pub granted_tools: Vec<String>,
    /// Task this token was minted for.
    pub task_id: String,
    /// The `task_id` of the token that spawned this one, if any.
    #[serde(default)]
    pub parent_task_id: Option<String>,
    /// The `token_id` of this token's direct parent, if any.
    #[serde(default)]
    pub parent_token_id: Option<String>,
    /// Free-text description of the task, for audit/UI display.
    #[serde(default)]
    pub task_description: Option<String>,
    /// Whether this token's scope equals/subsets the parent's, or required
    /// an expansion-policy exception.
    pub scope_inheritance_type: ScopeInheritanceType,
    /// PKCE challenge this token's grant was bound to, if any (code flow).
    #[serde(default)]
    pub code_challenge: Option<String>,
    /// PKCE method, if `code_challenge` is set.
    #[serde(default)]
    pub code_challenge_method: Option<CodeChallengeMethod>,
    /// Issuance instant.
    pub issued_at: chrono::DateTime<chrono::Utc>,
    /// Expiry instant.
    pub expires_at: chrono::DateTime<chrono::Utc>,
    /// Monotone revocation flag (§3 invariant iv).
    #[serde(default)]
    pub is_revoked: bool,
    /// Revocation instant, set exactly once.
    #[serde(default)]
    pub revoked_at: Option<chrono::DateTime<chrono::Utc>>,
    /// Human-readable revocation reason, e.g. `"parent token revoked: <id>"`.
    #[serde(default)]
    pub revocation_reason: Option<String>,
    /// Principal this token delegates on behalf of, when issued under a
    /// delegation grant.
    #[serde(default)]
    pub delegator_sub: Option<String>,
    /// OIDC-A `agent_type` claim.
    #[serde(default)]
    pub agent_type: Option<String>,
    /// OIDC-A `agent_model` claim.
    #[serde(default)]
    pub agent_model: Option<String>,
    /// OIDC-A `agent_provider` claim.
    #[serde(default)]
    pub agent_provider: Option<String>,
    /// OIDC-A `agent_instance_id` claim.
    #[serde(default)]
    pub agent_instance_id: Option<String>,
    /// Trust level assigned to this agent, if the registering client has one.
    #[serde(default)]
    pub agent_trust_level: Option<String>,
    /// Launch reason this token was minted under.
    pub launch_reason: LaunchReason,
}

impl IssuedToken {
    /// `true` unless revoked or past expiry (used by `verify_task_lineage`
    /// when no parent assertions are supplied, §4.8.6).
    #[must_use]
    pub fn is_valid(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        !self.is_revoked && now < self.expires_at
    }

    /// `scope` as a `HashSet` for subset comparisons.
    #[must_use]
    pub fn scope_set(&self) -> HashSet<&str> {
        self.scope.iter().map(String::as_str).collect()
    }

    /// `granted_tools` as a `HashSet` for subset comparisons.
    #[must_use]
    pub fn tools_set(&self) -> HashSet<&str> {
        self.granted_tools.iter().map(String::as_str).collect()
    }
}

/// Principal type a delegation grant is issued from (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    /// A human user.
    User,
    /// Another agent.
    Agent,
}

/// A persisted delegation grant (§3, C7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationGrant {
    /// Opaque storage id.
    pub grant_id: String,
    /// The kind of principal delegating.
    pub principal_type: PrincipalType,
    /// The delegating principal's id.
    pub principal_id: String,
    /// The client id allowed to act as delegate under this grant.
    pub delegate_id: String,
    /// Upper bound on any token issued under this grant.
    pub scope: Vec<String>,
    /// Maximum delegation chain depth (`>= 1`).
    pub max_depth: u32,
    /// Free-form constraints document (opaque to the core).
    #[serde(default)]
    pub constraints: Option<serde_json::Value>,
    /// Grant expiry instant.
    pub expires_at: chrono::DateTime<chrono::Utc>,
    /// Monotone revocation flag.
    #[serde(default)]
    pub revoked: bool,
}

impl DelegationGrant {
    /// `true` unless revoked or past `expires_at`.
    #[must_use]
    pub fn is_active(&self, now: chrono::DateTime<chrono::Utc>) -> bool {
        !self.revoked && now < self.expires_at
    }
}

/// An audit record's kind (§3; drives which typed fields are populated).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    /// Token lifecycle events.
    Token,
    /// Delegation grant lifecycle events.
    Delegation,
    /// Policy decision events.
    Policy,
    /// Resource (scope/policy/agent) CRUD events.
    Resource,
}

/// Outcome of the audited event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    /// The operation succeeded.
    Success,
    /// The operation failed for a reason unrelated to policy.
    Failure,
    /// The operation was denied by policy.
    Denied,
}

/// An append-only audit record (§3). Never mutated once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Opaque storage id.
    pub id: String,
    /// Wall-clock instant the event was recorded.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Which subsystem produced this record.
    pub kind: AuditKind,
    /// Subject ids relevant to this event (token id, grant id, client id, ...).
    #[serde(default)]
    pub subject_ids: Vec<String>,
    /// Fine-grained event type, e.g. `"issued"`, `"revoked"`, `"validation_failed"`.
    pub event_type: String,
    /// Outcome.
    pub status: AuditStatus,
    /// Free-form structured detail.
    #[serde(default)]
    pub details: serde_json::Value,
    /// Source IP of the request that produced this event, if known.
    #[serde(default)]
    pub source_ip: Option<String>,
}

/// An agent client able to authenticate a client-credentials grant (§3
/// ambient addition, SPEC_FULL §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentClient {
    /// OAuth `client_id`.
    pub client_id: String,
    /// One-way hash of the client secret; verified in constant time.
    pub client_secret_hash: String,
    /// Soft-delete flag.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Tool names this agent may be granted.
    #[serde(default)]
    pub tool_names: Vec<String>,
    /// OIDC-A `agent_type` claim value to stamp onto tokens.
    #[serde(default)]
    pub agent_type: Option<String>,
    /// OIDC-A `agent_model` claim value.
    #[serde(default)]
    pub agent_model: Option<String>,
    /// OIDC-A `agent_provider` claim value.
    #[serde(default)]
    pub agent_provider: Option<String>,
    /// Trust level stamped onto tokens issued to this agent.
    #[serde(default)]
    pub trust_level: Option<String>,
    /// Registered redirect URIs for the authorization-code flow.
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

impl AgentClient {
    /// Split a scope name on `:` into `(resource, action, qualifiers)` (§4.2 `registry()`).
    #[must_use]
    pub fn tool_name_set(&self) -> HashSet<&str> {
        self.tool_names.iter().map(String::as_str).collect()
    }
}

/// Split a scope name on `:` into its parts (§4.2 `registry()`).
#[must_use]
pub fn scope_parts(name: &str) -> ScopeParts {
    let mut segments = name.split(':');
    let resource = segments.next().unwrap_or_default().to_string();
    let action = segments.next().unwrap_or_default().to_string();
    let qualifiers = segments.map(str::to_string).collect();
    ScopeParts { name: name.to_string(), resource, action, qualifiers }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parts_splits_resource_action_qualifiers() {
        // GIVEN: a scope name with two qualifiers
        let name = "tool:invoke:search:web";

        // WHEN: split into parts
        let parts = scope_parts(name);

        // THEN: resource/action/qualifiers line up
        assert_eq!(parts.resource, "tool");
        assert_eq!(parts.action, "invoke");
        assert_eq!(parts.qualifiers, vec!["search", "web"]);
    }

    #[test]
    fn issued_token_is_valid_respects_revocation_and_expiry() {
        // GIVEN: a token expiring in the future
        let now = chrono::Utc::now();
        let mut token = sample_token(now);

        // THEN: valid before expiry
        assert!(token.is_valid(now));

        // WHEN: revoked
        token.is_revoked = true;

        // THEN: no longer valid
        assert!(!token.is_valid(now));
    }

    fn sample_token(now: chrono::DateTime<chrono::Utc>) -> IssuedToken {
        IssuedToken {
            token_id: "tok_1".into(),
            client_id: "client_1".into(),
            access_token_hash: "hash".into(),
            refresh_token_hash: None,
            scope: vec!["read:web".into()],
            granted_tools: vec![],
            task_id: "task_1".into(),
            parent_task_id: None,
            parent_token_id: None,
            task_description: None,
            scope_inheritance_type: ScopeInheritanceType::Restricted,
            code_challenge: None,
            code_challenge_method: None,
            issued_at: now,
            expires_at: now + chrono::Duration::minutes(3),
            is_revoked: false,
            revoked_at: None,
            revocation_reason: None,
            delegator_sub: None,
            agent_type: None,
            agent_model: None,
            agent_provider: None,
            agent_instance_id: None,
            agent_trust_level: None,
            launch_reason: LaunchReason::UserInteractive,
        }
    }
}
