//! Delegation Engine (C7, §4.7).

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::audit::{self, AuditSink};
use crate::domain::{AuditKind, AuditStatus, DelegationGrant, PrincipalType};
use crate::error::{Error, Result};
use crate::store::DelegationStore;

/// Inputs to [`DelegationEngine::create_grant`].
pub struct NewGrant {
    /// Kind of principal delegating.
    pub principal_type: PrincipalType,
    /// The delegating principal's id.
    pub principal_id: String,
    /// The client id allowed to act as delegate under this grant.
    pub delegate_id: String,
    /// Upper bound on any token issued under this grant.
    pub scope: Vec<String>,
    /// Maximum delegation chain depth.
    pub max_depth: u32,
    /// Free-form constraints document.
    pub constraints: Option<serde_json::Value>,
    /// Time-to-live in seconds.
    pub ttl_seconds: i64,
}

/// Why [`DelegationEngine::validate_grant`] rejected a grant (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationFailureReason {
    /// No grant with that id exists.
    NotFound,
    /// `delegate_id` does not match `grant.delegate_id`.
    DelegateMismatch,
    /// Past `expires_at`.
    Expired,
    /// `grant.revoked == true`.
    Revoked,
    /// Requested scopes are not a subset of `grant.scope`.
    ScopeExceeded,
}

impl ValidationFailureReason {
    /// The wire/audit string for this reason.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::DelegateMismatch => "delegate_mismatch",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::ScopeExceeded => "scope_exceeded",
        }
    }
}

/// Lifecycle and validation for delegation grants (C7).
pub struct DelegationEngine {
    store: Arc<dyn DelegationStore>,
    audit: Arc<dyn AuditSink>,
}

impl DelegationEngine {
    /// Build from a store and the shared audit sink.
    #[must_use]
    pub fn new(store: Arc<dyn DelegationStore>, audit: Arc<dyn AuditSink>) -> Self {
        Self { store, audit }
    }

    /// Create and persist a new grant, emitting a `"created"` audit event
    /// (§4.7).
    ///
    /// # Errors
    /// `invalid_request` if `principal_id`/`scope` are empty, `max_depth < 1`,
    /// or `ttl_seconds <= 0`.
    pub async fn create_grant(&self, new_grant: NewGrant) -> Result<DelegationGrant> {
        if new_grant.principal_id.trim().is_empty() {
            return Err(Error::invalid_request("principal_id must not be empty"));
        }
        if new_grant.scope.is_empty() {
            return Err(Error::invalid_request("scope must not be empty"));
        }
        if new_grant.max_depth < 1 {
            return Err(Error::invalid_request("max_depth must be >= 1"));
        }
        if new_grant.ttl_seconds <= 0 {
            return Err(Error::invalid_request("ttl must be > 0"));
        }

        let grant = DelegationGrant {
            grant_id: uuid::Uuid::new_v4().to_string(),
            principal_type: new_grant.principal_type,
            principal_id: new_grant.principal_id,
            delegate_id: new_grant.delegate_id,
            scope: new_grant.scope,
            max_depth: new_grant.max_depth,
            constraints: new_grant.constraints,
            expires_at: Utc::now() + chrono::Duration::seconds(new_grant.ttl_seconds),
            revoked: false,
        };

        self.store.create(grant.clone()).await;

        audit::emit(
            self.audit.as_ref(),
            AuditKind::Delegation,
            "created",
            AuditStatus::Success,
            vec![grant.grant_id.clone()],
            json!({ "principal_id": grant.principal_id, "delegate_id": grant.delegate_id }),
        )
        .await;

        Ok(grant)
    }

    /// Revoke a grant. If `principal` is supplied it must match
    /// `grant.principal_id` (§4.7).
    ///
    /// # Errors
    /// `invalid_request` if the grant doesn't exist or `principal` mismatches.
    pub async fn revoke_grant(&self, grant_id: &str, principal: Option<&str>) -> Result<()> {
        let Some(mut grant) = self.store.get(grant_id).await else {
            return Err(Error::invalid_request("delegation grant not found"));
        };
        if let Some(principal) = principal {
            if grant.principal_id != principal {
                return Err(Error::invalid_request("principal does not own this grant"));
            }
        }

        grant.revoked = true;
        self.store.update(grant).await;

        audit::emit(
            self.audit.as_ref(),
            AuditKind::Delegation,
            "revoked",
            AuditStatus::Success,
            vec![grant_id.to_string()],
            json!({}),
        )
        .await;

        Ok(())
    }

    /// Validate a grant for use by `delegate_id`, optionally asserting the
    /// requested scopes are covered (§4.7). Each distinct failure emits a
    /// `"validation_failed"` audit event carrying its `reason`.
    ///
    /// # Errors
    /// `invalid_grant` carrying the `reason` in its details on any failure.
    pub async fn validate_grant(
        &self,
        grant_id: &str,
        delegate_id: &str,
        requested_scopes: Option<&[String]>,
    ) -> Result<DelegationGrant> {
        let grant = match self.store.get(grant_id).await {
            Some(g) => g,
            None => {
                self.audit_validation_failure(grant_id, ValidationFailureReason::NotFound).await;
                return Err(invalid_grant_reason(ValidationFailureReason::NotFound));
            }
        };

        if grant.revoked {
            self.audit_validation_failure(grant_id, ValidationFailureReason::Revoked).await;
            return Err(invalid_grant_reason(ValidationFailureReason::Revoked));
        }
        if !grant.is_active(Utc::now()) {
            self.audit_validation_failure(grant_id, ValidationFailureReason::Expired).await;
            return Err(invalid_grant_reason(ValidationFailureReason::Expired));
        }
        if grant.delegate_id != delegate_id {
            self.audit_validation_failure(grant_id, ValidationFailureReason::DelegateMismatch).await;
            return Err(invalid_grant_reason(ValidationFailureReason::DelegateMismatch));
        }
        if let Some(requested) = requested_scopes {
            let granted: std::collections::HashSet<&str> = grant.scope.iter().map(String::as_str).collect();
            if !requested.iter().all(|s| granted.contains(s.as_str())) {
                self.audit_validation_failure(grant_id, ValidationFailureReason::ScopeExceeded).await;
                return Err(invalid_grant_reason(ValidationFailureReason::ScopeExceeded));
            }
        }

        Ok(grant)
    }

    async fn audit_validation_failure(&self, grant_id: &str, reason: ValidationFailureReason) {
        audit::emit(
            self.audit.as_ref(),
            AuditKind::Delegation,
            "validation_failed",
            AuditStatus::Denied,
            vec![grant_id.to_string()],
            json!({ "reason": reason.as_str() }),
        )
        .await;
    }
}

fn invalid_grant_reason(reason: ValidationFailureReason) -> Error {
    Error::invalid_grant(format!("delegation grant validation failed: {}", reason.as_str()))
        .with_details(json!({ "reason": reason.as_str() }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::store::InMemoryDelegationStore;

    fn engine() -> DelegationEngine {
        DelegationEngine::new(Arc::new(InMemoryDelegationStore::new()), Arc::new(InMemoryAuditSink::default()))
    }

    fn new_grant() -> NewGrant {
        NewGrant {
            principal_type: PrincipalType::User,
            principal_id: "user-1".to_string(),
            delegate_id: "agent-1".to_string(),
            scope: vec!["read:x".to_string(), "write:x".to_string()],
            max_depth: 1,
            constraints: None,
            ttl_seconds: 3600,
        }
    }

    #[tokio::test]
    async fn create_rejects_zero_max_depth() {
        let engine = engine();
        let mut g = new_grant();
        g.max_depth = 0;
        assert!(engine.create_grant(g).await.is_err());
    }

    #[tokio::test]
    async fn validate_grant_happy_path_then_scope_exceeded() {
        // GIVEN: §8 scenario 6's grant
        let engine = engine();
        let grant = engine.create_grant(new_grant()).await.unwrap();

        // WHEN: validating with a covered scope
        let ok = engine.validate_grant(&grant.grant_id, "agent-1", Some(&["read:x".to_string()])).await;
        assert!(ok.is_ok());

        // WHEN: validating with an uncovered scope
        let exceeded = engine.validate_grant(&grant.grant_id, "agent-1", Some(&["admin:x".to_string()])).await;
        assert!(exceeded.is_err());
    }

    #[tokio::test]
    async fn validate_grant_after_revoke_fails() {
        let engine = engine();
        let grant = engine.create_grant(new_grant()).await.unwrap();

        engine.revoke_grant(&grant.grant_id, None).await.unwrap();

        let result = engine.validate_grant(&grant.grant_id, "agent-1", None).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn revoke_grant_requires_matching_principal() {
        let engine = engine();
        let grant = engine.create_grant(new_grant()).await.unwrap();

        let result = engine.revoke_grant(&grant.grant_id, Some("someone-else")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn validate_grant_rejects_delegate_mismatch() {
        let engine = engine();
        let grant = engine.create_grant(new_grant()).await.unwrap();

        let result = engine.validate_grant(&grant.grant_id, "not-the-delegate", None).await;
        assert!(result.is_err());
    }
}
