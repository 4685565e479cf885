//! Policy Engine (C3, §4.3).

use std::sync::Arc;

use serde_json::Value;

use crate::condition::evaluate;
use crate::domain::Effect;
use crate::expansion_policy::ExpansionPolicyCell;
use crate::store::PolicyStore;

/// The outcome of a policy evaluation pass (§4.3 `evaluate(context)`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// At least one non-deny policy matched and no deny matched.
    Allow,
    /// A deny policy matched; deny-overrides wins regardless of priority (§8 property 8).
    Deny {
        /// The id of the deny policy that won.
        denied_by: String,
    },
    /// No policy matched either way.
    None,
}

/// Full result of [`PolicyEngine::evaluate`].
#[derive(Debug, Clone)]
pub struct EvaluationResult {
    /// Whether the decision is `Allow`.
    pub allowed: bool,
    /// The decision itself.
    pub decision: Decision,
    /// Ids of every policy (of the evaluated effect set) that matched.
    pub matched: Vec<String>,
}

/// The attribute-based policy layer (C3): evaluation, consent-gating, and
/// scope-expansion exceptions.
pub struct PolicyEngine {
    store: Arc<dyn PolicyStore>,
    expansion: ExpansionPolicyCell,
}

impl PolicyEngine {
    /// Build from a policy store and the live expansion-policy cell.
    #[must_use]
    pub fn new(store: Arc<dyn PolicyStore>, expansion: ExpansionPolicyCell) -> Self {
        Self { store, expansion }
    }

    /// Evaluate every active allow/deny policy against `context` (§4.3).
    ///
    /// Algorithm: fetch active policies ordered by ascending priority,
    /// evaluate each via the condition evaluator (C1), collect matches; a
    /// matched deny stops evaluation and wins regardless of priority
    /// ordering among the matches (equal-priority deny beats allow).
    pub async fn evaluate(&self, context: &Value) -> EvaluationResult {
        let allow_policies = self.store.list_active_by_effect(Effect::Allow).await;
        let deny_policies = self.store.list_active_by_effect(Effect::Deny).await;

        let mut matched = Vec::new();
        for policy in &deny_policies {
            if evaluate(&policy.conditions, context) {
                matched.push(policy.id.clone());
                return EvaluationResult {
                    allowed: false,
                    decision: Decision::Deny { denied_by: policy.id.clone() },
                    matched,
                };
            }
        }

        for policy in &allow_policies {
            if evaluate(&policy.conditions, context) {
                matched.push(policy.id.clone());
            }
        }

        if matched.is_empty() {
            EvaluationResult { allowed: false, decision: Decision::None, matched }
        } else {
            EvaluationResult { allowed: true, decision: Decision::Allow, matched }
        }
    }

    /// Whether any active `consent_required` policy matches this request
    /// (§4.3 `requires_human_approval`).
    pub async fn requires_human_approval(&self, client_id: &str, scopes: &[String], response_type: &str) -> bool {
        let consent_policies = self.store.list_active_by_effect(Effect::ConsentRequired).await;
        let context = serde_json::json!({
            "client_id": client_id,
            "scopes": scopes,
            "response_type": response_type,
        });
        consent_policies.iter().any(|p| evaluate(&p.conditions, &context))
    }

    /// Whether `exceeded` — the scopes a child token requested beyond its
    /// parent's scope — is covered by the live expansion-policy document
    /// (§4.3 `is_scope_expansion_allowed`).
    #[must_use]
    pub fn is_scope_expansion_allowed(&self, exceeded: &[String], parent_scopes: &[String], client_id: Option<&str>) -> bool {
        self.expansion.snapshot().is_expansion_allowed(exceeded, parent_scopes, client_id)
    }
}
