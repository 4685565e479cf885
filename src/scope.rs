//! Scope Engine (C2, §4.2).
//!
//! Owns the scope catalog's CRUD surface, name validation, declarative
//! "implied" expansion, and the `registry()` flattened view.

use std::collections::HashSet;
use std::sync::Arc;

use std::sync::OnceLock;

use crate::config::ImpliedExpansion;
use crate::domain::{Scope, ScopeCategory, ScopeParts, scope_parts};
use crate::error::{Error, Result};
use crate::store::ScopeStore;

static SCOPE_NAME_PATTERN: OnceLock<regex::Regex> = OnceLock::new();

/// Validate a scope name against the §3 grammar:
/// `^[a-z][a-z0-9_]*(:[a-z0-9_]+)+$`.
#[must_use]
pub fn is_valid_scope_name(name: &str) -> bool {
    SCOPE_NAME_PATTERN
        .get_or_init(|| regex::Regex::new(r"^[a-z][a-z0-9_]*(:[a-z0-9_]+)+$").expect("static pattern"))
        .is_match(name)
}

/// The scope catalog and its expansion rules (C2).
pub struct ScopeEngine {
    store: Arc<dyn ScopeStore>,
    /// Declarative "implied" expansions: holding `implies` also grants `scope`.
    implied: Vec<ImpliedExpansion>,
}

impl ScopeEngine {
    /// Build from a store and a declarative implied-expansion list (§6 bootstrap).
    #[must_use]
    pub fn new(store: Arc<dyn ScopeStore>, implied: Vec<ImpliedExpansion>) -> Self {
        Self { store, implied }
    }

    /// Create a scope after validating its name (§3, §4.2).
    ///
    /// # Errors
    /// `invalid_request` if the name fails validation or is already taken.
    pub async fn create(&self, scope: Scope) -> Result<Scope> {
        if !is_valid_scope_name(&scope.name) {
            return Err(Error::invalid_request(format!("invalid scope name: {}", scope.name)));
        }
        self.store.create(scope).await
    }

    /// Fetch by id.
    pub async fn get(&self, id: &str) -> Option<Scope> {
        self.store.get(id).await
    }

    /// Fetch by name.
    pub async fn get_by_name(&self, name: &str) -> Option<Scope> {
        self.store.get_by_name(name).await
    }

    /// List scopes, optionally filtered by category (§4.2).
    pub async fn list(&self, category: Option<ScopeCategory>) -> Vec<Scope> {
        self.store.list(category).await
    }

    /// Update a scope. A rename re-checks uniqueness at the store layer (§4.2).
    ///
    /// # Errors
    /// `invalid_request` if the new name is invalid or already taken.
    pub async fn update(&self, scope: Scope) -> Result<Scope> {
        if !is_valid_scope_name(&scope.name) {
            return Err(Error::invalid_request(format!("invalid scope name: {}", scope.name)));
        }
        self.store.update(scope).await
    }

    /// Delete a scope, refusing if any policy still references it (§3).
    ///
    /// `references_scope` is the hook a full deployment also wires to tool
    /// and user references; here it covers the policy reference the core
    /// tracks directly.
    ///
    /// # Errors
    /// `invalid_request` if the scope is still referenced.
    pub async fn delete(&self, id: &str, policies: &dyn crate::store::PolicyStore) -> Result<()> {
        if let Some(scope) = self.store.get(id).await {
            if policies.references_scope(&scope.name).await {
                return Err(Error::invalid_request("scope is referenced by an active policy"));
            }
        }
        self.store.delete(id).await
    }

    /// Apply declarative "implied" expansions to `set`, returning the superset
    /// (§4.2 `expand(set) -> superset`). Fixpoint iteration so a chain of
    /// implications (`a implies b`, `b implies c`) fully resolves.
    #[must_use]
    pub fn expand(&self, set: &[String]) -> Vec<String> {
        let mut held: HashSet<String> = set.iter().cloned().collect();
        loop {
            let mut grew = false;
            for rule in &self.implied {
                if held.contains(&rule.implies) && !held.contains(&rule.scope) {
                    held.insert(rule.scope.clone());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }
        held.into_iter().collect()
    }

    /// The flattened `resource`/`action`/`qualifiers` view over every
    /// cataloged scope name (§4.2 `registry()`).
    pub async fn registry(&self) -> Vec<ScopeParts> {
        self.store.all_names().await.iter().map(|name| scope_parts(name)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryScopeStore;

    fn scope(name: &str) -> Scope {
        Scope {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: String::new(),
            category: ScopeCategory::Read,
            is_sensitive: false,
            requires_approval: false,
            is_default: false,
            is_active: true,
        }
    }

    #[test]
    fn valid_scope_names() {
        assert!(is_valid_scope_name("read:web"));
        assert!(is_valid_scope_name("tool:invoke:search:web"));
        assert!(!is_valid_scope_name("Read:Web"));
        assert!(!is_valid_scope_name("read"));
        assert!(!is_valid_scope_name(":web"));
    }

    #[tokio::test]
    async fn create_rejects_invalid_name() {
        let engine = ScopeEngine::new(Arc::new(InMemoryScopeStore::new()), vec![]);
        let result = engine.create(scope("NOTVALID")).await;
        assert!(result.is_err());
    }

    #[test]
    fn expand_applies_transitive_implied_chain() {
        // GIVEN: holding admin:web implies write:web implies read:web
        let engine = ScopeEngine::new(
            Arc::new(InMemoryScopeStore::new()),
            vec![
                ImpliedExpansion { implies: "admin:web".to_string(), scope: "write:web".to_string() },
                ImpliedExpansion { implies: "write:web".to_string(), scope: "read:web".to_string() },
            ],
        );

        // WHEN: expanding a set holding only admin:web
        let expanded = engine.expand(&["admin:web".to_string()]);

        // THEN: both implied scopes are present
        assert!(expanded.contains(&"write:web".to_string()));
        assert!(expanded.contains(&"read:web".to_string()));
    }

    #[tokio::test]
    async fn delete_refuses_when_policy_references_scope() {
        use crate::domain::{Condition, Effect, Policy};
        use crate::store::{InMemoryPolicyStore, PolicyStore, ScopeStore};

        let scope_store = Arc::new(InMemoryScopeStore::new());
        let s = scope("read:web");
        let id = s.id.clone();
        scope_store.create(s).await.unwrap();
        let engine = ScopeEngine::new(scope_store, vec![]);

        let policy_store = InMemoryPolicyStore::new();
        policy_store
            .create(Policy {
                id: "p1".to_string(),
                name: "needs-read".to_string(),
                description: String::new(),
                effect: Effect::Allow,
                conditions: Condition::And(vec![]),
                priority: 10,
                is_active: true,
                scopes: vec!["read:web".to_string()],
            })
            .await
            .unwrap();

        let result = engine.delete(&id, &policy_store).await;
        assert!(result.is_err());
    }
}
