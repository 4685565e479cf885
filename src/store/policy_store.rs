//! Policy catalog storage (backs C3, §4.3).

use dashmap::DashMap;

use crate::domain::{Effect, Policy};
use crate::error::{Error, Result};

/// Persistence for the policy catalog.
#[async_trait::async_trait]
pub trait PolicyStore: Send + Sync + 'static {
    /// Insert a new policy. Fails if `name` is already taken.
    async fn create(&self, policy: Policy) -> Result<Policy>;

    /// Fetch a policy by id.
    async fn get(&self, id: &str) -> Option<Policy>;

    /// List all active policies with the given effect, ordered by ascending
    /// `priority` (§4.3 "order by ascending priority").
    async fn list_active_by_effect(&self, effect: Effect) -> Vec<Policy>;

    /// List every policy regardless of effect/active state (admin surface).
    async fn list_all(&self) -> Vec<Policy>;

    /// Replace a policy's stored record.
    async fn update(&self, policy: Policy) -> Result<Policy>;

    /// Delete a policy by id.
    async fn delete(&self, id: &str) -> Result<()>;

    /// Whether any active policy references `scope_name` (§3 scope-deletion guard).
    async fn references_scope(&self, scope_name: &str) -> bool;
}

/// In-memory policy catalog.
pub struct InMemoryPolicyStore {
    by_id: DashMap<String, Policy>,
}

impl InMemoryPolicyStore {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self { by_id: DashMap::new() }
    }
}

impl Default for InMemoryPolicyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl PolicyStore for InMemoryPolicyStore {
    async fn create(&self, policy: Policy) -> Result<Policy> {
        if self.by_id.iter().any(|e| e.value().name == policy.name) {
            return Err(Error::invalid_request(format!("policy name already exists: {}", policy.name)));
        }
        self.by_id.insert(policy.id.clone(), policy.clone());
        Ok(policy)
    }

    async fn get(&self, id: &str) -> Option<Policy> {
        self.by_id.get(id).map(|p| p.clone())
    }

    async fn list_active_by_effect(&self, effect: Effect) -> Vec<Policy> {
        let mut matched: Vec<Policy> =
            self.by_id.iter().map(|e| e.value().clone()).filter(|p| p.is_active && p.effect == effect).collect();
        matched.sort_by_key(|p| p.priority);
        matched
    }

    async fn list_all(&self) -> Vec<Policy> {
        self.by_id.iter().map(|e| e.value().clone()).collect()
    }

    async fn update(&self, policy: Policy) -> Result<Policy> {
        if !self.by_id.contains_key(&policy.id) {
            return Err(Error::invalid_request("policy not found"));
        }
        self.by_id.insert(policy.id.clone(), policy.clone());
        Ok(policy)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.by_id.remove(id);
        Ok(())
    }

    async fn references_scope(&self, scope_name: &str) -> bool {
        self.by_id.iter().any(|e| e.value().scopes.iter().any(|s| s == scope_name))
    }
}

/// All active policies of a given effect, ordered for evaluation.
///
/// Every engine in this crate that asks "which policies fire" for a given
/// effect goes through this helper so the ordering contract (§4.3) lives in
/// one place.
pub async fn active_ordered(store: &dyn PolicyStore, effect: Effect) -> Vec<Policy> {
    store.list_active_by_effect(effect).await
}
