//! Delegation grant persistence (backs C7, §4.7).

use dashmap::DashMap;

use crate::domain::DelegationGrant;

/// Persistence for delegation grants.
#[async_trait::async_trait]
pub trait DelegationStore: Send + Sync + 'static {
    /// Insert a new grant.
    async fn create(&self, grant: DelegationGrant);

    /// Fetch a grant by id.
    async fn get(&self, grant_id: &str) -> Option<DelegationGrant>;

    /// Replace a grant's stored record (used by revoke).
    async fn update(&self, grant: DelegationGrant);

    /// List every grant for a principal (admin surface).
    async fn list_for_principal(&self, principal_id: &str) -> Vec<DelegationGrant>;
}

/// In-memory delegation grant store.
pub struct InMemoryDelegationStore {
    by_id: DashMap<String, DelegationGrant>,
}

impl InMemoryDelegationStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { by_id: DashMap::new() }
    }
}

impl Default for InMemoryDelegationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl DelegationStore for InMemoryDelegationStore {
    async fn create(&self, grant: DelegationGrant) {
        self.by_id.insert(grant.grant_id.clone(), grant);
    }

    async fn get(&self, grant_id: &str) -> Option<DelegationGrant> {
        self.by_id.get(grant_id).map(|g| g.clone())
    }

    async fn update(&self, grant: DelegationGrant) {
        self.by_id.insert(grant.grant_id.clone(), grant);
    }

    async fn list_for_principal(&self, principal_id: &str) -> Vec<DelegationGrant> {
        self.by_id.iter().map(|e| e.value().clone()).filter(|g| g.principal_id == principal_id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::PrincipalType;
    use chrono::Utc;

    fn grant(id: &str, principal: &str) -> DelegationGrant {
        DelegationGrant {
            grant_id: id.to_string(),
            principal_type: PrincipalType::User,
            principal_id: principal.to_string(),
            delegate_id: "agent-1".to_string(),
            scope: vec!["read:x".to_string()],
            max_depth: 1,
            constraints: None,
            expires_at: Utc::now() + chrono::Duration::hours(1),
            revoked: false,
        }
    }

    #[tokio::test]
    async fn list_for_principal_filters_by_owner() {
        let store = InMemoryDelegationStore::new();
        store.create(grant("g1", "user-1")).await;
        store.create(grant("g2", "user-2")).await;

        let grants = store.list_for_principal("user-1").await;
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].grant_id, "g1");
    }

    #[tokio::test]
    async fn update_persists_revocation() {
        let store = InMemoryDelegationStore::new();
        let mut g = grant("g1", "user-1");
        store.create(g.clone()).await;

        g.revoked = true;
        store.update(g).await;

        assert!(store.get("g1").await.unwrap().revoked);
    }
}
