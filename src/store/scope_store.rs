//! Scope catalog storage (backs C2, §4.2).

use std::sync::Arc;

use dashmap::DashMap;

use crate::domain::Scope;
use crate::error::{Error, Result};

/// Persistence for the scope catalog.
///
/// Implementations must be `Send + Sync` — the catalog is shared across
/// every request the authority handles.
#[async_trait::async_trait]
pub trait ScopeStore: Send + Sync + 'static {
    /// Insert a new scope. Fails if `name` is already taken by an active scope.
    async fn create(&self, scope: Scope) -> Result<Scope>;

    /// Fetch a scope by id.
    async fn get(&self, id: &str) -> Option<Scope>;

    /// Fetch a scope by name.
    async fn get_by_name(&self, name: &str) -> Option<Scope>;

    /// List scopes, optionally filtered by category.
    async fn list(&self, category: Option<crate::domain::ScopeCategory>) -> Vec<Scope>;

    /// Replace a scope's stored record. Rename re-checks uniqueness (§4.2).
    async fn update(&self, scope: Scope) -> Result<Scope>;

    /// Delete a scope by id. Callers must have already checked for
    /// references (§3 "deletion is refused if referenced"); this method
    /// itself is an unconditional delete.
    async fn delete(&self, id: &str) -> Result<()>;

    /// All scope names currently cataloged, for `registry()`/expansion checks.
    async fn all_names(&self) -> Vec<String>;
}

/// In-memory scope catalog, keyed by id with a secondary name index.
pub struct InMemoryScopeStore {
    by_id: DashMap<String, Scope>,
    name_to_id: DashMap<String, String>,
}

impl InMemoryScopeStore {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self { by_id: DashMap::new(), name_to_id: DashMap::new() }
    }

    /// Seed the catalog from a bootstrap list, wrapping it for sharing.
    #[must_use]
    pub fn seeded(scopes: Vec<Scope>) -> Arc<Self> {
        let store = Self::new();
        for scope in scopes {
            store.name_to_id.insert(scope.name.clone(), scope.id.clone());
            store.by_id.insert(scope.id.clone(), scope);
        }
        Arc::new(store)
    }
}

impl Default for InMemoryScopeStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ScopeStore for InMemoryScopeStore {
    async fn create(&self, scope: Scope) -> Result<Scope> {
        if self.name_to_id.contains_key(&scope.name) {
            return Err(Error::invalid_request(format!("scope name already exists: {}", scope.name)));
        }
        self.name_to_id.insert(scope.name.clone(), scope.id.clone());
        self.by_id.insert(scope.id.clone(), scope.clone());
        Ok(scope)
    }

    async fn get(&self, id: &str) -> Option<Scope> {
        self.by_id.get(id).map(|s| s.clone())
    }

    async fn get_by_name(&self, name: &str) -> Option<Scope> {
        let id = self.name_to_id.get(name)?.clone();
        self.get(&id).await
    }

    async fn list(&self, category: Option<crate::domain::ScopeCategory>) -> Vec<Scope> {
        self.by_id
            .iter()
            .map(|e| e.value().clone())
            .filter(|s| category.is_none_or(|c| s.category == c))
            .collect()
    }

    async fn update(&self, scope: Scope) -> Result<Scope> {
        let Some(existing) = self.by_id.get(&scope.id).map(|s| s.clone()) else {
            return Err(Error::invalid_request("scope not found"));
        };
        if existing.name != scope.name {
            if self.name_to_id.contains_key(&scope.name) {
                return Err(Error::invalid_request(format!("scope name already exists: {}", scope.name)));
            }
            self.name_to_id.remove(&existing.name);
            self.name_to_id.insert(scope.name.clone(), scope.id.clone());
        }
        self.by_id.insert(scope.id.clone(), scope.clone());
        Ok(scope)
    }

    async fn delete(&self, id: &str) -> Result<()> {
        if let Some((_, scope)) = self.by_id.remove(id) {
            self.name_to_id.remove(&scope.name);
        }
        Ok(())
    }

    async fn all_names(&self) -> Vec<String> {
        self.name_to_id.iter().map(|e| e.key().clone()).collect()
    }
}
