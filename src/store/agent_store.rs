//! Agent client storage (ambient addition, SPEC_FULL §3 "Agent client").

use dashmap::DashMap;

use crate::domain::AgentClient;

/// Persistence for registered agent clients.
#[async_trait::async_trait]
pub trait AgentStore: Send + Sync + 'static {
    /// Fetch a client by id.
    async fn get(&self, client_id: &str) -> Option<AgentClient>;

    /// Insert or replace a client record (bootstrap and admin CRUD share this).
    async fn put(&self, client: AgentClient);

    /// Remove a client.
    async fn delete(&self, client_id: &str);

    /// List every registered client (admin surface).
    async fn list(&self) -> Vec<AgentClient>;
}

/// In-memory agent client registry.
pub struct InMemoryAgentStore {
    by_id: DashMap<String, AgentClient>,
}

impl InMemoryAgentStore {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self { by_id: DashMap::new() }
    }

    /// Seed from a bootstrap list.
    #[must_use]
    pub fn seeded(clients: Vec<AgentClient>) -> Self {
        let store = Self::new();
        for client in clients {
            store.by_id.insert(client.client_id.clone(), client);
        }
        store
    }
}

impl Default for InMemoryAgentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AgentStore for InMemoryAgentStore {
    async fn get(&self, client_id: &str) -> Option<AgentClient> {
        self.by_id.get(client_id).map(|c| c.clone())
    }

    async fn put(&self, client: AgentClient) {
        self.by_id.insert(client.client_id.clone(), client);
    }

    async fn delete(&self, client_id: &str) {
        self.by_id.remove(client_id);
    }

    async fn list(&self) -> Vec<AgentClient> {
        self.by_id.iter().map(|e| e.value().clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(id: &str) -> AgentClient {
        AgentClient {
            client_id: id.to_string(),
            client_secret_hash: "hash".to_string(),
            is_active: true,
            tool_names: vec![],
            agent_type: None,
            agent_model: None,
            agent_provider: None,
            trust_level: None,
            redirect_uris: vec![],
        }
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let store = InMemoryAgentStore::new();
        store.put(client("agent-1")).await;
        assert!(store.get("agent-1").await.is_some());
    }

    #[tokio::test]
    async fn delete_removes_client() {
        let store = InMemoryAgentStore::new();
        store.put(client("agent-1")).await;
        store.delete("agent-1").await;
        assert!(store.get("agent-1").await.is_none());
    }
}
