//! Issued-token persistence and lineage (C6, §4.6).
//!
//! Cascade revocation and ancestor walks both traverse the parent/child graph
//! that `parent_token_id` encodes. Per §9 ("self-referential token lineage"),
//! tokens are stored in a flat table keyed by opaque id — parent/child links
//! are ids, not owning references — so the walks below carry an explicit
//! visited set and are safe even if a test harness (or a storage bug)
//! introduces a cycle.

use std::collections::HashSet;

use chrono::Utc;
use dashmap::DashMap;

use crate::domain::IssuedToken;

/// Persistence for issued tokens and their lineage (C6).
#[async_trait::async_trait]
pub trait TokenStore: Send + Sync + 'static {
    /// Persist a newly-minted token record.
    async fn persist(&self, token: IssuedToken);

    /// Fetch a token by its `token_id`/`jti`.
    async fn get_by_id(&self, token_id: &str) -> Option<IssuedToken>;

    /// Find a token by its refresh-token hash, scoped to `client_id` (§4.8.4).
    async fn find_by_refresh_hash(&self, client_id: &str, refresh_hash: &str) -> Option<IssuedToken>;

    /// Replace a token's stored record (used for revoke).
    async fn update(&self, token: IssuedToken);

    /// Atomically rotate the refresh token backing `token_id`: installs
    /// `updated` only if the record's current `refresh_token_hash` still
    /// equals `old_refresh_hash`. Returns `false` if a concurrent refresh
    /// already rotated it out from under the caller, who should then fail
    /// with `invalid_grant` (§5 refresh-rotation atomicity, §8 "exactly one
    /// winner").
    async fn rotate_refresh(&self, token_id: &str, old_refresh_hash: &str, updated: IssuedToken) -> bool;

    /// Direct children of `token_id` (tokens whose `parent_token_id` matches).
    async fn children(&self, token_id: &str) -> Vec<IssuedToken>;

    /// Revoke `token_id`, optionally cascading to every transitive
    /// descendant (§4.6, §8 property 4). Returns the ids actually
    /// transitioned (idempotent: already-revoked nodes are skipped and not
    /// re-counted, and the walk is cycle-safe via a visited set).
    async fn revoke(&self, token_id: &str, reason: Option<String>, cascade: bool) -> Vec<String>;

    /// The ancestor chain `[t, parent(t), parent(parent(t)), …]`, stopping at
    /// the first missing link or at `max_depth` entries. Cycle-safe.
    async fn ancestors(&self, token_id: &str, max_depth: Option<usize>) -> Vec<IssuedToken>;
}

/// In-memory token store keyed by `token_id`, with a refresh-hash index.
pub struct InMemoryTokenStore {
    by_id: DashMap<String, IssuedToken>,
    by_refresh_hash: DashMap<String, String>,
}

impl InMemoryTokenStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self { by_id: DashMap::new(), by_refresh_hash: DashMap::new() }
    }

    fn reindex_refresh(&self, token: &IssuedToken) {
        if let Some(hash) = &token.refresh_token_hash {
            self.by_refresh_hash.insert(hash.clone(), token.token_id.clone());
        }
    }
}

impl Default for InMemoryTokenStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn persist(&self, token: IssuedToken) {
        self.reindex_refresh(&token);
        self.by_id.insert(token.token_id.clone(), token);
    }

    async fn get_by_id(&self, token_id: &str) -> Option<IssuedToken> {
        self.by_id.get(token_id).map(|t| t.clone())
    }

    async fn find_by_refresh_hash(&self, client_id: &str, refresh_hash: &str) -> Option<IssuedToken> {
        let token_id = self.by_refresh_hash.get(refresh_hash)?.clone();
        let token = self.get_by_id(&token_id).await?;
        if token.client_id == client_id { Some(token) } else { None }
    }

    async fn update(&self, token: IssuedToken) {
        self.reindex_refresh(&token);
        self.by_id.insert(token.token_id.clone(), token);
    }

    async fn rotate_refresh(&self, token_id: &str, old_refresh_hash: &str, updated: IssuedToken) -> bool {
        // Single entry lock covers locate + verify + flip, the same shape
        // as CodeStore::consume's compare-and-swap over one DashMap entry.
        let Some(mut entry) = self.by_id.get_mut(token_id) else { return false };
        if entry.refresh_token_hash.as_deref() != Some(old_refresh_hash) {
            return false;
        }
        *entry = updated.clone();
        drop(entry);
        self.by_refresh_hash.remove(old_refresh_hash);
        self.reindex_refresh(&updated);
        true
    }

    async fn children(&self, token_id: &str) -> Vec<IssuedToken> {
        self.by_id
            .iter()
            .map(|e| e.value().clone())
            .filter(|t| t.parent_token_id.as_deref() == Some(token_id))
            .collect()
    }

    async fn revoke(&self, token_id: &str, reason: Option<String>, cascade: bool) -> Vec<String> {
        let mut visited = HashSet::new();
        let mut transitioned = Vec::new();
        let mut stack = vec![(token_id.to_string(), reason)];

        while let Some((id, this_reason)) = stack.pop() {
            if !visited.insert(id.clone()) {
                continue; // cycle guard (§4.6, §8 property "cycle safety")
            }

            let Some(mut entry) = self.by_id.get_mut(&id) else { continue };
            if !entry.is_revoked {
                entry.is_revoked = true;
                entry.revoked_at = Some(Utc::now());
                entry.revocation_reason = this_reason;
                transitioned.push(id.clone());
            }
            drop(entry);

            if cascade {
                let child_reason = format!("parent token revoked: {id}");
                for child in self.children(&id).await {
                    if !visited.contains(&child.token_id) {
                        stack.push((child.token_id, Some(child_reason.clone())));
                    }
                }
            }
        }

        transitioned
    }

    async fn ancestors(&self, token_id: &str, max_depth: Option<usize>) -> Vec<IssuedToken> {
        let mut chain = Vec::new();
        let mut visited = HashSet::new();
        let mut current = self.get_by_id(token_id).await;
        let limit = max_depth.unwrap_or(usize::MAX);

        while let Some(token) = current {
            if chain.len() >= limit || !visited.insert(token.token_id.clone()) {
                break;
            }
            let parent_id = token.parent_token_id.clone();
            chain.push(token);
            current = match parent_id {
                Some(id) => self.get_by_id(&id).await,
                None => None,
            };
        }

        chain
    }
}
