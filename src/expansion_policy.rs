//! Scope-expansion policy document and its hot-reload watcher (§4.3, §9).
//!
//! The document is read-mostly (§5 "Resource policy"): requests read an
//! `Arc<ExpansionPolicy>` snapshot captured once at request entry, and the
//! watcher swaps the pointer behind a lock when the file on disk changes —
//! no in-flight request ever observes a half-written document.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// One `from_scope -> to_scope` expansion rule.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScopeExpansionRule {
    /// The scope name the parent must already hold.
    pub from_scope: String,
    /// The scope name the child is then permitted beyond its parent's scope.
    pub to_scope: String,
}

/// One `required_scope -> allowed_expansion` pattern (global section, §4.3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExpansionPattern {
    /// The scope name the parent must already hold.
    pub required_scope: String,
    /// The scope name permitted as an exception.
    pub allowed_expansion: String,
}

/// A client-specific expansion allowance.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientExpansionSection {
    /// When true, any expansion is allowed for this client (bypasses the
    /// allowed_expansions list entirely).
    #[serde(default)]
    pub allow_all_expansions: bool,
    /// Explicit allow-list of expansions scoped to this client.
    #[serde(default)]
    pub allowed_expansions: Vec<ScopeExpansionRule>,
}

/// The global expansion section (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GlobalExpansionSection {
    /// `{required_scope, allowed_expansion}` patterns.
    #[serde(default)]
    pub allowed_patterns: Vec<ExpansionPattern>,
    /// `{from_scope, to_scope}` rules.
    #[serde(default)]
    pub allowed_expansions: Vec<ScopeExpansionRule>,
}

/// The full expansion-policy document (§4.3).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExpansionPolicy {
    /// Per-client sections, keyed by `client_id`.
    #[serde(default)]
    pub clients: std::collections::HashMap<String, ClientExpansionSection>,
    /// The global section, consulted for every client.
    #[serde(default)]
    pub global: GlobalExpansionSection,
}

impl ExpansionPolicy {
    /// Load from a YAML file. Missing file or parse failure is the caller's
    /// concern; this just deserializes.
    ///
    /// # Errors
    /// Propagates `std::io::Error` / YAML parse errors.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
    }

    /// Whether `exceeded` (the scopes a child requested beyond its parent's
    /// scope) are all covered by an expansion rule the parent qualifies for
    /// (§4.3 `is_scope_expansion_allowed`). Default deny; the empty set is
    /// trivially allowed (§8 property).
    #[must_use]
    pub fn is_expansion_allowed(
        &self,
        exceeded: &[String],
        parent_scopes: &[String],
        client_id: Option<&str>,
    ) -> bool {
        if exceeded.is_empty() {
            return true;
        }

        exceeded.iter().all(|to_scope| self.single_expansion_allowed(to_scope, parent_scopes, client_id))
    }

    fn single_expansion_allowed(&self, to_scope: &str, parent_scopes: &[String], client_id: Option<&str>) -> bool {
        if let Some(client_id) = client_id {
            if let Some(section) = self.clients.get(client_id) {
                if section.allow_all_expansions {
                    return true;
                }
                if section.allowed_expansions.iter().any(|rule| {
                    rule.to_scope == to_scope && parent_scopes.iter().any(|s| s == &rule.from_scope)
                }) {
                    return true;
                }
            }
        }

        let pattern_match = self.global.allowed_patterns.iter().any(|pattern| {
            pattern.allowed_expansion == to_scope && parent_scopes.iter().any(|s| s == &pattern.required_scope)
        });
        if pattern_match {
            return true;
        }

        self.global
            .allowed_expansions
            .iter()
            .any(|rule| rule.to_scope == to_scope && parent_scopes.iter().any(|s| s == &rule.from_scope))
    }
}

/// A hot-reloadable, pointer-swapped handle to the live expansion policy.
#[derive(Clone)]
pub struct ExpansionPolicyCell {
    inner: Arc<RwLock<Arc<ExpansionPolicy>>>,
}

impl ExpansionPolicyCell {
    /// Start from a policy loaded once at boot (or the conservative default
    /// if no path was configured).
    #[must_use]
    pub fn new(initial: ExpansionPolicy) -> Self {
        Self { inner: Arc::new(RwLock::new(Arc::new(initial))) }
    }

    /// Take an immutable snapshot for the duration of one request (§9
    /// "in-flight requests keep their snapshot").
    #[must_use]
    pub fn snapshot(&self) -> Arc<ExpansionPolicy> {
        self.inner.read().clone()
    }

    /// Swap in a freshly-loaded document. Called by the file watcher.
    pub fn swap(&self, updated: ExpansionPolicy) {
        *self.inner.write() = Arc::new(updated);
    }
}

/// Watch `path` for changes and swap `cell`'s snapshot on every write event.
/// Best-effort: a watch-setup failure or a transient parse failure while
/// reloading is logged and does not crash the process (§5 "updates take
/// effect on the next request without restart").
pub fn spawn_watcher(path: PathBuf, cell: ExpansionPolicyCell) {
    use notify::{RecursiveMode, Watcher};

    std::thread::spawn(move || {
        let (tx, rx) = std::sync::mpsc::channel();
        let mut watcher = match notify::recommended_watcher(tx) {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!("expansion policy watcher setup failed: {e}");
                return;
            }
        };
        if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            tracing::warn!("expansion policy watch failed for {}: {e}", path.display());
            return;
        }

        for event in rx {
            let Ok(event) = event else { continue };
            if !matches!(event.kind, notify::EventKind::Modify(_) | notify::EventKind::Create(_)) {
                continue;
            }
            match ExpansionPolicy::load(&path) {
                Ok(policy) => {
                    tracing::info!("reloaded scope expansion policy from {}", path.display());
                    cell.swap(policy);
                }
                Err(e) => tracing::warn!("failed to reload expansion policy: {e}"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_exceeded_set_is_trivially_allowed() {
        let policy = ExpansionPolicy::default();
        assert!(policy.is_expansion_allowed(&[], &["read:web".to_string()], None));
    }

    #[test]
    fn uncovered_scope_is_denied_by_default() {
        let policy = ExpansionPolicy::default();
        assert!(!policy.is_expansion_allowed(&["write:web".to_string()], &["read:web".to_string()], None));
    }

    #[test]
    fn global_pattern_allows_matching_expansion() {
        // GIVEN: §8 scenario 3's expansion policy
        let mut policy = ExpansionPolicy::default();
        policy.global.allowed_patterns.push(ExpansionPattern {
            required_scope: "read:web".to_string(),
            allowed_expansion: "write:web".to_string(),
        });

        // WHEN/THEN: the parent's read:web covers a write:web request
        assert!(policy.is_expansion_allowed(&["write:web".to_string()], &["read:web".to_string()], None));
    }

    #[test]
    fn client_specific_allow_all_bypasses_lists() {
        let mut policy = ExpansionPolicy::default();
        policy.clients.insert(
            "special-client".to_string(),
            ClientExpansionSection { allow_all_expansions: true, allowed_expansions: vec![] },
        );

        assert!(policy.is_expansion_allowed(
            &["admin:anything".to_string()],
            &[],
            Some("special-client")
        ));
    }

    #[test]
    fn client_section_does_not_leak_to_other_clients() {
        let mut policy = ExpansionPolicy::default();
        policy.clients.insert(
            "special-client".to_string(),
            ClientExpansionSection { allow_all_expansions: true, allowed_expansions: vec![] },
        );

        assert!(!policy.is_expansion_allowed(
            &["admin:anything".to_string()],
            &[],
            Some("other-client")
        ));
    }
}
