//! Storage traits (§6 "Storage layer: CRUD on the entities in §3").
//!
//! No ORM: every entity is owned behind a trait object, and this crate ships
//! one in-memory reference implementation per trait. A relational-backed
//! implementation is a drop-in behind the same trait; nothing above this
//! layer knows or cares which one is wired in.

pub mod agent_store;
pub mod code_store;
pub mod delegation_store;
pub mod policy_store;
pub mod scope_store;
pub mod token_store;

pub use agent_store::{AgentStore, InMemoryAgentStore};
pub use code_store::{CodeStore, InMemoryCodeStore};
pub use delegation_store::{DelegationStore, InMemoryDelegationStore};
pub use policy_store::{InMemoryPolicyStore, PolicyStore};
pub use scope_store::{InMemoryScopeStore, ScopeStore};
pub use token_store::{InMemoryTokenStore, TokenStore};
