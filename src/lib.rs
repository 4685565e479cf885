//! Agent Token Authority
//!
//! An OAuth 2.1 / OIDC-A authorization server purpose-built for autonomous
//! agent delegation chains: a parent task mints a narrower-scoped token for
//! a child task, that child may mint a narrower one still, and the whole
//! lineage stays verifiable and revocable as one unit.
//!
//! # Components
//!
//! - **Condition evaluator** (`condition`): attribute-based policy predicates.
//! - **Scope engine** (`scope`): scope catalog plus transitive expansion.
//! - **Policy engine** (`policy`): deny-overrides evaluation over scope/consent policies.
//! - **Decision gateway** (`decision_gateway`): optional external policy service adapter.
//! - **Delegation engine** (`delegation`): time- and depth-bounded delegation grants.
//! - **Token authority** (`authority`): issuance, exchange, refresh, introspection, revocation.
//! - **HTTP surface** (`http`): the OAuth endpoints and discovery documents.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod authority;
pub mod cli;
pub mod condition;
pub mod config;
pub mod decision_gateway;
pub mod delegation;
pub mod domain;
pub mod error;
pub mod expansion_policy;
pub mod hashing;
pub mod http;
pub mod keys;
pub mod policy;
pub mod scope;
pub mod store;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
