//! Agent Token Authority - OAuth 2.1 / OIDC-A authorization server

use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use agent_token_authority::authority::TokenAuthority;
use agent_token_authority::cli::Cli;
use agent_token_authority::config::Config;
use agent_token_authority::decision_gateway::PolicyDecisionGateway;
use agent_token_authority::delegation::DelegationEngine;
use agent_token_authority::domain::{AgentClient, Policy, Scope, ScopeCategory};
use agent_token_authority::expansion_policy::{ExpansionPolicy, ExpansionPolicyCell};
use agent_token_authority::http::{self, AppState};
use agent_token_authority::keys::KeyProvider;
use agent_token_authority::policy::PolicyEngine;
use agent_token_authority::scope::ScopeEngine;
use agent_token_authority::store::{
    AgentStore, InMemoryAgentStore, InMemoryCodeStore, InMemoryDelegationStore, InMemoryPolicyStore,
    InMemoryScopeStore, InMemoryTokenStore, PolicyStore, ScopeStore,
};
use agent_token_authority::{audit, setup_tracing};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            if let Some(port) = cli.port {
                config.server.port = port;
            }
            if let Some(ref host) = cli.host {
                config.server.host = host.clone();
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        host = %config.server.host,
        port = config.server.port,
        issuer = %config.issuer.issuer,
        "Starting Agent Token Authority"
    );

    let keys = match KeyProvider::load(&config.keys) {
        Ok(keys) => Arc::new(keys),
        Err(e) => {
            error!("Failed to load signing keys: {e}");
            return ExitCode::FAILURE;
        }
    };

    let scope_store = Arc::new(InMemoryScopeStore::new());
    let policy_store = Arc::new(InMemoryPolicyStore::new());
    let code_store: Arc<InMemoryCodeStore> = Arc::new(InMemoryCodeStore::new());
    let token_store = Arc::new(InMemoryTokenStore::new());
    let delegation_store = Arc::new(InMemoryDelegationStore::new());
    let agent_store = Arc::new(InMemoryAgentStore::new());
    let audit_sink = Arc::new(audit::InMemoryAuditSink::default());

    if let Err(e) = seed_bootstrap_catalog(&config, &scope_store, &policy_store, &agent_store).await {
        error!("Failed to seed bootstrap catalog: {e}");
        return ExitCode::FAILURE;
    }

    let scopes = Arc::new(ScopeEngine::new(scope_store, config.bootstrap.implied_expansions.clone()));

    let expansion_policy = match &config.scope_expansion.path {
        Some(path) => match ExpansionPolicy::load(std::path::Path::new(path)) {
            Ok(policy) => policy,
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to load scope expansion policy; starting with an empty one");
                ExpansionPolicy::default()
            }
        },
        None => ExpansionPolicy::default(),
    };
    let expansion_cell = ExpansionPolicyCell::new(expansion_policy);
    if let Some(path) = &config.scope_expansion.path {
        agent_token_authority::expansion_policy::spawn_watcher(std::path::PathBuf::from(path), expansion_cell.clone());
    }

    let policy = Arc::new(PolicyEngine::new(policy_store, expansion_cell));
    let gateway = Arc::new(PolicyDecisionGateway::new(config.decision_gateway.clone()));
    let delegations = Arc::new(DelegationEngine::new(delegation_store, audit_sink.clone()));
    let system_client_ids: HashSet<String> = config.system_clients.system_client_ids.iter().cloned().collect();

    let authority = Arc::new(TokenAuthority::new(
        scopes.clone(),
        policy,
        gateway,
        code_store,
        token_store,
        delegations,
        agent_store,
        audit_sink,
        keys.clone(),
        config.issuer.clone(),
        system_client_ids,
    ));

    let state = Arc::new(AppState { authority, scopes, keys, issuer: config.issuer.issuer.clone() });
    let app = http::create_router(state, &config.server);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(addr = %addr, "Failed to bind listener: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(addr = %addr, "Listening");

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await {
        error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Agent Token Authority shutdown complete");
    ExitCode::SUCCESS
}

async fn seed_bootstrap_catalog(
    config: &Config,
    scope_store: &Arc<InMemoryScopeStore>,
    policy_store: &Arc<InMemoryPolicyStore>,
    agent_store: &Arc<InMemoryAgentStore>,
) -> Result<(), agent_token_authority::Error> {
    for bootstrap_scope in &config.bootstrap.scopes {
        let category: ScopeCategory = serde_json::from_value(json!(bootstrap_scope.category))
            .map_err(|e| agent_token_authority::Error::config(format!("invalid scope category: {e}")))?;
        scope_store
            .create(Scope {
                id: uuid::Uuid::new_v4().to_string(),
                name: bootstrap_scope.name.clone(),
                description: bootstrap_scope.description.clone(),
                category,
                is_sensitive: bootstrap_scope.is_sensitive,
                requires_approval: bootstrap_scope.requires_approval,
                is_default: bootstrap_scope.is_default,
                is_active: true,
            })
            .await?;
    }

    for raw_policy in &config.bootstrap.policies {
        let mut raw_policy = raw_policy.clone();
        if let Some(object) = raw_policy.as_object_mut() {
            object.entry("id".to_string()).or_insert_with(|| json!(uuid::Uuid::new_v4().to_string()));
        }
        let policy: Policy = serde_json::from_value(raw_policy)
            .map_err(|e| agent_token_authority::Error::config(format!("invalid bootstrap policy: {e}")))?;
        policy_store.create(policy).await?;
    }

    for bootstrap_agent in &config.bootstrap.agents {
        agent_store
            .put(AgentClient {
                client_id: bootstrap_agent.client_id.clone(),
                client_secret_hash: bootstrap_agent.client_secret_hash.clone(),
                is_active: true,
                tool_names: bootstrap_agent.tool_names.clone(),
                agent_type: bootstrap_agent.agent_type.clone(),
                agent_model: bootstrap_agent.agent_model.clone(),
                agent_provider: bootstrap_agent.agent_provider.clone(),
                trust_level: bootstrap_agent.trust_level.clone(),
                redirect_uris: bootstrap_agent.redirect_uris.clone(),
            })
            .await;
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
