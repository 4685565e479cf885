//! End-to-end OAuth flow tests driven through the HTTP router, exercising the
//! same request/response shapes a real client would send.

use std::collections::HashSet;
use std::sync::Arc;

use agent_token_authority::authority::TokenAuthority;
use agent_token_authority::audit::{AuditSink, InMemoryAuditSink};
use agent_token_authority::config::{DecisionGatewayConfig, IssuerConfig, ServerConfig};
use agent_token_authority::decision_gateway::PolicyDecisionGateway;
use agent_token_authority::delegation::DelegationEngine;
use agent_token_authority::domain::AgentClient;
use agent_token_authority::expansion_policy::{ExpansionPolicy, ExpansionPolicyCell};
use agent_token_authority::hashing::sha256_hex;
use agent_token_authority::http::{self, AppState};
use agent_token_authority::keys::KeyProvider;
use agent_token_authority::policy::PolicyEngine;
use agent_token_authority::scope::ScopeEngine;
use agent_token_authority::store::{
    AgentStore, CodeStore, InMemoryAgentStore, InMemoryCodeStore, InMemoryDelegationStore, InMemoryPolicyStore,
    InMemoryScopeStore, InMemoryTokenStore, TokenStore,
};
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use pretty_assertions::assert_eq;
use serde_json::Value;
use tower::ServiceExt as _;

const TEST_PRIVATE_KEY: &[u8] = include_bytes!("fixtures/test_rsa_private.pem");
const TEST_PUBLIC_KEY: &[u8] = include_bytes!("fixtures/test_rsa_public.pem");

async fn build_router() -> (Router, Arc<InMemoryAgentStore>) {
    let agents = Arc::new(InMemoryAgentStore::new());
    agents
        .put(AgentClient {
            client_id: "client-1".to_string(),
            client_secret_hash: sha256_hex("secret"),
            is_active: true,
            tool_names: vec!["search".to_string()],
            agent_type: Some("worker".to_string()),
            agent_model: None,
            agent_provider: None,
            trust_level: None,
            redirect_uris: vec!["https://agent.example/callback".to_string()],
        })
        .await;

    let scope_store = Arc::new(InMemoryScopeStore::new());
    let scopes = Arc::new(ScopeEngine::new(scope_store, vec![]));
    let policy_store = Arc::new(InMemoryPolicyStore::new());
    let expansion = ExpansionPolicyCell::new(ExpansionPolicy::default());
    let policy = Arc::new(PolicyEngine::new(policy_store, expansion));
    let gateway = Arc::new(PolicyDecisionGateway::new(DecisionGatewayConfig { enabled: false, ..Default::default() }));
    let codes: Arc<dyn CodeStore> = Arc::new(InMemoryCodeStore::new());
    let audit: Arc<dyn AuditSink> = Arc::new(InMemoryAuditSink::default());
    let delegations = Arc::new(DelegationEngine::new(Arc::new(InMemoryDelegationStore::new()), audit.clone()));
    let tokens: Arc<dyn TokenStore> = Arc::new(InMemoryTokenStore::new());
    let keys = Arc::new(KeyProvider::from_keys("test-kid", TEST_PRIVATE_KEY, TEST_PUBLIC_KEY).unwrap());
    let issuer = IssuerConfig { issuer: "https://authority.test.invalid".to_string(), ..IssuerConfig::default() };

    let authority = Arc::new(TokenAuthority::new(
        scopes.clone(),
        policy,
        gateway,
        codes,
        tokens,
        delegations,
        agents.clone() as Arc<dyn AgentStore>,
        audit,
        keys.clone(),
        issuer.clone(),
        HashSet::new(),
    ));

    let state = Arc::new(AppState { authority, scopes, keys, issuer: issuer.issuer.clone() });
    (http::create_router(state, &ServerConfig::default()), agents)
}

#[tokio::test]
async fn healthz_reports_ok() {
    let (router, _agents) = build_router().await;

    let response =
        router.oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap()).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn discovery_document_lists_grant_types() {
    let (router, _agents) = build_router().await;

    let response = router
        .oneshot(Request::builder().uri("/.well-known/openid-configuration").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let doc: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(doc["issuer"], "https://authority.test.invalid");
    assert!(doc["grant_types_supported"].as_array().unwrap().iter().any(|v| v == "client_credentials"));
}

#[tokio::test]
async fn jwks_document_is_served() {
    let (router, _agents) = build_router().await;

    let response =
        router.oneshot(Request::builder().uri("/.well-known/jwks.json").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn client_credentials_then_introspect_then_revoke() {
    let (router, _agents) = build_router().await;

    let challenge = agent_token_authority::hashing::pkce_s256_challenge("verifier-value-long-enough-for-pkce");
    let form = format!(
        "grant_type=client_credentials&client_id=client-1&client_secret=secret&scope=read:web&\
         code_challenge={challenge}&code_challenge_method=S256"
    );

    let token_response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/oauth/token")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::from(form))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(token_response.status(), StatusCode::OK);

    let body = axum::body::to_bytes(token_response.into_body(), usize::MAX).await.unwrap();
    let token: Value = serde_json::from_slice(&body).unwrap();
    let access_token = token["access_token"].as_str().unwrap().to_string();
    assert_eq!(token["token_type"], "Bearer");

    // introspect: active
    let introspect_form = format!("token={access_token}");
    let introspect_response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/oauth/introspect")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::from(introspect_form.clone()))
                .unwrap(),
        )
        .await
        .unwrap();
    let body = axum::body::to_bytes(introspect_response.into_body(), usize::MAX).await.unwrap();
    let introspected: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(introspected["active"], true);

    // revoke, then introspect again: inactive
    let revoke_form = format!("token={access_token}");
    let revoke_response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/oauth/revoke")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::from(revoke_form))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(revoke_response.status(), StatusCode::OK);

    let introspect_after_revoke = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/oauth/introspect")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::from(introspect_form))
                .unwrap(),
        )
        .await
        .unwrap();
    let body = axum::body::to_bytes(introspect_after_revoke.into_body(), usize::MAX).await.unwrap();
    let introspected: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(introspected["active"], false);
}

#[tokio::test]
async fn token_endpoint_rejects_unknown_grant_type() {
    let (router, _agents) = build_router().await;

    let response = router
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/oauth/token")
                .header("content-type", "application/x-www-form-urlencoded")
                .body(Body::from("grant_type=not_a_real_grant"))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
