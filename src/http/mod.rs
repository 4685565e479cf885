//! HTTP layer (§A): an axum router exposing the OAuth 2.1 / OIDC-A endpoints
//! plus `/healthz`. Handlers are thin — decode the request, call into
//! [`TokenAuthority`], map the result onto a response via
//! [`errors::to_response`] (the single conversion point errors.rs's own doc
//! comment promises).

pub mod discovery;
pub mod errors;

use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, Form, Query, State};
use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::authority::{
    AuthorizeOutcome, AuthorizeRequest, ChainRole, ClaimedParent, ClientCredentialsRequest, ExchangeCodeRequest,
    RefreshRequest, TokenAuthority,
};
use crate::config::ServerConfig;
use crate::domain::LaunchReason;
use crate::error::Error;
use crate::keys::KeyProvider;
use crate::scope::ScopeEngine;
use discovery::DiscoveryDocument;

/// Shared state every handler closes over.
pub struct AppState {
    pub authority: Arc<TokenAuthority>,
    pub scopes: Arc<ScopeEngine>,
    pub keys: Arc<KeyProvider>,
    pub issuer: String,
}

/// Build the router. `server` drives the CORS policy, body-size limit, and
/// per-request timeout (§A).
#[must_use]
pub fn create_router(state: Arc<AppState>, server: &ServerConfig) -> Router {
    let request_id_header = HeaderName::from_static("x-request-id");

    let cors = if server.permissive_cors { CorsLayer::permissive() } else { CorsLayer::new() };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/.well-known/openid-configuration", get(discovery_document))
        .route("/.well-known/jwks.json", get(jwks))
        .route("/api/oauth/authorize", get(authorize))
        .route("/api/oauth/token", post(token))
        .route("/api/oauth/introspect", post(introspect))
        .route("/api/oauth/revoke", post(revoke))
        .route("/api/oauth/verify", post(verify))
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(cors)
        .layer(TimeoutLayer::new(server.request_timeout))
        .layer(DefaultBodyLimit::max(server.max_body_size))
        .with_state(state)
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn discovery_document(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let scopes_supported = state.scopes.list(None).await.into_iter().map(|s| s.name).collect();
    Json(DiscoveryDocument::build(&state.issuer, scopes_supported))
}

async fn jwks(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.keys.jwks_document().clone())
}

// ── /api/oauth/authorize ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AuthorizeQuery {
    response_type: String,
    client_id: String,
    redirect_uri: String,
    #[serde(default)]
    scope: String,
    #[serde(default)]
    state: Option<String>,
    code_challenge: String,
    code_challenge_method: String,
}

async fn authorize(State(state): State<Arc<AppState>>, Query(q): Query<AuthorizeQuery>) -> Response {
    let request = AuthorizeRequest {
        response_type: q.response_type,
        client_id: q.client_id,
        redirect_uri: q.redirect_uri,
        scope: split_scope(&q.scope),
        state: q.state,
        code_challenge: q.code_challenge,
        code_challenge_method: q.code_challenge_method,
    };

    match state.authority.authorize(request).await {
        Ok(AuthorizeOutcome::Redirect { url }) => Redirect::to(&url).into_response(),
        Ok(AuthorizeOutcome::ConsentRequired { client_id, scope }) => {
            (StatusCode::OK, Json(json!({ "consent_required": true, "client_id": client_id, "scope": scope })))
                .into_response()
        }
        Err(err) => err.into_response(),
    }
}

// ── /api/oauth/token ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TokenRequest {
    grant_type: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    redirect_uri: Option<String>,
    #[serde(default)]
    code_verifier: Option<String>,
    #[serde(default)]
    client_id: Option<String>,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    agent_type: Option<String>,
    #[serde(default)]
    agent_model: Option<String>,
    #[serde(default)]
    agent_provider: Option<String>,
    #[serde(default)]
    agent_instance_id: Option<String>,
    #[serde(default)]
    delegation_grant_id: Option<String>,
    #[serde(default)]
    parent_token: Option<String>,
    #[serde(default)]
    parent_tokens: Option<String>,
    #[serde(default)]
    required_tools: Option<String>,
    #[serde(default)]
    code_challenge: Option<String>,
    #[serde(default)]
    code_challenge_method: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    launch_reason: Option<LaunchReason>,
    #[serde(default)]
    refresh_token: Option<String>,
}

async fn token(State(state): State<Arc<AppState>>, Form(req): Form<TokenRequest>) -> Response {
    match req.grant_type.as_str() {
        "authorization_code" => exchange_code(&state, req).await,
        "client_credentials" => client_credentials(&state, req).await,
        "refresh_token" => refresh(&state, req).await,
        other => {
            Error::unsupported_grant_type(format!("unsupported grant_type: {other}")).into_response()
        }
    }
}

async fn exchange_code(state: &AppState, req: TokenRequest) -> Response {
    let (Some(client_id), Some(code), Some(redirect_uri), Some(code_verifier)) =
        (req.client_id, req.code, req.redirect_uri, req.code_verifier)
    else {
        return Error::invalid_request("client_id, code, redirect_uri, and code_verifier are required")
            .into_response();
    };

    let request = ExchangeCodeRequest {
        client_id,
        code,
        redirect_uri,
        code_verifier,
        delegation_grant_id: req.delegation_grant_id,
        launch_reason: req.launch_reason.unwrap_or(LaunchReason::UserInteractive),
    };

    match state.authority.exchange_code(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn client_credentials(state: &AppState, req: TokenRequest) -> Response {
    let (Some(client_id), Some(client_secret), Some(code_challenge), Some(code_challenge_method)) =
        (req.client_id, req.client_secret, req.code_challenge, req.code_challenge_method)
    else {
        return Error::invalid_request(
            "client_id, client_secret, code_challenge, and code_challenge_method are required",
        )
        .into_response();
    };

    let default_launch_reason =
        if req.delegation_grant_id.is_some() { LaunchReason::AgentDelegated } else { LaunchReason::SystemJob };

    let request = ClientCredentialsRequest {
        client_id,
        client_secret,
        agent_type: req.agent_type,
        agent_model: req.agent_model,
        agent_provider: req.agent_provider,
        agent_instance_id: req.agent_instance_id,
        delegation_grant_id: req.delegation_grant_id,
        parent_token: req.parent_token,
        parent_tokens: split_scope(&req.parent_tokens.unwrap_or_default()),
        required_tools: split_scope(&req.required_tools.unwrap_or_default()),
        scope: split_scope(&req.scope.unwrap_or_default()),
        code_challenge,
        code_challenge_method,
        task_id: req.task_id,
        launch_reason: req.launch_reason.unwrap_or(default_launch_reason),
    };

    match state.authority.client_credentials(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn refresh(state: &AppState, req: TokenRequest) -> Response {
    let (Some(client_id), Some(refresh_token)) = (req.client_id, req.refresh_token) else {
        return Error::invalid_request("client_id and refresh_token are required").into_response();
    };

    let request = RefreshRequest {
        client_id,
        refresh_token,
        scope: req.scope.map(|s| split_scope(&s)),
        code_verifier: req.code_verifier,
        delegation_grant_id: req.delegation_grant_id,
    };

    match state.authority.refresh(request).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(err) => err.into_response(),
    }
}

fn split_scope(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

// ── /api/oauth/introspect ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct IntrospectRequest {
    token: String,
}

async fn introspect(State(state): State<Arc<AppState>>, Form(req): Form<IntrospectRequest>) -> impl IntoResponse {
    let result = state.authority.introspect(&req.token, None).await;
    if !result.active {
        return Json(json!({ "active": false }));
    }
    let mut body = serde_json::to_value(&result.claims).unwrap_or_else(|_| json!({}));
    if let Some(map) = body.as_object_mut() {
        map.insert("active".to_string(), json!(true));
    }
    Json(body)
}

// ── /api/oauth/revoke ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RevokeRequest {
    token: String,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    cascade: bool,
}

async fn revoke(State(state): State<Arc<AppState>>, Form(req): Form<RevokeRequest>) -> Response {
    match state.authority.revoke(&req.token, req.reason, req.cascade).await {
        Ok(revoked) => (StatusCode::OK, Json(json!({ "revoked": revoked }))).into_response(),
        Err(err) => err.into_response(),
    }
}

// ── /api/oauth/verify ────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct VerifyRequest {
    token: String,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    parent_task_id: Option<String>,
    #[serde(default)]
    parent_token: Option<String>,
    #[serde(default)]
    claimed_parents: Option<String>,
}

async fn verify(State(state): State<Arc<AppState>>, Form(req): Form<VerifyRequest>) -> Response {
    let introspection = state.authority.introspect(&req.token, None).await;
    let Some(record) = introspection.token.filter(|_| introspection.active) else {
        return Error::invalid_grant("token failed verification").into_response();
    };

    if let Some(claimed) = req.claimed_parents.filter(|s| !s.trim().is_empty()) {
        let claims: Vec<ClaimedParent> =
            split_scope(&claimed).into_iter().map(|token| ClaimedParent { token, task_id: None }).collect();
        return match state.authority.verify_token_chain(&record, &claims).await {
            Ok(entries) => {
                let chain: Vec<_> = entries
                    .into_iter()
                    .map(|e| json!({ "token_id": e.token_id, "role": matches!(e.role, ChainRole::DirectParent).then_some("direct_parent").unwrap_or("ancestor") }))
                    .collect();
                (StatusCode::OK, Json(json!({ "active": true, "verified": true, "chain": chain }))).into_response()
            }
            Err(err) => err.into_response(),
        };
    }

    let parent_record = match &req.parent_token {
        Some(parent_token) => {
            let parent_introspection = state.authority.introspect(parent_token, None).await;
            match parent_introspection.token.filter(|_| parent_introspection.active) {
                Some(record) => Some(record),
                None => return Error::invalid_grant("parent_token failed verification").into_response(),
            }
        }
        None => None,
    };

    let verified = state
        .authority
        .verify_task_lineage(&record, parent_record.as_ref(), req.task_id.as_deref(), req.parent_task_id.as_deref())
        .await;

    (StatusCode::OK, Json(json!({ "active": true, "verified": verified }))).into_response()
}
