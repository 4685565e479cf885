//! Policy Decision Gateway (C4, §4.4).
//!
//! A thin adapter in front of the policy engine: when an external decision
//! service (e.g. OPA) is configured, decisions are routed there first;
//! otherwise — or on an undefined rule — evaluation falls through to the
//! caller. Timeouts and network failures fail closed (deny); an explicitly
//! undefined rule (no `result` key) fails open (allow), matching §4.4's
//! "explicit fallthrough" contract.

use std::time::Duration;

use serde_json::Value;

use crate::config::DecisionGatewayConfig;

/// The gateway's verdict for one rule query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayDecision {
    /// Proceed — either the remote service said so, the rule was undefined,
    /// or the gateway is disabled.
    Allow,
    /// Deny — either the remote service said so, or it was unreachable.
    Deny,
}

/// Adapter routing policy decisions to an optional external service (C4).
pub struct PolicyDecisionGateway {
    config: DecisionGatewayConfig,
    http: reqwest::Client,
}

impl PolicyDecisionGateway {
    /// Build from configuration. When `config.enabled` is false every query
    /// short-circuits to `Allow` without constructing an HTTP client call.
    #[must_use]
    pub fn new(config: DecisionGatewayConfig) -> Self {
        let http = reqwest::Client::builder().timeout(config.timeout).build().unwrap_or_default();
        Self { config, http }
    }

    fn base_url(&self) -> String {
        format!("http://{}:{}{}", self.config.host, self.config.port, self.config.policy_path)
    }

    /// Query `rule` with `input`. §4.4 contract:
    /// - disabled -> `Allow`
    /// - undefined rule (missing `result`) -> `Allow`
    /// - timeout/network failure -> `Deny`
    /// - `{"result": bool}` -> that bool
    pub async fn query(&self, rule: &str, input: &Value) -> GatewayDecision {
        if !self.config.enabled {
            return GatewayDecision::Allow;
        }

        let url = format!("{}/{rule}", self.base_url());
        let body = serde_json::json!({ "input": input });

        match self.http.post(&url).json(&body).send().await {
            Ok(response) => match response.json::<Value>().await {
                Ok(parsed) => match parsed.get("result") {
                    Some(Value::Bool(true)) => GatewayDecision::Allow,
                    Some(Value::Bool(false)) => GatewayDecision::Deny,
                    Some(_) | None => GatewayDecision::Allow, // undefined rule shape -> fallthrough
                },
                Err(_) => GatewayDecision::Deny,
            },
            Err(_) => GatewayDecision::Deny, // timeout / unreachable -> fail closed
        }
    }

    /// Mirror a scope/policy/tool document to the remote decision store so
    /// the external evaluator sees current state. Best-effort: failures are
    /// logged, never propagated (§4.4 "must not block writes").
    pub async fn put_data(&self, path: &str, document: &Value) {
        if !self.config.enabled {
            return;
        }
        let url = format!("{}/{path}", self.base_url());
        if let Err(e) = self.http.put(&url).json(document).send().await {
            tracing::warn!("decision gateway put_data({path}) failed: {e}");
        }
    }

    /// Mirror a delete to the remote decision store. Best-effort.
    pub async fn delete_data(&self, path: &str) {
        if !self.config.enabled {
            return;
        }
        let url = format!("{}/{path}", self.base_url());
        if let Err(e) = self.http.delete(&url).send().await {
            tracing::warn!("decision gateway delete_data({path}) failed: {e}");
        }
    }

    /// The configured timeout, surfaced so callers can reason about overall
    /// request budgets (§5 "timeout bounded, default 1s").
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.config.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_gateway_always_allows() {
        let gateway = PolicyDecisionGateway::new(DecisionGatewayConfig { enabled: false, ..Default::default() });
        let decision = gateway.query("allow_auth_code", &serde_json::json!({})).await;
        assert_eq!(decision, GatewayDecision::Allow);
    }

    #[tokio::test]
    async fn unreachable_service_fails_closed() {
        // GIVEN: enabled but pointed at a port nothing listens on
        let gateway = PolicyDecisionGateway::new(DecisionGatewayConfig {
            enabled: true,
            host: "127.0.0.1".to_string(),
            port: 1, // reserved, nothing binds here
            policy_path: "/v1/data".to_string(),
            timeout: Duration::from_millis(200),
        });

        // WHEN/THEN: fails closed
        let decision = gateway.query("allow_auth_code", &serde_json::json!({})).await;
        assert_eq!(decision, GatewayDecision::Deny);
    }
}
