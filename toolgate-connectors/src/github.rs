//! GitHub trigger connector.
//!
//! Repository webhooks via the REST API. GitHub signs deliveries with the
//! secret supplied at registration (the trigger's verification token) and
//! presents it as `X-Hub-Signature-256: sha256=<hex>`.

use crate::verify::{hmac_sha256_hex, verify_hex_signature};
use crate::{
    ConnectorAuth, ParsedEvent, RegistrationResult, TriggerConnector, VerificationResult,
    WebhookRequest, admin_client,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use toolgate_core::types::Trigger;
use tracing::{info, warn};

const API_BASE: &str = "https://api.github.com";

pub struct GitHubConnector {
    client: reqwest::Client,
}

impl Default for GitHubConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl GitHubConnector {
    pub fn new() -> Self {
        Self {
            client: admin_client(),
        }
    }

    /// "owner/repo" from the trigger config.
    fn repository(trigger: &Trigger) -> Option<String> {
        trigger
            .config
            .get("repository")
            .and_then(Value::as_str)
            .map(String::from)
    }
}

#[async_trait]
impl TriggerConnector for GitHubConnector {
    fn provider(&self) -> &'static str {
        "github"
    }

    async fn register(&self, trigger: &Trigger, auth: &ConnectorAuth) -> RegistrationResult {
        let Some(repository) = Self::repository(trigger) else {
            return RegistrationResult::failed("trigger config is missing 'repository'");
        };

        let body = json!({
            "name": "web",
            "active": true,
            "events": [trigger.trigger_type],
            "config": {
                "url": trigger.webhook_url,
                "content_type": "json",
                "secret": trigger.verification_token,
            }
        });
        let response = self
            .client
            .post(format!("{API_BASE}/repos/{repository}/hooks"))
            .bearer_auth(auth.token())
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "toolgate")
            .json(&body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                let payload: Value = response.json().await.unwrap_or_default();
                match payload.get("id").and_then(Value::as_i64) {
                    Some(id) => {
                        info!(trigger_id = %trigger.id, hook_id = id, "registered GitHub webhook");
                        RegistrationResult::ok(id.to_string())
                    }
                    None => RegistrationResult::failed("GitHub response carried no hook id"),
                }
            }
            Ok(response) => {
                let status = response.status();
                let detail = response.text().await.unwrap_or_default();
                warn!(trigger_id = %trigger.id, %status, "GitHub webhook registration failed");
                RegistrationResult::failed(format!("GitHub returned {status}: {detail}"))
            }
            Err(e) => RegistrationResult::failed(e.to_string()),
        }
    }

    async fn unregister(&self, trigger: &Trigger, auth: &ConnectorAuth) -> bool {
        let (Some(repository), Some(hook_id)) =
            (Self::repository(trigger), trigger.external_webhook_id.as_ref())
        else {
            return true;
        };
        match self
            .client
            .delete(format!("{API_BASE}/repos/{repository}/hooks/{hook_id}"))
            .bearer_auth(auth.token())
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "toolgate")
            .send()
            .await
        {
            // 404 counts as unregistered.
            Ok(response) => response.status().is_success() || response.status().as_u16() == 404,
            Err(e) => {
                warn!(trigger_id = %trigger.id, error = %e, "GitHub webhook deletion failed");
                false
            }
        }
    }

    async fn verify(
        &self,
        request: &WebhookRequest,
        trigger: &Trigger,
        _auth: &ConnectorAuth,
    ) -> VerificationResult {
        let Some(signature) = request.header("X-Hub-Signature-256") else {
            return VerificationResult::invalid("missing X-Hub-Signature-256 header");
        };
        let Some(presented) = signature.strip_prefix("sha256=") else {
            return VerificationResult::invalid("malformed signature header");
        };
        let expected = hmac_sha256_hex(trigger.verification_token.as_bytes(), &request.body);
        if verify_hex_signature(&expected, presented) {
            VerificationResult::valid()
        } else {
            VerificationResult::invalid("signature mismatch")
        }
    }

    fn parse(&self, request: &WebhookRequest) -> ParsedEvent {
        let payload = request.json().unwrap_or(Value::Null);
        let event_type = request.header("X-GitHub-Event").unwrap_or("unknown");
        let delivery_id = request.header("X-GitHub-Delivery").map(String::from);
        let timestamp = payload
            .pointer("/head_commit/timestamp")
            .and_then(Value::as_str)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));
        ParsedEvent {
            event_type: event_type.to_string(),
            event_data: payload,
            external_event_id: delivery_id,
            timestamp,
        }
    }
}
