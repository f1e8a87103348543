//! Shopify trigger connector.
//!
//! Webhook subscriptions go through the GraphQL Admin API
//! (`webhookSubscriptionCreate` / `webhookSubscriptionDelete`). Shopify
//! signs deliveries with the app's client secret and presents the digest
//! base64-encoded in `X-Shopify-Hmac-SHA256`. Deliveries may be retried up
//! to 8 times over 4 hours; `X-Shopify-Event-Id` dedupes them.

use crate::verify::{hmac_sha256_base64, verify_base64_signature};
use crate::{
    ConnectorAuth, ParsedEvent, RegistrationResult, TriggerConnector, VerificationResult,
    WebhookRequest, admin_client,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use toolgate_core::types::Trigger;
use tracing::{info, warn};

const API_VERSION: &str = "2024-07";

const CREATE_MUTATION: &str = r#"
mutation webhookSubscriptionCreate($topic: WebhookSubscriptionTopic!, $webhookSubscription: WebhookSubscriptionInput!) {
  webhookSubscriptionCreate(topic: $topic, webhookSubscription: $webhookSubscription) {
    webhookSubscription { id topic }
    userErrors { field message }
  }
}
"#;

const DELETE_MUTATION: &str = r#"
mutation webhookSubscriptionDelete($id: ID!) {
  webhookSubscriptionDelete(id: $id) {
    deletedWebhookSubscriptionId
    userErrors { field message }
  }
}
"#;

pub struct ShopifyConnector {
    client: reqwest::Client,
}

impl Default for ShopifyConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl ShopifyConnector {
    pub fn new() -> Self {
        Self {
            client: admin_client(),
        }
    }

    fn shop_domain(auth: &ConnectorAuth) -> Option<&str> {
        auth.metadata
            .get("shop_domain")
            .or_else(|| auth.metadata.get("shop"))
            .map(String::as_str)
    }

    fn graphql_endpoint(shop_domain: &str) -> String {
        format!("https://{shop_domain}/admin/api/{API_VERSION}/graphql.json")
    }

    /// "orders/create" -> "ORDERS_CREATE".
    fn topic(trigger_type: &str) -> String {
        trigger_type.replace('/', "_").to_uppercase()
    }

    async fn graphql(
        &self,
        auth: &ConnectorAuth,
        query: &str,
        variables: Value,
    ) -> Result<Value, String> {
        let shop_domain = Self::shop_domain(auth).ok_or("missing shop domain")?;
        let response = self
            .client
            .post(Self::graphql_endpoint(shop_domain))
            .header("X-Shopify-Access-Token", auth.token())
            .json(&json!({"query": query, "variables": variables}))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("Shopify returned {status}"));
        }
        response.json().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl TriggerConnector for ShopifyConnector {
    fn provider(&self) -> &'static str {
        "shopify"
    }

    async fn register(&self, trigger: &Trigger, auth: &ConnectorAuth) -> RegistrationResult {
        let variables = json!({
            "topic": Self::topic(&trigger.trigger_type),
            "webhookSubscription": {
                "callbackUrl": trigger.webhook_url,
                "format": "JSON",
            }
        });
        let payload = match self.graphql(auth, CREATE_MUTATION, variables).await {
            Ok(payload) => payload,
            Err(e) => return RegistrationResult::failed(e),
        };

        let result = &payload["data"]["webhookSubscriptionCreate"];
        if let Some(errors) = result["userErrors"].as_array().filter(|e| !e.is_empty()) {
            let message = errors
                .iter()
                .filter_map(|e| e["message"].as_str())
                .collect::<Vec<_>>()
                .join("; ");
            warn!(trigger_id = %trigger.id, "Shopify registration user errors: {message}");
            return RegistrationResult::failed(message);
        }
        match result["webhookSubscription"]["id"].as_str() {
            Some(id) => {
                info!(trigger_id = %trigger.id, subscription_id = id, "registered Shopify webhook");
                RegistrationResult::ok(id)
            }
            None => RegistrationResult::failed("Shopify response carried no subscription id"),
        }
    }

    async fn unregister(&self, trigger: &Trigger, auth: &ConnectorAuth) -> bool {
        let Some(id) = trigger.external_webhook_id.as_ref() else {
            return true;
        };
        match self
            .graphql(auth, DELETE_MUTATION, json!({"id": id}))
            .await
        {
            Ok(payload) => {
                payload["data"]["webhookSubscriptionDelete"]["deletedWebhookSubscriptionId"]
                    .is_string()
            }
            Err(e) => {
                warn!(trigger_id = %trigger.id, error = %e, "Shopify webhook deletion failed");
                false
            }
        }
    }

    async fn verify(
        &self,
        request: &WebhookRequest,
        _trigger: &Trigger,
        auth: &ConnectorAuth,
    ) -> VerificationResult {
        let Some(signature) = request.header("X-Shopify-Hmac-SHA256") else {
            return VerificationResult::invalid("missing X-Shopify-Hmac-SHA256 header");
        };
        let Some(secret) = auth.app_secret.as_deref() else {
            return VerificationResult::invalid("no client secret configured for verification");
        };
        let expected = hmac_sha256_base64(secret.as_bytes(), &request.body);
        if verify_base64_signature(&expected, signature) {
            VerificationResult::valid()
        } else {
            VerificationResult::invalid("signature mismatch")
        }
    }

    fn parse(&self, request: &WebhookRequest) -> ParsedEvent {
        let payload = request.json().unwrap_or(Value::Null);
        let topic = request.header("X-Shopify-Topic").unwrap_or("unknown");
        let event_id = request.header("X-Shopify-Event-Id").map(String::from);
        let timestamp = payload
            .get("created_at")
            .and_then(Value::as_str)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));
        ParsedEvent {
            event_type: topic.to_string(),
            event_data: payload,
            external_event_id: event_id,
            timestamp,
        }
    }
}
