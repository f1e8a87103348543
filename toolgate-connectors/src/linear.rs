//! Linear trigger connector.
//!
//! Webhooks are created through the GraphQL API with the trigger's
//! verification token as the signing secret. Deliveries carry a plain hex
//! HMAC of the body in `Linear-Signature` and a delivery id in
//! `Linear-Delivery`.

use crate::verify::{hmac_sha256_hex, verify_hex_signature};
use crate::{
    ConnectorAuth, ParsedEvent, RegistrationResult, TriggerConnector, VerificationResult,
    WebhookRequest, admin_client,
};
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{Value, json};
use toolgate_core::types::Trigger;
use tracing::{info, warn};

const GRAPHQL_ENDPOINT: &str = "https://api.linear.app/graphql";

const CREATE_MUTATION: &str = r#"
mutation WebhookCreate($input: WebhookCreateInput!) {
  webhookCreate(input: $input) {
    success
    webhook { id }
  }
}
"#;

const DELETE_MUTATION: &str = r#"
mutation WebhookDelete($id: String!) {
  webhookDelete(id: $id) { success }
}
"#;

pub struct LinearConnector {
    client: reqwest::Client,
}

impl Default for LinearConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl LinearConnector {
    pub fn new() -> Self {
        Self {
            client: admin_client(),
        }
    }

    async fn graphql(
        &self,
        auth: &ConnectorAuth,
        query: &str,
        variables: Value,
    ) -> Result<Value, String> {
        let response = self
            .client
            .post(GRAPHQL_ENDPOINT)
            .header("Authorization", auth.token())
            .json(&json!({"query": query, "variables": variables}))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("Linear returned {status}"));
        }
        response.json().await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl TriggerConnector for LinearConnector {
    fn provider(&self) -> &'static str {
        "linear"
    }

    async fn register(&self, trigger: &Trigger, auth: &ConnectorAuth) -> RegistrationResult {
        let resource_types: Vec<&str> = trigger.trigger_type.split(',').collect();
        let variables = json!({
            "input": {
                "url": trigger.webhook_url,
                "resourceTypes": resource_types,
                "secret": trigger.verification_token,
            }
        });
        let payload = match self.graphql(auth, CREATE_MUTATION, variables).await {
            Ok(payload) => payload,
            Err(e) => return RegistrationResult::failed(e),
        };

        let created = &payload["data"]["webhookCreate"];
        if created["success"].as_bool() != Some(true) {
            warn!(trigger_id = %trigger.id, "Linear webhook creation reported failure");
            return RegistrationResult::failed("Linear webhookCreate reported failure");
        }
        match created["webhook"]["id"].as_str() {
            Some(id) => {
                info!(trigger_id = %trigger.id, webhook_id = id, "registered Linear webhook");
                RegistrationResult::ok(id)
            }
            None => RegistrationResult::failed("Linear response carried no webhook id"),
        }
    }

    async fn unregister(&self, trigger: &Trigger, auth: &ConnectorAuth) -> bool {
        let Some(id) = trigger.external_webhook_id.as_ref() else {
            return true;
        };
        match self.graphql(auth, DELETE_MUTATION, json!({"id": id})).await {
            Ok(payload) => payload["data"]["webhookDelete"]["success"].as_bool() == Some(true),
            Err(e) => {
                warn!(trigger_id = %trigger.id, error = %e, "Linear webhook deletion failed");
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
        let Some(signature) = request.header("Linear-Signature") else {
            return VerificationResult::invalid("missing Linear-Signature header");
        };
        let expected = hmac_sha256_hex(trigger.verification_token.as_bytes(), &request.body);
        if verify_hex_signature(&expected, signature) {
            VerificationResult::valid()
        } else {
            VerificationResult::invalid("signature mismatch")
        }
    }

    fn parse(&self, request: &WebhookRequest) -> ParsedEvent {
        let payload = request.json().unwrap_or(Value::Null);
        let entity = payload.get("type").and_then(Value::as_str).unwrap_or("unknown");
        let action = payload.get("action").and_then(Value::as_str).unwrap_or("event");
        ParsedEvent {
            event_type: format!("{entity}.{action}"),
            external_event_id: request.header("Linear-Delivery").map(String::from),
            timestamp: payload
                .get("createdAt")
                .and_then(Value::as_str)
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&chrono::Utc)),
            event_data: payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{request, trigger};

    #[tokio::test]
    async fn test_verify_roundtrip() {
        let connector = LinearConnector::new();
        let t = trigger("Issue", json!({}));
        let body = br#"{"type":"Issue","action":"create"}"#;
        let signature = hmac_sha256_hex(t.verification_token.as_bytes(), body);
        let req = request(&[("Linear-Signature", &signature)], body);
        assert!(connector.verify(&req, &t, &ConnectorAuth::default()).await.is_valid);

        let tampered = request(&[("Linear-Signature", &signature)], br#"{"type":"Issue"}"#);
        assert!(!connector.verify(&tampered, &t, &ConnectorAuth::default()).await.is_valid);
    }

    #[test]
    fn test_parse_combines_type_and_action() {
        let connector = LinearConnector::new();
        let req = request(
            &[("Linear-Delivery", "d-77")],
            br#"{"type":"Issue","action":"update","createdAt":"2025-06-01T10:00:00.000Z"}"#,
        );
        let event = connector.parse(&req);
        assert_eq!(event.event_type, "Issue.update");
        assert_eq!(event.external_event_id.as_deref(), Some("d-77"));
        assert!(event.timestamp.is_some());
    }
}
