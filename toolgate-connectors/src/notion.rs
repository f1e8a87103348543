//! Notion trigger connector.
//!
//! Notion webhooks are created by hand in the integration settings, so
//! registration returns setup instructions. Deliveries are signed with the
//! verification token as `X-Notion-Signature: sha256=<hex>`.

use crate::verify::{hmac_sha256_hex, verify_hex_signature};
use crate::{
    ConnectorAuth, ParsedEvent, RegistrationResult, TriggerConnector, VerificationResult,
    WebhookRequest,
};
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::Value;
use toolgate_core::types::Trigger;

pub struct NotionConnector;

impl Default for NotionConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl NotionConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TriggerConnector for NotionConnector {
    fn provider(&self) -> &'static str {
        "notion"
    }

    async fn register(&self, trigger: &Trigger, _auth: &ConnectorAuth) -> RegistrationResult {
        RegistrationResult::manual(format!(
            "Notion webhooks are configured in the integration settings: create a \
             webhook subscription pointing at {}, subscribe to '{}' events, and paste \
             the trigger's verification token as the signing secret.",
            trigger.webhook_url, trigger.trigger_type
        ))
    }

    async fn unregister(&self, _trigger: &Trigger, _auth: &ConnectorAuth) -> bool {
        true
    }

    async fn verify(
        &self,
        request: &WebhookRequest,
        trigger: &Trigger,
        _auth: &ConnectorAuth,
    ) -> VerificationResult {
        let Some(signature) = request.header("X-Notion-Signature") else {
            return VerificationResult::invalid("missing X-Notion-Signature header");
        };
        let presented = signature.strip_prefix("sha256=").unwrap_or(signature);
        let expected = hmac_sha256_hex(trigger.verification_token.as_bytes(), &request.body);
        if verify_hex_signature(&expected, presented) {
            VerificationResult::valid()
        } else {
            VerificationResult::invalid("signature mismatch")
        }
    }

    fn parse(&self, request: &WebhookRequest) -> ParsedEvent {
        let payload = request.json().unwrap_or(Value::Null);
        ParsedEvent {
            event_type: payload
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            external_event_id: payload.get("id").and_then(Value::as_str).map(String::from),
            timestamp: payload
                .get("timestamp")
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
    use serde_json::json;

    #[tokio::test]
    async fn test_register_is_manual_setup() {
        let connector = NotionConnector::new();
        let t = trigger("page.updated", json!({}));
        let result = connector.register(&t, &ConnectorAuth::default()).await;
        assert!(result.success);
        let instructions = result.manual_setup.unwrap();
        assert!(instructions.contains(&t.webhook_url));
        assert!(instructions.contains("page.updated"));
    }

    #[tokio::test]
    async fn test_verify_with_and_without_prefix() {
        let connector = NotionConnector::new();
        let t = trigger("page.updated", json!({}));
        let body = br#"{"id":"evt-1","type":"page.updated"}"#;
        let digest = hmac_sha256_hex(t.verification_token.as_bytes(), body);

        let prefixed = request(&[("X-Notion-Signature", &format!("sha256={digest}"))], body);
        assert!(connector.verify(&prefixed, &t, &ConnectorAuth::default()).await.is_valid);

        let bare = request(&[("X-Notion-Signature", &digest)], body);
        assert!(connector.verify(&bare, &t, &ConnectorAuth::default()).await.is_valid);

        let wrong = request(&[("X-Notion-Signature", &digest)], br#"{"id":"evt-2"}"#);
        assert!(!connector.verify(&wrong, &t, &ConnectorAuth::default()).await.is_valid);
    }

    #[test]
    fn test_parse() {
        let connector = NotionConnector::new();
        let req = request(
            &[],
            br#"{"id":"evt-5","type":"page.updated","timestamp":"2025-06-01T10:00:00.000Z"}"#,
        );
        let event = connector.parse(&req);
        assert_eq!(event.event_type, "page.updated");
        assert_eq!(event.external_event_id.as_deref(), Some("evt-5"));
        assert!(event.timestamp.is_some());
    }
}
