//! HubSpot trigger connector.
//!
//! Subscriptions are created through the webhooks v3 API (scoped to the
//! developer app id in the trigger config). Request verification follows
//! the signature version header: v1 hashes `secret + method + uri + body`,
//! v2 appends the request timestamp and enforces a 300 s window. The
//! secret is part of the hashed string, not an HMAC key.

use crate::verify::{sha256_hex, verify_hex_signature, within_replay_window};
use crate::{
    ConnectorAuth, ParsedEvent, RegistrationResult, TriggerConnector, VerificationResult,
    WebhookRequest, admin_client,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use toolgate_core::types::Trigger;
use tracing::{info, warn};

const API_BASE: &str = "https://api.hubapi.com";

pub struct HubSpotConnector {
    client: reqwest::Client,
}

impl Default for HubSpotConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl HubSpotConnector {
    pub fn new() -> Self {
        Self {
            client: admin_client(),
        }
    }

    fn app_id(trigger: &Trigger) -> Option<String> {
        match trigger.config.get("app_id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    fn canonical_v1(secret: &str, method: &str, uri: &str, body: &[u8]) -> String {
        let mut canonical = format!("{secret}{method}{uri}").into_bytes();
        canonical.extend_from_slice(body);
        sha256_hex(&canonical)
    }

    fn canonical_v2(secret: &str, method: &str, uri: &str, body: &[u8], timestamp: &str) -> String {
        let mut canonical = format!("{secret}{method}{uri}").into_bytes();
        canonical.extend_from_slice(body);
        canonical.extend_from_slice(timestamp.as_bytes());
        sha256_hex(&canonical)
    }
}

#[async_trait]
impl TriggerConnector for HubSpotConnector {
    fn provider(&self) -> &'static str {
        "hubspot"
    }

    async fn register(&self, trigger: &Trigger, auth: &ConnectorAuth) -> RegistrationResult {
        let Some(app_id) = Self::app_id(trigger) else {
            return RegistrationResult::failed("trigger config is missing 'app_id'");
        };
        let body = json!({
            "eventType": trigger.trigger_type,
            "active": true,
        });
        let response = self
            .client
            .post(format!("{API_BASE}/webhooks/v3/{app_id}/subscriptions"))
            .bearer_auth(auth.token())
            .json(&body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                let payload: Value = response.json().await.unwrap_or_default();
                let id = payload
                    .get("id")
                    .map(|id| match id {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    });
                match id {
                    Some(id) => {
                        info!(trigger_id = %trigger.id, subscription_id = %id, "registered HubSpot subscription");
                        RegistrationResult::ok(id)
                    }
                    None => RegistrationResult::failed("HubSpot response carried no subscription id"),
                }
            }
            Ok(response) => {
                let status = response.status();
                warn!(trigger_id = %trigger.id, %status, "HubSpot subscription creation failed");
                RegistrationResult::failed(format!("HubSpot returned {status}"))
            }
            Err(e) => RegistrationResult::failed(e.to_string()),
        }
    }

    async fn unregister(&self, trigger: &Trigger, auth: &ConnectorAuth) -> bool {
        let (Some(app_id), Some(subscription_id)) =
            (Self::app_id(trigger), trigger.external_webhook_id.as_ref())
        else {
            return true;
        };
        match self
            .client
            .delete(format!(
                "{API_BASE}/webhooks/v3/{app_id}/subscriptions/{subscription_id}"
            ))
            .bearer_auth(auth.token())
            .send()
            .await
        {
            Ok(response) => response.status().is_success() || response.status().as_u16() == 404,
            Err(e) => {
                warn!(trigger_id = %trigger.id, error = %e, "HubSpot subscription deletion failed");
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
        let Some(signature) = request.header("X-HubSpot-Signature") else {
            return VerificationResult::invalid("missing X-HubSpot-Signature header");
        };
        let Some(secret) = auth.app_secret.as_deref() else {
            return VerificationResult::invalid("no app secret configured");
        };
        let version = request
            .header("X-HubSpot-Signature-Version")
            .unwrap_or("v1");

        let expected = match version {
            "v2" => {
                let Some(timestamp) = request.header("X-HubSpot-Request-Timestamp") else {
                    return VerificationResult::invalid("missing timestamp header");
                };
                let Ok(ts) = timestamp.parse::<i64>() else {
                    return VerificationResult::invalid("malformed timestamp");
                };
                if !within_replay_window(ts, Utc::now().timestamp()) {
                    return VerificationResult::invalid("timestamp outside replay window");
                }
                Self::canonical_v2(secret, &request.method, &request.path, &request.body, timestamp)
            }
            _ => Self::canonical_v1(secret, &request.method, &request.path, &request.body),
        };

        if verify_hex_signature(&expected, signature) {
            VerificationResult::valid()
        } else {
            VerificationResult::invalid("signature mismatch")
        }
    }

    fn parse(&self, request: &WebhookRequest) -> ParsedEvent {
        let payload = request.json().unwrap_or(Value::Null);
        // HubSpot batches events; the receiver fans out per entry, single
        // objects pass through unchanged.
        let entry = payload
            .as_array()
            .and_then(|entries| entries.first())
            .cloned()
            .unwrap_or(payload);
        ParsedEvent {
            event_type: entry
                .get("subscriptionType")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string(),
            external_event_id: entry.get("eventId").map(|id| match id {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            }),
            timestamp: entry
                .get("occurredAt")
                .and_then(Value::as_i64)
                .and_then(DateTime::from_timestamp_millis),
            event_data: entry,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{request, trigger};

    fn hubspot_auth() -> ConnectorAuth {
        ConnectorAuth {
            app_secret: Some("hs-secret".into()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_verify_v1() {
        let connector = HubSpotConnector::new();
        let t = trigger("contact.creation", json!({"app_id": 12345}));
        let body = br#"[{"eventId":1}]"#;
        let signature =
            HubSpotConnector::canonical_v1("hs-secret", "POST", "/v1/webhooks/test/abc", body);
        let req = request(&[("X-HubSpot-Signature", &signature)], body);
        assert!(connector.verify(&req, &t, &hubspot_auth()).await.is_valid);
    }

    #[tokio::test]
    async fn test_verify_v2_with_window() {
        let connector = HubSpotConnector::new();
        let t = trigger("contact.creation", json!({"app_id": 12345}));
        let body = br#"[{"eventId":1}]"#;
        let ts = (Utc::now().timestamp() * 1000).to_string();
        let signature = HubSpotConnector::canonical_v2(
            "hs-secret",
            "POST",
            "/v1/webhooks/test/abc",
            body,
            &ts,
        );
        let req = request(
            &[
                ("X-HubSpot-Signature", &signature),
                ("X-HubSpot-Signature-Version", "v2"),
                ("X-HubSpot-Request-Timestamp", &ts),
            ],
            body,
        );
        assert!(connector.verify(&req, &t, &hubspot_auth()).await.is_valid);
    }

    #[tokio::test]
    async fn test_verify_v2_stale_timestamp_fails() {
        let connector = HubSpotConnector::new();
        let t = trigger("contact.creation", json!({"app_id": 12345}));
        let body = b"[]";
        let ts = ((Utc::now().timestamp() - 400) * 1000).to_string();
        let signature = HubSpotConnector::canonical_v2(
            "hs-secret",
            "POST",
            "/v1/webhooks/test/abc",
            body,
            &ts,
        );
        let req = request(
            &[
                ("X-HubSpot-Signature", &signature),
                ("X-HubSpot-Signature-Version", "v2"),
                ("X-HubSpot-Request-Timestamp", &ts),
            ],
            body,
        );
        assert!(!connector.verify(&req, &t, &hubspot_auth()).await.is_valid);
    }

    #[tokio::test]
    async fn test_verify_wrong_method_fails() {
        let connector = HubSpotConnector::new();
        let t = trigger("contact.creation", json!({"app_id": 12345}));
        let body = b"[]";
        let signature =
            HubSpotConnector::canonical_v1("hs-secret", "GET", "/v1/webhooks/test/abc", body);
        let req = request(&[("X-HubSpot-Signature", &signature)], body);
        assert!(!connector.verify(&req, &t, &hubspot_auth()).await.is_valid);
    }

    #[test]
    fn test_parse_batched_payload() {
        let connector = HubSpotConnector::new();
        let req = request(
            &[],
            br#"[{"eventId":912,"subscriptionType":"contact.creation","occurredAt":1712000000000}]"#,
        );
        let event = connector.parse(&req);
        assert_eq!(event.event_type, "contact.creation");
        assert_eq!(event.external_event_id.as_deref(), Some("912"));
        assert!(event.timestamp.is_some());
    }

    #[tokio::test]
    async fn test_register_requires_app_id() {
        let connector = HubSpotConnector::new();
        let t = trigger("contact.creation", json!({}));
        let result = connector.register(&t, &hubspot_auth()).await;
        assert!(!result.success);
    }
}
