//! Stripe trigger connector.
//!
//! Webhook endpoints are managed via the REST API; Stripe returns the
//! endpoint's signing secret at creation, which is persisted into the
//! trigger config. Deliveries carry `Stripe-Signature: t=<ts>,v1=<hex>...`;
//! the digest covers `"<ts>.<body>"` and any `v1` candidate may match,
//! inside a 300 s window.

use crate::verify::{hmac_sha256_hex, verify_hex_signature, within_replay_window};
use crate::{
    ConnectorAuth, ParsedEvent, RegistrationResult, TriggerConnector, VerificationResult,
    WebhookRequest, admin_client,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use toolgate_core::types::Trigger;
use tracing::{info, warn};

const API_BASE: &str = "https://api.stripe.com";

pub struct StripeConnector {
    client: reqwest::Client,
}

impl Default for StripeConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl StripeConnector {
    pub fn new() -> Self {
        Self {
            client: admin_client(),
        }
    }

    /// The endpoint signing secret: persisted into the config at
    /// registration, falling back to the trigger's own token.
    fn signing_secret<'a>(trigger: &'a Trigger, auth: &'a ConnectorAuth) -> &'a str {
        trigger
            .config
            .get("signing_secret")
            .and_then(Value::as_str)
            .or(auth.app_secret.as_deref())
            .unwrap_or(&trigger.verification_token)
    }

    /// Parse `t=...,v1=...,v1=...` into (timestamp, v1 candidates).
    fn parse_signature_header(header: &str) -> (Option<i64>, Vec<&str>) {
        let mut timestamp = None;
        let mut candidates = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }
        (timestamp, candidates)
    }
}

#[async_trait]
impl TriggerConnector for StripeConnector {
    fn provider(&self) -> &'static str {
        "stripe"
    }

    async fn register(&self, trigger: &Trigger, auth: &ConnectorAuth) -> RegistrationResult {
        let form = vec![
            ("url".to_string(), trigger.webhook_url.clone()),
            ("enabled_events[]".to_string(), trigger.trigger_type.clone()),
        ];
        let response = self
            .client
            .post(format!("{API_BASE}/v1/webhook_endpoints"))
            .bearer_auth(auth.token())
            .form(&form)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                let payload: Value = response.json().await.unwrap_or_default();
                let Some(id) = payload.get("id").and_then(Value::as_str) else {
                    return RegistrationResult::failed("Stripe response carried no endpoint id");
                };
                info!(trigger_id = %trigger.id, endpoint_id = id, "registered Stripe webhook endpoint");
                let mut result = RegistrationResult::ok(id);
                if let Some(secret) = payload.get("secret").and_then(Value::as_str) {
                    result = result.with_metadata(json!({"signing_secret": secret}));
                }
                result
            }
            Ok(response) => {
                let status = response.status();
                warn!(trigger_id = %trigger.id, %status, "Stripe endpoint creation failed");
                RegistrationResult::failed(format!("Stripe returned {status}"))
            }
            Err(e) => RegistrationResult::failed(e.to_string()),
        }
    }

    async fn unregister(&self, trigger: &Trigger, auth: &ConnectorAuth) -> bool {
        let Some(id) = trigger.external_webhook_id.as_ref() else {
            return true;
        };
        match self
            .client
            .delete(format!("{API_BASE}/v1/webhook_endpoints/{id}"))
            .bearer_auth(auth.token())
            .send()
            .await
        {
            Ok(response) => response.status().is_success() || response.status().as_u16() == 404,
            Err(e) => {
                warn!(trigger_id = %trigger.id, error = %e, "Stripe endpoint deletion failed");
                false
            }
        }
    }

    async fn verify(
        &self,
        request: &WebhookRequest,
        trigger: &Trigger,
        auth: &ConnectorAuth,
    ) -> VerificationResult {
        let Some(header) = request.header("Stripe-Signature") else {
            return VerificationResult::invalid("missing Stripe-Signature header");
        };
        let (timestamp, candidates) = Self::parse_signature_header(header);
        let (Some(ts), false) = (timestamp, candidates.is_empty()) else {
            return VerificationResult::invalid("malformed signature header");
        };
        if !within_replay_window(ts, Utc::now().timestamp()) {
            return VerificationResult::invalid("timestamp outside replay window");
        }

        let mut signed_payload = format!("{ts}.").into_bytes();
        signed_payload.extend_from_slice(&request.body);
        let secret = Self::signing_secret(trigger, auth);
        let expected = hmac_sha256_hex(secret.as_bytes(), &signed_payload);

        if candidates
            .iter()
            .any(|candidate| verify_hex_signature(&expected, candidate))
        {
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
                .get("created")
                .and_then(Value::as_i64)
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
            event_data: payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{request, trigger};

    fn stripe_trigger() -> Trigger {
        trigger(
            "invoice.paid",
            json!({"signing_secret": "whsec_test_secret"}),
        )
    }

    fn signed_header(body: &[u8], ts: i64, secret: &str) -> String {
        let mut payload = format!("{ts}.").into_bytes();
        payload.extend_from_slice(body);
        format!("t={ts},v1={}", hmac_sha256_hex(secret.as_bytes(), &payload))
    }

    #[tokio::test]
    async fn test_verify_valid_v1_candidate() {
        let connector = StripeConnector::new();
        let t = stripe_trigger();
        let body = br#"{"id":"evt_1","type":"invoice.paid"}"#;
        let ts = Utc::now().timestamp();
        // A stale candidate first, the right one second.
        let header = format!(
            "t={ts},v1=deadbeef,{}",
            signed_header(body, ts, "whsec_test_secret")
                .split_once(',')
                .unwrap()
                .1
        );
        let req = request(&[("Stripe-Signature", &header)], body);
        assert!(connector.verify(&req, &t, &ConnectorAuth::default()).await.is_valid);
    }

    #[tokio::test]
    async fn test_verify_rejects_old_timestamp() {
        let connector = StripeConnector::new();
        let t = stripe_trigger();
        let body = br#"{"id":"evt_1"}"#;
        let ts = Utc::now().timestamp() - 400;
        let header = signed_header(body, ts, "whsec_test_secret");
        let req = request(&[("Stripe-Signature", &header)], body);
        assert!(!connector.verify(&req, &t, &ConnectorAuth::default()).await.is_valid);
    }

    #[tokio::test]
    async fn test_verify_rejects_wrong_secret() {
        let connector = StripeConnector::new();
        let t = stripe_trigger();
        let body = br#"{"id":"evt_1"}"#;
        let ts = Utc::now().timestamp();
        let header = signed_header(body, ts, "whsec_other");
        let req = request(&[("Stripe-Signature", &header)], body);
        assert!(!connector.verify(&req, &t, &ConnectorAuth::default()).await.is_valid);
    }

    #[test]
    fn test_parse_signature_header() {
        let (ts, candidates) =
            StripeConnector::parse_signature_header("t=1712000000,v1=aa,v1=bb,v0=cc");
        assert_eq!(ts, Some(1712000000));
        assert_eq!(candidates, vec!["aa", "bb"]);
    }

    #[test]
    fn test_parse_event() {
        let connector = StripeConnector::new();
        let req = request(
            &[],
            br#"{"id":"evt_9","type":"invoice.paid","created":1712000000}"#,
        );
        let event = connector.parse(&req);
        assert_eq!(event.event_type, "invoice.paid");
        assert_eq!(event.external_event_id.as_deref(), Some("evt_9"));
        assert!(event.timestamp.is_some());
    }

    #[test]
    fn test_signing_secret_fallback_chain() {
        let with_config = stripe_trigger();
        assert_eq!(
            StripeConnector::signing_secret(&with_config, &ConnectorAuth::default()),
            "whsec_test_secret"
        );
        let bare = trigger("invoice.paid", json!({}));
        assert_eq!(
            StripeConnector::signing_secret(&bare, &ConnectorAuth::default()),
            bare.verification_token
        );
    }
}
