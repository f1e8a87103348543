//! Slack trigger connector.
//!
//! Slack Events API subscriptions are configured in the app dashboard, so
//! registration returns the manual-setup sentinel. Deliveries are signed
//! `v0=hex(hmac_sha256(signing_secret, "v0:<ts>:<body>"))` with a 300 s
//! replay window; `url_verification` handshakes echo the challenge.

use crate::verify::{hmac_sha256_hex, verify_hex_signature, within_replay_window};
use crate::{
    ChallengeReply, ConnectorAuth, ParsedEvent, RegistrationResult, TriggerConnector,
    VerificationResult, WebhookRequest,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{Value, json};
use toolgate_core::types::Trigger;
use tracing::debug;

pub struct SlackConnector;

impl Default for SlackConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl SlackConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TriggerConnector for SlackConnector {
    fn provider(&self) -> &'static str {
        "slack"
    }

    async fn register(&self, trigger: &Trigger, _auth: &ConnectorAuth) -> RegistrationResult {
        debug!(trigger_id = %trigger.id, "Slack events require dashboard setup");
        RegistrationResult::manual(format!(
            "Slack Events API subscriptions are configured in the app dashboard: \
             add {} as the Request URL and subscribe to the '{}' event.",
            trigger.webhook_url, trigger.trigger_type
        ))
    }

    async fn unregister(&self, _trigger: &Trigger, _auth: &ConnectorAuth) -> bool {
        true
    }

    async fn verify(
        &self,
        request: &WebhookRequest,
        _trigger: &Trigger,
        auth: &ConnectorAuth,
    ) -> VerificationResult {
        let (Some(signature), Some(timestamp)) = (
            request.header("X-Slack-Signature"),
            request.header("X-Slack-Request-Timestamp"),
        ) else {
            return VerificationResult::invalid("missing Slack signature headers");
        };
        let Some(secret) = auth.app_secret.as_deref() else {
            return VerificationResult::invalid("no signing secret configured");
        };
        let Ok(ts) = timestamp.parse::<i64>() else {
            return VerificationResult::invalid("malformed timestamp");
        };
        if !within_replay_window(ts, Utc::now().timestamp()) {
            return VerificationResult::invalid("timestamp outside replay window");
        }
        let Some(presented) = signature.strip_prefix("v0=") else {
            return VerificationResult::invalid("malformed signature header");
        };

        let mut base = format!("v0:{timestamp}:").into_bytes();
        base.extend_from_slice(&request.body);
        let expected = hmac_sha256_hex(secret.as_bytes(), &base);
        if verify_hex_signature(&expected, presented) {
            VerificationResult::valid()
        } else {
            VerificationResult::invalid("signature mismatch")
        }
    }

    fn parse(&self, request: &WebhookRequest) -> ParsedEvent {
        let payload = request.json().unwrap_or(Value::Null);
        let event_type = payload
            .pointer("/event/type")
            .or_else(|| payload.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();
        let external_event_id = payload
            .get("event_id")
            .and_then(Value::as_str)
            .map(String::from);
        let timestamp = payload
            .get("event_time")
            .and_then(Value::as_i64)
            .and_then(|ts| DateTime::from_timestamp(ts, 0));
        ParsedEvent {
            event_type,
            event_data: payload,
            external_event_id,
            timestamp,
        }
    }

    fn challenge_response(&self, request: &WebhookRequest) -> Option<ChallengeReply> {
        let payload = request.json()?;
        if payload.get("type").and_then(Value::as_str) == Some("url_verification") {
            let challenge = payload.get("challenge")?.as_str()?.to_string();
            return Some(ChallengeReply::Json(json!({"challenge": challenge})));
        }
        None
    }
}
