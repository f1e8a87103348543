//! Gmail trigger connector (Google Pub/Sub push).
//!
//! `users.watch` arms push notifications onto a Pub/Sub topic whose push
//! subscription targets the gateway. Pushes authenticate with an OIDC JWT
//! in the Authorization header: issuer, audience, and expiry are validated
//! and the RS256 signature is checked against Google's JWKS (cached).
//! The message payload is base64 `{emailAddress, historyId}`.

use crate::{
    ConnectorAuth, ParsedEvent, RegistrationResult, TriggerConnector, VerificationResult,
    WebhookRequest, admin_client,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use toolgate_core::types::Trigger;
use tracing::{info, warn};

const GMAIL_API: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const GOOGLE_JWKS_URL: &str = "https://www.googleapis.com/oauth2/v3/certs";
const GOOGLE_ISSUERS: [&str; 2] = ["https://accounts.google.com", "accounts.google.com"];
const JWKS_CACHE_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Deserialize)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Debug, Clone, Deserialize)]
struct Jwks {
    keys: Vec<Jwk>,
}

#[derive(Debug, Deserialize)]
struct PubSubClaims {
    #[allow(dead_code)]
    aud: String,
    #[allow(dead_code)]
    iss: String,
}

pub struct GmailConnector {
    client: reqwest::Client,
    jwks: RwLock<Option<(Jwks, Instant)>>,
}

impl Default for GmailConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl GmailConnector {
    pub fn new() -> Self {
        Self {
            client: admin_client(),
            jwks: RwLock::new(None),
        }
    }

    /// The OIDC audience the push subscription was created with; defaults
    /// to the trigger's webhook URL.
    fn audience(trigger: &Trigger) -> String {
        trigger
            .config
            .get("audience")
            .and_then(Value::as_str)
            .unwrap_or(&trigger.webhook_url)
            .to_string()
    }

    async fn cached_jwks(&self) -> Option<Jwks> {
        {
            let cached = self.jwks.read().await;
            if let Some((jwks, fetched_at)) = cached.as_ref() {
                if fetched_at.elapsed() < JWKS_CACHE_TTL {
                    return Some(jwks.clone());
                }
            }
        }
        match self.client.get(GOOGLE_JWKS_URL).send().await {
            Ok(response) => match response.json::<Jwks>().await {
                Ok(jwks) => {
                    *self.jwks.write().await = Some((jwks.clone(), Instant::now()));
                    Some(jwks)
                }
                Err(e) => {
                    warn!(error = %e, "failed to parse Google JWKS");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to fetch Google JWKS");
                None
            }
        }
    }

    /// Decode the base64 Pub/Sub message data, tolerating missing padding.
    fn decode_message_data(data: &str) -> Option<Value> {
        let bytes = STANDARD
            .decode(data)
            .or_else(|_| URL_SAFE_NO_PAD.decode(data.trim_end_matches('=')))
            .ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}

#[async_trait]
impl TriggerConnector for GmailConnector {
    fn provider(&self) -> &'static str {
        "gmail"
    }

    async fn register(&self, trigger: &Trigger, auth: &ConnectorAuth) -> RegistrationResult {
        let Some(topic_name) = trigger.config.get("topic_name").and_then(Value::as_str) else {
            return RegistrationResult::failed("trigger config is missing 'topic_name'");
        };
        let body = json!({
            "topicName": topic_name,
            "labelIds": ["INBOX"],
            "labelFilterBehavior": "INCLUDE",
        });
        let response = self
            .client
            .post(format!("{GMAIL_API}/watch"))
            .bearer_auth(auth.token())
            .json(&body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                let payload: Value = response.json().await.unwrap_or_default();
                let expires_at = payload
                    .get("expiration")
                    .and_then(|e| match e {
                        Value::String(s) => s.parse::<i64>().ok(),
                        Value::Number(n) => n.as_i64(),
                        _ => None,
                    })
                    .and_then(DateTime::from_timestamp_millis);
                info!(trigger_id = %trigger.id, topic = topic_name, "armed Gmail watch");
                let mut result = RegistrationResult::ok(topic_name);
                if let Some(expires_at) = expires_at {
                    result = result.with_expires_at(expires_at);
                }
                if let Some(history_id) = payload.get("historyId") {
                    result = result.with_metadata(json!({"history_id": history_id}));
                }
                result
            }
            Ok(response) => {
                let status = response.status();
                warn!(trigger_id = %trigger.id, %status, "Gmail watch failed");
                RegistrationResult::failed(format!("Gmail returned {status}"))
            }
            Err(e) => RegistrationResult::failed(e.to_string()),
        }
    }

    async fn unregister(&self, trigger: &Trigger, auth: &ConnectorAuth) -> bool {
        match self
            .client
            .post(format!("{GMAIL_API}/stop"))
            .bearer_auth(auth.token())
            .send()
            .await
        {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!(trigger_id = %trigger.id, error = %e, "Gmail stop failed");
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
        let Some(authorization) = request.header("Authorization") else {
            return VerificationResult::invalid("missing Authorization header");
        };
        let Some(token) = authorization.strip_prefix("Bearer ") else {
            return VerificationResult::invalid("malformed Authorization header");
        };

        let header = match decode_header(token) {
            Ok(header) => header,
            Err(e) => return VerificationResult::invalid(format!("malformed JWT: {e}")),
        };
        let Some(kid) = header.kid else {
            return VerificationResult::invalid("JWT carries no key id");
        };
        let Some(jwks) = self.cached_jwks().await else {
            return VerificationResult::invalid("Google JWKS unavailable");
        };
        let Some(jwk) = jwks.keys.iter().find(|k| k.kid == kid) else {
            return VerificationResult::invalid("no JWKS key matches the token");
        };
        let key = match DecodingKey::from_rsa_components(&jwk.n, &jwk.e) {
            Ok(key) => key,
            Err(e) => return VerificationResult::invalid(format!("invalid JWKS key: {e}")),
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(&[Self::audience(trigger)]);
        validation.set_issuer(&GOOGLE_ISSUERS);
        match decode::<PubSubClaims>(token, &key, &validation) {
            Ok(_) => VerificationResult::valid(),
            Err(e) => VerificationResult::invalid(format!("OIDC validation failed: {e}")),
        }
    }

    fn parse(&self, request: &WebhookRequest) -> ParsedEvent {
        let envelope = request.json().unwrap_or(Value::Null);
        let message = envelope.get("message").cloned().unwrap_or(Value::Null);
        let decoded = message
            .get("data")
            .and_then(Value::as_str)
            .and_then(Self::decode_message_data)
            .unwrap_or(Value::Null);

        let external_event_id = match (
            decoded.get("emailAddress").and_then(Value::as_str),
            decoded.get("historyId"),
        ) {
            (Some(email), Some(history_id)) => Some(format!("{email}:{history_id}")),
            _ => message
                .get("messageId")
                .and_then(Value::as_str)
                .map(String::from),
        };
        let timestamp = message
            .get("publishTime")
            .and_then(Value::as_str)
            .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
            .map(|ts| ts.with_timezone(&Utc));

        ParsedEvent {
            event_type: "history_updated".into(),
            event_data: if decoded.is_null() { envelope } else { decoded },
            external_event_id,
            timestamp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{request, trigger};

    #[tokio::test]
    async fn test_verify_missing_authorization() {
        let connector = GmailConnector::new();
        let t = trigger("history_updated", json!({}));
        let req = request(&[], b"{}");
        let result = connector.verify(&req, &t, &ConnectorAuth::default()).await;
        assert!(!result.is_valid);
    }

    #[tokio::test]
    async fn test_verify_malformed_bearer() {
        let connector = GmailConnector::new();
        let t = trigger("history_updated", json!({}));
        let req = request(&[("Authorization", "Basic abc")], b"{}");
        assert!(!connector.verify(&req, &t, &ConnectorAuth::default()).await.is_valid);
        let req = request(&[("Authorization", "Bearer not.a.jwt!")], b"{}");
        assert!(!connector.verify(&req, &t, &ConnectorAuth::default()).await.is_valid);
    }

    #[test]
    fn test_audience_defaults_to_webhook_url() {
        let t = trigger("history_updated", json!({}));
        assert_eq!(GmailConnector::audience(&t), t.webhook_url);
        let with_audience = trigger("history_updated", json!({"audience": "https://aud"}));
        assert_eq!(GmailConnector::audience(&with_audience), "https://aud");
    }

    #[test]
    fn test_parse_pubsub_envelope() {
        let connector = GmailConnector::new();
        let data = STANDARD.encode(br#"{"emailAddress":"u@example.com","historyId":8675}"#);
        let body = serde_json::to_vec(&json!({
            "message": {
                "data": data,
                "messageId": "m-1",
                "publishTime": "2025-06-01T10:00:00Z"
            },
            "subscription": "projects/p/subscriptions/s"
        }))
        .unwrap();
        let event = connector.parse(&request(&[], &body));
        assert_eq!(event.event_type, "history_updated");
        assert_eq!(event.external_event_id.as_deref(), Some("u@example.com:8675"));
        assert_eq!(event.event_data["historyId"], 8675);
        assert!(event.timestamp.is_some());
    }

    #[test]
    fn test_decode_message_data_tolerates_urlsafe() {
        let decoded = GmailConnector::decode_message_data(
            &URL_SAFE_NO_PAD.encode(br#"{"historyId":1}"#),
        )
        .unwrap();
        assert_eq!(decoded["historyId"], 1);
        assert!(GmailConnector::decode_message_data("!!!").is_none());
    }

    #[tokio::test]
    async fn test_register_requires_topic() {
        let connector = GmailConnector::new();
        let t = trigger("history_updated", json!({}));
        let result = connector.register(&t, &ConnectorAuth::default()).await;
        assert!(!result.success);
    }
}
