//! Google Calendar trigger connector.
//!
//! Event notifications use watch channels: the channel carries the
//! trigger's verification token, which Google echoes back in
//! `X-Goog-Channel-Token` on every notification. Channels expire and are
//! renewed by re-registering. The initial `sync` notification is an
//! acknowledgement, not an event.

use crate::verify::constant_time_eq;
use crate::{
    ChallengeReply, ConnectorAuth, ParsedEvent, RegistrationResult, TriggerConnector,
    VerificationResult, WebhookRequest, admin_client,
};
use async_trait::async_trait;
use chrono::DateTime;
use serde_json::{Value, json};
use toolgate_core::types::Trigger;
use tracing::{info, warn};
use uuid::Uuid;

const CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3";

pub struct GoogleCalendarConnector {
    client: reqwest::Client,
}

impl Default for GoogleCalendarConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl GoogleCalendarConnector {
    pub fn new() -> Self {
        Self {
            client: admin_client(),
        }
    }

    fn calendar_id(trigger: &Trigger) -> &str {
        trigger
            .config
            .get("calendar_id")
            .and_then(Value::as_str)
            .unwrap_or("primary")
    }
}

#[async_trait]
impl TriggerConnector for GoogleCalendarConnector {
    fn provider(&self) -> &'static str {
        "google_calendar"
    }

    async fn register(&self, trigger: &Trigger, auth: &ConnectorAuth) -> RegistrationResult {
        let calendar_id = Self::calendar_id(trigger);
        let channel_id = Uuid::new_v4().to_string();
        let body = json!({
            "id": channel_id,
            "type": "web_hook",
            "address": trigger.webhook_url,
            "token": trigger.verification_token,
        });
        let response = self
            .client
            .post(format!("{CALENDAR_API}/calendars/{calendar_id}/events/watch"))
            .bearer_auth(auth.token())
            .json(&body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                let payload: Value = response.json().await.unwrap_or_default();
                let Some(resource_id) = payload.get("resourceId").and_then(Value::as_str) else {
                    return RegistrationResult::failed("watch response carried no resourceId");
                };
                let expires_at = payload
                    .get("expiration")
                    .and_then(|e| match e {
                        Value::String(s) => s.parse::<i64>().ok(),
                        Value::Number(n) => n.as_i64(),
                        _ => None,
                    })
                    .and_then(DateTime::from_timestamp_millis);
                info!(
                    trigger_id = %trigger.id,
                    resource_id,
                    channel_id = %channel_id,
                    "opened Google Calendar watch channel"
                );
                let mut result = RegistrationResult::ok(resource_id)
                    .with_metadata(json!({"channel_id": channel_id}));
                if let Some(expires_at) = expires_at {
                    result = result.with_expires_at(expires_at);
                }
                result
            }
            Ok(response) => {
                let status = response.status();
                warn!(trigger_id = %trigger.id, %status, "Google Calendar watch failed");
                RegistrationResult::failed(format!("Google Calendar returned {status}"))
            }
            Err(e) => RegistrationResult::failed(e.to_string()),
        }
    }

    async fn unregister(&self, trigger: &Trigger, auth: &ConnectorAuth) -> bool {
        let Some(resource_id) = trigger.external_webhook_id.as_ref() else {
            return true;
        };
        let channel_id = trigger
            .config
            .get("channel_id")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let body = json!({"id": channel_id, "resourceId": resource_id});
        match self
            .client
            .post(format!("{CALENDAR_API}/channels/stop"))
            .bearer_auth(auth.token())
            .json(&body)
            .send()
            .await
        {
            Ok(response) => response.status().is_success() || response.status().as_u16() == 404,
            Err(e) => {
                warn!(trigger_id = %trigger.id, error = %e, "Google Calendar channel stop failed");
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
        let Some(token) = request.header("X-Goog-Channel-Token") else {
            return VerificationResult::invalid("missing X-Goog-Channel-Token header");
        };
        if constant_time_eq(token.as_bytes(), trigger.verification_token.as_bytes()) {
            VerificationResult::valid()
        } else {
            VerificationResult::invalid("channel token mismatch")
        }
    }

    fn parse(&self, request: &WebhookRequest) -> ParsedEvent {
        // Calendar notifications carry their payload in headers; the body
        // is empty.
        let state = request
            .header("X-Goog-Resource-State")
            .unwrap_or("unknown")
            .to_string();
        let channel_id = request.header("X-Goog-Channel-ID").unwrap_or_default();
        let message_number = request.header("X-Goog-Message-Number").unwrap_or("0");
        let event_type = match state.as_str() {
            "sync" => "calendar.sync",
            "exists" => "calendar.event_changed",
            "not_exists" => "calendar.event_deleted",
            _ => "calendar.notification",
        };
        ParsedEvent {
            event_type: event_type.into(),
            event_data: json!({
                "resource_state": state,
                "resource_id": request.header("X-Goog-Resource-ID"),
                "resource_uri": request.header("X-Goog-Resource-URI"),
                "channel_id": channel_id,
                "message_number": message_number,
            }),
            external_event_id: Some(format!("{channel_id}:{message_number}")),
            timestamp: None,
        }
    }

    fn challenge_response(&self, request: &WebhookRequest) -> Option<ChallengeReply> {
        // The first notification on a new channel is a sync handshake.
        if request.header("X-Goog-Resource-State") == Some("sync") {
            return Some(ChallengeReply::Empty);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{request, trigger};

    #[tokio::test]
    async fn test_verify_token_echo() {
        let connector = GoogleCalendarConnector::new();
        let t = trigger("calendar.event_changed", json!({}));
        let req = request(&[("X-Goog-Channel-Token", &t.verification_token.clone())], b"");
        assert!(connector.verify(&req, &t, &ConnectorAuth::default()).await.is_valid);

        let wrong = request(&[("X-Goog-Channel-Token", "other")], b"");
        assert!(!connector.verify(&wrong, &t, &ConnectorAuth::default()).await.is_valid);
        let missing = request(&[], b"");
        assert!(!connector.verify(&missing, &t, &ConnectorAuth::default()).await.is_valid);
    }

    #[test]
    fn test_sync_is_a_challenge() {
        let connector = GoogleCalendarConnector::new();
        let sync = request(&[("X-Goog-Resource-State", "sync")], b"");
        assert_eq!(connector.challenge_response(&sync), Some(ChallengeReply::Empty));
        let exists = request(&[("X-Goog-Resource-State", "exists")], b"");
        assert!(connector.challenge_response(&exists).is_none());
    }

    #[test]
    fn test_parse_header_payload() {
        let connector = GoogleCalendarConnector::new();
        let req = request(
            &[
                ("X-Goog-Resource-State", "exists"),
                ("X-Goog-Channel-ID", "chan-1"),
                ("X-Goog-Message-Number", "12"),
                ("X-Goog-Resource-ID", "res-9"),
            ],
            b"",
        );
        let event = connector.parse(&req);
        assert_eq!(event.event_type, "calendar.event_changed");
        assert_eq!(event.external_event_id.as_deref(), Some("chan-1:12"));
        assert_eq!(event.event_data["resource_id"], "res-9");
    }

    #[test]
    fn test_calendar_id_default() {
        let t = trigger("calendar.event_changed", json!({}));
        assert_eq!(GoogleCalendarConnector::calendar_id(&t), "primary");
        let custom = trigger("calendar.event_changed", json!({"calendar_id": "team@x.com"}));
        assert_eq!(GoogleCalendarConnector::calendar_id(&custom), "team@x.com");
    }
}
