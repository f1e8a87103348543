//! Microsoft Graph trigger connector (calendar subscriptions).
//!
//! Graph subscriptions expire quickly and are renewed with a PATCH rather
//! than re-registration. Verification is a token echo: every change
//! notification carries the `clientState` supplied at subscription time.
//! New endpoints receive a `validationToken` handshake that must be echoed
//! back as plain text.

use crate::verify::constant_time_eq;
use crate::{
    ChallengeReply, ConnectorAuth, ParsedEvent, RegistrationResult, TriggerConnector,
    VerificationResult, WebhookRequest, admin_client,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{Value, json};
use toolgate_core::types::Trigger;
use tracing::{info, warn};

const GRAPH_API: &str = "https://graph.microsoft.com/v1.0";
/// Graph caps calendar subscriptions at about three days.
const SUBSCRIPTION_LIFETIME_HOURS: i64 = 70;

pub struct MicrosoftCalendarConnector {
    client: reqwest::Client,
}

impl Default for MicrosoftCalendarConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl MicrosoftCalendarConnector {
    pub fn new() -> Self {
        Self {
            client: admin_client(),
        }
    }

    fn resource(trigger: &Trigger) -> &str {
        trigger
            .config
            .get("resource")
            .and_then(Value::as_str)
            .unwrap_or("me/events")
    }

    fn change_type(trigger: &Trigger) -> String {
        if trigger.trigger_type.contains(',')
            || ["created", "updated", "deleted"].contains(&trigger.trigger_type.as_str())
        {
            trigger.trigger_type.clone()
        } else {
            "created,updated,deleted".into()
        }
    }

    fn expiration() -> (DateTime<Utc>, String) {
        let expires_at = Utc::now() + Duration::hours(SUBSCRIPTION_LIFETIME_HOURS);
        let rendered = expires_at.to_rfc3339_opts(SecondsFormat::Millis, true);
        (expires_at, rendered)
    }
}

#[async_trait]
impl TriggerConnector for MicrosoftCalendarConnector {
    fn provider(&self) -> &'static str {
        "microsoft_calendar"
    }

    async fn register(&self, trigger: &Trigger, auth: &ConnectorAuth) -> RegistrationResult {
        let (expires_at, expiration) = Self::expiration();
        let body = json!({
            "changeType": Self::change_type(trigger),
            "notificationUrl": trigger.webhook_url,
            "resource": Self::resource(trigger),
            "expirationDateTime": expiration,
            "clientState": trigger.verification_token,
        });
        let response = self
            .client
            .post(format!("{GRAPH_API}/subscriptions"))
            .bearer_auth(auth.token())
            .json(&body)
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                let payload: Value = response.json().await.unwrap_or_default();
                match payload.get("id").and_then(Value::as_str) {
                    Some(id) => {
                        info!(trigger_id = %trigger.id, subscription_id = id, "created Graph subscription");
                        RegistrationResult::ok(id).with_expires_at(expires_at)
                    }
                    None => RegistrationResult::failed("Graph response carried no subscription id"),
                }
            }
            Ok(response) => {
                let status = response.status();
                warn!(trigger_id = %trigger.id, %status, "Graph subscription creation failed");
                RegistrationResult::failed(format!("Microsoft Graph returned {status}"))
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
            .delete(format!("{GRAPH_API}/subscriptions/{id}"))
            .bearer_auth(auth.token())
            .send()
            .await
        {
            Ok(response) => response.status().is_success() || response.status().as_u16() == 404,
            Err(e) => {
                warn!(trigger_id = %trigger.id, error = %e, "Graph subscription deletion failed");
                false
            }
        }
    }

    /// Graph renewal is an expiration PATCH, not a new subscription.
    async fn renew(&self, trigger: &Trigger, auth: &ConnectorAuth) -> RegistrationResult {
        let Some(id) = trigger.external_webhook_id.as_ref() else {
            return self.register(trigger, auth).await;
        };
        let (expires_at, expiration) = Self::expiration();
        let response = self
            .client
            .patch(format!("{GRAPH_API}/subscriptions/{id}"))
            .bearer_auth(auth.token())
            .json(&json!({"expirationDateTime": expiration}))
            .send()
            .await;
        match response {
            Ok(response) if response.status().is_success() => {
                info!(trigger_id = %trigger.id, subscription_id = %id, "renewed Graph subscription");
                RegistrationResult::ok(id.clone()).with_expires_at(expires_at)
            }
            Ok(response) => {
                RegistrationResult::failed(format!("Microsoft Graph returned {}", response.status()))
            }
            Err(e) => RegistrationResult::failed(e.to_string()),
        }
    }

    async fn verify(
        &self,
        request: &WebhookRequest,
        trigger: &Trigger,
        _auth: &ConnectorAuth,
    ) -> VerificationResult {
        // Endpoint-validation handshakes carry no clientState to check.
        if self.challenge_response(request).is_some() {
            return VerificationResult::valid();
        }
        let Some(payload) = request.json() else {
            return VerificationResult::invalid("body is not JSON");
        };
        let Some(notifications) = payload.get("value").and_then(Value::as_array) else {
            return VerificationResult::invalid("payload carries no notifications");
        };
        for notification in notifications {
            let client_state = notification
                .get("clientState")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if !constant_time_eq(
                client_state.as_bytes(),
                trigger.verification_token.as_bytes(),
            ) {
                return VerificationResult::invalid("clientState mismatch");
            }
        }
        VerificationResult::valid()
    }

    fn parse(&self, request: &WebhookRequest) -> ParsedEvent {
        let payload = request.json().unwrap_or(Value::Null);
        let notification = payload
            .pointer("/value/0")
            .cloned()
            .unwrap_or(payload);
        let change_type = notification
            .get("changeType")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        let resource_id = notification
            .pointer("/resourceData/id")
            .and_then(Value::as_str);
        let subscription_id = notification
            .get("subscriptionId")
            .and_then(Value::as_str)
            .unwrap_or_default();
        ParsedEvent {
            event_type: format!("event.{change_type}"),
            external_event_id: resource_id
                .map(|id| format!("{subscription_id}:{id}:{change_type}")),
            timestamp: notification
                .get("subscriptionExpirationDateTime")
                .and_then(Value::as_str)
                .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| ts.with_timezone(&Utc)),
            event_data: notification,
        }
    }

    fn challenge_response(&self, request: &WebhookRequest) -> Option<ChallengeReply> {
        // Endpoint validation arrives as ?validationToken=... with an empty
        // body and must be echoed verbatim as text.
        if let Some(token) = request.query_param("validationToken") {
            return Some(ChallengeReply::Text(token.to_string()));
        }
        let payload = request.json()?;
        payload
            .get("validationToken")
            .and_then(Value::as_str)
            .map(|token| ChallengeReply::Text(token.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{request, trigger};

    fn notification_body(client_state: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "value": [{
                "subscriptionId": "sub-1",
                "clientState": client_state,
                "changeType": "created",
                "resourceData": {"id": "AAMkAD"}
            }]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_verify_client_state_echo() {
        let connector = MicrosoftCalendarConnector::new();
        let t = trigger("created", json!({}));
        let req = request(&[], &notification_body(&t.verification_token));
        assert!(connector.verify(&req, &t, &ConnectorAuth::default()).await.is_valid);

        let wrong = request(&[], &notification_body("intruder"));
        assert!(!connector.verify(&wrong, &t, &ConnectorAuth::default()).await.is_valid);
    }

    #[test]
    fn test_validation_token_challenge() {
        let connector = MicrosoftCalendarConnector::new();
        // Graph sends the token as a query parameter with an empty body.
        let req = request(&[], b"").with_query(
            [("validationToken".to_string(), "abc 123".to_string())]
                .into_iter()
                .collect(),
        );
        assert_eq!(
            connector.challenge_response(&req),
            Some(ChallengeReply::Text("abc 123".into()))
        );
        let body_fallback = request(&[], br#"{"validationToken":"abc123"}"#);
        assert_eq!(
            connector.challenge_response(&body_fallback),
            Some(ChallengeReply::Text("abc123".into()))
        );
        let normal = request(&[], &notification_body("x"));
        assert!(connector.challenge_response(&normal).is_none());
    }

    #[tokio::test]
    async fn test_validation_handshake_passes_verify() {
        let connector = MicrosoftCalendarConnector::new();
        let t = trigger("created", json!({}));
        let req = request(&[], b"").with_query(
            [("validationToken".to_string(), "tok".to_string())]
                .into_iter()
                .collect(),
        );
        assert!(connector.verify(&req, &t, &ConnectorAuth::default()).await.is_valid);
    }

    #[test]
    fn test_parse_notification() {
        let connector = MicrosoftCalendarConnector::new();
        let req = request(&[], &notification_body("tok"));
        let event = connector.parse(&req);
        assert_eq!(event.event_type, "event.created");
        assert_eq!(
            event.external_event_id.as_deref(),
            Some("sub-1:AAMkAD:created")
        );
    }

    #[test]
    fn test_change_type_defaults() {
        let t = trigger("event.changed", json!({}));
        assert_eq!(
            MicrosoftCalendarConnector::change_type(&t),
            "created,updated,deleted"
        );
        let explicit = trigger("updated", json!({}));
        assert_eq!(MicrosoftCalendarConnector::change_type(&explicit), "updated");
    }
}
