//! Webhook receiver: `POST /v1/webhooks/{provider}/{trigger_id}`.
//!
//! Rate-limit, resolve, verify, answer URL-verification challenges, parse,
//! dedupe, persist, enqueue. Signature and replay-window failures share one
//! opaque 401; responses are JSON `{status, duplicate?, detail?}`.

use crate::error::ApiError;
use crate::queue::NormalizedEvent;
use crate::state::SharedState;
use crate::triggers::{resolve_connector_auth, touch_last_triggered, trigger_context};
use axum::Json;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::collections::HashMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use toolgate_connectors::{ChallengeReply, ConnectorAuth, WebhookRequest};
use toolgate_core::error::StoreError;
use toolgate_core::types::Trigger;
use tracing::{info, warn};
use uuid::Uuid;

/// The webhook source address: first X-Forwarded-For hop, falling back to
/// the socket peer.
pub struct ClientIp(pub String);

impl<S> FromRequestParts<S> for ClientIp
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let socket_ip = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);
        Ok(ClientIp(remote_ip(&parts.headers, socket_ip)))
    }
}

/// POST /v1/webhooks/{provider}/{trigger_id}
pub async fn receive_webhook(
    State(state): State<SharedState>,
    Path((provider, trigger_id)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    ClientIp(remote_ip): ClientIp,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Global admission by source IP, then per-trigger.
    let (allowed, info) = state.global_limiter.allow(&remote_ip, 1.0);
    if !allowed {
        state
            .metrics
            .increment_counter("webhooks_rate_limited", 1.0, &[("scope", "global")]);
        return ApiError::RateLimited {
            retry_after_secs: info.retry_after_secs,
        }
        .into_response();
    }
    let (allowed, info) = state.trigger_limiter.allow(&trigger_id, 1.0);
    if !allowed {
        state
            .metrics
            .increment_counter("webhooks_rate_limited", 1.0, &[("scope", "trigger")]);
        return ApiError::RateLimited {
            retry_after_secs: info.retry_after_secs,
        }
        .into_response();
    }

    // The body is already drained; an unknown trigger can 404 without
    // provoking provider retry storms.
    let Ok(trigger_uuid) = Uuid::parse_str(&trigger_id) else {
        return not_found();
    };
    let trigger = match state.store.get_trigger(trigger_uuid) {
        Ok(Some(trigger)) => trigger,
        Ok(None) => return not_found(),
        Err(e) => return ApiError::from(e).into_response(),
    };
    let Some(connector) = state.connectors.get_by_provider(&provider) else {
        return not_found();
    };

    let request = WebhookRequest::new(
        "POST",
        format!("/v1/webhooks/{provider}/{trigger_id}"),
        header_map(&headers),
        body.to_vec(),
    )
    .with_query(query);

    // Verification secrets come from the trigger's linked account; a
    // broken linkage still lets token-based verifiers run.
    let auth = match trigger_context(&state, &trigger) {
        Ok((app, configuration, linked_account)) => {
            match resolve_connector_auth(&state, &app, &configuration, &linked_account, false).await
            {
                Ok(auth) => auth,
                Err(_) => ConnectorAuth::default(),
            }
        }
        Err(_) => ConnectorAuth::default(),
    };

    let verification = connector.verify(&request, &trigger, &auth).await;
    if !verification.is_valid {
        // The reason (signature vs replay window) stays in the log.
        warn!(
            handler = "receive_webhook",
            provider = %provider,
            trigger_id = %trigger_id,
            reason = verification.error_message.as_deref().unwrap_or("unknown"),
            "webhook_verification_failed"
        );
        state
            .metrics
            .increment_counter("webhook_verification_failures", 1.0, &[("provider", provider.as_str())]);
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"status": "error", "detail": "verification failed"})),
        )
            .into_response();
    }

    // URL-verification handshakes echo the provider's token and are never
    // enqueued.
    if let Some(challenge) = connector.challenge_response(&request) {
        info!(provider = %provider, trigger_id = %trigger_id, "answered URL verification challenge");
        return match challenge {
            ChallengeReply::Json(value) => Json(value).into_response(),
            ChallengeReply::Text(text) => (StatusCode::OK, text).into_response(),
            ChallengeReply::Empty => StatusCode::OK.into_response(),
        };
    }

    let event = connector.parse(&request);

    // Dedup by (trigger, external event id).
    if let Some(external_event_id) = &event.external_event_id {
        match state
            .store
            .check_duplicate_event(trigger.id, external_event_id)
        {
            Ok(true) => {
                info!(provider = %provider, external_event_id, "duplicate webhook event");
                return Json(json!({"status": "ok", "duplicate": true})).into_response();
            }
            Ok(false) => {}
            Err(e) => return ApiError::from(e).into_response(),
        }
    }

    let stored = match state.store.create_trigger_event(
        trigger.id,
        &event.event_type,
        event.event_data.clone(),
        event.external_event_id.as_deref(),
    ) {
        Ok(stored) => stored,
        // A racing duplicate insert is still a duplicate.
        Err(StoreError::AlreadyExists { .. }) => {
            return Json(json!({"status": "ok", "duplicate": true})).into_response();
        }
        Err(e) => return ApiError::from(e).into_response(),
    };
    touch_last_triggered(&state, &trigger);

    // Enqueue failure leaves the event PENDING for the redelivery loop.
    let enqueued = state.queue.enqueue(NormalizedEvent {
        provider: provider.clone(),
        event_type: event.event_type.clone(),
        subject_id: trigger.id,
        event_id: stored.id,
        timestamp: event.timestamp.unwrap_or(stored.received_at),
        data: event.event_data,
    });
    if enqueued.is_err() {
        warn!(event_id = %stored.id, "event queue unavailable, leaving event PENDING");
    }

    state
        .metrics
        .increment_counter("webhooks_received", 1.0, &[("provider", provider.as_str())]);
    log_received(&provider, &trigger, &event.event_type);

    Json(json!({"status": "ok"})).into_response()
}

fn log_received(provider: &str, trigger: &Trigger, event_type: &str) {
    info!(
        handler = "receive_webhook",
        provider,
        trigger_id = %trigger.id,
        project_id = %trigger.project_id,
        event_type,
        "webhook event persisted"
    );
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"status": "error", "detail": "unknown trigger"})),
    )
        .into_response()
}

/// Prefer the first X-Forwarded-For hop; fall back to the socket address.
fn remote_ip(headers: &HeaderMap, connect_info: Option<SocketAddr>) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .or_else(|| connect_info.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".into())
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_remote_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.9, 10.0.0.1"),
        );
        let socket = "192.0.2.1:443".parse().unwrap();
        assert_eq!(remote_ip(&headers, Some(socket)), "203.0.113.9");
        assert_eq!(remote_ip(&HeaderMap::new(), Some(socket)), "192.0.2.1");
        assert_eq!(remote_ip(&HeaderMap::new(), None), "unknown");
    }
}
