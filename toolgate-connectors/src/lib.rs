//! # ToolGate Connectors
//!
//! Per-provider trigger connectors. Each third-party service implements the
//! [`TriggerConnector`] trait: webhook registration against the provider's
//! admin API, request verification (HMAC families, OIDC JWT, token echo),
//! and normalization of incoming payloads. Connectors are selected by app
//! name through the [`ConnectorRegistry`].

pub mod verify;

mod github;
mod gmail;
mod google_calendar;
mod hubspot;
mod linear;
mod microsoft;
mod notion;
mod shopify;
mod slack;
mod stripe;

pub use github::GitHubConnector;
pub use gmail::GmailConnector;
pub use google_calendar::GoogleCalendarConnector;
pub use hubspot::HubSpotConnector;
pub use linear::LinearConnector;
pub use microsoft::MicrosoftCalendarConnector;
pub use notion::NotionConnector;
pub use shopify::ShopifyConnector;
pub use slack::SlackConnector;
pub use stripe::StripeConnector;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use toolgate_core::types::Trigger;

/// An incoming webhook request, as connectors see it: method, path, headers,
/// query parameters, and the raw body bytes the signature covers.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub method: String,
    pub path: String,
    /// Header names lowercased on construction.
    pub headers: HashMap<String, String>,
    /// Decoded query parameters (Microsoft's validation handshake arrives
    /// here).
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn new(
        method: impl Into<String>,
        path: impl Into<String>,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect(),
            query: HashMap::new(),
            body,
        }
    }

    pub fn with_query(mut self, query: HashMap<String, String>) -> Self {
        self.query = query;
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query.get(name).map(String::as_str)
    }

    /// Parse the body as JSON.
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }
}

/// Credentials and provider settings a connector operates with.
#[derive(Debug, Clone, Default)]
pub struct ConnectorAuth {
    /// OAuth2 access token or API key used for provider admin calls.
    pub access_token: Option<String>,
    /// Provider app secret used for signature verification (Shopify client
    /// secret, Slack signing secret, HubSpot app secret).
    pub app_secret: Option<String>,
    /// Extra provider-specific values (e.g. Shopify shop domain).
    pub metadata: HashMap<String, String>,
}

impl ConnectorAuth {
    pub fn with_access_token(token: impl Into<String>) -> Self {
        Self {
            access_token: Some(token.into()),
            ..Default::default()
        }
    }

    pub(crate) fn token(&self) -> &str {
        self.access_token.as_deref().unwrap_or_default()
    }
}

/// Result of registering (or renewing) a webhook with a provider.
#[derive(Debug, Clone, Default)]
pub struct RegistrationResult {
    pub success: bool,
    pub external_webhook_id: Option<String>,
    pub webhook_url: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    /// Provider-returned values worth persisting into the trigger config
    /// (e.g. a Stripe endpoint signing secret).
    pub metadata: Option<Value>,
    pub error_message: Option<String>,
    /// Set when the provider has no registration API; carries setup
    /// instructions to surface to the user. Not an error.
    pub manual_setup: Option<String>,
}

impl RegistrationResult {
    pub fn ok(external_webhook_id: impl Into<String>) -> Self {
        Self {
            success: true,
            external_webhook_id: Some(external_webhook_id.into()),
            ..Default::default()
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn manual(instructions: impl Into<String>) -> Self {
        Self {
            success: true,
            manual_setup: Some(instructions.into()),
            ..Default::default()
        }
    }

    pub fn with_expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// Result of verifying an incoming webhook. Signature and replay-window
/// failures carry the same outward shape; the detail stays in logs.
#[derive(Debug, Clone)]
pub struct VerificationResult {
    pub is_valid: bool,
    pub error_message: Option<String>,
}

impl VerificationResult {
    pub fn valid() -> Self {
        Self {
            is_valid: true,
            error_message: None,
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self {
            is_valid: false,
            error_message: Some(message.into()),
        }
    }
}

/// A webhook payload normalized into the gateway's event shape.
#[derive(Debug, Clone)]
pub struct ParsedEvent {
    pub event_type: String,
    pub event_data: Value,
    /// Provider event id for deduplication, when the provider supplies one.
    pub external_event_id: Option<String>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// A provider URL-verification handshake, echoed verbatim and not enqueued.
#[derive(Debug, Clone, PartialEq)]
pub enum ChallengeReply {
    Json(Value),
    Text(String),
    Empty,
}

/// One provider's webhook integration.
#[async_trait]
pub trait TriggerConnector: Send + Sync {
    /// URL path segment and registry label (e.g. "github").
    fn provider(&self) -> &'static str;

    /// Create the remote subscription.
    async fn register(&self, trigger: &Trigger, auth: &ConnectorAuth) -> RegistrationResult;

    /// Idempotently delete the remote subscription.
    async fn unregister(&self, trigger: &Trigger, auth: &ConnectorAuth) -> bool;

    /// Verify an incoming request. Must use timing-safe comparison.
    async fn verify(
        &self,
        request: &WebhookRequest,
        trigger: &Trigger,
        auth: &ConnectorAuth,
    ) -> VerificationResult;

    /// Normalize a verified request into the gateway event shape.
    fn parse(&self, request: &WebhookRequest) -> ParsedEvent;

    /// Renew an expiring subscription. Providers with an explicit refresh
    /// call override this.
    async fn renew(&self, trigger: &Trigger, auth: &ConnectorAuth) -> RegistrationResult {
        self.register(trigger, auth).await
    }

    /// URL-verification special case (Slack `url_verification`, Microsoft
    /// `validationToken`, Google Calendar `sync`). `None` for normal events.
    fn challenge_response(&self, _request: &WebhookRequest) -> Option<ChallengeReply> {
        None
    }
}

/// Connector selection by app name.
#[derive(Default)]
pub struct ConnectorRegistry {
    connectors: HashMap<String, Arc<dyn TriggerConnector>>,
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in provider connector registered.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("GITHUB", Arc::new(GitHubConnector::new()));
        registry.register("GMAIL", Arc::new(GmailConnector::new()));
        registry.register("GOOGLE_CALENDAR", Arc::new(GoogleCalendarConnector::new()));
        registry.register("HUBSPOT", Arc::new(HubSpotConnector::new()));
        registry.register("LINEAR", Arc::new(LinearConnector::new()));
        registry.register("MICROSOFT_CALENDAR", Arc::new(MicrosoftCalendarConnector::new()));
        registry.register("NOTION", Arc::new(NotionConnector::new()));
        registry.register("SHOPIFY", Arc::new(ShopifyConnector::new()));
        registry.register("SLACK", Arc::new(SlackConnector::new()));
        registry.register("STRIPE", Arc::new(StripeConnector::new()));
        registry
    }

    pub fn register(&mut self, app_name: &str, connector: Arc<dyn TriggerConnector>) {
        self.connectors.insert(app_name.to_string(), connector);
    }

    /// Look up by app name (e.g. "GITHUB").
    pub fn get(&self, app_name: &str) -> Option<Arc<dyn TriggerConnector>> {
        self.connectors.get(app_name).cloned()
    }

    /// Look up by the provider path segment (e.g. "github").
    pub fn get_by_provider(&self, provider: &str) -> Option<Arc<dyn TriggerConnector>> {
        self.connectors
            .values()
            .find(|c| c.provider() == provider)
            .cloned()
    }

    pub fn provider_names(&self) -> Vec<&str> {
        self.connectors.keys().map(String::as_str).collect()
    }
}

/// Shared HTTP client for provider admin APIs (30 s overall timeout).
pub(crate) fn admin_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .unwrap_or_default()
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use serde_json::json;
    use uuid::Uuid;

    pub fn trigger(trigger_type: &str, config: Value) -> Trigger {
        Trigger {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
            linked_account_id: Uuid::new_v4(),
            trigger_name: "test".into(),
            trigger_type: trigger_type.into(),
            webhook_url: "https://gw.example.com/v1/webhooks/test/abc".into(),
            external_webhook_id: None,
            verification_token: "0123456789abcdef0123456789abcdef".into(),
            config,
            status: toolgate_core::types::TriggerStatus::Active,
            last_triggered_at: None,
            expires_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn request(headers: &[(&str, &str)], body: &[u8]) -> WebhookRequest {
        WebhookRequest::new(
            "POST",
            "/v1/webhooks/test/abc",
            headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            body.to_vec(),
        )
    }

    #[test]
    fn test_registry_lookup() {
        let registry = ConnectorRegistry::with_defaults();
        assert!(registry.get("GITHUB").is_some());
        assert!(registry.get("UNKNOWN").is_none());
        assert_eq!(
            registry.get_by_provider("shopify").unwrap().provider(),
            "shopify"
        );
        assert_eq!(registry.provider_names().len(), 10);
    }

    #[test]
    fn test_webhook_request_header_lookup() {
        let req = request(&[("X-Hub-Signature-256", "sha256=ff")], b"{}");
        assert_eq!(req.header("x-hub-signature-256"), Some("sha256=ff"));
        assert_eq!(req.header("X-HUB-SIGNATURE-256"), Some("sha256=ff"));
        assert!(req.header("missing").is_none());
        assert_eq!(req.json(), Some(json!({})));
    }

    #[test]
    fn test_registration_result_builders() {
        let ok = RegistrationResult::ok("hook-1").with_metadata(json!({"k": "v"}));
        assert!(ok.success && ok.manual_setup.is_none());
        let manual = RegistrationResult::manual("configure in dashboard");
        assert!(manual.success && manual.manual_setup.is_some());
        let failed = RegistrationResult::failed("boom");
        assert!(!failed.success);
    }
}
