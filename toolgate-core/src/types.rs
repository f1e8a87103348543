//! Entity types shared across the gateway.
//!
//! These mirror the rows the catalog store persists: apps, functions,
//! projects, agents, app configurations, linked accounts, triggers,
//! trigger events, OAuth1 temp tokens, and search feedback.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

// ── Enums ───────────────────────────────────────────────────────────────────

/// Visibility of an app or function. PUBLIC is exposed to any project,
/// PRIVATE is restricted to the owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "PUBLIC",
            Visibility::Private => "PRIVATE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PUBLIC" => Some(Visibility::Public),
            "PRIVATE" => Some(Visibility::Private),
            _ => None,
        }
    }
}

/// The authentication scheme an app supports / a linked account uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityScheme {
    OAuth2,
    OAuth1,
    ApiKey,
    NoAuth,
}

impl SecurityScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityScheme::OAuth2 => "oauth2",
            SecurityScheme::OAuth1 => "oauth1",
            SecurityScheme::ApiKey => "api_key",
            SecurityScheme::NoAuth => "no_auth",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "oauth2" => Some(SecurityScheme::OAuth2),
            "oauth1" => Some(SecurityScheme::OAuth1),
            "api_key" => Some(SecurityScheme::ApiKey),
            "no_auth" => Some(SecurityScheme::NoAuth),
            _ => None,
        }
    }
}

impl std::fmt::Display for SecurityScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an injected credential lands in the outgoing request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HttpLocation {
    Header,
    Query,
    Body,
    Cookie,
}

/// Wire protocol of a function. Only REST is currently implemented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Rest,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Rest => "rest",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "rest" => Some(Protocol::Rest),
            _ => None,
        }
    }
}

/// Lifecycle state of a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerStatus {
    Active,
    Paused,
    Error,
    Expired,
}

impl TriggerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerStatus::Active => "ACTIVE",
            TriggerStatus::Paused => "PAUSED",
            TriggerStatus::Error => "ERROR",
            TriggerStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ACTIVE" => Some(TriggerStatus::Active),
            "PAUSED" => Some(TriggerStatus::Paused),
            "ERROR" => Some(TriggerStatus::Error),
            "EXPIRED" => Some(TriggerStatus::Expired),
            _ => None,
        }
    }
}

/// Lifecycle state of a received trigger event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerEventStatus {
    Pending,
    Delivered,
    Failed,
    Expired,
}

impl TriggerEventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerEventStatus::Pending => "PENDING",
            TriggerEventStatus::Delivered => "DELIVERED",
            TriggerEventStatus::Failed => "FAILED",
            TriggerEventStatus::Expired => "EXPIRED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TriggerEventStatus::Pending),
            "DELIVERED" => Some(TriggerEventStatus::Delivered),
            "FAILED" => Some(TriggerEventStatus::Failed),
            "EXPIRED" => Some(TriggerEventStatus::Expired),
            _ => None,
        }
    }
}

/// How a piece of search feedback was produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackType {
    Explicit,
    ImplicitSelection,
    ImplicitExecution,
}

impl FeedbackType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FeedbackType::Explicit => "explicit",
            FeedbackType::ImplicitSelection => "implicit_selection",
            FeedbackType::ImplicitExecution => "implicit_execution",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "explicit" => Some(FeedbackType::Explicit),
            "implicit_selection" => Some(FeedbackType::ImplicitSelection),
            "implicit_execution" => Some(FeedbackType::ImplicitExecution),
            _ => None,
        }
    }
}

/// Rendering format for a function definition handed to an LLM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionDefinitionFormat {
    Basic,
    #[default]
    Openai,
    OpenaiResponses,
    Anthropic,
}

// ── Security scheme configurations ──────────────────────────────────────────

/// OAuth 2.0 scheme configuration from an app manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2SchemeConfig {
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    pub authorize_url: String,
    pub access_token_url: String,
    pub refresh_token_url: String,
    /// client_secret_basic (default) | client_secret_post | none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_endpoint_auth_method: Option<String>,
    pub location: HttpLocation,
    /// Name of the header/query/body/cookie entry the token is injected as.
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    /// Extra headers whose values are `{{key}}` templates resolved from
    /// credential metadata.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub additional_headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

/// OAuth 1.0a scheme configuration from an app manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth1SchemeConfig {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub request_token_url: String,
    pub authorize_url: String,
    pub access_token_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// API key scheme configuration from an app manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeySchemeConfig {
    pub location: HttpLocation,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// No-auth scheme marker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoAuthSchemeConfig {}

/// The set of security schemes an app supports, keyed by scheme kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecuritySchemes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth2: Option<OAuth2SchemeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth1: Option<OAuth1SchemeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<ApiKeySchemeConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub no_auth: Option<NoAuthSchemeConfig>,
}

impl SecuritySchemes {
    /// Whether the app supports the given scheme kind.
    pub fn supports(&self, scheme: SecurityScheme) -> bool {
        match scheme {
            SecurityScheme::OAuth2 => self.oauth2.is_some(),
            SecurityScheme::OAuth1 => self.oauth1.is_some(),
            SecurityScheme::ApiKey => self.api_key.is_some(),
            SecurityScheme::NoAuth => self.no_auth.is_some(),
        }
    }
}

// ── Entities ────────────────────────────────────────────────────────────────

/// Integration manifest for a third-party service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: Uuid,
    /// Unique UPPER_SNAKE name, immutable after creation.
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub provider: String,
    pub categories: Vec<String>,
    pub visibility: Visibility,
    pub active: bool,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub security_schemes: SecuritySchemes,
    /// Default credentials the gateway substitutes when a linked account
    /// carries none, keyed by scheme kind.
    #[serde(default)]
    pub default_security_credentials: HashMap<SecurityScheme, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl App {
    /// Default credentials for the given scheme, if the app provides any.
    pub fn default_credentials(&self, scheme: SecurityScheme) -> Option<&Value> {
        self.default_security_credentials.get(&scheme)
    }
}

/// A single invocable operation on an app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Function {
    pub id: Uuid,
    pub app_id: Uuid,
    /// Unique name of the form `<APP>__<ACTION>`; the prefix must match the
    /// owning app's name.
    pub name: String,
    pub description: String,
    /// JSON-Schema whose top-level properties are drawn from
    /// {path, query, header, cookie, body}.
    pub parameters: Value,
    pub protocol: Protocol,
    /// Protocol-specific call description (REST: server_url/path/method/headers).
    pub protocol_data: Value,
    pub visibility: Visibility,
    pub active: bool,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Function {
    /// The owning app's name, parsed from the `<APP>__<ACTION>` form.
    pub fn app_name(&self) -> &str {
        self.name.split_once("__").map(|(app, _)| app).unwrap_or(&self.name)
    }

    /// The action part of the name, without the app prefix.
    pub fn short_name(&self) -> &str {
        self.name.split_once("__").map(|(_, action)| action).unwrap_or(&self.name)
    }
}

/// A tenant project owned by an organization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub visibility_access: Visibility,
    pub created_at: DateTime<Utc>,
}

/// An agent within a project, authenticated by API key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    #[serde(skip_serializing)]
    pub api_key: String,
    pub allowed_apps: Vec<String>,
    /// Per-function instruction strings consulted before execution.
    pub custom_instructions: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

/// A project's configuration of an app (scheme choice, overrides, enablement).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfiguration {
    pub id: Uuid,
    pub project_id: Uuid,
    pub app_id: Uuid,
    pub security_scheme: SecurityScheme,
    pub enabled: bool,
    /// JSON object shallow-merged onto the app's scheme config
    /// (e.g. a project-supplied client_id/client_secret).
    pub scheme_overrides: Value,
    pub created_at: DateTime<Utc>,
}

/// A (project, app, external user) tuple carrying credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedAccount {
    pub id: Uuid,
    pub project_id: Uuid,
    pub app_id: Uuid,
    /// Opaque external user id supplied by the client.
    pub linked_account_owner_id: String,
    pub security_scheme: SecurityScheme,
    /// Opaque credential JSON; the broker parses it per scheme.
    #[serde(skip_serializing)]
    pub security_credentials: Value,
    pub enabled: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A subscription binding a linked account to a provider webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trigger {
    pub id: Uuid,
    pub project_id: Uuid,
    pub app_id: Uuid,
    pub linked_account_id: Uuid,
    pub trigger_name: String,
    /// Provider-specific subscription topic (e.g. "orders/create").
    pub trigger_type: String,
    pub webhook_url: String,
    pub external_webhook_id: Option<String>,
    /// High-entropy secret used for webhook verification. Never exposed in
    /// list responses.
    #[serde(skip_serializing)]
    pub verification_token: String,
    pub config: Value,
    pub status: TriggerStatus,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Trigger {
    /// Registration retry count, tracked inside `config`.
    pub fn retry_count(&self) -> u32 {
        self.config
            .get("retry_count")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32
    }
}

/// Normalized record of a received webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerEvent {
    pub id: Uuid,
    pub trigger_id: Uuid,
    pub event_type: String,
    pub event_data: Value,
    /// Provider event id used for deduplication when present.
    pub external_event_id: Option<String>,
    pub status: TriggerEventStatus,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub error_message: Option<String>,
}

/// Temporary token bridging the two halves of an OAuth 1.0a flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth1TempToken {
    pub oauth_token: String,
    pub state_jwt: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Feedback on function search quality, explicit or implicit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSearchFeedback {
    pub id: Uuid,
    pub agent_id: Uuid,
    pub project_id: Uuid,
    pub intent: Option<String>,
    pub returned_function_names: Vec<String>,
    pub selected_function_name: Option<String>,
    pub was_helpful: bool,
    pub feedback_type: FeedbackType,
    pub feedback_comment: Option<String>,
    pub search_metadata: Value,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_name_parts() {
        let f = Function {
            id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
            name: "GMAIL__SEND_EMAIL".into(),
            description: "Send an email".into(),
            parameters: serde_json::json!({}),
            protocol: Protocol::Rest,
            protocol_data: serde_json::json!({}),
            visibility: Visibility::Public,
            active: true,
            embedding: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(f.app_name(), "GMAIL");
        assert_eq!(f.short_name(), "SEND_EMAIL");
    }

    #[test]
    fn test_enum_roundtrips() {
        for s in ["oauth2", "oauth1", "api_key", "no_auth"] {
            assert_eq!(SecurityScheme::parse(s).unwrap().as_str(), s);
        }
        for s in ["ACTIVE", "PAUSED", "ERROR", "EXPIRED"] {
            assert_eq!(TriggerStatus::parse(s).unwrap().as_str(), s);
        }
        for s in ["PENDING", "DELIVERED", "FAILED", "EXPIRED"] {
            assert_eq!(TriggerEventStatus::parse(s).unwrap().as_str(), s);
        }
        assert!(TriggerStatus::parse("active").is_none());
    }

    #[test]
    fn test_security_schemes_supports() {
        let schemes = SecuritySchemes {
            api_key: Some(ApiKeySchemeConfig {
                location: HttpLocation::Header,
                name: "X-Api-Key".into(),
                prefix: None,
            }),
            ..Default::default()
        };
        assert!(schemes.supports(SecurityScheme::ApiKey));
        assert!(!schemes.supports(SecurityScheme::OAuth2));
    }

    #[test]
    fn test_trigger_retry_count_default() {
        let trigger = Trigger {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
            linked_account_id: Uuid::new_v4(),
            trigger_name: "orders".into(),
            trigger_type: "orders/create".into(),
            webhook_url: "https://gw.example.com/v1/webhooks/shopify/x".into(),
            external_webhook_id: None,
            verification_token: "tok".into(),
            config: serde_json::json!({}),
            status: TriggerStatus::Active,
            last_triggered_at: None,
            expires_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(trigger.retry_count(), 0);

        let mut with_count = trigger.clone();
        with_count.config = serde_json::json!({"retry_count": 2});
        assert_eq!(with_count.retry_count(), 2);
    }

    #[test]
    fn test_scheme_config_serde() {
        let json = serde_json::json!({
            "oauth2": {
                "client_id": "cid",
                "client_secret": "secret",
                "scope": "email.read",
                "authorize_url": "https://example.com/authorize",
                "access_token_url": "https://example.com/token",
                "refresh_token_url": "https://example.com/token",
                "location": "header",
                "name": "Authorization",
                "prefix": "Bearer"
            }
        });
        let schemes: SecuritySchemes = serde_json::from_value(json).unwrap();
        let oauth2 = schemes.oauth2.unwrap();
        assert_eq!(oauth2.location, HttpLocation::Header);
        assert_eq!(oauth2.prefix.as_deref(), Some("Bearer"));
        assert!(oauth2.token_endpoint_auth_method.is_none());
    }
}
