//! Credential brokerage.
//!
//! The broker resolves the credentials a function execution (or webhook
//! registration) should use: stored linked-account credentials, app-level
//! defaults when the account carries none, and transparently refreshed
//! OAuth2 tokens. Callers persist refreshed credentials when `is_updated`
//! is set.

pub mod oauth1;
pub mod oauth2;
pub mod state;

use crate::error::CredentialError;
use crate::types::{
    ApiKeySchemeConfig, App, AppConfiguration, LinkedAccount, OAuth1SchemeConfig,
    OAuth2SchemeConfig, SecurityScheme,
};
use chrono::Utc;
use oauth2::OAuth2Manager;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{info, warn};

/// Refresh this many seconds before the recorded expiry.
const REFRESH_SKEW_SECS: i64 = 60;

// ── Credential payloads ─────────────────────────────────────────────────────

/// Stored OAuth2 credentials for a linked account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2Credentials {
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Unix seconds; absent for long-lived tokens.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Provider-specific extras resolved into `additional_headers` templates.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_token_response: Option<Value>,
}

/// Stored OAuth1 credentials (Trello-style key + token).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth1Credentials {
    pub consumer_key: String,
    pub consumer_secret: String,
    pub oauth_token: String,
    pub oauth_token_secret: String,
}

/// Stored API key credentials.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyCredentials {
    pub secret_key: String,
}

/// No-auth marker credentials.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NoAuthCredentials {}

/// Parsed credentials, one variant per scheme kind.
#[derive(Debug, Clone)]
pub enum ResolvedCredentials {
    OAuth2(OAuth2Credentials),
    OAuth1(OAuth1Credentials),
    ApiKey(ApiKeyCredentials),
    NoAuth(NoAuthCredentials),
}

impl ResolvedCredentials {
    pub fn scheme(&self) -> SecurityScheme {
        match self {
            ResolvedCredentials::OAuth2(_) => SecurityScheme::OAuth2,
            ResolvedCredentials::OAuth1(_) => SecurityScheme::OAuth1,
            ResolvedCredentials::ApiKey(_) => SecurityScheme::ApiKey,
            ResolvedCredentials::NoAuth(_) => SecurityScheme::NoAuth,
        }
    }

    /// Parse opaque credential JSON for the given scheme. A type mismatch is
    /// a hard error.
    pub fn from_value(scheme: SecurityScheme, value: &Value) -> Result<Self, CredentialError> {
        let mismatch = |e: serde_json::Error| CredentialError::SchemeMismatch {
            scheme: scheme.as_str().into(),
            message: e.to_string(),
        };
        match scheme {
            SecurityScheme::OAuth2 => Ok(ResolvedCredentials::OAuth2(
                serde_json::from_value(value.clone()).map_err(mismatch)?,
            )),
            SecurityScheme::OAuth1 => Ok(ResolvedCredentials::OAuth1(
                serde_json::from_value(value.clone()).map_err(mismatch)?,
            )),
            SecurityScheme::ApiKey => Ok(ResolvedCredentials::ApiKey(
                serde_json::from_value(value.clone()).map_err(mismatch)?,
            )),
            SecurityScheme::NoAuth => Ok(ResolvedCredentials::NoAuth(NoAuthCredentials {})),
        }
    }

    /// Serialize back into the opaque JSON the store persists.
    pub fn to_value(&self) -> Value {
        match self {
            ResolvedCredentials::OAuth2(c) => serde_json::to_value(c),
            ResolvedCredentials::OAuth1(c) => serde_json::to_value(c),
            ResolvedCredentials::ApiKey(c) => serde_json::to_value(c),
            ResolvedCredentials::NoAuth(c) => serde_json::to_value(c),
        }
        .unwrap_or(Value::Null)
    }
}

/// Validate that credential JSON matches its declared scheme; used on the
/// linked-account write path.
pub fn validate_credentials(
    scheme: SecurityScheme,
    credentials: &Value,
) -> Result<(), CredentialError> {
    ResolvedCredentials::from_value(scheme, credentials).map(|_| ())
}

/// What the broker hands back to the execution path.
#[derive(Debug, Clone)]
pub struct CredentialsResponse {
    pub scheme: SecurityScheme,
    pub credentials: ResolvedCredentials,
    /// Set when the broker refreshed the credentials; the caller must
    /// persist them.
    pub is_updated: bool,
    pub is_app_default_credentials: bool,
}

// ── Scheme config resolution ────────────────────────────────────────────────

fn merge_overrides<T: Serialize + for<'de> Deserialize<'de>>(
    base: &T,
    overrides: &Value,
    scheme: SecurityScheme,
) -> Result<T, CredentialError> {
    let mut merged = serde_json::to_value(base).map_err(|e| CredentialError::SchemeMismatch {
        scheme: scheme.as_str().into(),
        message: e.to_string(),
    })?;
    if let (Value::Object(target), Value::Object(extra)) = (&mut merged, overrides) {
        for (key, value) in extra {
            target.insert(key.clone(), value.clone());
        }
    }
    serde_json::from_value(merged).map_err(|e| CredentialError::SchemeMismatch {
        scheme: scheme.as_str().into(),
        message: e.to_string(),
    })
}

/// The app's OAuth2 scheme with the project's overrides applied.
pub fn oauth2_scheme_config(
    app: &App,
    configuration: &AppConfiguration,
) -> Result<OAuth2SchemeConfig, CredentialError> {
    let base = app
        .security_schemes
        .oauth2
        .as_ref()
        .ok_or_else(|| CredentialError::MissingScheme {
            app: app.name.clone(),
            scheme: "oauth2".into(),
        })?;
    merge_overrides(base, &configuration.scheme_overrides, SecurityScheme::OAuth2)
}

/// The app's OAuth1 scheme with the project's overrides applied.
pub fn oauth1_scheme_config(
    app: &App,
    configuration: &AppConfiguration,
) -> Result<OAuth1SchemeConfig, CredentialError> {
    let base = app
        .security_schemes
        .oauth1
        .as_ref()
        .ok_or_else(|| CredentialError::MissingScheme {
            app: app.name.clone(),
            scheme: "oauth1".into(),
        })?;
    merge_overrides(base, &configuration.scheme_overrides, SecurityScheme::OAuth1)
}

/// The app's API key scheme with the project's overrides applied.
pub fn api_key_scheme_config(
    app: &App,
    configuration: &AppConfiguration,
) -> Result<ApiKeySchemeConfig, CredentialError> {
    let base = app
        .security_schemes
        .api_key
        .as_ref()
        .ok_or_else(|| CredentialError::MissingScheme {
            app: app.name.clone(),
            scheme: "api_key".into(),
        })?;
    merge_overrides(base, &configuration.scheme_overrides, SecurityScheme::ApiKey)
}

// ── Broker ──────────────────────────────────────────────────────────────────

/// Resolves credentials for a linked account, refreshing OAuth2 tokens
/// transparently.
#[derive(Debug, Default)]
pub struct CredentialBroker {}

impl CredentialBroker {
    pub fn new() -> Self {
        Self {}
    }

    /// Resolve the credentials for an execution against this linked account.
    pub async fn get_credentials(
        &self,
        app: &App,
        configuration: &AppConfiguration,
        linked_account: &LinkedAccount,
    ) -> Result<CredentialsResponse, CredentialError> {
        let scheme = linked_account.security_scheme;

        let mut is_app_default = false;
        let raw = if credentials_empty(&linked_account.security_credentials) {
            match app.default_credentials(scheme) {
                Some(default) => {
                    is_app_default = true;
                    default.clone()
                }
                None if scheme == SecurityScheme::NoAuth => Value::Object(Default::default()),
                None => {
                    return Err(CredentialError::NoDefaultCredentials {
                        app: app.name.clone(),
                        scheme: scheme.as_str().into(),
                    });
                }
            }
        } else {
            linked_account.security_credentials.clone()
        };

        let credentials = ResolvedCredentials::from_value(scheme, &raw)?;

        match credentials {
            ResolvedCredentials::OAuth2(oauth2) if needs_refresh(&oauth2) => {
                // App-default credentials are shared; refreshing them through
                // one account's broker call would clobber the rest.
                if is_app_default {
                    warn!(
                        app = %app.name,
                        "app-default OAuth2 credentials are expiring and cannot be refreshed per account"
                    );
                    return Ok(CredentialsResponse {
                        scheme,
                        credentials: ResolvedCredentials::OAuth2(oauth2),
                        is_updated: false,
                        is_app_default_credentials: true,
                    });
                }
                let refreshed = self.refresh_oauth2(app, configuration, oauth2).await?;
                Ok(CredentialsResponse {
                    scheme,
                    credentials: ResolvedCredentials::OAuth2(refreshed),
                    is_updated: true,
                    is_app_default_credentials: false,
                })
            }
            credentials => Ok(CredentialsResponse {
                scheme,
                credentials,
                is_updated: false,
                is_app_default_credentials: is_app_default,
            }),
        }
    }

    async fn refresh_oauth2(
        &self,
        app: &App,
        configuration: &AppConfiguration,
        mut credentials: OAuth2Credentials,
    ) -> Result<OAuth2Credentials, CredentialError> {
        let refresh_token =
            credentials
                .refresh_token
                .clone()
                .ok_or_else(|| CredentialError::OAuth2 {
                    message: "access token expired and no refresh token is stored".into(),
                })?;

        let scheme_config = oauth2_scheme_config(app, configuration)?;
        let manager = OAuth2Manager::new(app.name.clone(), scheme_config);
        let token = manager.refresh_token(&refresh_token).await?;

        let parsed = manager.parse_token_response(&token)?;
        credentials.access_token = parsed.access_token;
        credentials.token_type = parsed.token_type.or(credentials.token_type);
        credentials.expires_at = parsed.expires_at;
        if parsed.refresh_token.is_some() {
            credentials.refresh_token = parsed.refresh_token;
        }
        credentials.raw_token_response = Some(token);

        info!(app = %app.name, "refreshed OAuth2 access token");
        Ok(credentials)
    }
}

fn credentials_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

fn needs_refresh(credentials: &OAuth2Credentials) -> bool {
    match credentials.expires_at {
        Some(expires_at) => Utc::now().timestamp() >= expires_at - REFRESH_SKEW_SECS,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn oauth2_credentials(expires_at: Option<i64>) -> OAuth2Credentials {
        OAuth2Credentials {
            client_id: "cid".into(),
            client_secret: "cs".into(),
            scope: "email".into(),
            access_token: "tok".into(),
            token_type: Some("Bearer".into()),
            expires_at,
            refresh_token: Some("refresh".into()),
            metadata: HashMap::new(),
            raw_token_response: None,
        }
    }

    #[test]
    fn test_needs_refresh_with_skew() {
        let now = Utc::now().timestamp();
        assert!(needs_refresh(&oauth2_credentials(Some(now - 1))));
        assert!(needs_refresh(&oauth2_credentials(Some(now + 30))));
        assert!(!needs_refresh(&oauth2_credentials(Some(now + 3600))));
        assert!(!needs_refresh(&oauth2_credentials(None)));
    }

    #[test]
    fn test_from_value_scheme_mismatch_is_hard_error() {
        let api_key_json = json!({"secret_key": "sk"});
        assert!(ResolvedCredentials::from_value(SecurityScheme::ApiKey, &api_key_json).is_ok());
        let err =
            ResolvedCredentials::from_value(SecurityScheme::OAuth2, &api_key_json).unwrap_err();
        assert!(matches!(err, CredentialError::SchemeMismatch { .. }));
    }

    #[test]
    fn test_validate_credentials_write_path() {
        assert!(validate_credentials(SecurityScheme::NoAuth, &json!({})).is_ok());
        assert!(
            validate_credentials(SecurityScheme::OAuth1, &json!({"consumer_key": "k"})).is_err()
        );
    }

    #[test]
    fn test_credentials_roundtrip_via_value() {
        let original = ResolvedCredentials::OAuth2(oauth2_credentials(Some(42)));
        let value = original.to_value();
        let parsed = ResolvedCredentials::from_value(SecurityScheme::OAuth2, &value).unwrap();
        match parsed {
            ResolvedCredentials::OAuth2(c) => {
                assert_eq!(c.access_token, "tok");
                assert_eq!(c.expires_at, Some(42));
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn test_merge_overrides_shallow() {
        let base = OAuth2SchemeConfig {
            client_id: "app-cid".into(),
            client_secret: "app-secret".into(),
            scope: "email".into(),
            authorize_url: "https://a".into(),
            access_token_url: "https://t".into(),
            refresh_token_url: "https://t".into(),
            token_endpoint_auth_method: None,
            location: crate::types::HttpLocation::Header,
            name: "Authorization".into(),
            prefix: Some("Bearer".into()),
            additional_headers: None,
            redirect_url: None,
        };
        let merged = merge_overrides(
            &base,
            &json!({"client_id": "project-cid"}),
            SecurityScheme::OAuth2,
        )
        .unwrap();
        assert_eq!(merged.client_id, "project-cid");
        assert_eq!(merged.client_secret, "app-secret");
    }

    #[test]
    fn test_credentials_empty() {
        assert!(credentials_empty(&Value::Null));
        assert!(credentials_empty(&json!({})));
        assert!(!credentials_empty(&json!({"secret_key": "x"})));
    }
}
