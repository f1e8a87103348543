//! OAuth 2.0 manager — authorization URL construction (PKCE by default),
//! code exchange, and token refresh.
//!
//! Provider deviations from the standard flow are data, not scattered
//! branches: `quirks_for` returns the per-app flags the manager consults.

use super::OAuth2Credentials;
use crate::error::CredentialError;
use crate::types::OAuth2SchemeConfig;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use rand::Rng;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};

/// Per-app deviations from the standard authorization-code flow.
#[derive(Debug, Clone)]
pub struct OAuth2Quirks {
    pub use_pkce: bool,
    pub include_scope_in_token_exchange: bool,
    /// Send `access_type=offline&prompt=consent` on the authorization URL.
    pub request_offline_access: bool,
    pub extra_auth_params: &'static [(&'static str, &'static str)],
    pub grant_type_override: Option<&'static str>,
    pub rewrite_authorization_url: bool,
}

impl Default for OAuth2Quirks {
    fn default() -> Self {
        Self {
            use_pkce: true,
            include_scope_in_token_exchange: true,
            request_offline_access: true,
            extra_auth_params: &[],
            grant_type_override: None,
            rewrite_authorization_url: false,
        }
    }
}

/// Quirk table keyed by app name.
pub fn quirks_for(app_name: &str) -> OAuth2Quirks {
    match app_name {
        // No PKCE at all, and an explicit grant_type on exchange.
        "LINKEDIN" => OAuth2Quirks {
            use_pkce: false,
            include_scope_in_token_exchange: false,
            request_offline_access: false,
            grant_type_override: Some("authorization_code"),
            ..Default::default()
        },
        // PKCE, but no offline-access parameters.
        "X" => OAuth2Quirks {
            request_offline_access: false,
            ..Default::default()
        },
        "REDDIT" => OAuth2Quirks {
            extra_auth_params: &[("duration", "permanent")],
            ..Default::default()
        },
        // Microsoft Graph family and Zoho accept PKCE but reject scope in
        // the token exchange.
        "MICROSOFT_OUTLOOK" | "MICROSOFT_ONEDRIVE" | "MICROSOFT_TEAMS" | "MICROSOFT_CALENDAR"
        | "SHARE_POINT" | "ZOHO_DESK" => OAuth2Quirks {
            include_scope_in_token_exchange: false,
            ..Default::default()
        },
        // Slack wants user scopes under `user_scope`.
        "SLACK" => OAuth2Quirks {
            rewrite_authorization_url: true,
            ..Default::default()
        },
        _ => OAuth2Quirks::default(),
    }
}

/// Manager for one app's OAuth2 flow.
pub struct OAuth2Manager {
    app_name: String,
    scheme: OAuth2SchemeConfig,
    quirks: OAuth2Quirks,
    client: reqwest::Client,
}

impl OAuth2Manager {
    pub fn new(app_name: String, scheme: OAuth2SchemeConfig) -> Self {
        let quirks = quirks_for(&app_name);
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            app_name,
            scheme,
            quirks,
            client,
        }
    }

    pub fn quirks(&self) -> &OAuth2Quirks {
        &self.quirks
    }

    /// Generate a 48-character alphanumeric PKCE code verifier.
    pub fn generate_code_verifier() -> String {
        const CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
        let mut rng = rand::thread_rng();
        (0..48)
            .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
            .collect()
    }

    /// S256 code challenge: base64url(sha256(verifier)), unpadded.
    pub fn code_challenge(verifier: &str) -> String {
        let digest = Sha256::digest(verifier.as_bytes());
        URL_SAFE_NO_PAD.encode(digest)
    }

    /// Build the authorization URL the user is redirected to.
    pub fn create_authorization_url(
        &self,
        redirect_uri: &str,
        state: &str,
        code_verifier: Option<&str>,
    ) -> Result<String, CredentialError> {
        let mut url =
            url::Url::parse(&self.scheme.authorize_url).map_err(|e| CredentialError::OAuth2 {
                message: format!("invalid authorize_url: {e}"),
            })?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &self.scheme.client_id);
            query.append_pair("redirect_uri", redirect_uri);
            query.append_pair("state", state);
            query.append_pair("scope", &self.scheme.scope);
            if self.quirks.use_pkce {
                if let Some(verifier) = code_verifier {
                    query.append_pair("code_challenge", &Self::code_challenge(verifier));
                    query.append_pair("code_challenge_method", "S256");
                }
            }
            if self.quirks.request_offline_access {
                query.append_pair("access_type", "offline");
                query.append_pair("prompt", "consent");
            }
            for (key, value) in self.quirks.extra_auth_params {
                debug!(app = %self.app_name, param = key, "adding app-specific auth param");
                query.append_pair(key, value);
            }
        }
        let mut authorization_url = url.to_string();
        if self.quirks.rewrite_authorization_url {
            authorization_url = Self::rewrite_authorization_url(&self.app_name, &authorization_url);
        }
        Ok(authorization_url)
    }

    /// Rewrite the authorization URL for apps with nonstandard parameter
    /// names. Slack requires user scopes under `user_scope` with an empty
    /// bot `scope`.
    pub fn rewrite_authorization_url(app_name: &str, authorization_url: &str) -> String {
        if app_name != "SLACK" {
            return authorization_url.to_string();
        }
        let Some(start) = authorization_url.find("scope=") else {
            return authorization_url.to_string();
        };
        let value_start = start + "scope=".len();
        let value_end = authorization_url[value_start..]
            .find('&')
            .map(|i| value_start + i)
            .unwrap_or(authorization_url.len());
        let original_scope = &authorization_url[value_start..value_end];
        authorization_url.replace(
            &format!("scope={original_scope}"),
            &format!("user_scope={original_scope}&scope="),
        )
    }

    /// Exchange an authorization code for a token response.
    pub async fn fetch_token(
        &self,
        redirect_uri: &str,
        code: &str,
        code_verifier: Option<&str>,
    ) -> Result<Value, CredentialError> {
        let mut form: Vec<(&str, &str)> = vec![
            ("grant_type", self.quirks.grant_type_override.unwrap_or("authorization_code")),
            ("code", code),
            ("redirect_uri", redirect_uri),
        ];
        if self.quirks.use_pkce {
            if let Some(verifier) = code_verifier {
                form.push(("code_verifier", verifier));
            }
        }
        if self.quirks.include_scope_in_token_exchange {
            form.push(("scope", self.scheme.scope.as_str()));
        }
        self.token_request(&self.scheme.access_token_url, form, "fetch access token")
            .await
    }

    /// Exchange a refresh token for a fresh access token.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<Value, CredentialError> {
        let form: Vec<(&str, &str)> = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.token_request(&self.scheme.refresh_token_url, form, "refresh access token")
            .await
    }

    async fn token_request(
        &self,
        token_url: &str,
        mut form: Vec<(&str, &str)>,
        action: &str,
    ) -> Result<Value, CredentialError> {
        let auth_method = self
            .scheme
            .token_endpoint_auth_method
            .as_deref()
            .unwrap_or("client_secret_basic");

        let mut request = self.client.post(token_url);
        match auth_method {
            "client_secret_post" => {
                form.push(("client_id", self.scheme.client_id.as_str()));
                form.push(("client_secret", self.scheme.client_secret.as_str()));
            }
            "none" => {
                form.push(("client_id", self.scheme.client_id.as_str()));
            }
            _ => {
                request = request.basic_auth(
                    &self.scheme.client_id,
                    Some(&self.scheme.client_secret),
                );
            }
        }

        let response = request
            .header("Accept", "application/json")
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            error!(app = %self.app_name, error = %e, "token endpoint returned unparseable body");
            CredentialError::OAuth2 {
                message: format!("failed to {action}"),
            }
        })?;

        if !status.is_success() || body.get("error").is_some() {
            // The body may carry client secrets echoed back by broken
            // providers; log only the error code.
            error!(
                app = %self.app_name,
                status = %status,
                oauth_error = body.get("error").and_then(|v| v.as_str()).unwrap_or("unknown"),
                "token endpoint request failed"
            );
            return Err(CredentialError::OAuth2 {
                message: format!("failed to {action}"),
            });
        }
        Ok(body)
    }

    /// Parse a token response into stored credentials, handling provider
    /// response-shape quirks.
    pub fn parse_token_response(
        &self,
        token: &Value,
    ) -> Result<OAuth2Credentials, CredentialError> {
        // Slack nests the user token under `authed_user`.
        let data = if self.app_name == "SLACK" {
            token
                .get("authed_user")
                .ok_or_else(|| CredentialError::OAuth2 {
                    message: "missing authed_user in Slack OAuth response".into(),
                })?
        } else {
            token
        };

        let access_token = data
            .get("access_token")
            .and_then(Value::as_str)
            .ok_or_else(|| CredentialError::OAuth2 {
                message: "missing access_token in OAuth response".into(),
            })?;

        let expires_at = match (data.get("expires_at"), data.get("expires_in")) {
            (Some(at), _) if at.is_number() => at.as_i64(),
            (_, Some(expires_in)) if expires_in.is_number() => {
                expires_in.as_i64().map(|s| Utc::now().timestamp() + s)
            }
            _ => None,
        };

        Ok(OAuth2Credentials {
            client_id: self.scheme.client_id.clone(),
            client_secret: self.scheme.client_secret.clone(),
            scope: self.scheme.scope.clone(),
            access_token: access_token.to_string(),
            token_type: data
                .get("token_type")
                .and_then(Value::as_str)
                .map(String::from),
            expires_at,
            refresh_token: data
                .get("refresh_token")
                .and_then(Value::as_str)
                .map(String::from),
            metadata: HashMap::new(),
            raw_token_response: Some(token.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::HttpLocation;
    use serde_json::json;

    fn scheme() -> OAuth2SchemeConfig {
        OAuth2SchemeConfig {
            client_id: "cid".into(),
            client_secret: "csecret".into(),
            scope: "email.read".into(),
            authorize_url: "https://provider.example.com/authorize".into(),
            access_token_url: "https://provider.example.com/token".into(),
            refresh_token_url: "https://provider.example.com/token".into(),
            token_endpoint_auth_method: None,
            location: HttpLocation::Header,
            name: "Authorization".into(),
            prefix: Some("Bearer".into()),
            additional_headers: None,
            redirect_url: None,
        }
    }

    #[test]
    fn test_code_verifier_shape() {
        let verifier = OAuth2Manager::generate_code_verifier();
        assert_eq!(verifier.len(), 48);
        assert!(verifier.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_code_challenge_is_rfc7636_s256() {
        // Appendix B of RFC 7636.
        let challenge = OAuth2Manager::code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn test_authorization_url_default_pkce() {
        let manager = OAuth2Manager::new("GMAIL".into(), scheme());
        let url = manager
            .create_authorization_url("https://gw.example.com/cb", "state-jwt", Some("ver"))
            .unwrap();
        assert!(url.contains("response_type=code"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("access_type=offline"));
        assert!(url.contains("prompt=consent"));
        assert!(url.contains("state=state-jwt"));
    }

    #[test]
    fn test_authorization_url_linkedin_no_pkce() {
        let manager = OAuth2Manager::new("LINKEDIN".into(), scheme());
        let url = manager
            .create_authorization_url("https://gw.example.com/cb", "s", Some("ver"))
            .unwrap();
        assert!(!url.contains("code_challenge"));
        assert!(!url.contains("access_type"));
    }

    #[test]
    fn test_authorization_url_reddit_duration() {
        let manager = OAuth2Manager::new("REDDIT".into(), scheme());
        let url = manager
            .create_authorization_url("https://gw.example.com/cb", "s", Some("ver"))
            .unwrap();
        assert!(url.contains("duration=permanent"));
    }

    #[test]
    fn test_slack_authorization_url_rewrite() {
        let rewritten = OAuth2Manager::rewrite_authorization_url(
            "SLACK",
            "https://slack.com/oauth/v2/authorize?scope=chat%3Awrite&state=s",
        );
        assert!(rewritten.contains("user_scope=chat%3Awrite"));
        assert!(rewritten.contains("&scope=&") || rewritten.contains("scope=&"));

        let untouched = OAuth2Manager::rewrite_authorization_url(
            "GMAIL",
            "https://accounts.google.com/o/oauth2/v2/auth?scope=email",
        );
        assert!(untouched.contains("scope=email"));
    }

    #[test]
    fn test_parse_token_response_expires_in() {
        let manager = OAuth2Manager::new("GMAIL".into(), scheme());
        let token = json!({
            "access_token": "at",
            "refresh_token": "rt",
            "token_type": "Bearer",
            "expires_in": 3600
        });
        let credentials = manager.parse_token_response(&token).unwrap();
        assert_eq!(credentials.access_token, "at");
        assert_eq!(credentials.refresh_token.as_deref(), Some("rt"));
        let expires_at = credentials.expires_at.unwrap();
        let expected = Utc::now().timestamp() + 3600;
        assert!((expires_at - expected).abs() <= 2);
    }

    #[test]
    fn test_parse_token_response_slack_authed_user() {
        let manager = OAuth2Manager::new("SLACK".into(), scheme());
        let token = json!({
            "ok": true,
            "authed_user": {"access_token": "xoxp-1", "token_type": "user"}
        });
        let credentials = manager.parse_token_response(&token).unwrap();
        assert_eq!(credentials.access_token, "xoxp-1");

        let missing = json!({"ok": true});
        assert!(manager.parse_token_response(&missing).is_err());
    }

    #[test]
    fn test_parse_token_response_missing_access_token() {
        let manager = OAuth2Manager::new("GMAIL".into(), scheme());
        let err = manager
            .parse_token_response(&json!({"token_type": "Bearer"}))
            .unwrap_err();
        assert!(err.to_string().contains("access_token"));
    }

    #[test]
    fn test_quirk_table() {
        assert!(!quirks_for("LINKEDIN").use_pkce);
        assert!(!quirks_for("MICROSOFT_OUTLOOK").include_scope_in_token_exchange);
        assert!(quirks_for("SLACK").rewrite_authorization_url);
        let default = quirks_for("SOME_NEW_APP");
        assert!(default.use_pkce && default.include_scope_in_token_exchange);
    }
}
