//! Signed OAuth callback state.
//!
//! The state parameter round-tripped through the provider is an HS256 JWT:
//! signed, not encrypted. It carries everything the callback needs to
//! finish the link. For OAuth1, the JWT is the authoritative carrier of
//! `oauth_token_secret`; the temp-token row only maps the provider's echoed
//! `oauth_token` back to the JWT.

use crate::error::CredentialError;
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use uuid::Uuid;

/// How long a pending link flow stays valid.
const STATE_TTL_SECS: i64 = 600;

/// State carried through an OAuth2 authorization round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth2State {
    pub app_name: String,
    pub project_id: Uuid,
    pub linked_account_owner_id: String,
    /// Must match the app configuration's client_id on callback.
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_link_redirect_url: Option<String>,
    /// JWT expiry, unix seconds.
    pub exp: i64,
}

/// State carried through an OAuth1 authorization round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuth1State {
    pub app_name: String,
    pub project_id: Uuid,
    pub linked_account_owner_id: String,
    /// Request-token secret needed for the access-token exchange.
    pub oauth_token_secret: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after_link_redirect_url: Option<String>,
    pub exp: i64,
}

/// Expiry claim for a state minted now.
pub fn state_expiry() -> i64 {
    Utc::now().timestamp() + STATE_TTL_SECS
}

/// Sign a state payload into a JWT.
pub fn encode_state<T: Serialize>(state: &T, signing_key: &str) -> Result<String, CredentialError> {
    encode(
        &Header::default(),
        state,
        &EncodingKey::from_secret(signing_key.as_bytes()),
    )
    .map_err(|e| CredentialError::InvalidState {
        message: e.to_string(),
    })
}

/// Decode and verify a state JWT. Expired or tampered states are rejected.
pub fn decode_state<T: DeserializeOwned>(
    state_jwt: &str,
    signing_key: &str,
) -> Result<T, CredentialError> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<T>(
        state_jwt,
        &DecodingKey::from_secret(signing_key.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| CredentialError::InvalidState {
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oauth2_state() -> OAuth2State {
        OAuth2State {
            app_name: "GMAIL".into(),
            project_id: Uuid::new_v4(),
            linked_account_owner_id: "u1".into(),
            client_id: "cid".into(),
            code_verifier: Some("verifier".into()),
            after_link_redirect_url: None,
            exp: state_expiry(),
        }
    }

    #[test]
    fn test_state_roundtrip() {
        let state = oauth2_state();
        let jwt = encode_state(&state, "signing-key").unwrap();
        let decoded: OAuth2State = decode_state(&jwt, "signing-key").unwrap();
        assert_eq!(decoded.app_name, "GMAIL");
        assert_eq!(decoded.project_id, state.project_id);
        assert_eq!(decoded.code_verifier.as_deref(), Some("verifier"));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let jwt = encode_state(&oauth2_state(), "signing-key").unwrap();
        let result: Result<OAuth2State, _> = decode_state(&jwt, "other-key");
        assert!(result.is_err());
    }

    #[test]
    fn test_expired_state_rejected() {
        let mut state = oauth2_state();
        state.exp = Utc::now().timestamp() - 120;
        let jwt = encode_state(&state, "signing-key").unwrap();
        let result: Result<OAuth2State, _> = decode_state(&jwt, "signing-key");
        assert!(result.is_err());
    }

    #[test]
    fn test_tampered_state_rejected() {
        let jwt = encode_state(&oauth2_state(), "signing-key").unwrap();
        let mut tampered = jwt.clone();
        // Flip a payload character.
        let mid = jwt.len() / 2;
        let replacement = if &jwt[mid..mid + 1] == "A" { "B" } else { "A" };
        tampered.replace_range(mid..mid + 1, replacement);
        let result: Result<OAuth2State, _> = decode_state(&tampered, "signing-key");
        assert!(result.is_err());
    }

    #[test]
    fn test_oauth1_state_carries_token_secret() {
        let state = OAuth1State {
            app_name: "TRELLO".into(),
            project_id: Uuid::new_v4(),
            linked_account_owner_id: "u1".into(),
            oauth_token_secret: "request-secret".into(),
            after_link_redirect_url: Some("https://app.example.com/done".into()),
            exp: state_expiry(),
        };
        let jwt = encode_state(&state, "k").unwrap();
        let decoded: OAuth1State = decode_state(&jwt, "k").unwrap();
        assert_eq!(decoded.oauth_token_secret, "request-secret");
        assert_eq!(
            decoded.after_link_redirect_url.as_deref(),
            Some("https://app.example.com/done")
        );
    }
}
