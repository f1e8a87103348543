//! Linked account endpoints: no-auth / api-key / default linking, the
//! OAuth2 and OAuth1 browser flows with their callbacks, and account
//! management.
//!
//! The callbacks are reached by provider redirects, not agents, so they
//! authenticate through the signed state JWT instead of an API key.

use crate::auth::RequestContext;
use crate::error::ApiError;
use crate::state::SharedState;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Redirect, Response};
use serde::Deserialize;
use serde_json::{Value, json};
use toolgate_core::credentials::state::{
    OAuth1State, OAuth2State, decode_state, encode_state, state_expiry,
};
use toolgate_core::credentials::oauth1::OAuth1Manager;
use toolgate_core::credentials::oauth2::OAuth2Manager;
use toolgate_core::credentials::{
    NoAuthCredentials, validate_credentials, oauth1_scheme_config, oauth2_scheme_config,
};
use toolgate_core::store::LinkedAccountPage;
use toolgate_core::types::{App, AppConfiguration, LinkedAccount, SecurityScheme};
use tracing::{info, warn};
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: usize = 50;

/// Shared preamble: the app configuration for a link request, checked
/// against the expected scheme.
fn configured_app(
    state: &SharedState,
    project_id: Uuid,
    app_name: &str,
    expected_scheme: SecurityScheme,
) -> Result<(App, AppConfiguration), ApiError> {
    let configuration = state
        .store
        .get_app_configuration(project_id, app_name)?
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "configuration for app {app_name} not found, configure the app first"
            ))
        })?;
    if configuration.security_scheme != expected_scheme {
        return Err(ApiError::BadRequest(format!(
            "the security scheme configured for app {app_name} is {}, not {}",
            configuration.security_scheme, expected_scheme
        )));
    }
    let app = state
        .store
        .get_app_by_id(configuration.app_id)?
        .ok_or_else(|| ApiError::NotFound(format!("app {app_name} not found")))?;
    Ok((app, configuration))
}

fn enforce_quota(
    state: &SharedState,
    context: &RequestContext,
    linked_account_owner_id: &str,
) -> Result<(), ApiError> {
    state.quota.check_linked_account_creation(
        &state.store,
        context.project.org_id,
        linked_account_owner_id,
    )
}

// ── Direct link flows ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LinkNoAuthRequest {
    pub app_name: String,
    pub linked_account_owner_id: String,
}

/// POST /v1/linked-accounts/no-auth
pub async fn link_no_auth(
    State(state): State<SharedState>,
    context: RequestContext,
    Json(body): Json<LinkNoAuthRequest>,
) -> Result<Json<LinkedAccount>, ApiError> {
    configured_app(
        &state,
        context.project.id,
        &body.app_name,
        SecurityScheme::NoAuth,
    )?;
    enforce_quota(&state, &context, &body.linked_account_owner_id)?;
    let account = state.store.create_linked_account(
        context.project.id,
        &body.app_name,
        &body.linked_account_owner_id,
        SecurityScheme::NoAuth,
        serde_json::to_value(NoAuthCredentials::default())?,
        true,
    )?;
    info!(
        handler = "link_no_auth",
        project_id = %context.project.id,
        app_name = %body.app_name,
        "linked no-auth account"
    );
    Ok(Json(account))
}

#[derive(Debug, Deserialize)]
pub struct LinkApiKeyRequest {
    pub app_name: String,
    pub linked_account_owner_id: String,
    pub api_key: String,
}

/// POST /v1/linked-accounts/api-key
pub async fn link_api_key(
    State(state): State<SharedState>,
    context: RequestContext,
    Json(body): Json<LinkApiKeyRequest>,
) -> Result<Json<LinkedAccount>, ApiError> {
    configured_app(
        &state,
        context.project.id,
        &body.app_name,
        SecurityScheme::ApiKey,
    )?;
    enforce_quota(&state, &context, &body.linked_account_owner_id)?;

    let credentials = json!({"secret_key": body.api_key});
    validate_credentials(SecurityScheme::ApiKey, &credentials)?;
    let account = state.store.create_linked_account(
        context.project.id,
        &body.app_name,
        &body.linked_account_owner_id,
        SecurityScheme::ApiKey,
        credentials,
        true,
    )?;
    info!(
        handler = "link_api_key",
        project_id = %context.project.id,
        app_name = %body.app_name,
        "linked api-key account"
    );
    Ok(Json(account))
}

#[derive(Debug, Deserialize)]
pub struct LinkDefaultRequest {
    pub app_name: String,
    pub linked_account_owner_id: String,
}

/// POST /v1/linked-accounts/default: link with gateway-provided default
/// credentials; the account row stays empty and the broker substitutes the
/// defaults at use.
pub async fn link_default(
    State(state): State<SharedState>,
    context: RequestContext,
    Json(body): Json<LinkDefaultRequest>,
) -> Result<Json<LinkedAccount>, ApiError> {
    let configuration = state
        .store
        .get_app_configuration(context.project.id, &body.app_name)?
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "configuration for app {} not found, configure the app first",
                body.app_name
            ))
        })?;
    let app = state
        .store
        .get_app_by_id(configuration.app_id)?
        .ok_or_else(|| ApiError::NotFound(format!("app {} not found", body.app_name)))?;
    if app
        .default_credentials(configuration.security_scheme)
        .is_none()
    {
        return Err(ApiError::BadRequest(format!(
            "no default credentials provided for app {} scheme {}",
            app.name, configuration.security_scheme
        )));
    }
    enforce_quota(&state, &context, &body.linked_account_owner_id)?;

    let account = state.store.create_linked_account(
        context.project.id,
        &body.app_name,
        &body.linked_account_owner_id,
        configuration.security_scheme,
        json!({}),
        true,
    )?;
    Ok(Json(account))
}

// ── OAuth2 flow ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OAuth2LinkQuery {
    pub app_name: String,
    pub linked_account_owner_id: String,
    pub after_oauth2_link_redirect_url: Option<String>,
}

/// GET /v1/linked-accounts/oauth2: start the OAuth2 link and return the
/// provider authorization URL.
pub async fn oauth2_authorize(
    State(state): State<SharedState>,
    context: RequestContext,
    Query(query): Query<OAuth2LinkQuery>,
) -> Result<Json<Value>, ApiError> {
    let (app, configuration) = configured_app(
        &state,
        context.project.id,
        &query.app_name,
        SecurityScheme::OAuth2,
    )?;
    enforce_quota(&state, &context, &query.linked_account_owner_id)?;

    let scheme = oauth2_scheme_config(&app, &configuration)?;
    let manager = OAuth2Manager::new(app.name.clone(), scheme.clone());
    let code_verifier = manager
        .quirks()
        .use_pkce
        .then(OAuth2Manager::generate_code_verifier);

    let oauth2_state = OAuth2State {
        app_name: app.name.clone(),
        project_id: context.project.id,
        linked_account_owner_id: query.linked_account_owner_id.clone(),
        client_id: scheme.client_id.clone(),
        code_verifier: code_verifier.clone(),
        after_link_redirect_url: query.after_oauth2_link_redirect_url.clone(),
        exp: state_expiry(),
    };
    let state_jwt = encode_state(&oauth2_state, &state.config.signing_key)?;

    let redirect_uri = scheme
        .redirect_url
        .clone()
        .unwrap_or_else(|| state.config.oauth2_callback_url());
    let authorization_url =
        manager.create_authorization_url(&redirect_uri, &state_jwt, code_verifier.as_deref())?;

    info!(
        handler = "oauth2_authorize",
        project_id = %context.project.id,
        app_name = %app.name,
        "issued OAuth2 authorization URL"
    );
    Ok(Json(json!({"url": authorization_url})))
}

#[derive(Debug, Deserialize)]
pub struct OAuth2CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// GET /v1/linked-accounts/oauth2/callback
pub async fn oauth2_callback(
    State(state): State<SharedState>,
    Query(query): Query<OAuth2CallbackQuery>,
) -> Result<Response, ApiError> {
    if let Some(error) = &query.error {
        warn!(
            handler = "oauth2_callback",
            provider_error = %error,
            "OAuth2 callback returned an error"
        );
        return Err(ApiError::BadRequest(format!(
            "oauth2 account linking callback error: {error}, description: {}",
            query.error_description.as_deref().unwrap_or("none")
        )));
    }
    let code = query
        .code
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("missing code parameter".into()))?;
    let state_jwt = query
        .state
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("missing state parameter".into()))?;

    let oauth2_state: OAuth2State = decode_state(state_jwt, &state.config.signing_key)?;

    let (app, configuration) = configured_app(
        &state,
        oauth2_state.project_id,
        &oauth2_state.app_name,
        SecurityScheme::OAuth2,
    )?;
    let scheme = oauth2_scheme_config(&app, &configuration)?;
    if scheme.client_id != oauth2_state.client_id {
        return Err(ApiError::BadRequest(
            "client_id mismatch during account linking".into(),
        ));
    }

    let manager = OAuth2Manager::new(app.name.clone(), scheme.clone());
    let redirect_uri = scheme
        .redirect_url
        .clone()
        .unwrap_or_else(|| state.config.oauth2_callback_url());
    let token = manager
        .fetch_token(&redirect_uri, code, oauth2_state.code_verifier.as_deref())
        .await?;
    let credentials = manager.parse_token_response(&token)?;
    let credentials_value = serde_json::to_value(&credentials)?;

    // Re-linking replaces the stored credentials.
    let account = match state.store.get_linked_account(
        oauth2_state.project_id,
        &oauth2_state.app_name,
        &oauth2_state.linked_account_owner_id,
    )? {
        Some(existing) => {
            state
                .store
                .update_linked_account_credentials(existing.id, &credentials_value)?;
            state
                .store
                .get_linked_account_by_id(existing.id)?
                .ok_or_else(|| ApiError::Internal("linked account vanished".into()))?
        }
        None => state.store.create_linked_account(
            oauth2_state.project_id,
            &oauth2_state.app_name,
            &oauth2_state.linked_account_owner_id,
            SecurityScheme::OAuth2,
            credentials_value,
            true,
        )?,
    };

    info!(
        handler = "oauth2_callback",
        project_id = %oauth2_state.project_id,
        app_name = %oauth2_state.app_name,
        "OAuth2 account linked"
    );
    match oauth2_state.after_link_redirect_url {
        Some(url) => Ok(Redirect::to(&url).into_response()),
        None => Ok(Json(account).into_response()),
    }
}

// ── OAuth1 flow ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OAuth1LinkQuery {
    pub app_name: String,
    pub linked_account_owner_id: String,
    pub after_oauth1_link_redirect_url: Option<String>,
}

/// GET /v1/linked-accounts/oauth1: start the OAuth 1.0a link. The request
/// token is stored (keyed by the token the provider will echo) alongside
/// the signed state carrying the token secret.
pub async fn oauth1_authorize(
    State(state): State<SharedState>,
    context: RequestContext,
    Query(query): Query<OAuth1LinkQuery>,
) -> Result<Json<Value>, ApiError> {
    let (app, configuration) = configured_app(
        &state,
        context.project.id,
        &query.app_name,
        SecurityScheme::OAuth1,
    )?;
    enforce_quota(&state, &context, &query.linked_account_owner_id)?;

    let scheme = oauth1_scheme_config(&app, &configuration)?;
    let manager = OAuth1Manager::new(app.name.clone(), scheme);
    let request_token = manager
        .get_request_token(&state.config.oauth1_callback_url())
        .await?;
    let oauth_token = request_token
        .get("oauth_token")
        .ok_or_else(|| ApiError::BadRequest("request token response missing oauth_token".into()))?;
    let oauth_token_secret = request_token
        .get("oauth_token_secret")
        .cloned()
        .unwrap_or_default();

    let oauth1_state = OAuth1State {
        app_name: app.name.clone(),
        project_id: context.project.id,
        linked_account_owner_id: query.linked_account_owner_id.clone(),
        oauth_token_secret,
        after_link_redirect_url: query.after_oauth1_link_redirect_url.clone(),
        exp: state_expiry(),
    };
    let state_jwt = encode_state(&oauth1_state, &state.config.signing_key)?;
    state
        .store
        .create_oauth1_temp_token(oauth_token, &state_jwt)?;

    let authorization_url = manager.create_authorization_url(oauth_token, Some(&app.display_name));
    info!(
        handler = "oauth1_authorize",
        project_id = %context.project.id,
        app_name = %app.name,
        "issued OAuth1 authorization URL"
    );
    Ok(Json(json!({"url": authorization_url})))
}

#[derive(Debug, Deserialize)]
pub struct OAuth1CallbackQuery {
    pub oauth_token: Option<String>,
    pub oauth_verifier: Option<String>,
}

/// GET /v1/linked-accounts/oauth1/callback
pub async fn oauth1_callback(
    State(state): State<SharedState>,
    Query(query): Query<OAuth1CallbackQuery>,
) -> Result<Response, ApiError> {
    let oauth_token = query
        .oauth_token
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("missing oauth_token parameter".into()))?;
    let oauth_verifier = query
        .oauth_verifier
        .as_deref()
        .ok_or_else(|| ApiError::BadRequest("missing oauth_verifier parameter".into()))?;

    let temp_token = state
        .store
        .get_oauth1_temp_token(oauth_token)?
        .ok_or_else(|| ApiError::Unauthorized("unknown or expired oauth_token".into()))?;
    let oauth1_state: OAuth1State = decode_state(&temp_token.state_jwt, &state.config.signing_key)?;

    let (app, configuration) = configured_app(
        &state,
        oauth1_state.project_id,
        &oauth1_state.app_name,
        SecurityScheme::OAuth1,
    )?;
    let scheme = oauth1_scheme_config(&app, &configuration)?;
    let manager = OAuth1Manager::new(app.name.clone(), scheme);

    let response = manager
        .get_access_token(oauth_token, &oauth1_state.oauth_token_secret, oauth_verifier)
        .await?;
    let credentials = manager.parse_access_token_response(&response)?;
    let credentials_value = serde_json::to_value(&credentials)?;

    let account = match state.store.get_linked_account(
        oauth1_state.project_id,
        &oauth1_state.app_name,
        &oauth1_state.linked_account_owner_id,
    )? {
        Some(existing) => {
            state
                .store
                .update_linked_account_credentials(existing.id, &credentials_value)?;
            state
                .store
                .get_linked_account_by_id(existing.id)?
                .ok_or_else(|| ApiError::Internal("linked account vanished".into()))?
        }
        None => state.store.create_linked_account(
            oauth1_state.project_id,
            &oauth1_state.app_name,
            &oauth1_state.linked_account_owner_id,
            SecurityScheme::OAuth1,
            credentials_value,
            true,
        )?,
    };

    // The pending-flow row is single-use.
    state.store.delete_oauth1_temp_token(oauth_token)?;

    info!(
        handler = "oauth1_callback",
        project_id = %oauth1_state.project_id,
        app_name = %oauth1_state.app_name,
        "OAuth1 account linked"
    );
    match oauth1_state.after_link_redirect_url {
        Some(url) => Ok(Redirect::to(&url).into_response()),
        None => Ok(Json(account).into_response()),
    }
}

// ── Management ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListAccountsQuery {
    pub app_name: Option<String>,
    pub cursor: Option<String>,
    #[serde(default = "default_page_size")]
    pub limit: usize,
}

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

/// GET /v1/linked-accounts
pub async fn list_linked_accounts(
    State(state): State<SharedState>,
    context: RequestContext,
    Query(query): Query<ListAccountsQuery>,
) -> Result<Json<Value>, ApiError> {
    let LinkedAccountPage {
        accounts,
        next_cursor,
    } = state.store.list_linked_accounts(
        context.project.id,
        query.app_name.as_deref(),
        query.cursor.as_deref(),
        query.limit,
    )?;
    Ok(Json(json!({
        "linked_accounts": accounts,
        "next_cursor": next_cursor,
    })))
}

/// GET /v1/linked-accounts/{id}
pub async fn get_linked_account(
    State(state): State<SharedState>,
    context: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<Json<LinkedAccount>, ApiError> {
    let account = owned_account(&state, &context, id)?;
    Ok(Json(account))
}

#[derive(Debug, Deserialize)]
pub struct UpdateAccountRequest {
    pub enabled: bool,
}

/// PATCH /v1/linked-accounts/{id}
pub async fn update_linked_account(
    State(state): State<SharedState>,
    context: RequestContext,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateAccountRequest>,
) -> Result<Json<LinkedAccount>, ApiError> {
    owned_account(&state, &context, id)?;
    state.store.set_linked_account_enabled(id, body.enabled)?;
    let account = state
        .store
        .get_linked_account_by_id(id)?
        .ok_or_else(|| ApiError::Internal("linked account vanished".into()))?;
    Ok(Json(account))
}

/// DELETE /v1/linked-accounts/{id}
pub async fn delete_linked_account(
    State(state): State<SharedState>,
    context: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<axum::http::StatusCode, ApiError> {
    owned_account(&state, &context, id)?;
    state.store.delete_linked_account(id)?;
    Ok(axum::http::StatusCode::NO_CONTENT)
}

fn owned_account(
    state: &SharedState,
    context: &RequestContext,
    id: Uuid,
) -> Result<LinkedAccount, ApiError> {
    let account = state
        .store
        .get_linked_account_by_id(id)?
        .filter(|account| account.project_id == context.project.id)
        .ok_or_else(|| ApiError::NotFound(format!("linked account {id} not found")))?;
    Ok(account)
}
