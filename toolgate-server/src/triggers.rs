//! Trigger registry service.
//!
//! Binds (project, linked account, trigger type) to an external webhook
//! subscription through the per-provider connectors: creation, deletion,
//! renewal, and the persistence of registration outcomes. Route handlers
//! and background loops both come through here.

use crate::error::ApiError;
use crate::state::AppState;
use chrono::Utc;
use rand::RngCore;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use toolgate_connectors::{ConnectorAuth, RegistrationResult, TriggerConnector};
use toolgate_core::credentials::{ResolvedCredentials, oauth2_scheme_config};
use toolgate_core::types::{
    App, AppConfiguration, LinkedAccount, Trigger, TriggerStatus, Visibility,
};
use tracing::{info, warn};
use uuid::Uuid;

/// Registration attempts before the retry loop gives up on a trigger.
pub const MAX_REGISTRATION_RETRIES: u32 = 3;

/// 32 random bytes, hex-encoded.
pub fn generate_verification_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Load the app, configuration, and linked account a trigger hangs off.
pub fn trigger_context(
    state: &AppState,
    trigger: &Trigger,
) -> Result<(App, AppConfiguration, LinkedAccount), ApiError> {
    let app = state
        .store
        .get_app_by_id(trigger.app_id)?
        .ok_or_else(|| ApiError::NotFound("app not found".into()))?;
    let configuration = state
        .store
        .get_app_configuration(trigger.project_id, &app.name)?
        .ok_or_else(|| ApiError::NotFound(format!("configuration for app {} not found", app.name)))?;
    let linked_account = state
        .store
        .get_linked_account_by_id(trigger.linked_account_id)?
        .ok_or_else(|| ApiError::NotFound("linked account not found".into()))?;
    Ok((app, configuration, linked_account))
}

/// Build the connector auth material for a trigger's linked account. When
/// `refresh` is set, expiring OAuth2 tokens are refreshed through the
/// broker and persisted.
pub async fn resolve_connector_auth(
    state: &AppState,
    app: &App,
    configuration: &AppConfiguration,
    linked_account: &LinkedAccount,
    refresh: bool,
) -> Result<ConnectorAuth, ApiError> {
    let credentials = if refresh {
        let response = state
            .broker
            .get_credentials(app, configuration, linked_account)
            .await?;
        if response.is_updated {
            state
                .store
                .update_linked_account_credentials(linked_account.id, &response.credentials.to_value())?;
        }
        response.credentials
    } else {
        ResolvedCredentials::from_value(
            linked_account.security_scheme,
            &linked_account.security_credentials,
        )?
    };

    let mut auth = ConnectorAuth::default();
    match &credentials {
        ResolvedCredentials::OAuth2(oauth2) => {
            auth.access_token = Some(oauth2.access_token.clone());
            auth.metadata = oauth2.metadata.clone();
        }
        ResolvedCredentials::ApiKey(api_key) => {
            auth.access_token = Some(api_key.secret_key.clone());
        }
        ResolvedCredentials::OAuth1(oauth1) => {
            auth.access_token = Some(oauth1.oauth_token.clone());
        }
        ResolvedCredentials::NoAuth(_) => {}
    }

    // Verification secrets: an explicit signing_secret override wins, the
    // OAuth2 client secret is the usual fallback.
    auth.app_secret = configuration
        .scheme_overrides
        .get("signing_secret")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| {
            oauth2_scheme_config(app, configuration)
                .ok()
                .map(|scheme| scheme.client_secret)
        });
    Ok(auth)
}

/// Create a trigger: insert the row, call the provider connector, persist
/// the outcome. Returns the trigger plus manual-setup instructions when the
/// provider has no registration API.
#[allow(clippy::too_many_arguments)]
pub async fn create_trigger(
    state: &AppState,
    project_id: Uuid,
    project_public: bool,
    app_name: &str,
    linked_account_owner_id: &str,
    trigger_name: &str,
    trigger_type: &str,
    config: Value,
) -> Result<(Trigger, Option<String>), ApiError> {
    let app = state
        .store
        .get_app(app_name, project_public, true)?
        .ok_or_else(|| ApiError::NotFound(format!("app {app_name} not found")))?;
    let configuration = state
        .store
        .get_app_configuration(project_id, app_name)?
        .ok_or_else(|| ApiError::NotFound(format!("configuration for app {app_name} not found")))?;
    if !configuration.enabled {
        return Err(ApiError::Forbidden(format!(
            "configuration for app {app_name} is disabled"
        )));
    }
    let linked_account = state
        .store
        .get_linked_account(project_id, app_name, linked_account_owner_id)?
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "linked account {linked_account_owner_id} not found for app {app_name}"
            ))
        })?;
    if !linked_account.enabled {
        return Err(ApiError::Forbidden(format!(
            "linked account {linked_account_owner_id} is disabled"
        )));
    }
    let connector = state
        .connectors
        .get(app_name)
        .ok_or_else(|| ApiError::BadRequest(format!("no trigger connector for app {app_name}")))?;

    let trigger_id = Uuid::new_v4();
    let webhook_url = state.config.webhook_url(connector.provider(), trigger_id);
    let trigger = state.store.create_trigger(
        trigger_id,
        project_id,
        app.id,
        linked_account.id,
        trigger_name,
        trigger_type,
        &webhook_url,
        &generate_verification_token(),
        config,
    )?;

    let auth =
        resolve_connector_auth(state, &app, &configuration, &linked_account, true).await?;
    let result = connector.register(&trigger, &auth).await;
    let manual_setup = result.manual_setup.clone();
    apply_registration(state, &trigger, &result)?;
    state.metrics.increment_counter(
        "triggers_created",
        1.0,
        &[
            ("provider", connector.provider()),
            ("success", if result.success { "true" } else { "false" }),
        ],
    );

    let trigger = state
        .store
        .get_trigger(trigger.id)?
        .ok_or_else(|| ApiError::Internal("trigger vanished after creation".into()))?;
    Ok((trigger, manual_setup))
}

/// Persist a registration (or renewal) outcome onto the trigger row.
pub fn apply_registration(
    state: &AppState,
    trigger: &Trigger,
    result: &RegistrationResult,
) -> Result<(), ApiError> {
    if result.success {
        if let Some(external_id) = &result.external_webhook_id {
            state
                .store
                .update_trigger_external_id(trigger.id, external_id)?;
        }
        if let Some(expires_at) = result.expires_at {
            state.store.update_trigger_expires_at(trigger.id, expires_at)?;
        }
        // Returned metadata (channel ids, signing secrets) merges into the
        // config so later verification and renewal can use it; a successful
        // registration also clears the retry counter.
        let mut config = trigger
            .config
            .as_object()
            .cloned()
            .unwrap_or_else(Map::new);
        if let Some(extra) = result.metadata.as_ref().and_then(Value::as_object) {
            for (key, value) in extra {
                config.insert(key.clone(), value.clone());
            }
        }
        config.insert("retry_count".into(), json!(0));
        state
            .store
            .update_trigger_config(trigger.id, &Value::Object(config))?;
        state
            .store
            .update_trigger_status(trigger.id, TriggerStatus::Active)?;
        info!(trigger_id = %trigger.id, "webhook registration persisted");
    } else {
        let mut config = trigger
            .config
            .as_object()
            .cloned()
            .unwrap_or_else(Map::new);
        let retries = trigger.retry_count() + 1;
        config.insert("retry_count".into(), json!(retries));
        state
            .store
            .update_trigger_config(trigger.id, &Value::Object(config))?;
        state
            .store
            .update_trigger_status(trigger.id, TriggerStatus::Error)?;
        warn!(
            trigger_id = %trigger.id,
            retries,
            error = result.error_message.as_deref().unwrap_or("unknown"),
            "webhook registration failed"
        );
    }
    Ok(())
}

/// Unregister remotely (best effort, idempotent) and delete the row.
pub async fn delete_trigger(state: &AppState, trigger: &Trigger) -> Result<bool, ApiError> {
    if let Some(connector) = connector_for(state, trigger)? {
        match trigger_context(state, trigger) {
            Ok((app, configuration, linked_account)) => {
                let auth =
                    resolve_connector_auth(state, &app, &configuration, &linked_account, true)
                        .await?;
                if !connector.unregister(trigger, &auth).await {
                    warn!(trigger_id = %trigger.id, "remote webhook deletion failed, removing row anyway");
                }
            }
            Err(e) => {
                warn!(trigger_id = %trigger.id, error = %e, "skipping remote deletion");
            }
        }
    }
    Ok(state.store.delete_trigger(trigger.id)?)
}

/// Renew a trigger's subscription through its connector.
pub async fn renew_trigger(state: &AppState, trigger: &Trigger) -> RegistrationResult {
    let Ok(Some(connector)) = connector_for(state, trigger) else {
        return RegistrationResult::failed("no connector registered");
    };
    let (app, configuration, linked_account) = match trigger_context(state, trigger) {
        Ok(context) => context,
        Err(e) => return RegistrationResult::failed(e.to_string()),
    };
    let auth =
        match resolve_connector_auth(state, &app, &configuration, &linked_account, true).await {
            Ok(auth) => auth,
            Err(e) => return RegistrationResult::failed(e.to_string()),
        };
    connector.renew(trigger, &auth).await
}

/// Re-run registration for a trigger in ERROR state.
pub async fn reregister_trigger(state: &AppState, trigger: &Trigger) -> RegistrationResult {
    let Ok(Some(connector)) = connector_for(state, trigger) else {
        return RegistrationResult::failed("no connector registered");
    };
    let (app, configuration, linked_account) = match trigger_context(state, trigger) {
        Ok(context) => context,
        Err(e) => return RegistrationResult::failed(e.to_string()),
    };
    let auth =
        match resolve_connector_auth(state, &app, &configuration, &linked_account, true).await {
            Ok(auth) => auth,
            Err(e) => return RegistrationResult::failed(e.to_string()),
        };
    connector.register(trigger, &auth).await
}

/// The connector owning a trigger, by its app.
pub fn connector_for(
    state: &AppState,
    trigger: &Trigger,
) -> Result<Option<Arc<dyn TriggerConnector>>, ApiError> {
    let app = state
        .store
        .get_app_by_id(trigger.app_id)?
        .ok_or_else(|| ApiError::NotFound("app not found".into()))?;
    Ok(state.connectors.get(&app.name))
}

/// Access helper shared by route handlers: a project sees PUBLIC apps only
/// when its own visibility access is PUBLIC.
pub fn public_only(visibility_access: Visibility) -> bool {
    visibility_access == Visibility::Public
}

/// Timestamp helper for last-triggered bookkeeping.
pub fn touch_last_triggered(state: &AppState, trigger: &Trigger) {
    if let Err(e) = state
        .store
        .update_trigger_last_triggered_at(trigger.id, Utc::now())
    {
        warn!(trigger_id = %trigger.id, error = %e, "failed to update last_triggered_at");
    }
}
