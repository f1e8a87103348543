//! Trigger endpoints: create, list, get, delete, events, and the single
//! verification-token reveal.

use crate::auth::RequestContext;
use crate::error::ApiError;
use crate::state::SharedState;
use crate::triggers::{self, public_only};
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde::Deserialize;
use serde_json::{Value, json};
use toolgate_core::types::{Trigger, TriggerEvent, TriggerEventStatus, TriggerStatus};
use uuid::Uuid;

const DEFAULT_PAGE_SIZE: usize = 50;

fn default_page_size() -> usize {
    DEFAULT_PAGE_SIZE
}

#[derive(Debug, Deserialize)]
pub struct CreateTriggerRequest {
    pub app_name: String,
    pub linked_account_owner_id: String,
    pub trigger_name: String,
    pub trigger_type: String,
    #[serde(default)]
    pub config: Value,
}

/// POST /v1/triggers
pub async fn create_trigger(
    State(state): State<SharedState>,
    context: RequestContext,
    Json(body): Json<CreateTriggerRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let config = if body.config.is_null() {
        json!({})
    } else {
        body.config
    };
    let (trigger, manual_setup) = triggers::create_trigger(
        &state,
        context.project.id,
        public_only(context.project.visibility_access),
        &body.app_name,
        &body.linked_account_owner_id,
        &body.trigger_name,
        &body.trigger_type,
        config,
    )
    .await?;

    // Manual-setup providers surface their instructions structurally.
    let mut response = serde_json::to_value(&trigger)?;
    if let (Some(instructions), Some(object)) = (manual_setup, response.as_object_mut()) {
        object.insert("setup_instructions".into(), json!(instructions));
    }
    Ok((StatusCode::CREATED, Json(response)))
}

#[derive(Debug, Deserialize)]
pub struct ListTriggersQuery {
    pub status: Option<TriggerStatus>,
    #[serde(default = "default_page_size")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

/// GET /v1/triggers
pub async fn list_triggers(
    State(state): State<SharedState>,
    context: RequestContext,
    Query(query): Query<ListTriggersQuery>,
) -> Result<Json<Vec<Trigger>>, ApiError> {
    let triggers =
        state
            .store
            .list_triggers(context.project.id, query.status, query.limit, query.offset)?;
    Ok(Json(triggers))
}

/// GET /v1/triggers/{id}
pub async fn get_trigger(
    State(state): State<SharedState>,
    context: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Trigger>, ApiError> {
    let trigger = owned_trigger(&state, &context, id)?;
    Ok(Json(trigger))
}

/// DELETE /v1/triggers/{id}
pub async fn delete_trigger(
    State(state): State<SharedState>,
    context: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let trigger = owned_trigger(&state, &context, id)?;
    triggers::delete_trigger(&state, &trigger).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub status: Option<TriggerEventStatus>,
    #[serde(default = "default_page_size")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

/// GET /v1/triggers/{id}/events
pub async fn list_trigger_events(
    State(state): State<SharedState>,
    context: RequestContext,
    Path(id): Path<Uuid>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<Vec<TriggerEvent>>, ApiError> {
    owned_trigger(&state, &context, id)?;
    let events =
        state
            .store
            .get_trigger_events(id, query.status, query.limit, query.offset)?;
    Ok(Json(events))
}

/// GET /v1/triggers/{id}/verification-token: the single reveal endpoint;
/// list and get responses never carry the token.
pub async fn reveal_verification_token(
    State(state): State<SharedState>,
    context: RequestContext,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let trigger = owned_trigger(&state, &context, id)?;
    Ok(Json(json!({
        "trigger_id": trigger.id,
        "verification_token": trigger.verification_token,
    })))
}

fn owned_trigger(
    state: &SharedState,
    context: &RequestContext,
    id: Uuid,
) -> Result<Trigger, ApiError> {
    state
        .store
        .get_trigger(id)?
        .filter(|trigger| trigger.project_id == context.project.id)
        .ok_or_else(|| ApiError::NotFound(format!("trigger {id} not found")))
}
