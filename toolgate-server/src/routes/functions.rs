//! Function endpoints: list, search, definition, execute, feedback.

use crate::auth::RequestContext;
use crate::error::ApiError;
use crate::state::SharedState;
use crate::triggers::public_only;
use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{Duration, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::time::Instant;
use toolgate_core::credentials::{
    ResolvedCredentials, api_key_scheme_config, oauth2_scheme_config,
};
use toolgate_core::executor::{ExecutionAuth, ExecutionResult};
use toolgate_core::instructions::InstructionDecision;
use toolgate_core::manifest::function_definition;
use toolgate_core::search::SearchParams;
use toolgate_core::store::NewSearchFeedback;
use toolgate_core::types::{
    App, AppConfiguration, FeedbackType, Function, FunctionDefinitionFormat,
    FunctionSearchFeedback,
};
use tracing::{info, warn};

const DEFAULT_LIMIT: usize = 100;
/// Feedback rows allowed per agent per hour.
const FEEDBACK_HOURLY_LIMIT: i64 = 10;

fn default_limit() -> usize {
    DEFAULT_LIMIT
}

fn parse_app_names(raw: Option<&str>) -> Option<Vec<String>> {
    raw.map(|names| {
        names
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(String::from)
            .collect()
    })
}

#[derive(Debug, Deserialize)]
pub struct ListFunctionsQuery {
    pub app_names: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

/// GET /v1/functions
pub async fn list_functions(
    State(state): State<SharedState>,
    context: RequestContext,
    Query(query): Query<ListFunctionsQuery>,
) -> Result<Json<Vec<Function>>, ApiError> {
    let functions = state.store.list_functions(
        public_only(context.project.visibility_access),
        true,
        parse_app_names(query.app_names.as_deref()).as_deref(),
        query.limit,
        query.offset,
    )?;
    Ok(Json(functions))
}

#[derive(Debug, Deserialize)]
pub struct SearchFunctionsQuery {
    pub intent: Option<String>,
    pub app_names: Option<String>,
    #[serde(default)]
    pub allowed_apps_only: bool,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
    #[serde(default)]
    pub format: FunctionDefinitionFormat,
}

/// GET /v1/functions/search
pub async fn search_functions(
    State(state): State<SharedState>,
    context: RequestContext,
    Query(query): Query<SearchFunctionsQuery>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let params = SearchParams {
        intent: query.intent.clone(),
        app_names: parse_app_names(query.app_names.as_deref()),
        allowed_apps_only: query.allowed_apps_only,
        limit: query.limit,
        offset: query.offset,
    };
    let functions = state
        .search
        .search(&context.project, &context.agent, &params)
        .await?;

    // Remember intent searches for implicit-execution feedback.
    if let Some(intent) = query.intent.as_deref().filter(|i| !i.trim().is_empty()) {
        state.stash.record(
            context.agent.id,
            intent,
            functions.iter().map(|f| f.name.clone()).collect(),
        );
    }

    info!(
        handler = "search_functions",
        project_id = %context.project.id,
        agent_id = %context.agent.id,
        result_count = functions.len(),
        "function search served"
    );
    state
        .metrics
        .increment_counter("function_searches", 1.0, &[]);

    let definitions = functions
        .iter()
        .map(|function| function_definition(function, query.format))
        .collect();
    Ok(Json(definitions))
}

#[derive(Debug, Deserialize)]
pub struct DefinitionQuery {
    #[serde(default)]
    pub format: FunctionDefinitionFormat,
}

/// GET /v1/functions/{function_name}/definition
pub async fn get_function_definition(
    State(state): State<SharedState>,
    context: RequestContext,
    Path(function_name): Path<String>,
    Query(query): Query<DefinitionQuery>,
) -> Result<Json<Value>, ApiError> {
    let function = state
        .store
        .get_function(
            &function_name,
            public_only(context.project.visibility_access),
            true,
        )?
        .ok_or_else(|| ApiError::NotFound(format!("function {function_name} not found")))?;
    Ok(Json(function_definition(&function, query.format)))
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub function_input: Value,
    pub linked_account_owner_id: String,
}

/// POST /v1/functions/{function_name}/execute
pub async fn execute_function(
    State(state): State<SharedState>,
    context: RequestContext,
    Path(function_name): Path<String>,
    Json(body): Json<ExecuteRequest>,
) -> Result<Json<ExecutionResult>, ApiError> {
    let started = Instant::now();

    let function = state
        .store
        .get_function(
            &function_name,
            public_only(context.project.visibility_access),
            true,
        )?
        .ok_or_else(|| ApiError::NotFound(format!("function {function_name} not found")))?;
    let app = state
        .store
        .get_app_by_id(function.app_id)?
        .ok_or_else(|| ApiError::NotFound(format!("app for {function_name} not found")))?;

    let configuration = state
        .store
        .get_app_configuration(context.project.id, &app.name)?
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "configuration for app {} not found, configure the app first",
                app.name
            ))
        })?;
    if !configuration.enabled {
        return Err(ApiError::Forbidden(format!(
            "configuration for app {} is disabled",
            app.name
        )));
    }

    if !context.agent.allowed_apps.contains(&app.name) {
        return Err(ApiError::Forbidden(format!(
            "app {} is not allowed for agent {}",
            app.name, context.agent.name
        )));
    }

    let linked_account = state
        .store
        .get_linked_account(context.project.id, &app.name, &body.linked_account_owner_id)?
        .ok_or_else(|| {
            ApiError::NotFound(format!(
                "linked account {} not found for app {}",
                body.linked_account_owner_id, app.name
            ))
        })?;
    if !linked_account.enabled {
        return Err(ApiError::Forbidden(format!(
            "linked account {} is disabled",
            body.linked_account_owner_id
        )));
    }

    // Resolve credentials; a transparent refresh is persisted before the
    // outbound call.
    let credentials_response = state
        .broker
        .get_credentials(&app, &configuration, &linked_account)
        .await?;
    if credentials_response.is_updated {
        state.store.update_linked_account_credentials(
            linked_account.id,
            &credentials_response.credentials.to_value(),
        )?;
    }

    // Custom-instruction guard.
    if let Some(instruction) = context.agent.custom_instructions.get(&function_name) {
        let decision = state
            .instruction_policy
            .check(&function_name, instruction, &body.function_input)
            .await;
        if let InstructionDecision::Deny { reason } = decision {
            return Err(ApiError::Forbidden(format!(
                "execution blocked by custom instructions: {reason}"
            )));
        }
    }

    let auth = execution_auth(&app, &configuration, credentials_response.credentials)?;
    let result = state
        .executor
        .execute(&function, &body.function_input, &auth)
        .await?;

    state
        .store
        .update_linked_account_last_used_at(linked_account.id, Utc::now())?;
    record_implicit_feedback(&state, &context, &function_name, &result);

    let duration = started.elapsed().as_secs_f64();
    state.metrics.record_histogram(
        "function_execution_seconds",
        duration,
        &[("app", app.name.as_str())],
    );
    state.metrics.increment_counter(
        "function_executions",
        1.0,
        &[
            ("app", app.name.as_str()),
            ("success", if result.success { "true" } else { "false" }),
        ],
    );
    info!(
        handler = "execute_function",
        project_id = %context.project.id,
        agent_id = %context.agent.id,
        app_name = %app.name,
        function_name = %function_name,
        success = result.success,
        duration_secs = duration,
        "function execution completed"
    );

    Ok(Json(result))
}

fn execution_auth(
    app: &App,
    configuration: &AppConfiguration,
    credentials: ResolvedCredentials,
) -> Result<ExecutionAuth, ApiError> {
    Ok(match credentials {
        ResolvedCredentials::OAuth2(credentials) => ExecutionAuth::OAuth2 {
            scheme: oauth2_scheme_config(app, configuration)?,
            credentials,
        },
        ResolvedCredentials::OAuth1(credentials) => ExecutionAuth::OAuth1 { credentials },
        ResolvedCredentials::ApiKey(credentials) => ExecutionAuth::ApiKey {
            scheme: api_key_scheme_config(app, configuration)?,
            credentials,
        },
        ResolvedCredentials::NoAuth(_) => ExecutionAuth::NoAuth,
    })
}

/// If this execution's function was in the agent's last search results,
/// record implicit feedback. Only successful executions produce a row (a
/// failed call says nothing about search quality); the stash is cleared
/// either way, and feedback failure never fails the execution.
fn record_implicit_feedback(
    state: &SharedState,
    context: &RequestContext,
    function_name: &str,
    result: &ExecutionResult,
) {
    let Some((intent, returned_function_names)) = state.stash.take(context.agent.id) else {
        return;
    };
    if !returned_function_names.iter().any(|name| name == function_name) {
        return;
    }
    if !result.success {
        return;
    }
    let feedback = NewSearchFeedback {
        intent: Some(intent),
        returned_function_names,
        selected_function_name: Some(function_name.to_string()),
        was_helpful: result.success,
        feedback_type: FeedbackType::ImplicitExecution,
        feedback_comment: None,
        search_metadata: serde_json::json!({
            "execution_success": result.success,
        }),
    };
    if let Err(e) =
        state
            .store
            .create_search_feedback(context.agent.id, context.project.id, feedback)
    {
        warn!(agent_id = %context.agent.id, error = %e, "failed to record implicit feedback");
    }
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub intent: Option<String>,
    #[serde(default)]
    pub returned_function_names: Vec<String>,
    pub selected_function_name: Option<String>,
    pub was_helpful: bool,
    #[serde(default = "default_feedback_type")]
    pub feedback_type: FeedbackType,
    pub feedback_comment: Option<String>,
    #[serde(default)]
    pub search_metadata: Value,
}

fn default_feedback_type() -> FeedbackType {
    FeedbackType::Explicit
}

/// POST /v1/functions/search/feedback
pub async fn provide_search_feedback(
    State(state): State<SharedState>,
    context: RequestContext,
    Json(body): Json<FeedbackRequest>,
) -> Result<Json<FunctionSearchFeedback>, ApiError> {
    let one_hour_ago = Utc::now() - Duration::hours(1);
    let recent = state
        .store
        .count_recent_feedback(context.agent.id, one_hour_ago)?;
    if recent >= FEEDBACK_HOURLY_LIMIT {
        return Err(ApiError::RateLimited {
            retry_after_secs: 3600,
        });
    }

    let feedback = state.store.create_search_feedback(
        context.agent.id,
        context.project.id,
        NewSearchFeedback {
            intent: body.intent,
            returned_function_names: body.returned_function_names,
            selected_function_name: body.selected_function_name,
            was_helpful: body.was_helpful,
            feedback_type: body.feedback_type,
            feedback_comment: body.feedback_comment,
            search_metadata: body.search_metadata,
        },
    )?;

    info!(
        handler = "provide_search_feedback",
        project_id = %context.project.id,
        agent_id = %context.agent.id,
        was_helpful = feedback.was_helpful,
        "search feedback recorded"
    );
    Ok(Json(feedback))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_app_names() {
        assert_eq!(parse_app_names(None), None);
        assert_eq!(
            parse_app_names(Some("GMAIL, SLACK")),
            Some(vec!["GMAIL".to_string(), "SLACK".to_string()])
        );
        assert_eq!(parse_app_names(Some("")), Some(vec![]));
    }
}
