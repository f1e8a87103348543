//! Router assembly for the agent-facing API and the webhook surface.

pub mod functions;
pub mod health;
pub mod linked_accounts;
pub mod triggers;
pub mod webhooks;

use crate::state::SharedState;
use axum::Router;
use axum::routing::{delete, get, patch, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Build the full application router.
pub fn router(state: SharedState) -> Router {
    Router::new()
        // Functions
        .route("/v1/functions", get(functions::list_functions))
        .route("/v1/functions/search", get(functions::search_functions))
        .route(
            "/v1/functions/search/feedback",
            post(functions::provide_search_feedback),
        )
        .route(
            "/v1/functions/{function_name}/definition",
            get(functions::get_function_definition),
        )
        .route(
            "/v1/functions/{function_name}/execute",
            post(functions::execute_function),
        )
        // Linked accounts
        .route(
            "/v1/linked-accounts",
            get(linked_accounts::list_linked_accounts),
        )
        .route(
            "/v1/linked-accounts/no-auth",
            post(linked_accounts::link_no_auth),
        )
        .route(
            "/v1/linked-accounts/api-key",
            post(linked_accounts::link_api_key),
        )
        .route(
            "/v1/linked-accounts/default",
            post(linked_accounts::link_default),
        )
        .route(
            "/v1/linked-accounts/oauth2",
            get(linked_accounts::oauth2_authorize),
        )
        .route(
            "/v1/linked-accounts/oauth2/callback",
            get(linked_accounts::oauth2_callback),
        )
        .route(
            "/v1/linked-accounts/oauth1",
            get(linked_accounts::oauth1_authorize),
        )
        .route(
            "/v1/linked-accounts/oauth1/callback",
            get(linked_accounts::oauth1_callback),
        )
        .route(
            "/v1/linked-accounts/{id}",
            get(linked_accounts::get_linked_account),
        )
        .route(
            "/v1/linked-accounts/{id}",
            patch(linked_accounts::update_linked_account),
        )
        .route(
            "/v1/linked-accounts/{id}",
            delete(linked_accounts::delete_linked_account),
        )
        // Triggers
        .route("/v1/triggers", post(triggers::create_trigger))
        .route("/v1/triggers", get(triggers::list_triggers))
        .route("/v1/triggers/{id}", get(triggers::get_trigger))
        .route("/v1/triggers/{id}", delete(triggers::delete_trigger))
        .route(
            "/v1/triggers/{id}/events",
            get(triggers::list_trigger_events),
        )
        .route(
            "/v1/triggers/{id}/verification-token",
            get(triggers::reveal_verification_token),
        )
        // Webhooks (provider-authenticated, no API key)
        .route(
            "/v1/webhooks/{provider}/{trigger_id}",
            post(webhooks::receive_webhook),
        )
        // Operational
        .route("/v1/health", get(health::health))
        .route("/v1/metrics", get(health::metrics))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
