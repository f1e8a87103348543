//! Agent API authentication.
//!
//! Every agent-facing endpoint authenticates with an `X-API-KEY` header
//! that resolves to the owning (project, agent) pair. Webhook and OAuth
//! callback endpoints do not use this extractor; providers authenticate
//! differently.

use crate::error::ApiError;
use crate::state::SharedState;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use toolgate_core::types::{Agent, Project};

pub const API_KEY_HEADER: &str = "x-api-key";

/// The authenticated caller of an agent-facing endpoint.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub project: Project,
    pub agent: Agent,
}

impl FromRequestParts<SharedState> for RequestContext {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let api_key = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| ApiError::Unauthorized("missing API key".into()))?;

        let (project, agent) = state
            .store
            .get_agent_by_api_key(api_key)
            .map_err(ApiError::from)?
            .ok_or_else(|| ApiError::Unauthorized("invalid API key".into()))?;

        Ok(RequestContext { project, agent })
    }
}
