//! Function search — the policy pipeline over the catalog store.
//!
//! Access filter, app filter, lexical prune, vector rank, over-fetch for
//! rerank, optional LLM rerank, truncate. Search never fails because the
//! embedding or rerank stage failed; it degrades to the order it has.

use crate::embeddings::Embedder;
use crate::error::SearchError;
use crate::rerank::Reranker;
use crate::store::{CatalogStore, FunctionQuery};
use crate::types::{Agent, Function, Project, Visibility};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Reranking only engages above this intent length.
const RERANK_MIN_INTENT_LEN: usize = 5;
/// Hard cap on the over-fetch for reranking.
const RERANK_FETCH_CAP: usize = 200;

/// Caller-supplied search parameters.
#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    pub intent: Option<String>,
    pub app_names: Option<Vec<String>>,
    /// Restrict to the agent's allowed apps.
    pub allowed_apps_only: bool,
    pub limit: usize,
    pub offset: usize,
}

/// Semantic function discovery over the catalog.
pub struct FunctionSearch {
    store: Arc<CatalogStore>,
    embedder: Arc<dyn Embedder>,
    reranker: Option<Arc<Reranker>>,
}

impl FunctionSearch {
    pub fn new(
        store: Arc<CatalogStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<Reranker>>,
    ) -> Self {
        Self {
            store,
            embedder,
            reranker,
        }
    }

    /// Run the search pipeline for one agent request.
    pub async fn search(
        &self,
        project: &Project,
        agent: &Agent,
        params: &SearchParams,
    ) -> Result<Vec<Function>, SearchError> {
        let public_only = project.visibility_access == Visibility::Public;
        let app_names = determine_apps_to_filter(
            params.allowed_apps_only,
            params.app_names.as_deref(),
            &agent.allowed_apps,
        );

        let intent = params.intent.as_deref().unwrap_or("").trim();
        let needs_rerank =
            self.reranker.is_some() && intent.len() > RERANK_MIN_INTENT_LEN;
        // Over-fetch only when a rerank will actually run.
        let fetch_limit = if needs_rerank {
            (params.limit * 2).min(RERANK_FETCH_CAP)
        } else {
            params.limit
        };

        let intent_embedding = if intent.is_empty() {
            None
        } else {
            match self.embedder.embed(intent).await {
                Ok(embedding) => Some(embedding),
                Err(e) => {
                    // Degrade to lexical order rather than failing the search.
                    warn!(error = %e, "intent embedding unavailable, skipping vector rank");
                    None
                }
            }
        };

        let mut functions = self.store.search_functions(&FunctionQuery {
            public_only,
            active_only: true,
            app_names,
            intent_embedding,
            intent_text: (!intent.is_empty()).then(|| intent.to_string()),
            limit: fetch_limit,
            offset: params.offset,
        })?;

        if needs_rerank && functions.len() > 1 {
            if let Some(reranker) = &self.reranker {
                functions = reranker.rerank(functions, intent).await;
            }
            functions.truncate(params.limit);
        }

        debug!(
            result_count = functions.len(),
            reranked = needs_rerank,
            "function search completed"
        );
        Ok(functions)
    }
}

/// Resolve the effective app filter from the query parameters and the
/// agent's allowed apps.
fn determine_apps_to_filter(
    allowed_apps_only: bool,
    app_names: Option<&[String]>,
    agent_allowed_apps: &[String],
) -> Option<Vec<String>> {
    if allowed_apps_only {
        match app_names {
            None => Some(agent_allowed_apps.to_vec()),
            Some(names) => {
                let allowed: HashSet<&String> = agent_allowed_apps.iter().collect();
                Some(
                    names
                        .iter()
                        .filter(|name| allowed.contains(name))
                        .cloned()
                        .collect(),
                )
            }
        }
    } else {
        app_names.map(<[String]>::to_vec)
    }
}
