//! Shared server state.
//!
//! Everything process-wide lives here: the store, the search pipeline, the
//! credential broker and executor, the connector registry, rate limiters,
//! metrics, the event queue, and the implicit-feedback stash.

use crate::config::ServerConfig;
use crate::metrics::MetricsCollector;
use crate::queue::EventQueue;
use crate::quota::{NoopQuotaEnforcer, QuotaEnforcer};
use crate::rate_limit::RateLimiter;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use toolgate_connectors::ConnectorRegistry;
use toolgate_core::credentials::CredentialBroker;
use toolgate_core::embeddings::{Embedder, OpenAiEmbedder};
use toolgate_core::executor::RestExecutor;
use toolgate_core::instructions::{AllowAllPolicy, InstructionPolicy};
use toolgate_core::rerank::Reranker;
use toolgate_core::search::FunctionSearch;
use toolgate_core::store::CatalogStore;
use uuid::Uuid;

/// How long a search result set stays eligible for implicit feedback.
const STASH_TTL: Duration = Duration::from_secs(600);
/// Bounded number of agents with a live stash entry.
const STASH_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct StashEntry {
    intent: String,
    returned_function_names: Vec<String>,
    stored_at: Instant,
}

/// Per-agent stash of the last intent search, consumed by a subsequent
/// execution to record implicit feedback. Process-wide because the search
/// and the execution arrive as separate requests.
#[derive(Debug, Default)]
pub struct SearchStash {
    entries: Mutex<HashMap<Uuid, StashEntry>>,
}

impl SearchStash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember the last intent search for this agent.
    pub fn record(&self, agent_id: Uuid, intent: &str, returned_function_names: Vec<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, entry| entry.stored_at.elapsed() < STASH_TTL);
        if entries.len() >= STASH_CAPACITY {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(id, _)| *id)
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(
            agent_id,
            StashEntry {
                intent: intent.to_string(),
                returned_function_names,
                stored_at: Instant::now(),
            },
        );
    }

    /// Take (and clear) the stashed search for this agent.
    pub fn take(&self, agent_id: Uuid) -> Option<(String, Vec<String>)> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.remove(&agent_id)?;
        if entry.stored_at.elapsed() >= STASH_TTL {
            return None;
        }
        Some((entry.intent, entry.returned_function_names))
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Process-wide server state handed to every handler.
pub struct AppState {
    pub config: ServerConfig,
    pub store: Arc<CatalogStore>,
    pub embedder: Arc<dyn Embedder>,
    pub search: FunctionSearch,
    pub broker: CredentialBroker,
    pub executor: RestExecutor,
    pub connectors: ConnectorRegistry,
    pub global_limiter: RateLimiter,
    pub trigger_limiter: RateLimiter,
    pub metrics: Arc<MetricsCollector>,
    pub queue: EventQueue,
    pub stash: SearchStash,
    pub instruction_policy: Arc<dyn InstructionPolicy>,
    pub quota: Arc<dyn QuotaEnforcer>,
}

pub type SharedState = Arc<AppState>;

impl AppState {
    /// Assemble production state from configuration. Returns the state and
    /// the queue receiver for the delivery worker.
    pub fn from_config(
        config: ServerConfig,
        store: Arc<CatalogStore>,
    ) -> (SharedState, mpsc::UnboundedReceiver<crate::queue::NormalizedEvent>) {
        let embedder: Arc<dyn Embedder> = Arc::new(OpenAiEmbedder::new(
            config.openai_api_key.clone(),
            config.embedding_model.clone(),
            config.embedding_dimension,
            Some(config.openai_base_url.clone()),
        ));
        let reranker = (!config.rerank_model.is_empty()).then(|| {
            Arc::new(Reranker::new(
                config.openai_api_key.clone(),
                config.rerank_model.clone(),
                Some(config.openai_base_url.clone()),
            ))
        });
        Self::assemble(config, store, embedder, reranker)
    }

    /// Assemble state from explicit parts (tests inject their own embedder
    /// and skip reranking).
    pub fn assemble(
        config: ServerConfig,
        store: Arc<CatalogStore>,
        embedder: Arc<dyn Embedder>,
        reranker: Option<Arc<Reranker>>,
    ) -> (SharedState, mpsc::UnboundedReceiver<crate::queue::NormalizedEvent>) {
        let (queue, rx) = EventQueue::new();
        let search = FunctionSearch::new(store.clone(), embedder.clone(), reranker);
        let state = Arc::new(AppState {
            global_limiter: RateLimiter::new(config.global_rate_per_sec, config.global_burst),
            trigger_limiter: RateLimiter::new(config.trigger_rate_per_sec, config.trigger_burst),
            store,
            embedder,
            search,
            broker: CredentialBroker::new(),
            executor: RestExecutor::new(),
            connectors: ConnectorRegistry::with_defaults(),
            metrics: Arc::new(MetricsCollector::new()),
            queue,
            stash: SearchStash::new(),
            instruction_policy: Arc::new(AllowAllPolicy),
            quota: Arc::new(NoopQuotaEnforcer),
            config,
        });
        (state, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stash_record_and_take() {
        let stash = SearchStash::new();
        let agent_id = Uuid::new_v4();
        stash.record(agent_id, "send email", vec!["GMAIL__SEND_EMAIL".into()]);

        let (intent, names) = stash.take(agent_id).unwrap();
        assert_eq!(intent, "send email");
        assert_eq!(names, vec!["GMAIL__SEND_EMAIL".to_string()]);
        // Take clears the entry.
        assert!(stash.take(agent_id).is_none());
    }

    #[test]
    fn test_stash_capacity_bound() {
        let stash = SearchStash::new();
        for _ in 0..(STASH_CAPACITY + 10) {
            stash.record(Uuid::new_v4(), "intent", vec![]);
        }
        assert!(stash.len() <= STASH_CAPACITY);
    }

    #[test]
    fn test_stash_overwrites_same_agent() {
        let stash = SearchStash::new();
        let agent_id = Uuid::new_v4();
        stash.record(agent_id, "first", vec![]);
        stash.record(agent_id, "second", vec![]);
        assert_eq!(stash.len(), 1);
        assert_eq!(stash.take(agent_id).unwrap().0, "second");
    }
}
