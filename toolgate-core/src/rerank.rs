//! LLM-based reranker for function search results.
//!
//! Second-stage ordering of vector-search candidates: the top candidates
//! plus the intent go to a fast chat model that returns an ordered index
//! list. Results are cached under an md5 digest of (intent, candidate
//! names) with a one-hour TTL and a hard capacity; when full, the oldest
//! entry by insertion time is evicted (replacement is by insertion time,
//! not recency). Rerank failure is never fatal: callers get the original
//! order back.

use crate::types::Function;
use md5::{Digest, Md5};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const MAX_CACHE_SIZE: usize = 100;
const CACHE_TTL: Duration = Duration::from_secs(3600);
/// Only the top candidates are sent to the model.
const RERANK_WINDOW: usize = 20;
/// At most this many required params are described per candidate.
const MAX_REQUIRED_PARAMS: usize = 5;

/// Cache key: md5 over the intent and the candidate name list.
pub fn cache_key(intent: &str, function_names: &[&str]) -> String {
    let mut hasher = Md5::new();
    hasher.update(intent.as_bytes());
    hasher.update(b"|");
    hasher.update(function_names.join("|").as_bytes());
    hex::encode(hasher.finalize())
}

/// Mutex-guarded TTL cache of rerank index lists.
#[derive(Debug, Default)]
pub struct RerankCache {
    entries: Mutex<HashMap<String, (Vec<usize>, Instant)>>,
}

impl RerankCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch a live entry; expired entries are evicted on access.
    pub fn get(&self, key: &str) -> Option<Vec<usize>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        match entries.get(key) {
            Some((indices, inserted_at)) if inserted_at.elapsed() < CACHE_TTL => {
                Some(indices.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert an entry, sweeping expired entries first and evicting the
    /// oldest by insertion time when still full.
    pub fn insert(&self, key: String, indices: Vec<usize>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|_, (_, inserted_at)| inserted_at.elapsed() < CACHE_TTL);
        if entries.len() >= MAX_CACHE_SIZE {
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, (_, inserted_at))| *inserted_at)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        entries.insert(key, (indices, Instant::now()));
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

/// Reranks functions against a user intent via a chat model.
pub struct Reranker {
    client: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    cache: RerankCache,
}

impl Reranker {
    pub fn new(api_key: String, model: String, base_url: Option<String>) -> Self {
        // The rerank call sits on the search path; keep it on a short leash.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(2))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            model,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".into()),
            cache: RerankCache::new(),
        }
    }

    pub fn cache(&self) -> &RerankCache {
        &self.cache
    }

    /// Rerank `functions` by relevance to `intent`. On any failure the
    /// input order is returned unchanged.
    pub async fn rerank(&self, functions: Vec<Function>, intent: &str) -> Vec<Function> {
        if functions.len() < 2 || intent.is_empty() {
            return functions;
        }

        let window = functions.len().min(RERANK_WINDOW);
        let names: Vec<&str> = functions[..window].iter().map(|f| f.name.as_str()).collect();
        let key = cache_key(intent, &names);
        if let Some(indices) = self.cache.get(&key) {
            debug!(intent_len = intent.len(), "rerank cache hit");
            return apply_indices(functions, &indices, window);
        }

        let prompt = build_prompt(intent, &functions[..window]);
        let indices = match self.call_model(&prompt).await {
            Some(response) => parse_rerank_response(&response, window),
            None => return functions,
        };

        self.cache.insert(key, indices.clone());
        apply_indices(functions, &indices, window)
    }

    /// One retry on top of the 2 s client timeout.
    async fn call_model(&self, prompt: &str) -> Option<String> {
        for attempt in 0..2 {
            match self.try_call_model(prompt).await {
                Ok(content) => return Some(content),
                Err(e) => {
                    warn!(attempt, error = %e, "rerank model call failed");
                }
            }
        }
        None
    }

    async fn try_call_model(&self, prompt: &str) -> Result<String, reqwest::Error> {
        let body = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": "You are a function matching expert. Analyze the user's intent and rank functions by relevance."
                },
                {"role": "user", "content": prompt}
            ],
            "temperature": 0,
            "max_tokens": 500
        });
        let response: Value = self
            .client
            .post(format!("{}/v1/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or_default()
            .to_string())
    }
}

fn build_prompt(intent: &str, candidates: &[Function]) -> String {
    let metadata: Vec<Value> = candidates
        .iter()
        .enumerate()
        .map(|(index, function)| {
            json!({
                "index": index,
                "name": function.name,
                "description": function.description,
                "app_name": function.app_name(),
                "required_params": required_params(&function.parameters),
            })
        })
        .collect();
    let functions_str = serde_json::to_string_pretty(&metadata).unwrap_or_default();

    format!(
        "User Intent: \"{intent}\"\n\n\
         Functions to rank:\n{functions_str}\n\n\
         Task: Analyze the user's intent and rank these functions by relevance. Consider:\n\
         1. Direct name/description match to the intent\n\
         2. Whether the function can fulfill the user's goal\n\
         3. Required parameters - penalize functions requiring data not mentioned by the user\n\
         4. Prefer functions from relevant services mentioned in the intent\n\n\
         Return ONLY a JSON array of indices in order of relevance (most relevant first).\n\
         Example: [2, 0, 5, 1, 3, 4]\n\n\
         Your response:"
    )
}

fn required_params(parameters: &Value) -> Vec<String> {
    parameters
        .get("required")
        .and_then(Value::as_array)
        .map(|reqs| {
            reqs.iter()
                .filter_map(Value::as_str)
                .take(MAX_REQUIRED_PARAMS)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

/// Parse the model's index list: markdown fences tolerated, indices
/// validated for bounds and uniqueness. A parse failure yields the
/// identity order.
pub fn parse_rerank_response(response: &str, num_candidates: usize) -> Vec<usize> {
    let mut text = response.trim();
    if text.starts_with("```") {
        text = text
            .trim_start_matches("```json")
            .trim_start_matches("```")
            .trim_end_matches("```")
            .trim();
    }

    let Ok(Value::Array(raw)) = serde_json::from_str::<Value>(text) else {
        return (0..num_candidates).collect();
    };

    let mut seen = vec![false; num_candidates];
    let mut indices = Vec::new();
    for value in raw {
        if let Some(index) = value.as_u64().map(|i| i as usize) {
            if index < num_candidates && !seen[index] {
                seen[index] = true;
                indices.push(index);
            }
        }
    }
    indices
}

/// Apply a validated index order to the rerank window, then append the
/// untouched tail in its original order.
fn apply_indices(functions: Vec<Function>, indices: &[usize], window: usize) -> Vec<Function> {
    let mut taken = vec![false; functions.len()];
    let mut reranked = Vec::with_capacity(functions.len());
    for &index in indices {
        if index < window && !taken[index] {
            taken[index] = true;
            reranked.push(functions[index].clone());
        }
    }
    for (index, function) in functions.into_iter().enumerate() {
        if !taken[index] {
            reranked.push(function);
        }
    }
    reranked
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Protocol, Visibility};
    use chrono::Utc;
    use uuid::Uuid;

    fn function(name: &str) -> Function {
        Function {
            id: Uuid::new_v4(),
            app_id: Uuid::new_v4(),
            name: name.into(),
            description: format!("{name} description"),
            parameters: json!({"required": ["body"]}),
            protocol: Protocol::Rest,
            protocol_data: json!({}),
            visibility: Visibility::Public,
            active: true,
            embedding: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_cache_key_changes_with_inputs() {
        let a = cache_key("send email", &["GMAIL__SEND_EMAIL"]);
        let b = cache_key("send email", &["GMAIL__SEND_EMAIL", "SLACK__POST"]);
        let c = cache_key("send mail", &["GMAIL__SEND_EMAIL"]);
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn test_cache_bounds() {
        let cache = RerankCache::new();
        for i in 0..150 {
            cache.insert(format!("key-{i}"), vec![0]);
        }
        assert!(cache.len() <= MAX_CACHE_SIZE);
    }

    #[test]
    fn test_cache_hit_and_miss() {
        let cache = RerankCache::new();
        cache.insert("k".into(), vec![2, 0, 1]);
        assert_eq!(cache.get("k"), Some(vec![2, 0, 1]));
        assert_eq!(cache.get("missing"), None);
    }

    #[test]
    fn test_parse_rerank_response_plain() {
        assert_eq!(parse_rerank_response("[2, 0, 1]", 3), vec![2, 0, 1]);
    }

    #[test]
    fn test_parse_rerank_response_markdown_fence() {
        assert_eq!(
            parse_rerank_response("```json\n[1, 0]\n```", 2),
            vec![1, 0]
        );
    }

    #[test]
    fn test_parse_rerank_response_validates_bounds_and_uniqueness() {
        assert_eq!(parse_rerank_response("[5, 1, 1, 0]", 3), vec![1, 0]);
    }

    #[test]
    fn test_parse_rerank_response_garbage_is_identity() {
        assert_eq!(parse_rerank_response("not json", 3), vec![0, 1, 2]);
        assert_eq!(parse_rerank_response("{\"a\": 1}", 2), vec![0, 1]);
    }

    #[test]
    fn test_apply_indices_appends_untouched_tail() {
        let functions = vec![function("A__X"), function("B__Y"), function("C__Z")];
        let reranked = apply_indices(functions, &[1], 2);
        let names: Vec<&str> = reranked.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, ["B__Y", "A__X", "C__Z"]);
    }

    #[test]
    fn test_build_prompt_includes_candidates() {
        let prompt = build_prompt("send an email", &[function("GMAIL__SEND_EMAIL")]);
        assert!(prompt.contains("User Intent: \"send an email\""));
        assert!(prompt.contains("GMAIL__SEND_EMAIL"));
        assert!(prompt.contains("\"app_name\": \"GMAIL\""));
        assert!(prompt.contains("Return ONLY a JSON array"));
    }

    #[tokio::test]
    async fn test_rerank_single_candidate_short_circuits() {
        let reranker = Reranker::new("key".into(), "model".into(), None);
        let functions = vec![function("A__X")];
        let result = reranker.rerank(functions.clone(), "intent").await;
        assert_eq!(result.len(), 1);
        assert!(reranker.cache().is_empty());
    }
}
