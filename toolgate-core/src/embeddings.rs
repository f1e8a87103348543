//! Pluggable embedding providers for semantic function search.
//!
//! Provides a trait-based abstraction over embedding models with an OpenAI
//! API implementation and a deterministic hashing embedder for tests. Also
//! owns the canonical embedding-text builders: the catalog write path
//! regenerates vectors whenever a contributing field changes, readers never
//! recompute.

use crate::error::EmbeddingError;
use crate::types::App;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// Trait for embedding providers.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Generate an embedding for a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;

    /// Return the dimensionality of produced embeddings.
    fn dimensions(&self) -> usize;
}

/// OpenAI-compatible embedding client.
pub struct OpenAiEmbedder {
    client: reqwest::Client,
    api_key: String,
    model: String,
    dimensions: usize,
    base_url: String,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingDatum>,
}

#[derive(Deserialize)]
struct EmbeddingDatum {
    embedding: Vec<f32>,
}

impl OpenAiEmbedder {
    pub fn new(api_key: String, model: String, dimensions: usize, base_url: Option<String>) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key,
            model,
            dimensions,
            base_url: base_url.unwrap_or_else(|| "https://api.openai.com".into()),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let body = serde_json::json!({
            "input": [text],
            "model": self.model,
            "dimensions": self.dimensions,
        });
        let response = self
            .client
            .post(format!("{}/v1/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| EmbeddingError::Unavailable {
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(EmbeddingError::Unavailable {
                message: format!("embedding endpoint returned {}", response.status()),
            });
        }

        let parsed: EmbeddingResponse =
            response.json().await.map_err(|e| EmbeddingError::Unavailable {
                message: e.to_string(),
            })?;
        let embedding = parsed
            .data
            .into_iter()
            .next()
            .map(|d| d.embedding)
            .ok_or_else(|| EmbeddingError::Unavailable {
                message: "embedding response contained no data".into(),
            })?;

        if embedding.len() != self.dimensions {
            return Err(EmbeddingError::DimensionMismatch {
                expected: self.dimensions,
                actual: embedding.len(),
            });
        }
        Ok(embedding)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Deterministic term-hashing embedder. Always available, used by tests and
/// as an offline fallback; L2-normalized so cosine distances are meaningful.
#[derive(Debug, Clone)]
pub struct HashEmbedder {
    dimensions: usize,
}

impl HashEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self { dimensions }
    }
}

fn term_hash(s: &str) -> usize {
    let mut hash: usize = 5381;
    for b in s.bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(b as usize);
    }
    hash
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let mut vector = vec![0.0f32; self.dimensions];
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        let mut tf: HashMap<&str, usize> = HashMap::new();
        for word in &words {
            *tf.entry(word).or_insert(0) += 1;
        }
        for (term, count) in &tf {
            let idx = term_hash(term) % self.dimensions;
            vector[idx] += *count as f32;
        }

        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        Ok(vector)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Cosine distance between two vectors (1 - cosine similarity).
///
/// Mismatched or zero-norm vectors rank last (distance 1.0).
pub fn cosine_distance(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 1.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 1.0;
    }
    1.0 - dot / (norm_a.sqrt() * norm_b.sqrt())
}

/// Canonical embedding text for a function manifest.
///
/// `"Function: <short> | Description: <desc> | Parameters: k1: d1, ... | Service: <APP>"`,
/// with at most the first 10 parameters of the body/query/path sub-schemas.
pub fn function_embedding_text(name: &str, description: &str, parameters: &Value) -> String {
    let (app_name, short_name) = match name.split_once("__") {
        Some((app, action)) => (Some(app), action),
        None => (None, name),
    };

    let mut parts = vec![
        format!("Function: {short_name}"),
        format!("Description: {description}"),
    ];

    let mut params: Vec<String> = Vec::new();
    if let Some(locations) = parameters.get("properties").and_then(Value::as_object) {
        for location in locations.values() {
            let Some(props) = location.get("properties").and_then(Value::as_object) else {
                continue;
            };
            for (key, schema) in props {
                if params.len() >= 10 {
                    break;
                }
                match schema.get("description").and_then(Value::as_str) {
                    Some(desc) if !desc.is_empty() => params.push(format!("{key}: {desc}")),
                    _ => params.push(key.clone()),
                }
            }
        }
    }
    if !params.is_empty() {
        parts.push(format!("Parameters: {}", params.join(", ")));
    }
    if let Some(app) = app_name {
        parts.push(format!("Service: {app}"));
    }
    parts.join(" | ")
}

/// Canonical embedding text for an app manifest.
pub fn app_embedding_text(app: &App) -> String {
    let mut parts = vec![format!("App: {}", app.name)];
    if !app.display_name.is_empty() {
        parts.push(format!("Display: {}", app.display_name));
    }
    if !app.description.is_empty() {
        parts.push(format!("Description: {}", app.description));
    }
    if !app.categories.is_empty() {
        parts.push(format!("Categories: {}", app.categories.join(", ")));
    }
    if !app.provider.is_empty() {
        parts.push(format!("Provider: {}", app.provider));
    }
    parts.join(" | ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_hash_embedder_deterministic() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("send an email").await.unwrap();
        let b = embedder.embed("send an email").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[tokio::test]
    async fn test_hash_embedder_normalized() {
        let embedder = HashEmbedder::new(32);
        let v = embedder.embed("create a shopify order").await.unwrap();
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_similar_texts_rank_closer() {
        let embedder = HashEmbedder::new(256);
        let query = embedder.embed("send an email message").await.unwrap();
        let email = embedder
            .embed("Function: SEND_EMAIL | Description: send an email message to a recipient")
            .await
            .unwrap();
        let order = embedder
            .embed("Function: CREATE_ORDER | Description: create a new sales order")
            .await
            .unwrap();
        assert!(cosine_distance(&query, &email) < cosine_distance(&query, &order));
    }

    #[test]
    fn test_cosine_distance_edge_cases() {
        assert_eq!(cosine_distance(&[], &[]), 1.0);
        assert_eq!(cosine_distance(&[1.0, 0.0], &[0.0]), 1.0);
        assert_eq!(cosine_distance(&[0.0, 0.0], &[1.0, 0.0]), 1.0);
        assert!(cosine_distance(&[1.0, 0.0], &[1.0, 0.0]).abs() < 1e-6);
        assert!((cosine_distance(&[1.0, 0.0], &[0.0, 1.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_function_embedding_text_canonical_form() {
        let parameters = json!({
            "type": "object",
            "properties": {
                "body": {
                    "type": "object",
                    "properties": {
                        "to": {"type": "string", "description": "recipient address"},
                        "subject": {"type": "string"}
                    },
                    "additionalProperties": false
                }
            },
            "additionalProperties": false
        });
        let text = function_embedding_text("GMAIL__SEND_EMAIL", "Send an email", &parameters);
        assert!(text.starts_with("Function: SEND_EMAIL | Description: Send an email"));
        assert!(text.contains("to: recipient address"));
        assert!(text.contains("subject"));
        assert!(text.ends_with("Service: GMAIL"));
    }

    #[test]
    fn test_function_embedding_text_caps_parameters() {
        let mut props = serde_json::Map::new();
        for i in 0..15 {
            props.insert(format!("p{i:02}"), json!({"type": "string"}));
        }
        let parameters = json!({
            "type": "object",
            "properties": {"body": {"type": "object", "properties": props}}
        });
        let text = function_embedding_text("APP__ACTION", "desc", &parameters);
        let param_section = text
            .split(" | ")
            .find(|s| s.starts_with("Parameters: "))
            .unwrap();
        assert_eq!(param_section.matches(',').count(), 9);
    }
}
