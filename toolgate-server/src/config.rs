//! Server configuration.
//!
//! Layered with figment: built-in defaults, then `toolgate.toml`, then
//! `TOOLGATE_*` environment variables (highest precedence).

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address, e.g. "0.0.0.0:8000".
    pub listen_addr: String,
    /// SQLite database path.
    pub database_path: PathBuf,
    /// Public base URL of this deployment; webhook and OAuth redirect URLs
    /// are built from it.
    pub base_url: String,
    /// HS256 key for OAuth state JWTs.
    pub signing_key: String,
    /// Embedding / rerank provider credentials.
    pub openai_api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimension")]
    pub embedding_dimension: usize,
    /// Chat model used for search reranking; empty disables reranking.
    #[serde(default = "default_rerank_model")]
    pub rerank_model: String,
    /// Global webhook rate limit (per source IP).
    #[serde(default = "default_global_rate")]
    pub global_rate_per_sec: u32,
    #[serde(default = "default_global_burst")]
    pub global_burst: u32,
    /// Per-trigger webhook rate limit.
    #[serde(default = "default_trigger_rate")]
    pub trigger_rate_per_sec: u32,
    #[serde(default = "default_trigger_burst")]
    pub trigger_burst: u32,
    /// Background scheduler cadence.
    #[serde(default = "default_renewal_interval")]
    pub renewal_interval_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_openai_base_url() -> String {
    "https://api.openai.com".into()
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".into()
}

fn default_embedding_dimension() -> usize {
    1024
}

fn default_rerank_model() -> String {
    "gpt-4o-mini".into()
}

fn default_global_rate() -> u32 {
    100
}

fn default_global_burst() -> u32 {
    200
}

fn default_trigger_rate() -> u32 {
    10
}

fn default_trigger_burst() -> u32 {
    20
}

fn default_renewal_interval() -> u64 {
    15 * 60
}

fn default_cleanup_interval() -> u64 {
    60 * 60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".into(),
            database_path: PathBuf::from("toolgate.db"),
            base_url: "http://localhost:8000".into(),
            signing_key: String::new(),
            openai_api_key: String::new(),
            openai_base_url: default_openai_base_url(),
            embedding_model: default_embedding_model(),
            embedding_dimension: default_embedding_dimension(),
            rerank_model: default_rerank_model(),
            global_rate_per_sec: default_global_rate(),
            global_burst: default_global_burst(),
            trigger_rate_per_sec: default_trigger_rate(),
            trigger_burst: default_trigger_burst(),
            renewal_interval_secs: default_renewal_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from defaults, `toolgate.toml`, and the
    /// environment.
    pub fn load() -> Result<Self, figment::Error> {
        Figment::from(Serialized::defaults(ServerConfig::default()))
            .merge(Toml::file("toolgate.toml"))
            .merge(Env::prefixed("TOOLGATE_"))
            .extract()
    }

    /// Startup validation for the fields with no sensible default.
    pub fn validate(&self) -> Result<(), String> {
        if self.signing_key.is_empty() {
            return Err("signing_key must be set (TOOLGATE_SIGNING_KEY)".into());
        }
        if self.base_url.ends_with('/') {
            return Err("base_url must not carry a trailing slash".into());
        }
        Ok(())
    }

    pub fn webhook_url(&self, provider: &str, trigger_id: uuid::Uuid) -> String {
        format!("{}/v1/webhooks/{provider}/{trigger_id}", self.base_url)
    }

    pub fn oauth2_callback_url(&self) -> String {
        format!("{}/v1/linked-accounts/oauth2/callback", self.base_url)
    }

    pub fn oauth1_callback_url(&self) -> String {
        format!("{}/v1/linked-accounts/oauth1/callback", self.base_url)
    }
}
