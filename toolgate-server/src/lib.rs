//! # ToolGate Server
//!
//! The agent-facing HTTP surface of the gateway: function discovery and
//! execution, account linking (OAuth2 / OAuth1 / API key / no-auth), the
//! trigger registry, the provider webhook receiver, rate limiting,
//! metrics, and the background maintenance loops.

pub mod auth;
pub mod config;
pub mod error;
pub mod jobs;
pub mod metrics;
pub mod queue;
pub mod quota;
pub mod rate_limit;
pub mod routes;
pub mod state;
pub mod triggers;

pub use auth::RequestContext;
pub use config::ServerConfig;
pub use error::ApiError;
pub use metrics::{MetricsCollector, MetricsSnapshot};
pub use queue::{EventQueue, NormalizedEvent};
pub use quota::{NoopQuotaEnforcer, QuotaEnforcer};
pub use rate_limit::{RateLimitInfo, RateLimiter};
pub use routes::router;
pub use state::{AppState, SearchStash, SharedState};
