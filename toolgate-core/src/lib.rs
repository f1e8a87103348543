//! # ToolGate Core
//!
//! Core library for the ToolGate tool-execution gateway.
//! Provides the catalog store, embedding client, function search with LLM
//! reranking, credential broker (OAuth 2.0 / OAuth 1.0a / API key / no-auth),
//! and the REST function executor.

pub mod credentials;
pub mod embeddings;
pub mod error;
pub mod executor;
pub mod instructions;
pub mod manifest;
pub mod rerank;
pub mod search;
pub mod store;
pub mod types;

// Re-export commonly used types at the crate root.
pub use credentials::{
    ApiKeyCredentials, CredentialBroker, CredentialsResponse, NoAuthCredentials,
    OAuth1Credentials, OAuth2Credentials, ResolvedCredentials,
};
pub use embeddings::{Embedder, HashEmbedder, OpenAiEmbedder};
pub use error::{
    CredentialError, EmbeddingError, ExecutionError, Result, SearchError, StoreError,
    ToolgateError, TriggerError,
};
pub use executor::{ComposedBody, ComposedRequest, ExecutionAuth, ExecutionResult, RestExecutor};
pub use instructions::{AllowAllPolicy, InstructionDecision, InstructionPolicy};
pub use manifest::{
    AppManifest, FunctionManifest, RestMetadata, filter_visible_properties, function_definition,
};
pub use rerank::{RerankCache, Reranker};
pub use search::{FunctionSearch, SearchParams};
pub use store::{CatalogStore, FunctionQuery, LinkedAccountPage, NewSearchFeedback};
pub use types::{
    Agent, App, AppConfiguration, FeedbackType, Function, FunctionDefinitionFormat,
    FunctionSearchFeedback, HttpLocation, LinkedAccount, OAuth1TempToken, Project, Protocol,
    SecurityScheme, SecuritySchemes, Trigger, TriggerEvent, TriggerEventStatus, TriggerStatus,
    Visibility,
};
