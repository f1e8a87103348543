//! Error types for the ToolGate core.
//!
//! Uses `thiserror` for public API error types with structured variants
//! covering the store, embedding, search, credential, execution, and
//! trigger domains.

/// Top-level error type for the ToolGate core library.
#[derive(Debug, thiserror::Error)]
pub enum ToolgateError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),

    #[error("Search error: {0}")]
    Search(#[from] SearchError),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Trigger error: {0}")]
    Trigger(#[from] TriggerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors from the catalog store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Invalid stored value for {column}: {message}")]
    Corrupt { column: String, message: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: &'static str, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: &'static str, name: String },

    #[error("Security scheme mismatch: configuration uses {configured}, got {given}")]
    SchemeMismatch { configured: String, given: String },
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Corrupt {
            column: "json".into(),
            message: e.to_string(),
        }
    }
}

/// Errors from the embedding client.
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Embedding provider unavailable: {message}")]
    Unavailable { message: String },

    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
}

/// Errors from function search.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbeddingError),
}

/// Errors from the credential broker and the OAuth flows.
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("OAuth2 error: {message}")]
    OAuth2 { message: String },

    #[error("OAuth1 error: {message}")]
    OAuth1 { message: String },

    #[error("App '{app}' has no {scheme} security scheme configured")]
    MissingScheme { app: String, scheme: String },

    #[error("Credentials do not match security scheme {scheme}: {message}")]
    SchemeMismatch { scheme: String, message: String },

    #[error("No default credentials provided for app '{app}' scheme {scheme}")]
    NoDefaultCredentials { app: String, scheme: String },

    #[error("Invalid OAuth state: {message}")]
    InvalidState { message: String },

    #[error("Token endpoint request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// Errors from the function executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("Unsupported protocol: {protocol}")]
    UnsupportedProtocol { protocol: String },

    #[error("Invalid protocol data for function '{function}': {message}")]
    InvalidProtocolData { function: String, message: String },

    #[error("Execution blocked by custom instructions: {message}")]
    InstructionViolation { message: String },
}

/// Errors from the trigger registry.
#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("No trigger connector registered for app '{app}'")]
    ConnectorNotFound { app: String },

    #[error("Webhook registration failed: {message}")]
    RegistrationFailed { message: String },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// A type alias for results using the top-level `ToolgateError`.
pub type Result<T> = std::result::Result<T, ToolgateError>;
