use thiserror::Error;

#[derive(Debug, Error)]
pub enum AeroError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("No usable credential for {backend}/{model}")]
    NoCredential { backend: String, model: String },

    #[error("All backends exhausted: {0}")]
    ChainExhausted(String),

    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    #[error("Translation error: {0}")]
    Translate(String),

    #[error("Unsupported model: {model}")]
    UnsupportedModel { model: String },

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request timeout after {ms}ms")]
    Timeout { ms: u64 },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AeroError {
    /// Short error code string surfaced in client-facing error envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            AeroError::Config(_) => "CONFIG_ERROR",
            AeroError::AuthFailed(_) => "AUTH_FAILED",
            AeroError::NoCredential { .. } => "NO_CREDENTIAL",
            AeroError::ChainExhausted(_) => "CHAIN_EXHAUSTED",
            AeroError::Upstream { .. } => "UPSTREAM_ERROR",
            AeroError::Translate(_) => "TRANSLATE_ERROR",
            AeroError::UnsupportedModel { .. } => "UNSUPPORTED_MODEL",
            AeroError::Database(_) => "DATABASE_ERROR",
            AeroError::Serialization(_) => "SERIALIZATION_ERROR",
            AeroError::Io(_) => "IO_ERROR",
            AeroError::Timeout { .. } => "TIMEOUT",
            AeroError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, AeroError>;
