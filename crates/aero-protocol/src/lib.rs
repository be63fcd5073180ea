pub mod anthropic;
pub mod budget;
pub mod gemini;
pub mod model;
pub mod openai;
pub mod thought_id;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("unsupported content block: {0}")]
    UnsupportedBlock(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, TranslateError>;
