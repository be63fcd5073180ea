use thiserror::Error;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Conversation not found: {scid}")]
    NotFound { scid: String },
}

pub type Result<T> = std::result::Result<T, StateError>;
