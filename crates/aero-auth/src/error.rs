use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid identity file {path}: {reason}")]
    InvalidIdentity { path: String, reason: String },

    #[error("token refresh failed ({status}): {message}")]
    Refresh { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unknown credential '{id}' in pool '{backend}'")]
    UnknownCredential { backend: String, id: String },
}

pub type Result<T> = std::result::Result<T, AuthError>;
