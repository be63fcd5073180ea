pub mod credential;
pub mod error;
pub mod manager;
pub mod refresh;

pub use credential::{Credential, FailureKind, IdentityFile};
pub use error::{AuthError, Result};
pub use manager::{AcquiredCredential, CredentialManager};
