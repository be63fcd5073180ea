pub mod fingerprint;
pub mod sanitize;

pub use fingerprint::session_fingerprint;
pub use sanitize::{sanitize, SanitizeContext, SanitizeOutcome, SanitizeReport};
