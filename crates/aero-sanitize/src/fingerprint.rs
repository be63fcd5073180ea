//! Session fingerprint: a stable key for one conversation derived from its
//! opening user turn. Survives clients that re-issue every other identifier.

use sha2::{Digest, Sha256};

use aero_protocol::model::{Message, Role};

/// Hash of the first user turn's canonical text. `None` when the history has
/// no user text to anchor on.
pub fn session_fingerprint(messages: &[Message]) -> Option<String> {
    let first_user = messages.iter().find(|m| m.role == Role::User)?;
    let canonical = first_user
        .plain_text()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if canonical.is_empty() {
        return None;
    }
    let digest = Sha256::digest(canonical.as_bytes());
    Some(hex::encode(digest)[..32].to_string())
}
