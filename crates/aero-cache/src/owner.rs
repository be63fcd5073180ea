//! Multi-tenant isolation key.

use sha2::{Digest, Sha256};

/// Deterministic owner id derived from a caller's bearer token.
///
/// Truncated to 16 hex chars — enough to separate tenants sharing one
/// gateway instance without putting token material in logs or cache rows.
pub fn owner_id(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(digest)[..16].to_string()
}
