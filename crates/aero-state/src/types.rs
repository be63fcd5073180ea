use aero_protocol::model::Message;
use serde::{Deserialize, Serialize};

/// Server-side authoritative record of one conversation.
///
/// History is kept in block-list form — thinking blocks and their signatures
/// survive here even when the client flattens them away on replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationState {
    pub scid: String,
    pub client_type: String,
    pub history: Vec<Message>,
    /// Signature of the newest assistant thinking block, used as the
    /// second recovery layer by the sanitizer.
    pub last_signature: Option<String>,
    pub created_at: i64,
    pub expires_at: i64,
    pub access_count: u64,
}

impl ConversationState {
    pub fn new(scid: String, client_type: String, idle_ttl_secs: u64) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            scid,
            client_type,
            history: Vec::new(),
            last_signature: None,
            created_at: now,
            expires_at: now + idle_ttl_secs as i64,
            access_count: 0,
        }
    }

    pub fn is_expired(&self, now: i64) -> bool {
        now >= self.expires_at
    }

    /// Push expiry out after activity.
    pub fn touch(&mut self, idle_ttl_secs: u64) {
        self.expires_at = chrono::Utc::now().timestamp() + idle_ttl_secs as i64;
        self.access_count += 1;
    }
}
