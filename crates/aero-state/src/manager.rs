//! Per-conversation authoritative history.
//!
//! The manager is advisory: requests without a conversation id skip it
//! entirely. Its value is giving the sanitizer a clean source of truth for
//! thinking blocks and tool pairing when IDE clients mangle replayed history.

use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use rusqlite::Connection;
use tracing::{debug, warn};
use uuid::Uuid;

use aero_protocol::model::{ContentBlock, Message, Role};

use crate::error::Result;
use crate::types::ConversationState;

pub struct ConversationManager {
    /// One mutex per conversation; different scids proceed fully in parallel.
    states: DashMap<String, Arc<Mutex<ConversationState>>>,
    idle_ttl_secs: u64,
    db: Option<Mutex<Connection>>,
}

impl ConversationManager {
    pub fn new(idle_ttl_secs: u64, db: Option<Connection>) -> Result<Self> {
        if let Some(conn) = &db {
            crate::db::init_db(conn)?;
        }
        Ok(Self {
            states: DashMap::new(),
            idle_ttl_secs,
            db: db.map(Mutex::new),
        })
    }

    pub fn in_memory(idle_ttl_secs: u64) -> Self {
        Self {
            states: DashMap::new(),
            idle_ttl_secs,
            db: None,
        }
    }

    /// Look up a conversation, or create one when `scid` is unknown or absent.
    /// Returns the (possibly newly issued) scid with the state handle.
    pub fn get_or_create(
        &self,
        scid: Option<&str>,
        client_type: &str,
    ) -> (String, Arc<Mutex<ConversationState>>) {
        if let Some(scid) = scid {
            if let Some(existing) = self.states.get(scid) {
                return (scid.to_string(), existing.value().clone());
            }
            // Unknown scid from the client: try the persistent store before
            // starting fresh under the same id.
            if let Some(state) = self.load_persisted(scid) {
                let handle = Arc::new(Mutex::new(state));
                self.states.insert(scid.to_string(), handle.clone());
                return (scid.to_string(), handle);
            }
            let state = ConversationState::new(
                scid.to_string(),
                client_type.to_string(),
                self.idle_ttl_secs,
            );
            let handle = Arc::new(Mutex::new(state));
            self.states.insert(scid.to_string(), handle.clone());
            return (scid.to_string(), handle);
        }

        let scid = format!("conv_{}", Uuid::new_v4().simple());
        debug!(%scid, client_type, "issuing new conversation id");
        let state =
            ConversationState::new(scid.clone(), client_type.to_string(), self.idle_ttl_secs);
        let handle = Arc::new(Mutex::new(state));
        self.states.insert(scid.clone(), handle.clone());
        (scid, handle)
    }

    /// Merge client-replayed history with the authoritative record.
    ///
    /// Reliable replayers: leading client messages matching the authoritative
    /// prefix are discarded and the rest is appended. Unreliable replayers
    /// contribute only their last user turn; everything earlier comes from
    /// the record.
    pub fn merge_with_client_history(
        state: &ConversationState,
        client_messages: &[Message],
        reliable_replay: bool,
    ) -> Vec<Message> {
        if state.history.is_empty() {
            return client_messages.to_vec();
        }

        if reliable_replay {
            let matched = state
                .history
                .iter()
                .zip(client_messages.iter())
                .take_while(|(ours, theirs)| messages_match(ours, theirs))
                .count();
            let mut merged = state.history.clone();
            merged.extend(client_messages[matched..].iter().cloned());
            merged
        } else {
            let mut merged = state.history.clone();
            if let Some(last_user) = client_messages.iter().rev().find(|m| m.role == Role::User) {
                merged.push(last_user.clone());
            }
            merged
        }
    }

    /// Record one completed round-trip: the merged request history plus the
    /// streamed assistant response, signatures preserved in block form.
    pub fn commit_turn(
        &self,
        scid: &str,
        merged_history: Vec<Message>,
        assistant_message: Message,
    ) {
        let Some(handle) = self.states.get(scid).map(|h| h.value().clone()) else {
            return;
        };
        let mut state = handle.lock().unwrap();

        state.last_signature = assistant_message
            .content
            .iter()
            .find_map(|b| match b {
                ContentBlock::Thinking {
                    signature: Some(sig),
                    ..
                } => Some(sig.clone()),
                _ => None,
            })
            .or_else(|| state.last_signature.clone());

        state.history = merged_history;
        state.history.push(assistant_message);
        state.touch(self.idle_ttl_secs);
        self.persist(&state);
    }

    /// Drop expired conversations. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = chrono::Utc::now().timestamp();
        let expired: Vec<String> = self
            .states
            .iter()
            .filter(|entry| entry.value().lock().unwrap().is_expired(now))
            .map(|entry| entry.key().clone())
            .collect();
        for scid in &expired {
            self.states.remove(scid);
        }
        if let Some(db) = &self.db {
            let db = db.lock().unwrap();
            if let Err(e) = db.execute(
                "DELETE FROM conversations WHERE expires_at <= ?1",
                rusqlite::params![now],
            ) {
                warn!(error = %e, "conversation sweep failed");
            }
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn persist(&self, state: &ConversationState) {
        let Some(db) = &self.db else { return };
        let history = match serde_json::to_string(&state.history) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "conversation history serialization failed");
                return;
            }
        };
        let db = db.lock().unwrap();
        if let Err(e) = db.execute(
            "INSERT OR REPLACE INTO conversations
             (scid, client_type, history, last_signature, created_at, expires_at, access_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                state.scid,
                state.client_type,
                history,
                state.last_signature,
                state.created_at,
                state.expires_at,
                state.access_count as i64,
            ],
        ) {
            warn!(error = %e, scid = %state.scid, "conversation persist failed");
        }
    }

    fn load_persisted(&self, scid: &str) -> Option<ConversationState> {
        let db = self.db.as_ref()?;
        let db = db.lock().unwrap();
        let result = db.query_row(
            "SELECT client_type, history, last_signature, created_at, expires_at, access_count
             FROM conversations WHERE scid = ?1",
            rusqlite::params![scid],
            |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            },
        );
        match result {
            Ok((client_type, history, last_signature, created_at, expires_at, access_count)) => {
                let now = chrono::Utc::now().timestamp();
                if now >= expires_at {
                    return None;
                }
                let history: Vec<Message> = serde_json::from_str(&history).ok()?;
                Some(ConversationState {
                    scid: scid.to_string(),
                    client_type,
                    history,
                    last_signature,
                    created_at,
                    expires_at,
                    access_count: access_count as u64,
                })
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => None,
            Err(e) => {
                warn!(error = %e, scid, "conversation load failed");
                None
            }
        }
    }
}

/// Replay match: role plus visible text. Thinking blocks and signatures are
/// exactly what clients mangle, so they do not participate.
fn messages_match(ours: &Message, theirs: &Message) -> bool {
    ours.role == theirs.role && ours.plain_text() == theirs.plain_text()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aero_protocol::model::ContentBlock;

    fn user(text: &str) -> Message {
        Message::user(vec![ContentBlock::text(text)])
    }

    fn assistant(text: &str) -> Message {
        Message::assistant(vec![ContentBlock::text(text)])
    }

    #[test]
    fn issues_scid_when_absent() {
        let manager = ConversationManager::in_memory(3600);
        let (scid, _) = manager.get_or_create(None, "cli");
        assert!(scid.starts_with("conv_"));
        let (scid2, _) = manager.get_or_create(Some(&scid), "cli");
        assert_eq!(scid, scid2);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn merge_on_empty_history_takes_client_messages() {
        let state = ConversationState::new("s".into(), "cli".into(), 3600);
        let client = vec![user("hi")];
        let merged = ConversationManager::merge_with_client_history(&state, &client, true);
        assert_eq!(merged, client);
    }

    #[test]
    fn merge_appends_net_new_suffix() {
        let mut state = ConversationState::new("s".into(), "cli".into(), 3600);
        state.history = vec![user("hi"), assistant("hello")];

        let client = vec![user("hi"), assistant("hello"), user("continue")];
        let merged = ConversationManager::merge_with_client_history(&state, &client, true);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[2].plain_text(), "continue");
    }

    #[test]
    fn merge_keeps_authoritative_blocks_over_flattened_replay() {
        let sig = "s".repeat(64);
        let mut state = ConversationState::new("s".into(), "cli".into(), 3600);
        state.history = vec![
            user("hi"),
            Message::assistant(vec![
                ContentBlock::Thinking {
                    thinking: "reasoning".into(),
                    signature: Some(sig.clone()),
                    redacted: false,
                },
                ContentBlock::text("hello"),
            ]),
        ];

        // Client replays the assistant turn flattened to text only.
        let client = vec![user("hi"), assistant("hello"), user("continue")];
        let merged = ConversationManager::merge_with_client_history(&state, &client, true);

        // The authoritative assistant turn (with its signature) wins.
        match &merged[1].content[0] {
            ContentBlock::Thinking { signature, .. } => {
                assert_eq!(signature.as_deref(), Some(sig.as_str()));
            }
            other => panic!("unexpected block: {other:?}"),
        }
        assert_eq!(merged[2].plain_text(), "continue");
    }

    #[test]
    fn unreliable_replay_takes_only_last_user_turn() {
        let mut state = ConversationState::new("s".into(), "cli".into(), 3600);
        state.history = vec![user("hi"), assistant("hello")];

        // Client re-ordered and rewrote everything; only its newest user
        // message is trusted.
        let client = vec![user("mangled"), assistant("fake"), user("the real question")];
        let merged = ConversationManager::merge_with_client_history(&state, &client, false);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[0].plain_text(), "hi");
        assert_eq!(merged[1].plain_text(), "hello");
        assert_eq!(merged[2].plain_text(), "the real question");
    }

    #[test]
    fn commit_turn_updates_history_and_signature() {
        let manager = ConversationManager::in_memory(3600);
        let (scid, handle) = manager.get_or_create(None, "cli");

        let sig = "g".repeat(64);
        manager.commit_turn(
            &scid,
            vec![user("hi")],
            Message::assistant(vec![
                ContentBlock::Thinking {
                    thinking: "reasoning".into(),
                    signature: Some(sig.clone()),
                    redacted: false,
                },
                ContentBlock::text("hello"),
            ]),
        );

        let state = handle.lock().unwrap();
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.last_signature.as_deref(), Some(sig.as_str()));
        assert_eq!(state.access_count, 1);
    }

    #[test]
    fn sweep_removes_expired() {
        let manager = ConversationManager::in_memory(3600);
        let (_, handle) = manager.get_or_create(None, "cli");
        handle.lock().unwrap().expires_at = 0;
        assert_eq!(manager.sweep_expired(), 1);
        assert!(manager.is_empty());
    }

    #[test]
    fn persists_and_reloads_across_managers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("conversations.db");

        let scid = {
            let conn = Connection::open(&path).unwrap();
            let manager = ConversationManager::new(3600, Some(conn)).unwrap();
            let (scid, _) = manager.get_or_create(None, "editor-extension");
            manager.commit_turn(&scid, vec![user("hi")], assistant("hello"));
            scid
        };

        let conn = Connection::open(&path).unwrap();
        let manager = ConversationManager::new(3600, Some(conn)).unwrap();
        let (_, handle) = manager.get_or_create(Some(&scid), "editor-extension");
        let state = handle.lock().unwrap();
        assert_eq!(state.history.len(), 2);
        assert_eq!(state.client_type, "editor-extension");
    }
}
