//! Multi-indexed thinking-signature store.
//!
//! A signature captured from one response must be discoverable by whatever
//! scrap of context the next request still carries: the thinking text itself,
//! a tool-call id, a session fingerprint, or nothing but recency. Every
//! lookup path is soft — a failure here downgrades a thinking block, it never
//! fails a request.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use aero_core::config::MIN_SIGNATURE_LEN;

use crate::mirror::{MirrorRow, SignatureMirror};

/// Leading slice of normalized content that feeds the content hash.
const CONTENT_KEY_CHARS: usize = 500;
/// Fallback TTL when the caller supplies none.
const DEFAULT_TTL_SECS: u64 = 3_600;

struct CacheEntry {
    signature: String,
    /// Full content kept for collision verification on content lookups.
    content: Option<String>,
    content_key: Option<String>,
    tool_id: Option<String>,
    session_fp: Option<String>,
    owner_id: Option<String>,
    model_family: String,
    client_type: Option<String>,
    ttl_secs: u64,
    created_at: i64,
    /// Logical access clock tick, not wall time — keeps LRU ordering strict
    /// even for accesses within the same second.
    last_access: AtomicU64,
    access_count: AtomicU64,
}

impl CacheEntry {
    fn is_expired(&self, now: i64) -> bool {
        now >= self.created_at + self.ttl_secs as i64
    }

    fn touch(&self, tick: u64) {
        self.last_access.store(tick, Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Owner skip rule for keyed lookups: an entry owned by someone else is
    /// invisible, but ownerless entries stay visible.
    fn owner_allows(&self, query_owner: Option<&str>) -> bool {
        match (&self.owner_id, query_owner) {
            (Some(entry_owner), Some(owner)) => entry_owner == owner,
            _ => true,
        }
    }

    /// Strict owner rule for the recency fallback: null never matches owned
    /// and owned never matches null.
    fn owner_matches_strict(&self, query_owner: Option<&str>) -> bool {
        self.owner_id.as_deref() == query_owner
    }
}

/// Keys a signature is stored under. At least recency always applies.
#[derive(Debug, Default, Clone)]
pub struct PutKeys {
    pub content: Option<String>,
    pub tool_id: Option<String>,
    pub session_fp: Option<String>,
    pub owner_id: Option<String>,
    pub model_family: String,
    pub client_type: Option<String>,
    /// TTL override, usually the client policy's `signature_ttl_secs`.
    pub ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StoreStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub size: usize,
    pub hit_rate: f64,
}

pub struct SignatureStore {
    entries: RwLock<HashMap<u64, CacheEntry>>,
    by_content: RwLock<HashMap<String, u64>>,
    by_tool: RwLock<HashMap<String, u64>>,
    by_session: RwLock<HashMap<String, u64>>,
    /// Insertion order, newest at the back. Drives `get_recent`.
    order: RwLock<VecDeque<u64>>,
    next_id: AtomicU64,
    access_clock: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    max_entries: usize,
    mirror: Option<SignatureMirror>,
}

impl SignatureStore {
    pub fn new(max_entries: usize, mirror: Option<SignatureMirror>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            by_content: RwLock::new(HashMap::new()),
            by_tool: RwLock::new(HashMap::new()),
            by_session: RwLock::new(HashMap::new()),
            order: RwLock::new(VecDeque::new()),
            next_id: AtomicU64::new(1),
            access_clock: AtomicU64::new(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            max_entries,
            mirror,
        }
    }

    /// In-memory store with the default bound and no mirror.
    pub fn in_memory(max_entries: usize) -> Self {
        Self::new(max_entries, None)
    }

    /// Hash of the normalized content prefix: whitespace collapsed, first
    /// 500 chars, SHA-256.
    pub fn content_key(content: &str) -> String {
        let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
        let prefix: String = collapsed.chars().take(CONTENT_KEY_CHARS).collect();
        hex::encode(Sha256::digest(prefix.as_bytes()))
    }

    /// Store a signature under every provided index. Returns false for
    /// signatures below the validity floor; never errors.
    pub fn put(&self, signature: &str, keys: PutKeys) -> bool {
        if signature.len() < MIN_SIGNATURE_LEN {
            debug!(len = signature.len(), "signature below validity floor, not cached");
            return false;
        }

        let now = now_ts();
        self.evict_if_full();

        let content_key = keys.content.as_deref().map(Self::content_key);
        let entry = CacheEntry {
            signature: signature.to_string(),
            content: keys.content,
            content_key: content_key.clone(),
            tool_id: keys.tool_id.clone(),
            session_fp: keys.session_fp.clone(),
            owner_id: keys.owner_id.clone(),
            model_family: keys.model_family.clone(),
            client_type: keys.client_type.clone(),
            ttl_secs: keys.ttl_secs.unwrap_or(DEFAULT_TTL_SECS),
            created_at: now,
            last_access: AtomicU64::new(self.tick()),
            access_count: AtomicU64::new(0),
        };

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Some(mirror) = &self.mirror {
            let row = MirrorRow {
                signature: entry.signature.clone(),
                content: entry.content.clone(),
                owner_id: entry.owner_id.clone(),
                model_family: entry.model_family.clone(),
                created_at: entry.created_at,
                ttl_secs: entry.ttl_secs,
            };
            if let Err(e) = mirror.put(
                content_key.as_deref(),
                entry.tool_id.as_deref(),
                entry.session_fp.as_deref(),
                &row,
            ) {
                warn!(error = %e, "signature mirror write failed");
            }
        }

        self.entries.write().unwrap().insert(id, entry);
        if let Some(key) = content_key {
            self.by_content.write().unwrap().insert(key, id);
        }
        if let Some(tool_id) = keys.tool_id {
            self.by_tool.write().unwrap().insert(tool_id, id);
        }
        if let Some(fp) = keys.session_fp {
            self.by_session.write().unwrap().insert(fp, id);
        }
        self.order.write().unwrap().push_back(id);
        self.writes.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// Look up by content. The candidate's stored full content is compared
    /// against the query to rule out prefix-hash collisions.
    pub fn get_by_content(&self, content: &str, owner_id: Option<&str>) -> Option<String> {
        let key = Self::content_key(content);
        let id = { self.by_content.read().unwrap().get(&key).copied() };

        let found = id
            .and_then(|id| {
                self.read_entry(id, owner_id, |e| match &e.content {
                    Some(stored) if stored == content => true,
                    Some(_) => {
                        warn!("content hash collision detected, treating as miss");
                        false
                    }
                    None => false,
                })
            })
            .or_else(|| {
                self.hydrate(
                    |m| m.get_by_content(&key),
                    owner_id,
                    |row| row.content.as_deref() == Some(content),
                )
            });
        self.record(found)
    }

    pub fn get_by_tool_id(&self, tool_id: &str, owner_id: Option<&str>) -> Option<String> {
        let id = { self.by_tool.read().unwrap().get(tool_id).copied() };
        let found = id
            .and_then(|id| self.read_entry(id, owner_id, |_| true))
            .or_else(|| self.hydrate(|m| m.get_by_tool(tool_id), owner_id, |_| true));
        self.record(found)
    }

    pub fn get_by_session_fingerprint(&self, fp: &str, owner_id: Option<&str>) -> Option<String> {
        let id = { self.by_session.read().unwrap().get(fp).copied() };
        let found = id
            .and_then(|id| self.read_entry(id, owner_id, |_| true))
            .or_else(|| self.hydrate(|m| m.get_by_session(fp), owner_id, |_| true));
        self.record(found)
    }

    /// Update hit/miss counters for one lookup outcome.
    fn record(&self, found: Option<String>) -> Option<String> {
        match found {
            Some(sig) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(sig)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Most recent live entry with a strictly matching owner, newest first.
    ///
    /// Owner matching is strict in both directions: an ownerless entry is
    /// never returned to an owned query, and an owned entry is never returned
    /// to an ownerless one.
    pub fn get_recent(
        &self,
        window_secs: u64,
        owner_id: Option<&str>,
        client_type: Option<&str>,
    ) -> Option<String> {
        let now = now_ts();
        let found = {
            let order = self.order.read().unwrap();
            let entries = self.entries.read().unwrap();
            let mut found = None;

            for id in order.iter().rev() {
                let Some(entry) = entries.get(id) else {
                    continue;
                };
                if entry.is_expired(now) {
                    continue;
                }
                if now - entry.created_at > window_secs as i64 {
                    // Entries are insertion-ordered; everything older is out
                    // of the window too.
                    break;
                }
                if !entry.owner_matches_strict(owner_id) {
                    continue;
                }
                if let Some(ct) = client_type {
                    if entry.client_type.as_deref() != Some(ct) {
                        continue;
                    }
                }
                entry.touch(self.tick());
                found = Some(entry.signature.clone());
                break;
            }
            found
        };
        self.record(found)
    }

    pub fn clear(&self) {
        self.entries.write().unwrap().clear();
        self.by_content.write().unwrap().clear();
        self.by_tool.write().unwrap().clear();
        self.by_session.write().unwrap().clear();
        self.order.write().unwrap().clear();
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.clear() {
                warn!(error = %e, "signature mirror clear failed");
            }
        }
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn cleanup_expired(&self) -> usize {
        let now = now_ts();
        let expired: Vec<u64> = {
            let entries = self.entries.read().unwrap();
            entries
                .iter()
                .filter(|(_, e)| e.is_expired(now))
                .map(|(id, _)| *id)
                .collect()
        };
        for id in &expired {
            self.remove_entry(*id);
        }
        if let Some(mirror) = &self.mirror {
            if let Err(e) = mirror.cleanup_expired(now) {
                warn!(error = %e, "signature mirror cleanup failed");
            }
        }
        expired.len()
    }

    pub fn stats(&self) -> StoreStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        StoreStats {
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            size: self.entries.read().unwrap().len(),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
        }
    }

    /// Shared read path for keyed lookups: expiry, owner rule, extra check.
    /// Hit/miss accounting is the caller's job.
    fn read_entry(
        &self,
        id: u64,
        owner_id: Option<&str>,
        verify: impl Fn(&CacheEntry) -> bool,
    ) -> Option<String> {
        let now = now_ts();
        let expired = {
            let entries = self.entries.read().unwrap();
            let Some(entry) = entries.get(&id) else {
                return None;
            };
            if entry.is_expired(now) {
                true
            } else if !entry.owner_allows(owner_id) || !verify(entry) {
                return None;
            } else {
                entry.touch(self.tick());
                return Some(entry.signature.clone());
            }
        };
        if expired {
            self.remove_entry(id);
        }
        None
    }

    /// Read-through from the mirror on a memory miss. The memory lock is held
    /// only for the insert, not across the disk read.
    fn hydrate(
        &self,
        fetch: impl Fn(&SignatureMirror) -> rusqlite::Result<Option<MirrorRow>>,
        owner_id: Option<&str>,
        verify: impl Fn(&MirrorRow) -> bool,
    ) -> Option<String> {
        let mirror = self.mirror.as_ref()?;
        let row = match fetch(mirror) {
            Ok(Some(row)) => row,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "signature mirror read failed");
                return None;
            }
        };

        let now = now_ts();
        if now >= row.created_at + row.ttl_secs as i64 {
            return None;
        }
        match (&row.owner_id, owner_id) {
            (Some(entry_owner), Some(owner)) if entry_owner != owner => return None,
            _ => {}
        }
        if !verify(&row) {
            return None;
        }

        debug!("signature hydrated from mirror");
        let signature = row.signature.clone();
        self.put(
            &row.signature,
            PutKeys {
                content: row.content,
                tool_id: None,
                session_fp: None,
                owner_id: row.owner_id,
                model_family: row.model_family,
                client_type: None,
                ttl_secs: Some(row.ttl_secs),
            },
        );
        Some(signature)
    }

    fn tick(&self) -> u64 {
        self.access_clock.fetch_add(1, Ordering::Relaxed)
    }

    /// Strict LRU eviction on total entry count.
    fn evict_if_full(&self) {
        loop {
            let victim = {
                let entries = self.entries.read().unwrap();
                if entries.len() < self.max_entries {
                    return;
                }
                entries
                    .iter()
                    .min_by_key(|(_, e)| e.last_access.load(Ordering::Relaxed))
                    .map(|(id, _)| *id)
            };
            match victim {
                Some(id) => {
                    debug!(id, "evicting least-recently-accessed signature");
                    self.remove_entry(id);
                }
                None => return,
            }
        }
    }

    fn remove_entry(&self, id: u64) {
        let entry = self.entries.write().unwrap().remove(&id);
        let Some(entry) = entry else { return };
        if let Some(key) = &entry.content_key {
            let mut map = self.by_content.write().unwrap();
            if map.get(key) == Some(&id) {
                map.remove(key);
            }
        }
        if let Some(tool_id) = &entry.tool_id {
            let mut map = self.by_tool.write().unwrap();
            if map.get(tool_id) == Some(&id) {
                map.remove(tool_id);
            }
        }
        if let Some(fp) = &entry.session_fp {
            let mut map = self.by_session.write().unwrap();
            if map.get(fp) == Some(&id) {
                map.remove(fp);
            }
        }
        self.order.write().unwrap().retain(|x| *x != id);
    }
}

fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
