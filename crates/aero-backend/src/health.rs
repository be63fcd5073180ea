//! Backend health tracking — passive monitoring based on real request
//! outcomes. No test pings; only traffic that actually flowed is measured,
//! over a rolling 5-minute window.

use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use dashmap::DashMap;
use serde::Serialize;

use crate::classify::FailureClass;

/// Rolling window duration for request outcome tracking.
const WINDOW_SECS: u64 = 300;

/// Backend health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    Ok,
    Degraded,
    Down,
    RateLimited,
    AuthExpired,
    Unknown,
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Degraded => write!(f, "degraded"),
            Self::Down => write!(f, "down"),
            Self::RateLimited => write!(f, "rate-limited"),
            Self::AuthExpired => write!(f, "auth-expired"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// Public snapshot of one backend's health state.
#[derive(Debug, Clone, Serialize)]
pub struct BackendHealthEntry {
    pub backend: String,
    pub status: BackendStatus,
    pub last_success_at: Option<i64>,
    pub last_error_at: Option<i64>,
    pub last_error: Option<String>,
    pub avg_latency_ms: u64,
    pub requests_ok: u32,
    pub requests_err: u32,
    pub total_requests: u64,
}

/// Internal mutable state per backend.
struct InternalEntry {
    /// Rolling window of (timestamp, was_success, latency_ms).
    window: VecDeque<(Instant, bool, u64)>,
    last_success_at: Option<i64>,
    last_error_at: Option<i64>,
    last_error: Option<String>,
    total_requests: u64,
    /// Override from auth/quota failures; takes precedence over the derived
    /// status until the next success.
    status_override: Option<BackendStatus>,
}

impl InternalEntry {
    fn new() -> Self {
        Self {
            window: VecDeque::new(),
            last_success_at: None,
            last_error_at: None,
            last_error: None,
            total_requests: 0,
            status_override: None,
        }
    }

    fn prune(&mut self) {
        let cutoff = Instant::now() - std::time::Duration::from_secs(WINDOW_SECS);
        while self.window.front().is_some_and(|(t, _, _)| *t < cutoff) {
            self.window.pop_front();
        }
    }

    fn derive_status(&self) -> BackendStatus {
        if let Some(status) = self.status_override {
            return status;
        }
        if self.window.is_empty() {
            return BackendStatus::Unknown;
        }

        let total = self.window.len() as f64;
        let ok_count = self.window.iter().filter(|(_, ok, _)| *ok).count() as f64;
        let success_rate = ok_count / total;

        if success_rate > 0.8 {
            BackendStatus::Ok
        } else if success_rate >= 0.5 {
            BackendStatus::Degraded
        } else {
            BackendStatus::Down
        }
    }

    fn avg_latency_ms(&self) -> u64 {
        if self.window.is_empty() {
            return 0;
        }
        let sum: u64 = self.window.iter().map(|(_, _, lat)| lat).sum();
        sum / self.window.len() as u64
    }

    fn to_entry(&self, backend: &str) -> BackendHealthEntry {
        BackendHealthEntry {
            backend: backend.to_string(),
            status: self.derive_status(),
            last_success_at: self.last_success_at,
            last_error_at: self.last_error_at,
            last_error: self.last_error.clone(),
            avg_latency_ms: self.avg_latency_ms(),
            requests_ok: self.window.iter().filter(|(_, ok, _)| *ok).count() as u32,
            requests_err: self.window.iter().filter(|(_, ok, _)| !*ok).count() as u32,
            total_requests: self.total_requests,
        }
    }
}

/// Concurrent health tracker for all backends.
pub struct HealthTracker {
    entries: DashMap<String, InternalEntry>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Record a successful request with its latency.
    pub fn record_success(&self, backend: &str, latency_ms: u64) {
        let mut entry = self
            .entries
            .entry(backend.to_string())
            .or_insert_with(InternalEntry::new);
        entry.prune();
        entry.window.push_back((Instant::now(), true, latency_ms));
        entry.last_success_at = Some(now_ts());
        entry.total_requests += 1;
        // A success clears any standing override; the backend is working.
        entry.status_override = None;
    }

    /// Record a failed request, classified.
    pub fn record_error(&self, backend: &str, class: FailureClass, message: &str) {
        let mut entry = self
            .entries
            .entry(backend.to_string())
            .or_insert_with(InternalEntry::new);
        entry.prune();
        entry.window.push_back((Instant::now(), false, 0));
        entry.last_error_at = Some(now_ts());
        entry.last_error = Some(message.to_string());
        entry.total_requests += 1;

        match class {
            FailureClass::QuotaExhausted => {
                entry.status_override = Some(BackendStatus::RateLimited);
            }
            FailureClass::AuthFailure => {
                entry.status_override = Some(BackendStatus::AuthExpired);
            }
            _ => {}
        }
    }

    /// Snapshot every backend's health entry.
    pub fn all_entries(&self) -> Vec<BackendHealthEntry> {
        let mut entries: Vec<BackendHealthEntry> = self
            .entries
            .iter()
            .map(|e| e.value().to_entry(e.key()))
            .collect();
        entries.sort_by(|a, b| a.backend.cmp(&b.backend));
        entries
    }
}

fn now_ts() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
