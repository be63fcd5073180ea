//! Credential pool with per-model cooldowns and quota protection.
//!
//! One mutex covers every pool; acquire and the report calls are short
//! critical sections so two requests cannot both claim a credential that is
//! about to be rate-limited without the second one seeing the cooldown.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::{debug, info, warn};

use crate::credential::{Credential, FailureKind};

/// Snapshot handed to the router; holds no lock.
#[derive(Debug, Clone)]
pub struct AcquiredCredential {
    pub id: String,
    pub access_token: String,
}

struct Pool {
    credentials: Vec<Credential>,
    /// Sticky round-robin cursor; advances on failure or rotation cadence.
    cursor: usize,
}

pub struct CredentialManager {
    pools: Mutex<HashMap<String, Pool>>,
    quota_floor: f64,
    default_cooldown_secs: u64,
    calls_per_rotation: u32,
    auto_ban: bool,
}

impl CredentialManager {
    pub fn new(
        quota_floor: f64,
        default_cooldown_secs: u64,
        calls_per_rotation: u32,
        auto_ban: bool,
    ) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            quota_floor,
            default_cooldown_secs,
            calls_per_rotation,
            auto_ban,
        }
    }

    /// Add a credential to a backend's pool.
    pub fn register(&self, backend: &str, credential: Credential) {
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.entry(backend.to_string()).or_insert_with(|| Pool {
            credentials: Vec::new(),
            cursor: 0,
        });
        debug!(backend, id = %credential.id, "credential registered");
        pool.credentials.push(credential);
    }

    pub fn pool_size(&self, backend: &str) -> usize {
        self.pools
            .lock()
            .unwrap()
            .get(backend)
            .map(|p| p.credentials.len())
            .unwrap_or(0)
    }

    /// Select a usable credential for (backend, model).
    ///
    /// Sticky round-robin: the cursor credential is reused until it fails or
    /// serves `calls_per_rotation` requests, then the cursor advances.
    pub fn acquire(&self, backend: &str, model: &str) -> Option<AcquiredCredential> {
        let now = chrono::Utc::now().timestamp();
        let mut pools = self.pools.lock().unwrap();
        let pool = pools.get_mut(backend)?;
        let len = pool.credentials.len();
        if len == 0 {
            return None;
        }

        for offset in 0..len {
            let idx = (pool.cursor + offset) % len;
            let cred = &mut pool.credentials[idx];
            if !cred.eligible(model, now, self.quota_floor) {
                continue;
            }

            cred.calls_since_rotation += 1;
            let acquired = AcquiredCredential {
                id: cred.id.clone(),
                access_token: cred.access_token.clone(),
            };
            if cred.calls_since_rotation >= self.calls_per_rotation {
                cred.calls_since_rotation = 0;
                pool.cursor = (idx + 1) % len;
            } else {
                pool.cursor = idx;
            }
            return Some(acquired);
        }
        None
    }

    /// Try `primary` first, then the same-family alternates, then (only for
    /// aggressive-fallback clients) the cross-family models. Returns the
    /// credential together with the model it was granted for.
    pub fn acquire_for_models(
        &self,
        backend: &str,
        primary: &str,
        same_family: &[String],
        cross_family: &[String],
        allow_cross_pool: bool,
    ) -> Option<(AcquiredCredential, String)> {
        if let Some(cred) = self.acquire(backend, primary) {
            return Some((cred, primary.to_string()));
        }
        for model in same_family {
            if let Some(cred) = self.acquire(backend, model) {
                info!(backend, from = primary, to = %model, "fallback within model family");
                return Some((cred, model.clone()));
            }
        }
        if allow_cross_pool {
            for model in cross_family {
                if let Some(cred) = self.acquire(backend, model) {
                    warn!(backend, from = primary, to = %model, "cross-family model fallback");
                    return Some((cred, model.clone()));
                }
            }
        }
        None
    }

    /// Record an upstream failure against a credential.
    pub fn report_failure(
        &self,
        backend: &str,
        credential_id: &str,
        model: &str,
        kind: FailureKind,
        retry_after_secs: Option<u64>,
    ) {
        let mut pools = self.pools.lock().unwrap();
        let Some(pool) = pools.get_mut(backend) else {
            return;
        };
        let len = pool.credentials.len();
        let Some(idx) = pool.credentials.iter().position(|c| c.id == credential_id) else {
            return;
        };

        match kind {
            FailureKind::Quota => {
                let cooldown = retry_after_secs.unwrap_or(self.default_cooldown_secs);
                let until = chrono::Utc::now().timestamp() + cooldown as i64;
                warn!(
                    backend,
                    credential = credential_id,
                    model,
                    cooldown_secs = cooldown,
                    "quota exhausted, model cooling down"
                );
                pool.credentials[idx]
                    .model_cooldowns
                    .insert(model.to_string(), until);
            }
            FailureKind::Auth => {
                if self.auto_ban {
                    warn!(backend, credential = credential_id, "auth failure, credential disabled");
                    pool.credentials[idx].disabled = true;
                } else {
                    warn!(
                        backend,
                        credential = credential_id,
                        "auth failure (auto_ban off, credential kept)"
                    );
                }
            }
            FailureKind::Transient => {}
        }

        if kind != FailureKind::Transient {
            pool.credentials[idx].calls_since_rotation = 0;
            pool.cursor = (idx + 1) % len.max(1);
        }
    }

    /// Record a success, optionally updating quota fractions from a snapshot
    /// the response carried.
    pub fn report_success(
        &self,
        backend: &str,
        credential_id: &str,
        quota_snapshot: Option<&HashMap<String, f64>>,
    ) {
        let Some(snapshot) = quota_snapshot else {
            return;
        };
        let mut pools = self.pools.lock().unwrap();
        let Some(pool) = pools.get_mut(backend) else {
            return;
        };
        if let Some(cred) = pool
            .credentials
            .iter_mut()
            .find(|c| c.id == credential_id)
        {
            for (model, fraction) in snapshot {
                cred.model_quota_fraction
                    .insert(model.clone(), fraction.clamp(0.0, 1.0));
            }
        }
    }

    /// Clone a credential's full state (refresh flow needs the file path and
    /// refresh token without holding the pool lock across I/O).
    pub fn snapshot(&self, backend: &str, credential_id: &str) -> Option<Credential> {
        let pools = self.pools.lock().unwrap();
        pools
            .get(backend)?
            .credentials
            .iter()
            .find(|c| c.id == credential_id)
            .cloned()
    }

    /// Install a refreshed access token.
    pub fn update_token(
        &self,
        backend: &str,
        credential_id: &str,
        access_token: String,
        refresh_token: Option<String>,
        expiry_date: i64,
    ) {
        let mut pools = self.pools.lock().unwrap();
        let Some(pool) = pools.get_mut(backend) else {
            return;
        };
        if let Some(cred) = pool
            .credentials
            .iter_mut()
            .find(|c| c.id == credential_id)
        {
            cred.access_token = access_token;
            if refresh_token.is_some() {
                cred.refresh_token = refresh_token;
            }
            cred.expiry_date = expiry_date;
        }
    }
}
