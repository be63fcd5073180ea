use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Identity credentials stored on disk, one JSON file per identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityFile {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix millis when the access token expires. 0 = never.
    #[serde(default)]
    pub expiry_date: i64,
    /// Token endpoint used for refresh. Required when `refresh_token` is set.
    #[serde(default)]
    pub token_uri: Option<String>,
}

/// One authenticated identity plus its per-model throttling state.
#[derive(Debug, Clone)]
pub struct Credential {
    pub id: String,
    /// Path of the backing identity file; static API keys have none.
    pub identity_file: Option<PathBuf>,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_uri: Option<String>,
    /// Unix millis when the access token expires. 0 = never.
    pub expiry_date: i64,
    /// model -> unix seconds the cooldown lasts until.
    pub model_cooldowns: HashMap<String, i64>,
    /// model -> remaining quota fraction in [0, 1].
    pub model_quota_fraction: HashMap<String, f64>,
    pub disabled: bool,
    /// Consecutive calls served since this credential last rotated in.
    pub calls_since_rotation: u32,
}

impl Credential {
    /// Credential backed by a static API key.
    pub fn from_api_key(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            identity_file: None,
            access_token: key.into(),
            refresh_token: None,
            token_uri: None,
            expiry_date: 0,
            model_cooldowns: HashMap::new(),
            model_quota_fraction: HashMap::new(),
            disabled: false,
            calls_since_rotation: 0,
        }
    }

    pub fn from_identity(id: impl Into<String>, path: PathBuf, identity: IdentityFile) -> Self {
        Self {
            id: id.into(),
            identity_file: Some(path),
            access_token: identity.access_token,
            refresh_token: identity.refresh_token,
            token_uri: identity.token_uri,
            expiry_date: identity.expiry_date,
            model_cooldowns: HashMap::new(),
            model_quota_fraction: HashMap::new(),
            disabled: false,
            calls_since_rotation: 0,
        }
    }

    /// Usable for `model` right now: not disabled, not cooling down for the
    /// model, and no monitored model below the quota floor.
    pub fn eligible(&self, model: &str, now: i64, quota_floor: f64) -> bool {
        if self.disabled {
            return false;
        }
        if let Some(until) = self.model_cooldowns.get(model) {
            if *until > now {
                return false;
            }
        }
        !self
            .model_quota_fraction
            .values()
            .any(|fraction| *fraction < quota_floor)
    }

    /// Whether the access token needs a refresh before use.
    pub fn needs_refresh(&self, now_ms: i64) -> bool {
        self.refresh_token.is_some() && self.expiry_date > 0 && now_ms + 60_000 >= self.expiry_date
    }
}

/// Classified outcome the router reports back after an upstream call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Per-model 429: cooldown the model on this credential.
    Quota,
    /// 401/403: the credential itself is bad.
    Auth,
    /// 5xx / timeout: no credential state change.
    Transient,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eligibility_rules() {
        let now = 1_000_000;
        let mut cred = Credential::from_api_key("c1", "sk-test");
        assert!(cred.eligible("claude-x", now, 0.1));

        cred.model_cooldowns.insert("claude-x".into(), now + 100);
        assert!(!cred.eligible("claude-x", now, 0.1));
        // Cooldown is per model.
        assert!(cred.eligible("claude-y", now, 0.1));
        // Expired cooldown no longer blocks.
        assert!(cred.eligible("claude-x", now + 200, 0.1));
    }

    #[test]
    fn quota_floor_blocks_all_models() {
        let mut cred = Credential::from_api_key("c1", "sk-test");
        cred.model_quota_fraction.insert("claude-x".into(), 0.05);
        // Any monitored model below the floor makes the whole credential
        // ineligible, even for other models.
        assert!(!cred.eligible("claude-y", 0, 0.1));
        cred.model_quota_fraction.insert("claude-x".into(), 0.5);
        assert!(cred.eligible("claude-y", 0, 0.1));
    }

    #[test]
    fn disabled_is_never_eligible() {
        let mut cred = Credential::from_api_key("c1", "sk-test");
        cred.disabled = true;
        assert!(!cred.eligible("any", 0, 0.1));
    }

    #[test]
    fn refresh_needed_near_expiry() {
        let mut cred = Credential::from_api_key("c1", "sk-test");
        assert!(!cred.needs_refresh(0));

        cred.refresh_token = Some("rt".into());
        cred.expiry_date = 1_000_000;
        assert!(cred.needs_refresh(999_000));
        assert!(!cred.needs_refresh(500_000));
    }
}
