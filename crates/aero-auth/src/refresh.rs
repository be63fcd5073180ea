//! Identity-file loading and access-token refresh.
//!
//! Refresh flow:
//!   1. Snapshot the credential out of the pool (no lock across I/O).
//!   2. POST the refresh token to the identity's token endpoint.
//!   3. Install the new token in the pool and persist the identity file
//!      best-effort.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::credential::{Credential, IdentityFile};
use crate::error::{AuthError, Result};
use crate::manager::CredentialManager;

/// Load every `*.json` identity file in `dir`. Unreadable files are skipped
/// with a warning; the rest of the pool still loads.
pub fn load_identity_dir(dir: &Path) -> Vec<Credential> {
    let mut credentials = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), error = %e, "no identity directory");
            return credentials;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match load_identity_file(&path) {
            Ok(cred) => credentials.push(cred),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping identity file"),
        }
    }

    info!(count = credentials.len(), dir = %dir.display(), "identity files loaded");
    credentials
}

pub fn load_identity_file(path: &Path) -> Result<Credential> {
    let data = std::fs::read_to_string(path)?;
    let identity: IdentityFile =
        serde_json::from_str(&data).map_err(|e| AuthError::InvalidIdentity {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("identity")
        .to_string();
    Ok(Credential::from_identity(id, path.to_path_buf(), identity))
}

#[derive(Deserialize)]
struct TokenRefreshResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default = "default_expires")]
    expires_in: u64,
    /// model -> remaining quota fraction, when the endpoint reports it.
    #[serde(default)]
    quota: HashMap<String, f64>,
}

fn default_expires() -> u64 {
    3_600
}

/// Refresh a credential's access token if it is near expiry. No-op for
/// static API keys. The refreshed identity file is persisted best-effort.
pub async fn ensure_fresh(
    client: &reqwest::Client,
    manager: &CredentialManager,
    backend: &str,
    credential_id: &str,
) -> Result<()> {
    let Some(cred) = manager.snapshot(backend, credential_id) else {
        return Err(AuthError::UnknownCredential {
            backend: backend.to_string(),
            id: credential_id.to_string(),
        });
    };

    let now_ms = chrono::Utc::now().timestamp_millis();
    if !cred.needs_refresh(now_ms) {
        return Ok(());
    }
    let (Some(refresh_token), Some(token_uri)) = (&cred.refresh_token, &cred.token_uri) else {
        return Ok(());
    };

    info!(backend, credential = credential_id, "refreshing access token");
    let resp = client
        .post(token_uri)
        .json(&serde_json::json!({
            "grant_type": "refresh_token",
            "refresh_token": refresh_token,
        }))
        .send()
        .await?;

    if !resp.status().is_success() {
        let status = resp.status().as_u16();
        let message = resp.text().await.unwrap_or_default();
        return Err(AuthError::Refresh { status, message });
    }

    let token: TokenRefreshResponse = resp.json().await.map_err(AuthError::Http)?;
    let expiry_date = now_ms + (token.expires_in as i64) * 1_000;

    manager.update_token(
        backend,
        credential_id,
        token.access_token.clone(),
        token.refresh_token.clone(),
        expiry_date,
    );
    if !token.quota.is_empty() {
        manager.report_success(backend, credential_id, Some(&token.quota));
    }

    // Persist so the next process start reuses the fresh token.
    if let Some(path) = &cred.identity_file {
        let updated = IdentityFile {
            access_token: token.access_token,
            refresh_token: token.refresh_token.or(cred.refresh_token),
            expiry_date,
            token_uri: cred.token_uri,
        };
        match serde_json::to_string_pretty(&updated) {
            Ok(json) => {
                if let Err(e) = std::fs::write(path, json) {
                    warn!(path = %path.display(), error = %e, "failed to save refreshed identity");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize refreshed identity"),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_identity_files_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("alice.json"),
            r#"{"access_token": "tok-a", "refresh_token": "rt-a", "expiry_date": 123, "token_uri": "https://auth.test/token"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let creds = load_identity_dir(dir.path());
        assert_eq!(creds.len(), 1);
        assert_eq!(creds[0].id, "alice");
        assert_eq!(creds[0].access_token, "tok-a");
        assert_eq!(creds[0].refresh_token.as_deref(), Some("rt-a"));
    }

    #[test]
    fn missing_dir_is_empty_pool() {
        let creds = load_identity_dir(Path::new("/definitely/not/here"));
        assert!(creds.is_empty());
    }

    #[tokio::test]
    async fn fresh_token_is_noop() {
        let manager = CredentialManager::new(0.1, 300, 100, true);
        manager.register("b", Credential::from_api_key("c1", "sk"));
        let client = reqwest::Client::new();
        // Static keys never refresh; must not hit the network.
        ensure_fresh(&client, &manager, "b", "c1").await.unwrap();
    }

    #[tokio::test]
    async fn unknown_credential_errors() {
        let manager = CredentialManager::new(0.1, 300, 100, true);
        let client = reqwest::Client::new();
        let err = ensure_fresh(&client, &manager, "b", "ghost").await;
        assert!(matches!(err, Err(AuthError::UnknownCredential { .. })));
    }
}
