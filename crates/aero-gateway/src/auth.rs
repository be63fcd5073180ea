//! Bearer-token authentication and client classification.

use axum::http::HeaderMap;
use subtle::ConstantTimeEq;

use aero_core::client::ClientType;

/// Header names consumed for client-type fingerprinting.
const HDR_AG_CLIENT: &str = "x-ag-client";
const HDR_USER_AGENT: &str = "user-agent";
const HDR_FORWARDED_UA: &str = "x-forwarded-user-agent";
const HDR_AUGMENT_CLIENT: &str = "x-augment-client";

/// Client headers forwarded upstream when present (telemetry and downstream
/// client detection).
const FORWARD_WHITELIST: &[&str] = &[HDR_USER_AGENT, HDR_FORWARDED_UA, HDR_AUGMENT_CLIENT];

/// Who is calling, as derived from request headers.
#[derive(Debug, Clone)]
pub struct CallerIdentity {
    /// Deterministic hash of the bearer token; the multi-tenant cache key.
    pub owner_id: String,
    pub client_type: ClientType,
    pub scid: Option<String>,
    pub forward_headers: Vec<(String, String)>,
}

/// Validate `Authorization: Bearer` against the configured API password and
/// build the caller identity. Returns the failure reason on rejection.
pub fn authenticate(
    headers: &HeaderMap,
    api_password: Option<&str>,
) -> Result<CallerIdentity, &'static str> {
    let token = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or("missing bearer token")?;

    if let Some(password) = api_password {
        // The token is a shared secret; compare without a timing side channel.
        let matches: bool = token.as_bytes().ct_eq(password.as_bytes()).into();
        if !matches {
            return Err("invalid api password");
        }
    }

    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    let client_type = ClientType::classify(
        header(HDR_AG_CLIENT),
        header(HDR_USER_AGENT),
        header(HDR_FORWARDED_UA),
        header(HDR_AUGMENT_CLIENT),
    );

    let forward_headers = FORWARD_WHITELIST
        .iter()
        .filter_map(|name| header(name).map(|v| (name.to_string(), v.to_string())))
        .collect();

    Ok(CallerIdentity {
        owner_id: aero_cache::owner_id(token),
        client_type,
        scid: header(aero_core::config::CONVERSATION_HEADER.to_ascii_lowercase().as_str())
            .map(String::from),
        forward_headers,
    })
}
