//! Failure classification — the router's single place for converting
//! upstream failures into retry/advance decisions.

use crate::adapter::BackendError;

/// Semantic class of an upstream failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// The request shape failed upstream validation (invalid signature,
    /// unpaired tool_use). Never retried.
    InvariantViolation,
    /// Per-model 429: rotate credential, then backend.
    QuotaExhausted,
    /// 5xx / reset / timeout: retry in place with backoff.
    TransientUpstream,
    /// 401/403: disable the credential, try the next one.
    AuthFailure,
    /// Malformed request or unsupported model: surface as 4xx, no retry.
    ClientError,
    /// Parse bugs and other local faults.
    Internal,
}

impl FailureClass {
    pub fn label(&self) -> &'static str {
        match self {
            FailureClass::InvariantViolation => "invariant violation",
            FailureClass::QuotaExhausted => "quota exhausted",
            FailureClass::TransientUpstream => "transient upstream error",
            FailureClass::AuthFailure => "auth failure",
            FailureClass::ClientError => "client error",
            FailureClass::Internal => "internal error",
        }
    }
}

/// Upstream error bodies that mark an invariant violation rather than a
/// malformed request.
const INVARIANT_MARKERS: &[&str] = &[
    "Invalid signature in thinking block",
    "Invalid `signature`",
    "thinking.signature",
    "tool_use ids were found without tool_result",
    "unexpected `tool_use_id`",
];

pub fn classify(err: &BackendError) -> FailureClass {
    match err {
        BackendError::RateLimited {
            quota_exhausted: true,
            ..
        } => FailureClass::QuotaExhausted,
        BackendError::RateLimited { .. } => FailureClass::TransientUpstream,
        BackendError::Api { status, message } => match status {
            401 | 403 => FailureClass::AuthFailure,
            400 if INVARIANT_MARKERS.iter().any(|m| message.contains(m)) => {
                FailureClass::InvariantViolation
            }
            400 | 404 | 422 => FailureClass::ClientError,
            429 => FailureClass::QuotaExhausted,
            500..=599 => FailureClass::TransientUpstream,
            _ => FailureClass::Internal,
        },
        BackendError::Http(e) => {
            if e.is_timeout() || e.is_connect() {
                FailureClass::TransientUpstream
            } else {
                FailureClass::Internal
            }
        }
        BackendError::Unavailable(_) => FailureClass::TransientUpstream,
        BackendError::Parse(_) | BackendError::Internal(_) => FailureClass::Internal,
    }
}

/// Whether the router may retry the same backend/credential in place.
pub fn is_retriable(class: FailureClass) -> bool {
    matches!(class, FailureClass::TransientUpstream)
}

/// Extract a retry delay from a 429 body or `retry-after` seconds value.
/// Understands both the header form (plain seconds) and the JSON
/// `retryDelay: "3.5s"` detail some upstreams embed.
pub fn parse_retry_delay_ms(body: &str) -> Option<u64> {
    if let Some(idx) = body.find("retryDelay") {
        let rest = &body[idx..];
        let digits: String = rest
            .chars()
            .skip_while(|c| !c.is_ascii_digit())
            .take_while(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        if let Ok(secs) = digits.parse::<f64>() {
            return Some((secs * 1000.0) as u64);
        }
    }
    None
}
