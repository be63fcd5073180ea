//! Client-type classification and per-client policy.
//!
//! The IDE-style clients fronted by this gateway mangle assistant history in
//! different ways; behavior differences are captured in one static table
//! instead of scattered conditionals.

use serde::Serialize;
use std::fmt;

/// Kind of downstream client, detected from request headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientType {
    /// Terminal assistant. Preserves tool-call ids verbatim.
    Cli,
    /// Inline-completion IDE. Re-issues tool ids and drops thinking blocks.
    InlineIde,
    /// Editor extension speaking the Anthropic dialect.
    EditorExtension,
    /// NDJSON-streaming IDE extension.
    NdjsonIde,
    /// Generic OpenAI SDK caller.
    OpenAiSdk,
    Unknown,
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ClientType::Cli => "cli",
            ClientType::InlineIde => "inline-ide",
            ClientType::EditorExtension => "editor-extension",
            ClientType::NdjsonIde => "ndjson-ide",
            ClientType::OpenAiSdk => "openai-sdk",
            ClientType::Unknown => "unknown",
        };
        f.write_str(label)
    }
}

/// Behavior knobs per client type.
#[derive(Debug, Clone, Copy)]
pub struct ClientPolicy {
    /// Run the full message sanitizer on inbound history.
    pub needs_sanitization: bool,
    /// Smuggle signatures through tool-call ids (only safe when the client
    /// round-trips long ids verbatim).
    pub supports_id_encoding: bool,
    /// Allow falling over to a different model family when every credential
    /// in the primary pool is exhausted.
    pub enable_cross_pool: bool,
    /// Signature cache TTL for entries written on behalf of this client.
    pub signature_ttl_secs: u64,
    /// Time window for the `get_recent` recovery fallback.
    pub recent_window_secs: u64,
}

impl ClientType {
    pub fn policy(&self) -> ClientPolicy {
        match self {
            ClientType::Cli => ClientPolicy {
                needs_sanitization: true,
                supports_id_encoding: true,
                enable_cross_pool: true,
                signature_ttl_secs: 3_600,
                recent_window_secs: 1_800,
            },
            ClientType::OpenAiSdk => ClientPolicy {
                needs_sanitization: true,
                supports_id_encoding: true,
                enable_cross_pool: false,
                signature_ttl_secs: 3_600,
                recent_window_secs: 1_800,
            },
            // IDE clients hold sessions longer and mangle ids; longer TTL,
            // no id encoding, no silent model swaps.
            ClientType::InlineIde | ClientType::EditorExtension | ClientType::NdjsonIde => {
                ClientPolicy {
                    needs_sanitization: true,
                    supports_id_encoding: false,
                    enable_cross_pool: false,
                    signature_ttl_secs: 7_200,
                    recent_window_secs: 3_600,
                }
            }
            ClientType::Unknown => ClientPolicy {
                needs_sanitization: true,
                supports_id_encoding: false,
                enable_cross_pool: false,
                signature_ttl_secs: 3_600,
                recent_window_secs: 1_800,
            },
        }
    }

    /// Classify from the fingerprint headers the gateway consumes.
    ///
    /// `X-AG-Client` wins when present; otherwise the user-agent strings are
    /// scanned for known markers.
    pub fn classify(
        ag_client: Option<&str>,
        user_agent: Option<&str>,
        forwarded_user_agent: Option<&str>,
        augment_client: Option<&str>,
    ) -> Self {
        if let Some(explicit) = ag_client {
            match explicit.to_ascii_lowercase().as_str() {
                "cli" => return ClientType::Cli,
                "inline" | "inline-ide" => return ClientType::InlineIde,
                "editor" | "editor-extension" => return ClientType::EditorExtension,
                "ndjson" | "ndjson-ide" => return ClientType::NdjsonIde,
                _ => {}
            }
        }

        if augment_client.is_some() {
            return ClientType::NdjsonIde;
        }

        let ua = forwarded_user_agent
            .or(user_agent)
            .unwrap_or_default()
            .to_ascii_lowercase();

        for (marker, client) in UA_MARKERS {
            if ua.contains(marker) {
                return *client;
            }
        }
        ClientType::Unknown
    }
}

/// Substring markers checked in order against the (forwarded) user agent.
const UA_MARKERS: &[(&str, ClientType)] = &[
    ("claude-cli", ClientType::Cli),
    ("aero-cli", ClientType::Cli),
    ("augment", ClientType::NdjsonIde),
    ("cursor", ClientType::InlineIde),
    ("windsurf", ClientType::InlineIde),
    ("vscode", ClientType::EditorExtension),
    ("jetbrains", ClientType::EditorExtension),
    ("openai-python", ClientType::OpenAiSdk),
    ("openai-node", ClientType::OpenAiSdk),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_header_wins() {
        let c = ClientType::classify(Some("cli"), Some("cursor/1.2"), None, None);
        assert_eq!(c, ClientType::Cli);
    }

    #[test]
    fn augment_header_means_ndjson_ide() {
        let c = ClientType::classify(None, Some("some-agent"), None, Some("vscode-ext"));
        assert_eq!(c, ClientType::NdjsonIde);
    }

    #[test]
    fn forwarded_user_agent_preferred() {
        let c = ClientType::classify(None, Some("proxy/1.0"), Some("Cursor/0.42"), None);
        assert_eq!(c, ClientType::InlineIde);
    }

    #[test]
    fn unknown_without_markers() {
        let c = ClientType::classify(None, Some("curl/8.0"), None, None);
        assert_eq!(c, ClientType::Unknown);
    }

    #[test]
    fn ide_policy_disables_id_encoding() {
        for client in [
            ClientType::InlineIde,
            ClientType::EditorExtension,
            ClientType::NdjsonIde,
        ] {
            let p = client.policy();
            assert!(!p.supports_id_encoding);
            assert!(!p.enable_cross_pool);
            assert_eq!(p.signature_ttl_secs, 7_200);
        }
    }

    #[test]
    fn cli_policy_enables_cross_pool() {
        let p = ClientType::Cli.policy();
        assert!(p.supports_id_encoding);
        assert!(p.enable_cross_pool);
        assert_eq!(p.signature_ttl_secs, 3_600);
        assert_eq!(p.recent_window_secs, 1_800);
    }
}
