//! Canonical session keys

use serde::{Deserialize, Serialize};

/// Agent id used when none is configured
pub const DEFAULT_AGENT_ID: &str = "main";
/// Main bucket name used when none is configured
pub const DEFAULT_MAIN_KEY: &str = "main";
/// The single bucket used by `global` scope
pub const GLOBAL_SESSION_KEY: &str = "global";

const MAX_AGENT_ID_LEN: usize = 64;

/// How conversations map onto sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionScope {
    /// Direct chats share the agent's main bucket, groups are isolated
    #[default]
    PerSender,
    /// Everything shares one bucket
    Global,
}

impl SessionScope {
    /// Parse a wire/config spelling
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "per-sender" | "per_sender" | "persender" => Some(Self::PerSender),
            "global" => Some(Self::Global),
            _ => None,
        }
    }
}

/// Kind of conversation a message arrived in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatType {
    #[default]
    Direct,
    Group,
    Channel,
}

impl ChatType {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "direct" | "dm" | "private" => Some(Self::Direct),
            "group" => Some(Self::Group),
            "channel" => Some(Self::Channel),
            _ => None,
        }
    }
}

/// Conversation identity of an inbound message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MsgContext {
    /// Explicit session key override; wins over everything except `global`
    pub session_key: Option<String>,
    /// Sender / peer identity for direct chats
    pub from: Option<String>,
    pub chat_type: ChatType,
    /// Stable group or channel identifier for multi-party chats
    pub group_id: Option<String>,
    /// Provider (channel adapter) name, e.g. `telegram`
    pub channel: Option<String>,
    pub agent_id: Option<String>,
}

/// Normalize an agent id: lowercase, `[a-z0-9_-]`, at most 64 chars.
///
/// Empty or fully invalid ids fall back to [`DEFAULT_AGENT_ID`].
pub fn normalize_agent_id(raw: &str) -> String {
    let lowered = raw.trim().to_ascii_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_dash = false;
    for c in lowered.chars() {
        let keep = c.is_ascii_alphanumeric() || c == '_' || c == '-';
        let c = if keep { c } else { '-' };
        if c == '-' && last_dash {
            continue;
        }
        last_dash = c == '-';
        out.push(c);
    }
    let trimmed: String = out
        .trim_matches('-')
        .chars()
        .take(MAX_AGENT_ID_LEN)
        .collect();
    if trimmed.is_empty() {
        DEFAULT_AGENT_ID.to_string()
    } else {
        trimmed
    }
}

/// Normalize the main bucket name; empty falls back to [`DEFAULT_MAIN_KEY`]
pub fn normalize_main_key(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(key) if !key.is_empty() => key.to_lowercase(),
        _ => DEFAULT_MAIN_KEY.to_string(),
    }
}

/// `agent:<agentId>:<mainKey>`
pub fn build_agent_main_session_key(agent_id: &str, main_key: Option<&str>) -> String {
    format!(
        "agent:{}:{}",
        normalize_agent_id(agent_id),
        normalize_main_key(main_key)
    )
}

/// Split `agent:<agentId>:<rest>` into its agent id and remainder
pub fn parse_agent_session_key(key: &str) -> Option<(String, String)> {
    let mut parts = key.trim().splitn(3, ':');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(prefix), Some(agent), Some(rest))
            if prefix.eq_ignore_ascii_case("agent") && !agent.is_empty() && !rest.is_empty() =>
        {
            Some((normalize_agent_id(agent), rest.to_string()))
        }
        _ => None,
    }
}

/// Whether a raw bucket or session key addresses a group or channel
pub fn is_group_session_key(key: &str) -> bool {
    key.contains(":group:") || key.contains(":channel:")
}

/// Derive the raw bucket for a message, before agent scoping.
///
/// Multi-party chats yield `<provider>:<group|channel>:<id>`; direct chats
/// yield the trimmed sender identity (or `unknown`).
pub fn derive_session_key(scope: SessionScope, ctx: &MsgContext) -> String {
    if scope == SessionScope::Global {
        return GLOBAL_SESSION_KEY.to_string();
    }

    if let Some(group_id) = ctx.group_id.as_deref().map(str::trim).filter(|g| !g.is_empty()) {
        let kind = match ctx.chat_type {
            ChatType::Channel => Some("channel"),
            ChatType::Group => Some("group"),
            ChatType::Direct => None,
        };
        if let Some(kind) = kind {
            let provider = ctx
                .channel
                .as_deref()
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .unwrap_or("unknown");
            return format!("{}:{}:{}", provider, kind, group_id).to_lowercase();
        }
    }

    match ctx.from.as_deref().map(str::trim) {
        Some(from) if !from.is_empty() => from.to_string(),
        _ => "unknown".to_string(),
    }
}

/// Resolve the canonical session key for a message.
///
/// Pure and deterministic: identical inputs always yield the same key.
pub fn resolve_session_key(scope: SessionScope, ctx: &MsgContext, main_key: &str) -> String {
    if scope == SessionScope::Global {
        return GLOBAL_SESSION_KEY.to_string();
    }

    if let Some(explicit) = ctx
        .session_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
    {
        return explicit.to_lowercase();
    }

    let agent_id = normalize_agent_id(ctx.agent_id.as_deref().unwrap_or(DEFAULT_AGENT_ID));
    let raw = derive_session_key(scope, ctx);
    if !is_group_session_key(&raw) {
        return build_agent_main_session_key(&agent_id, Some(main_key));
    }
    format!("agent:{}:{}", agent_id, raw).to_lowercase()
}

/// Map the aliases of an agent's main bucket (`main`, the configured main
/// key, `agent:<id>:main`) onto the canonical main key; other keys pass
/// through trimmed and lower-cased.
pub fn canonicalize_main_session_alias(
    scope: SessionScope,
    agent_id: &str,
    main_key: &str,
    session_key: &str,
) -> String {
    let raw = session_key.trim();
    if raw.is_empty() {
        return String::new();
    }

    let main_key = normalize_main_key(Some(main_key));
    let canonical = build_agent_main_session_key(agent_id, Some(&main_key));
    let alias = build_agent_main_session_key(agent_id, Some(DEFAULT_MAIN_KEY));
    let lowered = raw.to_lowercase();
    let is_main_alias =
        lowered == DEFAULT_MAIN_KEY || lowered == main_key || lowered == canonical || lowered == alias;

    match (scope, is_main_alias) {
        (SessionScope::Global, true) => GLOBAL_SESSION_KEY.to_string(),
        (_, true) => canonical,
        _ => lowered,
    }
}
