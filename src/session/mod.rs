//! Session key resolution
//!
//! Collapses platform-native conversation identity into the canonical
//! session key space:
//!
//! - `global` scope: every conversation shares the `global` bucket
//! - direct chats: one `agent:<agentId>:<mainKey>` bucket per agent
//! - groups and channels: one isolated `agent:<agentId>:<provider>:group:<id>`
//!   bucket per group

mod key;

pub use key::{
    build_agent_main_session_key, canonicalize_main_session_alias, derive_session_key,
    is_group_session_key, normalize_agent_id, normalize_main_key, parse_agent_session_key,
    resolve_session_key, ChatType, MsgContext, SessionScope, DEFAULT_AGENT_ID, DEFAULT_MAIN_KEY,
    GLOBAL_SESSION_KEY,
};
