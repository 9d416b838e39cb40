//! ClawGate configuration management

use crate::error::{Error, Result};
use crate::retry::RetryConfig;
use crate::session::{SessionScope, DEFAULT_AGENT_ID, DEFAULT_MAIN_KEY};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main ClawGate configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClawGateConfig {
    /// Gateway listener and connection policy
    pub gateway: GatewayConfig,

    /// Handshake authentication
    pub auth: AuthConfig,

    /// Session key resolution
    pub session: SessionConfig,

    /// Chat run lifecycle tunables
    pub runs: RunsConfig,

    /// Inbound message de-duplication
    pub dedupe: DedupeConfig,

    /// Presence registry limits
    pub presence: PresenceConfig,

    /// Channel adapters and delivery
    pub channels: ChannelsConfig,
}

impl ClawGateConfig {
    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&raw)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| Error::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as TOML
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Reject values the gateway cannot run with
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.gateway.max_queued_frames == 0 {
            problems.push("gateway.max_queued_frames must be at least 1".to_string());
        }
        if self.gateway.max_payload_bytes < 1024 {
            problems.push("gateway.max_payload_bytes must be at least 1024".to_string());
        }
        if self.gateway.tick_interval_ms == 0 {
            problems.push("gateway.tick_interval_ms must be positive".to_string());
        }
        if self.gateway.health_refresh_ms == 0 {
            problems.push("gateway.health_refresh_ms must be positive".to_string());
        }
        if self.gateway.handshake_timeout_ms == 0 {
            problems.push("gateway.handshake_timeout_ms must be positive".to_string());
        }

        match self.auth.mode {
            AuthMode::Token if self.auth.token.as_deref().map_or(true, str::is_empty) => {
                problems.push("auth.mode = \"token\" requires auth.token".to_string())
            }
            AuthMode::Password if self.auth.password.as_deref().map_or(true, str::is_empty) => {
                problems.push("auth.mode = \"password\" requires auth.password".to_string())
            }
            _ => {}
        }

        if self.runs.agent_timeout_ms == 0 {
            problems.push("runs.agent_timeout_ms must be positive".to_string());
        }
        if self.dedupe.max_size == 0 {
            problems.push("dedupe.max_size must be at least 1".to_string());
        }
        if self.presence.max_entries == 0 {
            problems.push("presence.max_entries must be at least 1".to_string());
        }

        let retry = &self.channels.retry;
        if retry.min_delay_ms > retry.max_delay_ms {
            problems.push("channels.retry.min_delay_ms exceeds max_delay_ms".to_string());
        }
        if !(0.0..=1.0).contains(&retry.jitter) {
            problems.push("channels.retry.jitter must be within [0, 1]".to_string());
        }
        if self.channels.restart_initial_ms == 0
            || self.channels.restart_initial_ms > self.channels.restart_max_ms
        {
            problems.push(
                "channels.restart_initial_ms must be positive and not exceed restart_max_ms"
                    .to_string(),
            );
        }

        let mut names = std::collections::HashSet::new();
        for webhook in &self.channels.webhooks {
            if webhook.name.trim().is_empty() {
                problems.push("channels.webhooks entries need a name".to_string());
            } else if !names.insert(webhook.name.as_str()) {
                problems.push(format!("duplicate channel name '{}'", webhook.name));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Config(problems.join("; ")))
        }
    }
}

/// Gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Outbound frames queued per connection before it counts as a slow consumer
    pub max_queued_frames: usize,

    /// Largest accepted inbound frame
    pub max_payload_bytes: usize,

    /// Interval between `tick` events
    pub tick_interval_ms: u64,

    /// Interval between health refreshes
    pub health_refresh_ms: u64,

    /// Time allowed for the `connect` request after the socket opens
    pub handshake_timeout_ms: u64,

    /// Origins allowed to call the HTTP API from a browser (empty = any)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cors_origins: Vec<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 18790,
            max_queued_frames: 256,
            max_payload_bytes: 512 * 1024,
            tick_interval_ms: 30_000,
            health_refresh_ms: 60_000,
            handshake_timeout_ms: 10_000,
            cors_origins: Vec::new(),
        }
    }
}

/// How `connect` requests are authenticated
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    None,
    Token,
    Password,
}

/// Authentication configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub mode: AuthMode,

    /// Shared token for `mode = "token"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// Shared password for `mode = "password"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Session key resolution configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub scope: SessionScope,

    /// Agent id used when a key does not name one
    pub agent_id: String,

    /// Main key direct chats collapse into
    pub main_key: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            scope: SessionScope::PerSender,
            agent_id: DEFAULT_AGENT_ID.to_string(),
            main_key: DEFAULT_MAIN_KEY.to_string(),
        }
    }
}

/// Chat run lifecycle configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunsConfig {
    /// Late events for a cancelled run are swallowed for this long
    pub abort_grace_ms: u64,

    /// Terminal runs nobody drained are evicted after this
    pub eviction_grace_ms: u64,

    /// Bound on each backend call
    pub agent_timeout_ms: u64,

    /// Minimum spacing between delta broadcasts for one run
    pub delta_throttle_ms: u64,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            abort_grace_ms: 5_000,
            eviction_grace_ms: 60_000,
            agent_timeout_ms: 600_000,
            delta_throttle_ms: 150,
        }
    }
}

/// De-duplication cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupeConfig {
    pub ttl_ms: u64,
    pub max_size: usize,
}

impl Default for DedupeConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 20 * 60 * 1000,
            max_size: 5_000,
        }
    }
}

/// Presence registry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PresenceConfig {
    pub ttl_ms: u64,
    pub max_entries: usize,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 5 * 60 * 1000,
            max_entries: 200,
        }
    }
}

/// Channel adapter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Retry policy for outbound replies
    pub retry: RetryConfig,

    /// Per-attempt bound on `send_message`
    pub send_timeout_ms: u64,

    /// First supervisor restart delay
    pub restart_initial_ms: u64,

    /// Supervisor restart delay cap
    pub restart_max_ms: u64,

    /// How long a session remembers its last inbound reply route
    pub route_ttl_ms: u64,

    /// Generic webhook channels
    pub webhooks: Vec<WebhookChannelConfig>,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            send_timeout_ms: 15_000,
            restart_initial_ms: 2_000,
            restart_max_ms: 60_000,
            route_ttl_ms: 24 * 60 * 60 * 1000,
            webhooks: Vec::new(),
        }
    }
}

/// Generic webhook channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookChannelConfig {
    /// Channel name, also the `/webhook/<name>` path segment
    pub name: String,

    /// Bearer secret inbound requests must present
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,

    /// Where replies are POSTed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,

    /// Account id recorded on inbound messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = ClawGateConfig::default();
        assert_eq!(config.gateway.port, 18790);
        assert_eq!(config.gateway.max_queued_frames, 256);
        assert_eq!(config.runs.abort_grace_ms, 5_000);
        assert_eq!(config.dedupe.max_size, 5_000);
        assert_eq!(config.channels.retry.attempts, 3);
        assert_eq!(config.auth.mode, AuthMode::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let config = ClawGateConfig::from_toml(
            r#"
            [gateway]
            port = 9000

            [runs]
            abort_grace_ms = 1500
            "#,
        )
        .unwrap();
        assert_eq!(config.gateway.port, 9000);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.runs.abort_grace_ms, 1500);
        assert_eq!(config.runs.eviction_grace_ms, 60_000);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [auth]
            mode = "token"
            token = "s3cret-token"

            [session]
            scope = "global"

            [[channels.webhooks]]
            name = "ops"
            callback_url = "http://127.0.0.1:9/reply"
            "#
        )
        .unwrap();

        let config = ClawGateConfig::load(file.path()).unwrap();
        assert_eq!(config.auth.mode, AuthMode::Token);
        assert_eq!(config.session.scope, SessionScope::Global);
        assert_eq!(config.channels.webhooks.len(), 1);
        assert_eq!(config.channels.webhooks[0].name, "ops");
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ClawGateConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_token_mode_without_token() {
        let mut config = ClawGateConfig::default();
        config.auth.mode = AuthMode::Token;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("auth.token"));
    }

    #[test]
    fn test_validate_collects_problems() {
        let mut config = ClawGateConfig::default();
        config.gateway.max_queued_frames = 0;
        config.dedupe.max_size = 0;
        let message = config.validate().unwrap_err().to_string();
        assert!(message.contains("max_queued_frames"));
        assert!(message.contains("dedupe.max_size"));
    }

    #[test]
    fn test_validate_rejects_duplicate_webhooks() {
        let mut config = ClawGateConfig::default();
        let hook = WebhookChannelConfig {
            name: "ops".into(),
            secret: None,
            callback_url: None,
            account_id: None,
        };
        config.channels.webhooks = vec![hook.clone(), hook];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip_preserves_values() {
        let mut config = ClawGateConfig::default();
        config.gateway.port = 4242;
        config.session.main_key = "home".into();
        let text = config.to_toml().unwrap();
        let parsed = ClawGateConfig::from_toml(&text).unwrap();
        assert_eq!(parsed, config);
    }
}
