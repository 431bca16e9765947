/// Config schema types (server, gateway lifecycle, webhook limits, channels).
use std::{collections::HashMap, time::Duration};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

const REDACTED: &str = "[REDACTED]";

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClawportConfig {
    pub server: ServerConfig,
    pub gateway: GatewayConfig,
    pub webhooks: WebhooksConfig,
    pub channels: ChannelsConfig,
}

impl ClawportConfig {
    /// Copy of the config with every secret value replaced by a marker,
    /// suitable for printing.
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        if copy.gateway.control_token.is_some() {
            copy.gateway.control_token = Some(Secret::new(REDACTED.into()));
        }
        for account in copy.channels.telegram.values_mut() {
            if let Some(obj) = account.as_object_mut() {
                for key in ["token", "webhook_secret"] {
                    if let Some(value) = obj.get_mut(key)
                        && !value.is_null()
                    {
                        *value = serde_json::Value::String(REDACTED.into());
                    }
                }
            }
        }
        copy
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind to. Defaults to "127.0.0.1".
    pub bind: String,
    /// Port to listen on.
    pub port: u16,
    /// Externally reachable base URL (e.g. `https://bot.example.com`).
    /// Channel adapters that register upstream webhooks build their
    /// callback URLs from it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1".into(),
            port: 18790,
            public_url: None,
        }
    }
}

/// Process lifecycle settings.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Bearer token protecting `/api/gateway/*`. The control API is not
    /// mounted when unset.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_option_secret"
    )]
    pub control_token: Option<Secret<String>>,
    /// How long a freshly spawned successor keeps retrying the instance
    /// lock while its predecessor exits.
    pub lock_wait_secs: u64,
    pub restart: RestartConfig,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field(
                "control_token",
                &self.control_token.as_ref().map(|_| REDACTED),
            )
            .field("lock_wait_secs", &self.lock_wait_secs)
            .field("restart", &self.restart)
            .finish()
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            control_token: None,
            lock_wait_secs: 10,
            restart: RestartConfig::default(),
        }
    }
}

impl GatewayConfig {
    #[must_use]
    pub fn lock_wait(&self) -> Duration {
        Duration::from_secs(self.lock_wait_secs)
    }
}

/// Restart and drain behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Upper bound on waiting for in-flight tasks before closing an epoch.
    pub drain_timeout_secs: u64,
    /// Hint passed to `close` so downstream health checks expect a brief
    /// outage instead of a dead instance.
    pub restart_expected_ms: u64,
    /// Honour a restart signal (SIGUSR1) even without a prior authorization
    /// from the control API.
    pub allow_external_signal: bool,
    /// How long a closing epoch waits for open connections before the serve
    /// task is aborted.
    pub close_grace_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            drain_timeout_secs: 30,
            restart_expected_ms: 1500,
            allow_external_signal: false,
            close_grace_secs: 5,
        }
    }
}

impl RestartConfig {
    #[must_use]
    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    #[must_use]
    pub fn restart_expected(&self) -> Duration {
        Duration::from_millis(self.restart_expected_ms)
    }

    #[must_use]
    pub fn close_grace(&self) -> Duration {
        Duration::from_secs(self.close_grace_secs)
    }
}

/// Per-request ceilings applied to every plugin webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhooksConfig {
    pub max_body_bytes: usize,
    pub body_timeout_secs: u64,
    pub handler_timeout_secs: u64,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            max_body_bytes: 1024 * 1024,
            body_timeout_secs: 30,
            handler_timeout_secs: 10,
        }
    }
}

/// Channel accounts. Each plugin parses its own account shape.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Telegram bot accounts, keyed by account ID.
    pub telegram: HashMap<String, serde_json::Value>,
}

fn serialize_option_secret<S: serde::Serializer>(
    secret: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match secret {
        Some(s) => serializer.serialize_some(s.expose_secret()),
        None => serializer.serialize_none(),
    }
}
