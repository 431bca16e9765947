use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
};

/// Configuration for a single Telegram bot account.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramAccountConfig {
    /// Bot token from @BotFather.
    #[serde(serialize_with = "serialize_secret")]
    pub token: Secret<String>,

    /// Route on the gateway listener. Defaults to `/telegram/<account_id>`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_path: Option<String>,

    /// Value Telegram echoes in `X-Telegram-Bot-Api-Secret-Token`. Requests
    /// without it are rejected when set.
    #[serde(
        serialize_with = "serialize_option_secret",
        skip_serializing_if = "Option::is_none"
    )]
    pub webhook_secret: Option<Secret<String>>,

    /// Ask Telegram to drop updates queued while no webhook was reachable.
    pub drop_pending_updates: bool,

    /// Call `deleteWebhook` when the account stops for good. Left off by
    /// default so a restart does not lose updates between epochs.
    pub delete_webhook_on_stop: bool,

    /// Bot API base URL override (self-hosted Bot API server).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,
}

impl TelegramAccountConfig {
    /// Route path for `account_id`, honoring the configured override.
    #[must_use]
    pub fn route_path(&self, account_id: &str) -> String {
        match &self.webhook_path {
            Some(path) => path.clone(),
            None => format!("/telegram/{account_id}"),
        }
    }
}

impl std::fmt::Debug for TelegramAccountConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramAccountConfig")
            .field("token", &"[REDACTED]")
            .field("webhook_path", &self.webhook_path)
            .field(
                "webhook_secret",
                &self.webhook_secret.as_ref().map(|_| "[REDACTED]"),
            )
            .field("drop_pending_updates", &self.drop_pending_updates)
            .finish_non_exhaustive()
    }
}

fn serialize_secret<S: serde::Serializer>(
    secret: &Secret<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(secret.expose_secret())
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

impl Default for TelegramAccountConfig {
    fn default() -> Self {
        Self {
            token: Secret::new(String::new()),
            webhook_path: None,
            webhook_secret: None,
            drop_pending_updates: false,
            delete_webhook_on_stop: false,
            api_url: None,
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_route_uses_account_id() {
        let cfg = TelegramAccountConfig::default();
        assert_eq!(cfg.route_path("main"), "/telegram/main");
        assert!(!cfg.delete_webhook_on_stop);
    }

    #[test]
    fn deserialize_from_json() {
        let json = r#"{
            "token": "123:ABC",
            "webhook_path": "/hooks/tg",
            "webhook_secret": "s3cret"
        }"#;
        let cfg: TelegramAccountConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.token.expose_secret(), "123:ABC");
        assert_eq!(cfg.route_path("main"), "/hooks/tg");
        assert_eq!(
            cfg.webhook_secret.as_ref().map(|s| s.expose_secret().as_str()),
            Some("s3cret")
        );
        assert!(!cfg.drop_pending_updates);
    }

    #[test]
    fn debug_redacts_secrets() {
        let cfg = TelegramAccountConfig {
            token: Secret::new("123:ABC".into()),
            webhook_secret: Some(Secret::new("s3cret".into())),
            ..Default::default()
        };
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("123:ABC"));
        assert!(!dbg.contains("s3cret"));
    }

    #[test]
    fn account_table_value_fills_defaults() {
        let value = serde_json::json!({
            "token": "tok",
            "api_url": "http://127.0.0.1:9/",
            "delete_webhook_on_stop": true
        });
        let cfg: TelegramAccountConfig = serde_json::from_value(value).unwrap();
        assert_eq!(cfg.api_url.as_deref(), Some("http://127.0.0.1:9/"));
        assert!(cfg.delete_webhook_on_stop);
        assert!(cfg.webhook_secret.is_none());
        assert_eq!(cfg.route_path("ops"), "/telegram/ops");
    }
}
