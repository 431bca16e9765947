use std::{collections::HashMap, sync::Arc};

use {
    anyhow::Result,
    async_trait::async_trait,
    secrecy::ExposeSecret,
    teloxide::Bot,
    tracing::{error, info, warn},
};

use clawport_channels::{
    ChannelEvent, ChannelEventSink, RouteSpec, WebhookRegistration, WebhookRouter,
    plugin::ChannelPlugin,
};

use crate::{bot, config::TelegramAccountConfig, webhook::TelegramWebhookHandler};

struct AccountState {
    bot: Bot,
    config: TelegramAccountConfig,
    registration: Box<dyn WebhookRegistration>,
}

/// Telegram channel plugin.
pub struct TelegramPlugin {
    router: Arc<dyn WebhookRouter>,
    public_url: Option<String>,
    event_sink: Option<Arc<dyn ChannelEventSink>>,
    accounts: HashMap<String, AccountState>,
}

impl TelegramPlugin {
    /// `router` is the gateway listener's route registry; `public_url` is the
    /// externally reachable base URL Telegram will call.
    pub fn new(router: Arc<dyn WebhookRouter>, public_url: Option<String>) -> Self {
        Self {
            router,
            public_url,
            event_sink: None,
            accounts: HashMap::new(),
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn ChannelEventSink>) -> Self {
        self.event_sink = Some(sink);
        self
    }

    /// Route path served for an account, if started.
    pub fn route_path(&self, account_id: &str) -> Option<&str> {
        self.accounts
            .get(account_id)
            .map(|state| state.registration.path())
    }

    async fn emit(&self, event: ChannelEvent) {
        if let Some(sink) = &self.event_sink {
            sink.emit(event).await;
        }
    }
}

#[async_trait]
impl ChannelPlugin for TelegramPlugin {
    fn id(&self) -> &str {
        "telegram"
    }

    fn name(&self) -> &str {
        "Telegram"
    }

    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()> {
        let tg_config: TelegramAccountConfig = serde_json::from_value(config)?;

        if tg_config.token.expose_secret().is_empty() {
            return Err(anyhow::anyhow!("telegram bot token is required"));
        }
        if self.accounts.contains_key(account_id) {
            return Err(anyhow::anyhow!(
                "telegram account {account_id} is already started"
            ));
        }
        let Some(public_url) = self.public_url.clone() else {
            return Err(anyhow::anyhow!(
                "server.public_url is required for telegram webhooks"
            ));
        };

        let path = tg_config.route_path(account_id);
        let url = bot::webhook_url(&public_url, &path)?;
        let bot = bot::build_bot(&tg_config)?;

        info!(account_id, path, "starting telegram account");

        let handler = Arc::new(TelegramWebhookHandler::new(
            account_id,
            tg_config.webhook_secret.clone(),
            self.event_sink.clone(),
        ));
        let registration = self.router.register(
            RouteSpec::post(path.clone(), "telegram").for_account(account_id),
            handler,
        )?;

        if let Err(e) = bot::register_webhook(&bot, url.clone(), &tg_config).await {
            registration.unregister();
            error!(
                account_id,
                url = %url,
                error = %e,
                "telegram rejected the webhook; inbound messages for this account will not be delivered"
            );
            self.emit(ChannelEvent::WebhookFailed {
                channel_type: "telegram".into(),
                account_id: account_id.to_string(),
                error: e.to_string(),
            })
            .await;
            return Err(e.into());
        }

        info!(account_id, url = %url, "telegram webhook registered");
        self.emit(ChannelEvent::WebhookRegistered {
            channel_type: "telegram".into(),
            account_id: account_id.to_string(),
            url: url.to_string(),
        })
        .await;

        self.accounts.insert(account_id.to_string(), AccountState {
            bot,
            config: tg_config,
            registration,
        });
        Ok(())
    }

    async fn stop_account(&mut self, account_id: &str) -> Result<()> {
        let Some(state) = self.accounts.remove(account_id) else {
            warn!(account_id, "telegram account not found");
            return Ok(());
        };
        state.registration.unregister();
        if state.config.delete_webhook_on_stop
            && let Err(e) = bot::delete_webhook(&state.bot).await
        {
            warn!(account_id, error = %e, "failed to delete telegram webhook");
        }
        info!(account_id, "telegram account stopped");
        Ok(())
    }

    fn account_ids(&self) -> Vec<String> {
        self.accounts.keys().cloned().collect()
    }
}
