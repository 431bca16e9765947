use std::time::Duration;

use {
    secrecy::ExposeSecret,
    teloxide::{prelude::*, types::AllowedUpdate},
    tracing::debug,
    url::Url,
};

use crate::{
    config::TelegramAccountConfig,
    error::{Error, Result},
};

/// Bot API calls made while starting or stopping an account are short;
/// anything slower than this is treated as a failure.
const API_TIMEOUT: Duration = Duration::from_secs(30);

/// Build a bot client for one account.
pub fn build_bot(config: &TelegramAccountConfig) -> Result<Bot> {
    let client = teloxide::net::default_reqwest_settings()
        .timeout(API_TIMEOUT)
        .build()
        .map_err(|e| Error::Client(Box::new(e)))?;
    let bot = Bot::with_client(config.token.expose_secret(), client);
    match &config.api_url {
        Some(raw) => {
            let api_url = Url::parse(raw).map_err(|source| Error::WebhookUrl {
                url: raw.clone(),
                source,
            })?;
            Ok(bot.set_api_url(api_url))
        },
        None => Ok(bot),
    }
}

/// Join the public base URL and the route path into the URL handed to
/// Telegram.
pub fn webhook_url(public_url: &str, path: &str) -> Result<Url> {
    let raw = format!("{}{path}", public_url.trim_end_matches('/'));
    Url::parse(&raw).map_err(|source| Error::WebhookUrl { url: raw, source })
}

/// Point Telegram at our webhook route.
pub async fn register_webhook(
    bot: &Bot,
    url: Url,
    config: &TelegramAccountConfig,
) -> Result<()> {
    let mut request = bot
        .set_webhook(url)
        .allowed_updates(vec![AllowedUpdate::Message])
        .drop_pending_updates(config.drop_pending_updates);
    if let Some(secret) = &config.webhook_secret {
        request = request.secret_token(secret.expose_secret().clone());
    }
    request.await?;
    debug!("telegram accepted setWebhook");
    Ok(())
}

/// Remove the webhook so Telegram stops delivering to us.
pub async fn delete_webhook(bot: &Bot) -> Result<()> {
    bot.delete_webhook().await?;
    Ok(())
}
