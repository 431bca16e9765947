//! Telegram channel plugin for clawport.
//!
//! Implements `ChannelPlugin` in webhook mode: each account registers a
//! route on the shared gateway listener and points Telegram's `setWebhook`
//! at it. Updates arrive as bounded, fully-read requests from the gateway.

pub mod bot;
pub mod config;
pub mod error;
pub mod plugin;
pub mod webhook;

pub use {
    config::TelegramAccountConfig,
    error::{Error, Result},
    plugin::TelegramPlugin,
    webhook::TelegramWebhookHandler,
};
