//! Channel plugin system.
//!
//! Each messaging platform implements [`ChannelPlugin`].
//! Webhook-driven channels receive inbound traffic through the gateway's
//! shared listener by registering a route with a [`WebhookRouter`].

pub mod error;
pub mod plugin;
pub mod registry;
pub mod webhook;

pub use {
    error::{Error, Result},
    plugin::{
        ChannelEvent, ChannelEventSink, ChannelMessageMeta, ChannelPlugin, ChannelReplyTarget,
    },
    registry::ChannelRegistry,
    webhook::{
        RouteError, RouteSpec, WebhookHandler, WebhookRegistration, WebhookReply, WebhookRequest,
        WebhookRouter,
    },
};
