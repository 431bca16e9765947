//! Transport-neutral webhook types shared between the gateway listener and
//! channel adapters.
//!
//! Adapters never see sockets or partially-read bodies: the gateway reads
//! and bounds the body first, then hands over a complete [`WebhookRequest`].

use std::sync::Arc;

use {
    async_trait::async_trait,
    bytes::Bytes,
    http::{HeaderMap, Method, StatusCode},
    serde::de::DeserializeOwned,
};

/// A fully-read inbound webhook request.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl WebhookRequest {
    /// Header value as UTF-8, if present and valid.
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Decode the body as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> crate::Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

/// What a handler wants written back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookReply {
    pub status: StatusCode,
    pub body: Option<serde_json::Value>,
}

impl WebhookReply {
    #[must_use]
    pub fn ok() -> Self {
        Self {
            status: StatusCode::OK,
            body: None,
        }
    }

    #[must_use]
    pub fn json(status: StatusCode, body: serde_json::Value) -> Self {
        Self {
            status,
            body: Some(body),
        }
    }

    #[must_use]
    pub fn error(status: StatusCode, message: impl Into<String>) -> Self {
        Self::json(status, serde_json::json!({ "error": message.into() }))
    }
}

/// Handles one inbound webhook request.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, request: WebhookRequest) -> WebhookReply;
}

/// Route a plugin asks the gateway to serve.
#[derive(Debug, Clone)]
pub struct RouteSpec {
    pub path: String,
    pub plugin_id: String,
    pub account_id: Option<String>,
    /// Accepted methods. Anything else is answered with 405.
    pub methods: Vec<Method>,
}

impl RouteSpec {
    /// A POST-only route, the common case for chat-platform webhooks.
    #[must_use]
    pub fn post(path: impl Into<String>, plugin_id: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            plugin_id: plugin_id.into(),
            account_id: None,
            methods: vec![Method::POST],
        }
    }

    #[must_use]
    pub fn for_account(mut self, account_id: impl Into<String>) -> Self {
        self.account_id = Some(account_id.into());
        self
    }

    /// Human-readable owner used in conflict errors and logs.
    #[must_use]
    pub fn owner(&self) -> String {
        match &self.account_id {
            Some(account) => format!("{}:{account}", self.plugin_id),
            None => self.plugin_id.clone(),
        }
    }
}

/// Why a route was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouteError {
    #[error("webhook path {path} is already registered by {owner}")]
    PathInUse { path: String, owner: String },

    #[error("webhook path {path} is reserved by the gateway")]
    Reserved { path: String },

    #[error("invalid webhook path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("webhook route for {path} must accept at least one method")]
    NoMethods { path: String },
}

/// A live route. Dropping it or calling [`WebhookRegistration::unregister`]
/// removes the route; both are idempotent.
pub trait WebhookRegistration: Send + Sync {
    fn path(&self) -> &str;
    fn unregister(&self);
}

/// Registers plugin routes on the shared listener.
pub trait WebhookRouter: Send + Sync {
    fn register(
        &self,
        spec: RouteSpec,
        handler: Arc<dyn WebhookHandler>,
    ) -> Result<Box<dyn WebhookRegistration>, RouteError>;
}
