use {anyhow::Result, async_trait::async_trait};

// ── Channel events (pub/sub) ────────────────────────────────────────────────

/// Events emitted by channel plugins.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelEvent {
    InboundMessage {
        channel_type: String,
        account_id: String,
        peer_id: String,
        username: Option<String>,
        sender_name: Option<String>,
    },
    /// The upstream provider accepted our webhook URL.
    WebhookRegistered {
        channel_type: String,
        account_id: String,
        url: String,
    },
    /// The upstream provider rejected our webhook URL. Inbound traffic for
    /// the account is dead until this is fixed.
    WebhookFailed {
        channel_type: String,
        account_id: String,
        error: String,
    },
}

/// Sink for channel events; the gateway provides the concrete implementation.
#[async_trait]
pub trait ChannelEventSink: Send + Sync {
    /// Record a channel event.
    async fn emit(&self, event: ChannelEvent);

    /// Hand an inbound message to the agent side. Implementations queue the
    /// work and return without waiting for it to run.
    async fn dispatch_to_chat(
        &self,
        text: &str,
        reply_to: ChannelReplyTarget,
        meta: ChannelMessageMeta,
    );
}

/// Metadata about a channel message.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ChannelMessageMeta {
    pub channel_type: String,
    pub sender_name: Option<String>,
    pub username: Option<String>,
}

/// Where to send the response back.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChannelReplyTarget {
    pub channel_type: String,
    pub account_id: String,
    /// Chat/peer ID to send the reply to.
    pub chat_id: String,
}

impl ChannelReplyTarget {
    /// Key identifying one conversation; work for the same key is serialized.
    #[must_use]
    pub fn lane_key(&self) -> String {
        format!("{}:{}:{}", self.channel_type, self.account_id, self.chat_id)
    }
}

/// Core channel plugin trait. Each messaging platform implements this.
#[async_trait]
pub trait ChannelPlugin: Send + Sync {
    /// Channel identifier (e.g. "telegram").
    fn id(&self) -> &str;

    /// Human-readable channel name.
    fn name(&self) -> &str;

    /// Start an account. Webhook channels register their route here and
    /// must fail if the upstream provider refuses the webhook URL.
    async fn start_account(&mut self, account_id: &str, config: serde_json::Value) -> Result<()>;

    /// Stop an account and release its route. Stopping an unknown account
    /// is not an error.
    async fn stop_account(&mut self, account_id: &str) -> Result<()>;

    /// Currently started accounts.
    fn account_ids(&self) -> Vec<String>;
}
