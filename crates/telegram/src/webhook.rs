use std::sync::Arc;

use {
    async_trait::async_trait,
    http::StatusCode,
    secrecy::{ExposeSecret, Secret},
    teloxide::types::{Message, Update, UpdateKind},
    tracing::{debug, warn},
};

use {
    clawport_channels::{
        ChannelEvent, ChannelEventSink, ChannelMessageMeta, ChannelReplyTarget, WebhookHandler,
        WebhookReply, WebhookRequest,
    },
    clawport_common::secret::constant_time_eq,
};

/// Header Telegram uses to echo the `secret_token` given to `setWebhook`.
pub const SECRET_HEADER: &str = "x-telegram-bot-api-secret-token";

/// Handles Telegram update deliveries for one account.
pub struct TelegramWebhookHandler {
    account_id: String,
    secret: Option<Secret<String>>,
    event_sink: Option<Arc<dyn ChannelEventSink>>,
}

impl TelegramWebhookHandler {
    pub fn new(
        account_id: impl Into<String>,
        secret: Option<Secret<String>>,
        event_sink: Option<Arc<dyn ChannelEventSink>>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            secret,
            event_sink,
        }
    }

    fn secret_matches(&self, request: &WebhookRequest) -> bool {
        let Some(expected) = &self.secret else {
            return true;
        };
        request
            .header(SECRET_HEADER)
            .is_some_and(|got| constant_time_eq(got.as_bytes(), expected.expose_secret().as_bytes()))
    }

    async fn handle_message(&self, msg: Message) {
        let Some(text) = msg.text() else {
            debug!(account_id = %self.account_id, "ignoring non-text message");
            return;
        };
        let Some(sink) = &self.event_sink else {
            return;
        };

        let peer_id = msg
            .from
            .as_ref()
            .map(|u| u.id.0.to_string())
            .unwrap_or_else(|| msg.chat.id.0.to_string());
        let username = msg.from.as_ref().and_then(|u| u.username.clone());
        let sender_name = msg.from.as_ref().map(|u| {
            let mut name = u.first_name.clone();
            if let Some(last) = &u.last_name {
                name.push(' ');
                name.push_str(last);
            }
            name
        });

        sink.emit(ChannelEvent::InboundMessage {
            channel_type: "telegram".into(),
            account_id: self.account_id.clone(),
            peer_id,
            username: username.clone(),
            sender_name: sender_name.clone(),
        })
        .await;

        let reply_to = ChannelReplyTarget {
            channel_type: "telegram".into(),
            account_id: self.account_id.clone(),
            chat_id: msg.chat.id.0.to_string(),
        };
        let meta = ChannelMessageMeta {
            channel_type: "telegram".into(),
            sender_name,
            username,
        };
        sink.dispatch_to_chat(text, reply_to, meta).await;
    }
}

#[async_trait]
impl WebhookHandler for TelegramWebhookHandler {
    async fn handle(&self, request: WebhookRequest) -> WebhookReply {
        if !self.secret_matches(&request) {
            warn!(account_id = %self.account_id, "telegram webhook secret mismatch");
            return WebhookReply::error(StatusCode::UNAUTHORIZED, "invalid secret token");
        }

        let update: Update = match request.json() {
            Ok(update) => update,
            Err(e) => {
                warn!(account_id = %self.account_id, error = %e, "malformed telegram update");
                return WebhookReply::error(StatusCode::BAD_REQUEST, "malformed update");
            },
        };

        match update.kind {
            UpdateKind::Message(msg) => self.handle_message(msg).await,
            other => debug!(account_id = %self.account_id, kind = ?other, "ignoring update"),
        }
        WebhookReply::ok()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use {
        bytes::Bytes,
        http::{HeaderMap, HeaderValue, Method},
        serde_json::json,
    };

    use super::*;

    #[derive(Default)]
    struct MockSink {
        events: Mutex<Vec<ChannelEvent>>,
        dispatched: Mutex<Vec<(String, ChannelReplyTarget)>>,
    }

    #[async_trait]
    impl ChannelEventSink for MockSink {
        async fn emit(&self, event: ChannelEvent) {
            self.events.lock().unwrap().push(event);
        }

        async fn dispatch_to_chat(
            &self,
            text: &str,
            reply_to: ChannelReplyTarget,
            _meta: ChannelMessageMeta,
        ) {
            self.dispatched
                .lock()
                .unwrap()
                .push((text.to_string(), reply_to));
        }
    }

    fn request(body: serde_json::Value, secret: Option<&str>) -> WebhookRequest {
        let mut headers = HeaderMap::new();
        if let Some(secret) = secret {
            headers.insert(SECRET_HEADER, HeaderValue::from_str(secret).unwrap());
        }
        WebhookRequest {
            method: Method::POST,
            path: "/telegram/main".into(),
            query: None,
            headers,
            body: Bytes::from(serde_json::to_vec(&body).unwrap()),
        }
    }

    fn text_update(text: &str) -> serde_json::Value {
        json!({
            "update_id": 10,
            "message": {
                "message_id": 1,
                "date": 1,
                "chat": { "id": 42, "type": "private", "first_name": "Alice" },
                "from": {
                    "id": 1001,
                    "is_bot": false,
                    "first_name": "Alice",
                    "username": "alice"
                },
                "text": text
            }
        })
    }

    #[tokio::test]
    async fn text_message_is_dispatched() {
        let sink = Arc::new(MockSink::default());
        let handler = TelegramWebhookHandler::new(
            "main",
            None,
            Some(Arc::clone(&sink) as Arc<dyn ChannelEventSink>),
        );

        let reply = handler.handle(request(text_update("hello"), None)).await;
        assert_eq!(reply.status, StatusCode::OK);

        let dispatched = sink.dispatched.lock().unwrap();
        assert_eq!(dispatched.len(), 1);
        assert_eq!(dispatched[0].0, "hello");
        assert_eq!(dispatched[0].1.lane_key(), "telegram:main:42");

        let events = sink.events.lock().unwrap();
        assert!(matches!(
            &events[0],
            ChannelEvent::InboundMessage { peer_id, username, .. }
                if peer_id == "1001" && username.as_deref() == Some("alice")
        ));
    }

    #[tokio::test]
    async fn wrong_secret_is_unauthorized() {
        let sink = Arc::new(MockSink::default());
        let handler = TelegramWebhookHandler::new(
            "main",
            Some(Secret::new("expected".into())),
            Some(Arc::clone(&sink) as Arc<dyn ChannelEventSink>),
        );

        let reply = handler
            .handle(request(text_update("hi"), Some("wrong")))
            .await;
        assert_eq!(reply.status, StatusCode::UNAUTHORIZED);
        let missing = handler.handle(request(text_update("hi"), None)).await;
        assert_eq!(missing.status, StatusCode::UNAUTHORIZED);
        assert!(sink.dispatched.lock().unwrap().is_empty());

        let ok = handler
            .handle(request(text_update("hi"), Some("expected")))
            .await;
        assert_eq!(ok.status, StatusCode::OK);
    }

    #[tokio::test]
    async fn malformed_body_is_bad_request() {
        let handler = TelegramWebhookHandler::new("main", None, None);
        let mut req = request(json!({}), None);
        req.body = Bytes::from_static(b"not json");
        let reply = handler.handle(req).await;
        assert_eq!(reply.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn non_text_message_is_acknowledged_but_not_dispatched() {
        let sink = Arc::new(MockSink::default());
        let handler = TelegramWebhookHandler::new(
            "main",
            None,
            Some(Arc::clone(&sink) as Arc<dyn ChannelEventSink>),
        );
        let update = json!({
            "update_id": 11,
            "message": {
                "message_id": 2,
                "date": 1,
                "chat": { "id": 42, "type": "private", "first_name": "Alice" },
                "location": { "latitude": 52.5, "longitude": 13.4 }
            }
        });
        let reply = handler.handle(request(update, None)).await;
        assert_eq!(reply.status, StatusCode::OK);
        assert!(sink.dispatched.lock().unwrap().is_empty());
    }
}
