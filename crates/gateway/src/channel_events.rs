//! Bridges channel adapters to the gateway's command queue.
//!
//! Inbound chat messages become turns on the conversation's lane, so two
//! messages from the same chat are handled in order while distinct chats run
//! in parallel. The queue's active count is what the run loop drains on
//! restart.

use std::sync::Arc;

use {
    async_trait::async_trait,
    tracing::{debug, error, info, warn},
};

use clawport_channels::{ChannelEvent, ChannelEventSink, ChannelMessageMeta, ChannelReplyTarget};

use crate::command_queue::CommandQueue;

/// One inbound message ready to be handled.
#[derive(Debug, Clone)]
pub struct InboundTurn {
    pub text: String,
    pub reply_to: ChannelReplyTarget,
    pub meta: ChannelMessageMeta,
}

/// Whatever turns inbound chat messages into work. Agent logic plugs in here.
#[async_trait]
pub trait TurnHandler: Send + Sync {
    async fn handle_turn(&self, turn: InboundTurn) -> anyhow::Result<()>;
}

/// Default handler: records the turn and does nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingTurnHandler;

#[async_trait]
impl TurnHandler for LoggingTurnHandler {
    async fn handle_turn(&self, turn: InboundTurn) -> anyhow::Result<()> {
        info!(
            channel = %turn.reply_to.channel_type,
            account_id = %turn.reply_to.account_id,
            chat_id = %turn.reply_to.chat_id,
            sender = turn.meta.sender_name.as_deref().unwrap_or("-"),
            chars = turn.text.chars().count(),
            "inbound turn"
        );
        Ok(())
    }
}

/// [`ChannelEventSink`] that logs events and queues turns per chat lane.
pub struct GatewayChannelEventSink {
    queue: CommandQueue,
    turns: Arc<dyn TurnHandler>,
}

impl GatewayChannelEventSink {
    pub fn new(queue: CommandQueue, turns: Arc<dyn TurnHandler>) -> Self {
        Self { queue, turns }
    }
}

#[async_trait]
impl ChannelEventSink for GatewayChannelEventSink {
    async fn emit(&self, event: ChannelEvent) {
        match event {
            ChannelEvent::InboundMessage {
                channel_type,
                account_id,
                peer_id,
                username,
                ..
            } => {
                debug!(channel = %channel_type, %account_id, %peer_id, ?username, "inbound message");
            },
            ChannelEvent::WebhookRegistered {
                channel_type,
                account_id,
                url,
            } => {
                info!(channel = %channel_type, %account_id, %url, "channel webhook registered");
            },
            ChannelEvent::WebhookFailed {
                channel_type,
                account_id,
                error,
            } => {
                error!(
                    channel = %channel_type,
                    %account_id,
                    %error,
                    "channel webhook registration failed"
                );
            },
        }
    }

    async fn dispatch_to_chat(
        &self,
        text: &str,
        reply_to: ChannelReplyTarget,
        meta: ChannelMessageMeta,
    ) {
        let lane = reply_to.lane_key();
        let turn = InboundTurn {
            text: text.to_string(),
            reply_to,
            meta,
        };
        let turns = Arc::clone(&self.turns);
        let task_lane = lane.clone();
        // Fire and forget: the queue tracks the task for draining.
        drop(self.queue.enqueue(&lane, async move {
            if let Err(e) = turns.handle_turn(turn).await {
                warn!(lane = %task_lane, error = %e, "turn failed");
            }
        }));
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::{sync::Mutex, time::Duration};

    use tokio::sync::Semaphore;

    use {super::*, crate::lifecycle::TaskAccounting};

    #[derive(Default)]
    struct RecordingTurns {
        seen: Mutex<Vec<String>>,
        gate: Option<Arc<Semaphore>>,
    }

    #[async_trait]
    impl TurnHandler for RecordingTurns {
        async fn handle_turn(&self, turn: InboundTurn) -> anyhow::Result<()> {
            if let Some(gate) = &self.gate {
                gate.acquire().await?.forget();
            }
            self.seen.lock().unwrap().push(turn.text);
            Ok(())
        }
    }

    fn target(chat: &str) -> ChannelReplyTarget {
        ChannelReplyTarget {
            channel_type: "telegram".into(),
            account_id: "main".into(),
            chat_id: chat.into(),
        }
    }

    fn meta() -> ChannelMessageMeta {
        ChannelMessageMeta {
            channel_type: "telegram".into(),
            sender_name: Some("Ada".into()),
            username: None,
        }
    }

    #[tokio::test]
    async fn turns_on_one_chat_run_in_order() {
        let queue = CommandQueue::new();
        let turns = Arc::new(RecordingTurns::default());
        let sink = GatewayChannelEventSink::new(queue.clone(), Arc::clone(&turns) as _);

        sink.dispatch_to_chat("first", target("42"), meta()).await;
        sink.dispatch_to_chat("second", target("42"), meta()).await;

        let outcome = queue.wait_for_active_tasks(Duration::from_secs(5)).await;
        assert!(outcome.drained);
        assert_eq!(*turns.seen.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn pending_turns_count_as_active_work() {
        let queue = CommandQueue::new();
        let gate = Arc::new(Semaphore::new(0));
        let turns = Arc::new(RecordingTurns {
            gate: Some(Arc::clone(&gate)),
            ..Default::default()
        });
        let sink = GatewayChannelEventSink::new(queue.clone(), Arc::clone(&turns) as _);

        sink.dispatch_to_chat("a", target("1"), meta()).await;
        sink.dispatch_to_chat("b", target("1"), meta()).await;
        sink.dispatch_to_chat("c", target("2"), meta()).await;
        assert_eq!(queue.active_task_count(), 3);

        let lanes = queue.lanes();
        assert!(lanes.iter().any(|l| l.lane == "telegram:main:1" && l.queued == 1));

        gate.add_permits(3);
        assert!(
            queue
                .wait_for_active_tasks(Duration::from_secs(5))
                .await
                .drained
        );
        assert_eq!(turns.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn logging_handler_accepts_any_turn() {
        let turn = InboundTurn {
            text: "hi".into(),
            reply_to: target("7"),
            meta: meta(),
        };
        assert!(LoggingTurnHandler.handle_turn(turn).await.is_ok());
    }
}
