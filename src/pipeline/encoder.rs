//! Encoder stage
//!
//! Consumes typed messages, encodes each into its MessagePack frame, and
//! hands the frame to the sender stage. An encoding failure drops that one
//! message; there is no retry.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::QueueConfig;
use crate::pipeline::sender::OutboundSender;
use crate::pipeline::MessageSink;
use crate::pipeline::stage::{spawn_dispatcher, StageCore};
use crate::wrp::Message;

/// Anything that can encode and send a message.
#[async_trait]
pub trait EncoderSender: Send + Sync {
    async fn encode_and_send(&self, message: Message);
    async fn close(&self);
}

/// Encodes queued messages and feeds the frames to the sender stage.
#[derive(Clone)]
pub struct EncoderQueue {
    core: Arc<StageCore<Message>>,
    sender: Arc<dyn OutboundSender>,
}

impl EncoderQueue {
    pub fn new(sender: Arc<dyn OutboundSender>, config: QueueConfig) -> Self {
        let config = config.clamped();
        let (tx, rx) = mpsc::channel(config.size);
        let write_sender = Arc::clone(&sender);
        let dispatcher = spawn_dispatcher(rx, config.max_workers, move |message: Message| {
            let sender = Arc::clone(&write_sender);
            async move { encode_one(sender, message).await }
        });
        Self {
            core: Arc::new(StageCore::new("encoder queue", tx, dispatcher)),
            sender,
        }
    }
}

async fn encode_one(sender: Arc<dyn OutboundSender>, message: Message) {
    debug!("encoding message...");
    match message.to_msgpack() {
        Ok(frame) => {
            debug!("message encoded");
            sender.send(frame).await;
        }
        Err(e) => {
            error!(error = %e, destination = %message.destination, "failed to encode message");
        }
    }
}

#[async_trait]
impl EncoderSender for EncoderQueue {
    async fn encode_and_send(&self, message: Message) {
        self.core.enqueue(message).await;
    }

    async fn close(&self) {
        let sender = Arc::clone(&self.sender);
        self.core.close_with(async move { sender.close().await }).await;
    }
}

#[async_trait]
impl MessageSink for EncoderQueue {
    async fn send_message(&self, message: Message) {
        self.encode_and_send(message).await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingSender {
        frames: Mutex<Vec<Vec<u8>>>,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl OutboundSender for RecordingSender {
        async fn send(&self, frame: Vec<u8>) {
            self.frames.lock().await.push(frame);
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn encoded_frames_match_the_codec_output() {
        let sender = Arc::new(RecordingSender::default());
        let encoder = EncoderQueue::new(
            Arc::clone(&sender) as Arc<dyn OutboundSender>,
            QueueConfig::new(1, 4),
        );

        let message = Message::event("mac:ffffff112233", "event:status", b"up".to_vec());
        encoder.encode_and_send(message.clone()).await;
        encoder.close().await;

        let frames = sender.frames.lock().await;
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], message.to_msgpack().expect("encoding should succeed"));
    }

    #[tokio::test]
    async fn close_propagates_to_the_sender_exactly_once() {
        let sender = Arc::new(RecordingSender::default());
        let encoder = EncoderQueue::new(
            Arc::clone(&sender) as Arc<dyn OutboundSender>,
            QueueConfig::default(),
        );

        encoder.close().await;
        encoder.close().await;

        assert_eq!(sender.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn messages_after_close_are_dropped() {
        let sender = Arc::new(RecordingSender::default());
        let encoder = EncoderQueue::new(
            Arc::clone(&sender) as Arc<dyn OutboundSender>,
            QueueConfig::default(),
        );

        encoder.close().await;
        encoder
            .encode_and_send(Message::event("mac:ffffff112233", "event:late", Vec::new()))
            .await;

        assert!(sender.frames.lock().await.is_empty());
    }
}
