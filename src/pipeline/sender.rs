//! Sender stage
//!
//! The sink of the pipeline: consumes encoded frames and writes each as one
//! WebSocket binary frame. At most `max_workers` writes are in flight at any
//! instant. A failed write drops that frame and nothing else; connection
//! health is the reader task's call, not this stage's.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::QueueConfig;
use crate::connection::FrameConnection;
use crate::pipeline::stage::{spawn_dispatcher, StageCore};

/// A way to send raw frames upstream.
#[async_trait]
pub trait OutboundSender: Send + Sync {
    async fn send(&self, frame: Vec<u8>);
    async fn close(&self);
}

/// Writes queued frames to the shared connection.
#[derive(Clone)]
pub struct SenderQueue {
    core: Arc<StageCore<Vec<u8>>>,
}

impl SenderQueue {
    pub fn new(connection: Arc<dyn FrameConnection>, config: QueueConfig) -> Self {
        let config = config.clamped();
        let (tx, rx) = mpsc::channel(config.size);
        let dispatcher = spawn_dispatcher(rx, config.max_workers, move |frame: Vec<u8>| {
            let connection = Arc::clone(&connection);
            async move { write_frame(connection, frame).await }
        });
        Self {
            core: Arc::new(StageCore::new("sender queue", tx, dispatcher)),
        }
    }
}

async fn write_frame(connection: Arc<dyn FrameConnection>, frame: Vec<u8>) {
    debug!("sending message...");
    if let Err(e) = connection.write_binary(frame).await {
        error!(error = %e, "failed to send message");
        return;
    }
    debug!("message sent");
}

#[async_trait]
impl OutboundSender for SenderQueue {
    async fn send(&self, frame: Vec<u8>) {
        self.core.enqueue(frame).await;
    }

    async fn close(&self) {
        self.core.close_with(async {}).await;
    }
}
