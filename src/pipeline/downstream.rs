//! Downstream dispatch stage
//!
//! The last inbound stage: runs the user handler for each routed message.
//! When a handler returns a reply, the reply is fed into the outbound path
//! through the injected sink. Handlers run on worker tasks with no timeout
//! around them.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::config::QueueConfig;
use crate::pipeline::stage::{spawn_dispatcher, StageCore};
use crate::pipeline::MessageSink;
use crate::registry::DownstreamHandler;
use crate::wrp::Message;

/// Sends messages to handlers downstream.
#[async_trait]
pub trait DownstreamSender: Send + Sync {
    async fn send(&self, handler: Arc<dyn DownstreamHandler>, message: Message);
    async fn close(&self);
}

/// The handler and the message it should receive.
struct SendInfo {
    handler: Arc<dyn DownstreamHandler>,
    message: Message,
}

/// Runs user handlers on queued `{handler, message}` pairs.
#[derive(Clone)]
pub struct DownstreamQueue {
    core: Arc<StageCore<SendInfo>>,
}

impl DownstreamQueue {
    pub fn new(sink: Arc<dyn MessageSink>, config: QueueConfig) -> Self {
        let config = config.clamped();
        let (tx, rx) = mpsc::channel(config.size);
        let dispatcher = spawn_dispatcher(rx, config.max_workers, move |info: SendInfo| {
            let sink = Arc::clone(&sink);
            async move { dispatch_one(sink, info).await }
        });
        Self {
            core: Arc::new(StageCore::new("downstream queue", tx, dispatcher)),
        }
    }
}

async fn dispatch_one(sink: Arc<dyn MessageSink>, info: SendInfo) {
    debug!("sending message downstream...");
    if let Some(response) = info.handler.handle_message(info.message).await {
        debug!("downstream handler returned a response");
        sink.send_message(response).await;
        return;
    }
    debug!("downstream message handled");
}

#[async_trait]
impl DownstreamSender for DownstreamQueue {
    async fn send(&self, handler: Arc<dyn DownstreamHandler>, message: Message) {
        self.core.enqueue(SendInfo { handler, message }).await;
    }

    async fn close(&self) {
        self.core.close_with(async {}).await;
    }
}
