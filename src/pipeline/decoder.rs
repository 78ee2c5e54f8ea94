//! Decoder stage
//!
//! The first inbound stage: consumes raw frames off the socket reader and
//! decodes each into a typed message before handing it to the routing stage.
//! A malformed frame is logged and discarded; one bad frame must never take
//! the pipeline down.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::QueueConfig;
use crate::pipeline::routing::RegistryDispatch;
use crate::pipeline::stage::{spawn_dispatcher, StageCore};
use crate::wrp::Message;

/// Anything that decodes a message from bytes and sends it downstream.
#[async_trait]
pub trait DecoderSender: Send + Sync {
    async fn decode_and_send(&self, frame: Vec<u8>);
    async fn close(&self);
}

/// Decodes queued frames and feeds the messages to the routing stage.
#[derive(Clone)]
pub struct DecoderQueue {
    core: Arc<StageCore<Vec<u8>>>,
    dispatch: Arc<dyn RegistryDispatch>,
}

impl DecoderQueue {
    pub fn new(dispatch: Arc<dyn RegistryDispatch>, config: QueueConfig) -> Self {
        let config = config.clamped();
        let (tx, rx) = mpsc::channel(config.size);
        let route = Arc::clone(&dispatch);
        let dispatcher = spawn_dispatcher(rx, config.max_workers, move |frame: Vec<u8>| {
            let route = Arc::clone(&route);
            async move { decode_one(route, frame).await }
        });
        Self {
            core: Arc::new(StageCore::new("decoder queue", tx, dispatcher)),
            dispatch,
        }
    }
}

async fn decode_one(dispatch: Arc<dyn RegistryDispatch>, frame: Vec<u8>) {
    debug!("decoding message...");
    match Message::from_msgpack(&frame) {
        Ok(message) => {
            debug!("message decoded");
            dispatch.get_handler_then_send(message).await;
        }
        Err(e) => {
            error!(error = %e, "failed to decode message into wrp");
        }
    }
}

#[async_trait]
impl DecoderSender for DecoderQueue {
    async fn decode_and_send(&self, frame: Vec<u8>) {
        self.core.enqueue(frame).await;
    }

    async fn close(&self) {
        let dispatch = Arc::clone(&self.dispatch);
        self.core
            .close_with(async move { dispatch.close().await })
            .await;
    }
}
