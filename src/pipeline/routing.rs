//! Routing stage
//!
//! Consumes decoded messages and resolves each one against the handler
//! registry. Matches go on to the downstream dispatch stage; a message no
//! handler claims is answered with a synthesized 503 reply pushed straight
//! back into the outbound path, so the far side learns the destination is
//! unserviced instead of waiting on silence.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::config::QueueConfig;
use crate::pipeline::downstream::DownstreamSender;
use crate::pipeline::stage::{spawn_dispatcher, StageCore};
use crate::pipeline::MessageSink;
use crate::registry::HandlerRegistry;
use crate::wrp::{self, DeviceId, Message};

const STATUS_SERVICE_UNAVAILABLE: i64 = 503;

/// A way to route a decoded message to the correct handler.
#[async_trait]
pub trait RegistryDispatch: Send + Sync {
    async fn get_handler_then_send(&self, message: Message);
    async fn close(&self);
}

/// Resolves handlers for queued messages and forwards them downstream.
#[derive(Clone)]
pub struct RegistryQueue {
    core: Arc<StageCore<Message>>,
    registry: HandlerRegistry,
    downstream: Arc<dyn DownstreamSender>,
}

struct RouteContext {
    registry: HandlerRegistry,
    downstream: Arc<dyn DownstreamSender>,
    sink: Arc<dyn MessageSink>,
    device_id: DeviceId,
}

impl RegistryQueue {
    pub fn new(
        sink: Arc<dyn MessageSink>,
        registry: HandlerRegistry,
        downstream: Arc<dyn DownstreamSender>,
        config: QueueConfig,
        device_id: DeviceId,
    ) -> Self {
        let config = config.clamped();
        let (tx, rx) = mpsc::channel(config.size);
        let context = Arc::new(RouteContext {
            registry: registry.clone(),
            downstream: Arc::clone(&downstream),
            sink,
            device_id,
        });
        let dispatcher = spawn_dispatcher(rx, config.max_workers, move |message: Message| {
            let context = Arc::clone(&context);
            async move { route_one(context, message).await }
        });
        Self {
            core: Arc::new(StageCore::new("registry queue", tx, dispatcher)),
            registry,
            downstream,
        }
    }
}

async fn route_one(context: Arc<RouteContext>, message: Message) {
    debug!("getting handler...");
    match context.registry.get_handler(&message.destination).await {
        Ok(handler) => {
            context.downstream.send(handler, message).await;
            debug!("sent message to handler");
        }
        Err(e) => {
            error!(error = %e, destination = %message.destination, "failed to get handler");
            let response = wrp::error_response(
                message.transaction_uuid.clone(),
                &message.source,
                &context.device_id,
                STATUS_SERVICE_UNAVAILABLE,
                &format!("unable to get handler: {e}"),
            );
            context.sink.send_message(response).await;
        }
    }
}

#[async_trait]
impl RegistryDispatch for RegistryQueue {
    async fn get_handler_then_send(&self, message: Message) {
        self.core.enqueue(message).await;
    }

    async fn close(&self) {
        let registry = self.registry.clone();
        let downstream = Arc::clone(&self.downstream);
        self.core
            .close_with(async move {
                registry.close().await;
                downstream.close().await;
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::sync::Mutex;

    use super::*;
    use crate::registry::{DownstreamHandler, HandlerConfig};
    use crate::wrp::MessageType;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl MessageSink for RecordingSink {
        async fn send_message(&self, message: Message) {
            self.sent.lock().await.push(message);
        }
    }

    #[derive(Default)]
    struct RecordingDownstream {
        dispatched: Mutex<Vec<Message>>,
        closed: AtomicUsize,
    }

    #[async_trait]
    impl DownstreamSender for RecordingDownstream {
        async fn send(&self, _handler: Arc<dyn DownstreamHandler>, message: Message) {
            self.dispatched.lock().await.push(message);
        }

        async fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct NoopHandler;

    #[async_trait]
    impl DownstreamHandler for NoopHandler {
        async fn handle_message(&self, _message: Message) -> Option<Message> {
            None
        }

        async fn close(&self) {}
    }

    fn queue_parts(
        patterns: &[&str],
    ) -> (RegistryQueue, Arc<RecordingSink>, Arc<RecordingDownstream>) {
        let configs = patterns
            .iter()
            .map(|pattern| HandlerConfig {
                pattern: (*pattern).to_string(),
                handler: Arc::new(NoopHandler),
            })
            .collect();
        let (registry, errors) = HandlerRegistry::new(configs);
        assert!(errors.is_empty());

        let sink = Arc::new(RecordingSink::default());
        let downstream = Arc::new(RecordingDownstream::default());
        let queue = RegistryQueue::new(
            Arc::clone(&sink) as Arc<dyn MessageSink>,
            registry,
            Arc::clone(&downstream) as Arc<dyn DownstreamSender>,
            QueueConfig::default(),
            DeviceId::parse("mac:ffffff112233").expect("device id should parse"),
        );
        (queue, sink, downstream)
    }

    fn inbound(destination: &str) -> Message {
        Message {
            msg_type: MessageType::SimpleRequestResponse,
            source: "mac:AAA".to_string(),
            destination: destination.to_string(),
            transaction_uuid: Some("T1".to_string()),
            ..Message::default()
        }
    }

    #[tokio::test]
    async fn a_matching_destination_goes_downstream() {
        let (queue, sink, downstream) = queue_parts(&["/bar"]);

        queue.get_handler_then_send(inbound("/bar")).await;
        queue.close().await;

        assert_eq!(downstream.dispatched.lock().await.len(), 1);
        assert!(sink.sent.lock().await.is_empty());
    }

    #[tokio::test]
    async fn an_unmatched_destination_yields_exactly_one_503_reply() {
        let (queue, sink, downstream) = queue_parts(&["/foo"]);

        queue.get_handler_then_send(inbound("/bar")).await;
        queue.close().await;

        assert!(downstream.dispatched.lock().await.is_empty());
        let sent = sink.sent.lock().await;
        assert_eq!(sent.len(), 1);
        let reply = &sent[0];
        assert_eq!(reply.status, Some(503));
        assert_eq!(reply.destination, "mac:AAA");
        assert_eq!(reply.source, "mac:ffffff112233");
        assert_eq!(reply.transaction_uuid.as_deref(), Some("T1"));
        let body: serde_json::Value =
            serde_json::from_slice(&reply.payload).expect("payload should be json");
        let reason = body
            .get("err")
            .and_then(|v| v.as_str())
            .expect("err field should be present");
        assert!(reason.contains("unable to get handler"));
    }

    #[tokio::test]
    async fn close_propagates_to_registry_and_downstream_once() {
        let (queue, _sink, downstream) = queue_parts(&["/foo"]);

        queue.close().await;
        queue.close().await;

        assert_eq!(downstream.closed.load(Ordering::SeqCst), 1);
    }
}
