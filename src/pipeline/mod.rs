//! The asynchronous message pipeline
//!
//! Five bounded, worker-pooled stages connect the socket to user handlers:
//!
//! ```text
//! outbound:  send(msg) → EncoderQueue → SenderQueue → socket
//! inbound:   socket → reader → DecoderQueue → RegistryQueue → DownstreamQueue → handler
//! ```
//!
//! Each stage owns a bounded ingress and a fixed worker pool; a full stage
//! makes its producers wait, so pressure propagates back to the socket reader
//! and ultimately to TCP flow control. Stages close in dependency order and a
//! stage's close returns only after everything it accepted has drained.

use async_trait::async_trait;

use crate::wrp::Message;

pub(crate) mod stage;

pub mod decoder;
pub mod downstream;
pub mod encoder;
pub mod routing;
pub mod sender;

pub use decoder::{DecoderQueue, DecoderSender};
pub use downstream::{DownstreamQueue, DownstreamSender};
pub use encoder::{EncoderQueue, EncoderSender};
pub use routing::{RegistryDispatch, RegistryQueue};
pub use sender::{OutboundSender, SenderQueue};

/// The bridge from the inbound stages back into the outbound path: handler
/// replies and synthesized error replies are fed through this seam.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_message(&self, message: Message);
}
