//! Device-side WRP agent
//!
//! This crate keeps a device connected to a cloud-side message cluster over a
//! persistent WebSocket and routes WRP (Web Routing Protocol) messages in
//! both directions through a bounded, worker-pooled pipeline.
//!
//! ## Architecture
//!
//! ```text
//!                       ┌──────── send(msg) ───────────┐
//!                       ▼                              │
//!   [EncoderQueue] → [SenderQueue] → socket            │ (response path)
//!                                                      │
//!   socket → [reader task] → [DecoderQueue]            │
//!                                   │                  │
//!                                   ▼                  │
//!                            [RegistryQueue]           │
//!                                   │                  │
//!                                   ▼                  │
//!                           [DownstreamQueue] ─────────┘
//!                                   │
//!                                   ▼
//!                           user handler(msg) → optional reply
//! ```
//!
//! Every stage is a bounded queue drained by a fixed worker pool, so a slow
//! consumer makes its producers wait instead of growing memory; when the
//! whole inbound path is saturated the reader stops pulling frames and TCP
//! flow control takes over. A ping watchdog tracks protocol-level liveness
//! and hands misses to a user policy hook. Shutdown drains the stages in
//! dependency order without losing accepted messages.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use wrp_agent::{
//!     Client, ClientConfig, DownstreamHandler, HandlerConfig, Message, QueueConfig,
//! };
//!
//! struct EchoHandler;
//!
//! #[async_trait::async_trait]
//! impl DownstreamHandler for EchoHandler {
//!     async fn handle_message(&self, message: Message) -> Option<Message> {
//!         println!("got a message for {}", message.destination);
//!         None
//!     }
//!
//!     async fn close(&self) {}
//! }
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = ClientConfig::new(
//!     "mac:ffffff112233",
//!     "https://fabric.example.com:8080/api/v2/device",
//! );
//! config.wrp_decoder_queue = QueueConfig::new(5, 100);
//! config.handlers.push(HandlerConfig {
//!     pattern: "/echo".to_string(),
//!     handler: Arc::new(EchoHandler),
//! });
//! config.handle_ping_miss = Some(Box::new(|| {
//!     println!("missed a ping");
//!     Ok(())
//! }));
//!
//! let client = Client::connect(config).await?;
//! client
//!     .send(Message::event(
//!         "mac:ffffff112233/emu",
//!         "event:device-status/up",
//!         b"online".to_vec(),
//!     ))
//!     .await;
//! client.close().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod errors;
pub mod ping;
pub mod pipeline;
pub mod registry;
pub mod wrp;

pub use client::Client;
pub use config::{ClientConfig, PingConfig, QueueConfig};
pub use connection::{Frame, FrameConnection, WsConnection};
pub use errors::{
    AgentError, CodecError, DeviceIdError, HttpHandshakeError, RegistryError, Result,
    TransportError,
};
pub use ping::HandlePingMiss;
pub use registry::{DownstreamHandler, HandlerConfig, HandlerRegistry};
pub use wrp::{DeviceId, Message, MessageType};
