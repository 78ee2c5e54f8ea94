//! Client orchestrator
//!
//! Assembles the pipeline bottom-up over a connected frame channel, launches
//! the reader and watchdog tasks, and owns the shutdown protocol. The client
//! is the only component that knows the full stage graph; every stage sees
//! nothing beyond its immediate downstream.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::connection::{self, ClientHeader, Frame, FrameConnection};
use crate::errors::{AgentError, TransportError};
use crate::pipeline::{
    DecoderQueue, DecoderSender, DownstreamQueue, DownstreamSender, EncoderQueue, EncoderSender,
    MessageSink, OutboundSender, RegistryDispatch, RegistryQueue, SenderQueue,
};
use crate::ping;
use crate::registry::HandlerRegistry;
use crate::wrp::{DeviceId, Message};

/// Time allowed to write a control frame to the peer.
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// A connected device agent.
///
/// Created with [`Client::connect`]; dropped or closed with [`Client::close`].
/// All methods take `&self`, so the client is typically shared behind an
/// [`Arc`] between the owner and the ping-miss policy.
pub struct Client {
    device_id: DeviceId,
    hostname: String,
    registry: HandlerRegistry,
    encoder: EncoderQueue,
    decoder: DecoderQueue,
    connection: Arc<dyn FrameConnection>,
    cancel: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    close_result: OnceCell<Result<(), TransportError>>,
}

impl Client {
    /// Dial the destination, perform the upgrade handshake, and start the
    /// pipeline.
    pub async fn connect(config: ClientConfig) -> Result<Self, AgentError> {
        if config.handle_ping_miss.is_none() {
            return Err(AgentError::MissingPingMissHook);
        }
        let header = ClientHeader {
            device_name: config.device_name.clone(),
            firmware_name: config.firmware_name.clone(),
            model_name: config.model_name.clone(),
            manufacturer: config.manufacturer.clone(),
        };
        let (connection, ws_url) = connection::connect(&header, &config.destination_url).await?;
        let hostname = connection::host_from_url(&ws_url);
        Self::start(Arc::new(connection), hostname, config)
    }

    /// Start the pipeline over an already-connected frame channel.
    ///
    /// This is the seam the handshake feeds into, and the entry point for
    /// driving the client over a mock connection.
    pub fn start(
        connection: Arc<dyn FrameConnection>,
        hostname: String,
        config: ClientConfig,
    ) -> Result<Self, AgentError> {
        let handle_ping_miss = config
            .handle_ping_miss
            .ok_or(AgentError::MissingPingMissHook)?;
        let device_id = DeviceId::parse(&config.device_name)?;
        let ping_config = config.ping_config.clamped();

        // Outbound path, sink first.
        let sender = SenderQueue::new(Arc::clone(&connection), config.outbound_queue);
        let encoder = EncoderQueue::new(
            Arc::new(sender) as Arc<dyn OutboundSender>,
            config.wrp_encoder_queue,
        );

        let (registry, registry_errors) = HandlerRegistry::new(config.handlers);
        for e in registry_errors {
            warn!(error = %e, "failed to initialize handler for registry");
        }

        // Inbound path; handler replies and error replies loop back through
        // the encoder.
        let sink = Arc::new(encoder.clone()) as Arc<dyn MessageSink>;
        let downstream = DownstreamQueue::new(Arc::clone(&sink), config.handle_msg_queue);
        let routing = RegistryQueue::new(
            sink,
            registry.clone(),
            Arc::new(downstream) as Arc<dyn DownstreamSender>,
            config.handler_registry_queue,
            device_id.clone(),
        );
        let decoder = DecoderQueue::new(
            Arc::new(routing) as Arc<dyn RegistryDispatch>,
            config.wrp_decoder_queue,
        );

        let cancel = CancellationToken::new();
        let (pinged_tx, pinged_rx) = mpsc::channel(1);

        let watchdog = tokio::spawn(ping::watch_pings(
            pinged_rx,
            ping_config,
            handle_ping_miss,
            cancel.clone(),
        ));
        let reader = tokio::spawn(run_reader(
            Arc::clone(&connection),
            decoder.clone(),
            pinged_tx,
            cancel.clone(),
        ));

        Ok(Self {
            device_id,
            hostname,
            registry,
            encoder,
            decoder,
            connection,
            cancel,
            reader: Mutex::new(Some(reader)),
            watchdog: Mutex::new(Some(watchdog)),
            close_result: OnceCell::new(),
        })
    }

    /// The resolved host this client is connected to, without scheme or port.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The device identifier this client advertises.
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    /// The live handler registry; additions and removals take effect for the
    /// next inbound message.
    pub fn handler_registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// Queue a message for delivery upstream.
    ///
    /// Fire-and-forget: encode or write failures are logged, not returned.
    /// When the outbound queues are full this waits for capacity, which is
    /// how senders experience backpressure.
    pub async fn send(&self, message: Message) {
        debug!("sending message...");
        self.encoder.encode_and_send(message).await;
    }

    /// Shut the client down, draining the pipeline in dependency order.
    ///
    /// Idempotent: the first caller performs the shutdown and every caller
    /// (concurrent or later) observes the same result. Returns the error from
    /// closing the underlying connection, if any.
    pub async fn close(&self) -> Result<(), AgentError> {
        let result = self
            .close_result
            .get_or_init(|| async {
                info!("closing client...");
                self.cancel.cancel();

                if let Some(watchdog) = self.watchdog.lock().await.take() {
                    if let Err(e) = watchdog.await {
                        warn!(error = %e, "watchdog task failed");
                    }
                }
                if let Some(reader) = self.reader.lock().await.take() {
                    if let Err(e) = reader.await {
                        warn!(error = %e, "reader task failed");
                    }
                }

                // Drain inbound before outbound: error replies synthesized
                // while the inbound side drains still need a live encoder.
                self.decoder.close().await;
                self.encoder.close().await;

                let result = self.connection.close().await;
                info!("client closed");
                result
            })
            .await;
        result.clone().map_err(AgentError::from)
    }
}

/// Watch the socket: data frames feed the decoder, pings feed the watchdog
/// and are answered with pongs.
///
/// Exits on cancellation, on a server close frame, or on the first read
/// error: a failed read means the connection is gone, and reconnecting is
/// the caller's policy, not this task's.
async fn run_reader(
    connection: Arc<dyn FrameConnection>,
    decoder: DecoderQueue,
    pinged: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
) {
    info!("watching socket for messages");
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("stopped reading from socket");
                return;
            }
            frame = connection.read_frame() => match frame {
                Ok(Frame::Binary(bytes)) => {
                    debug!("reading message...");
                    decoder.decode_and_send(bytes).await;
                    debug!("message sent to be decoded");
                }
                Ok(Frame::Ping(payload)) => {
                    debug!("received ping");
                    // The watchdog only needs to see that a ping arrived; if
                    // one delivery is still pending, dropping this one loses
                    // nothing.
                    let _ = pinged.try_send(payload.clone());
                    if let Err(e) = connection.write_pong(payload, WRITE_WAIT).await {
                        warn!(error = %e, "failed to answer ping");
                    }
                }
                Ok(Frame::Close(code)) => {
                    info!(?code, "server closed the connection");
                    return;
                }
                Err(e) => {
                    error!(error = %e, "failed to read message");
                    return;
                }
            }
        }
    }
}
