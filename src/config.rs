//! Client configuration
//!
//! [`ClientConfig`] is everything a caller provides to stand up an agent: the
//! device identity advertised during the upgrade handshake, per-stage queue
//! sizing, the initial handler set, and the ping watchdog policy.

use std::time::Duration;

use crate::ping::HandlePingMiss;
use crate::registry::HandlerConfig;

/// Default interval the watchdog waits between server pings.
pub const DEFAULT_PING_WAIT: Duration = Duration::from_secs(60);

const MIN_WORKERS: usize = 1;
const MIN_QUEUE_SIZE: usize = 1;
const MIN_PING_MISS: u32 = 1;

/// The configuration to provide when making a new client.
pub struct ClientConfig {
    pub device_name: String,
    pub firmware_name: String,
    pub model_name: String,
    pub manufacturer: String,
    pub destination_url: String,
    /// Sizing for the stage that writes raw frames to the socket.
    pub outbound_queue: QueueConfig,
    /// Sizing for the stage that encodes outbound messages.
    pub wrp_encoder_queue: QueueConfig,
    /// Sizing for the stage that decodes inbound frames.
    pub wrp_decoder_queue: QueueConfig,
    /// Sizing for the stage that resolves handlers for inbound messages.
    pub handler_registry_queue: QueueConfig,
    /// Sizing for the stage that runs user handlers.
    pub handle_msg_queue: QueueConfig,
    /// Handlers registered before the first frame arrives.
    pub handlers: Vec<HandlerConfig>,
    /// Called on every missed ping. Required.
    pub handle_ping_miss: Option<HandlePingMiss>,
    pub ping_config: PingConfig,
}

impl ClientConfig {
    /// Start a configuration from the device identity; queues fall back to
    /// single-worker, single-slot defaults until overridden.
    pub fn new<S: Into<String>>(device_name: S, destination_url: S) -> Self {
        Self {
            device_name: device_name.into(),
            firmware_name: String::new(),
            model_name: String::new(),
            manufacturer: String::new(),
            destination_url: destination_url.into(),
            outbound_queue: QueueConfig::default(),
            wrp_encoder_queue: QueueConfig::default(),
            wrp_decoder_queue: QueueConfig::default(),
            handler_registry_queue: QueueConfig::default(),
            handle_msg_queue: QueueConfig::default(),
            handlers: Vec::new(),
            handle_ping_miss: None,
            ping_config: PingConfig::default(),
        }
    }
}

/// Sizing for one pipeline stage: how many worker tasks may run at once and
/// how many items the ingress buffers before enqueuers wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub max_workers: usize,
    pub size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: MIN_WORKERS,
            size: MIN_QUEUE_SIZE,
        }
    }
}

impl QueueConfig {
    pub fn new(max_workers: usize, size: usize) -> Self {
        Self { max_workers, size }
    }

    /// Both knobs floor at 1; a zero-size ingress or zero-worker pool would
    /// wedge the stage.
    pub(crate) fn clamped(self) -> Self {
        Self {
            max_workers: self.max_workers.max(MIN_WORKERS),
            size: self.size.max(MIN_QUEUE_SIZE),
        }
    }
}

/// Watchdog policy: how long to wait between server pings and how many
/// consecutive misses to tolerate before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingConfig {
    pub ping_wait: Duration,
    pub max_ping_miss: u32,
}

impl Default for PingConfig {
    fn default() -> Self {
        Self {
            ping_wait: DEFAULT_PING_WAIT,
            max_ping_miss: MIN_PING_MISS,
        }
    }
}

impl PingConfig {
    /// A zero wait falls back to one minute, a zero tolerance to one miss.
    pub(crate) fn clamped(self) -> Self {
        Self {
            ping_wait: if self.ping_wait.is_zero() {
                DEFAULT_PING_WAIT
            } else {
                self.ping_wait
            },
            max_ping_miss: self.max_ping_miss.max(MIN_PING_MISS),
        }
    }
}
