//! Error types for the WRP agent
//!
//! This module contains all error types used throughout the crate: transport
//! errors raised while dialing or driving the WebSocket, codec errors from the
//! WRP MessagePack envelope, registry errors from handler lookup, and the main
//! [`AgentError`] type that unifies them for the public API.

use serde::Deserialize;

// ----------------------------------------------------------------------------
// Handshake HTTP Errors
// ----------------------------------------------------------------------------

/// Status returned by the cluster when the device is already connected
/// elsewhere.
pub const STATUS_DEVICE_DISCONNECTED: u16 = 523;
/// Status returned by the cluster when the device timed out server-side.
pub const STATUS_DEVICE_TIMEOUT: u16 = 524;

/// Body shape the cluster uses for handshake rejections.
#[derive(Debug, Default, Deserialize)]
struct HandshakeRejection {
    #[serde(default)]
    code: u16,
    #[serde(default)]
    body: String,
}

/// An HTTP-level rejection of the WebSocket upgrade.
///
/// Carries the status code and message body the cluster answered with, so
/// callers can branch on device-busy versus transaction-closed conditions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("handshake rejected with {code}: {body}")]
pub struct HttpHandshakeError {
    pub code: u16,
    pub body: String,
}

impl HttpHandshakeError {
    /// Map a handshake rejection from its status code and raw body bytes.
    ///
    /// The cluster usually answers with a JSON `{code, body}` object; when the
    /// body is empty the message is filled in from the status code.
    pub fn from_response(status: u16, body: &[u8]) -> Self {
        let parsed: HandshakeRejection = serde_json::from_slice(body).unwrap_or_default();
        let code = if parsed.code != 0 { parsed.code } else { status };
        let body = if parsed.body.is_empty() {
            match code {
                STATUS_DEVICE_DISCONNECTED => "ErrorDeviceBusy".to_string(),
                STATUS_DEVICE_TIMEOUT => {
                    "ErrorTransactionsClosed/ErrorTransactionsAlreadyClosed/ErrorDeviceClosed"
                        .to_string()
                }
                other => tokio_tungstenite::tungstenite::http::StatusCode::from_u16(other)
                    .ok()
                    .and_then(|s| s.canonical_reason())
                    .unwrap_or("")
                    .to_string(),
            }
        } else {
            parsed.body
        };
        Self { code, body }
    }
}

// ----------------------------------------------------------------------------
// Specific Error Types
// ----------------------------------------------------------------------------

/// Transport error types
///
/// Everything in here carries its detail as owned strings so the close path
/// can hand the same value to every concurrent caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open connection to {url}: {reason}")]
    Handshake { url: String, reason: String },
    #[error(transparent)]
    Http(#[from] HttpHandshakeError),
    #[error("failed to read from socket: {reason}")]
    Read { reason: String },
    #[error("failed to write to socket: {reason}")]
    Write { reason: String },
    #[error("failed to close connection: {reason}")]
    Close { reason: String },
    #[error("write missed its {duration_ms}ms deadline")]
    WriteTimeout { duration_ms: u64 },
}

/// WRP codec error types
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Handler registry error types
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("no downstream handler found for provided destination")]
    NoDownstreamHandler,
    #[error("failed to compile regular expression [{pattern}]: {source}")]
    BadPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },
}

/// Device identifier validation error types
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeviceIdError {
    #[error("device id [{id}] is missing a scheme prefix")]
    MissingScheme { id: String },
    #[error("device id scheme [{scheme}] is not one of mac, uuid, dns, serial")]
    UnsupportedScheme { scheme: String },
    #[error("mac device id [{id}] must be 12 hexadecimal digits")]
    InvalidMac { id: String },
}

// ----------------------------------------------------------------------------
// Crate Error
// ----------------------------------------------------------------------------

/// Core error type for the WRP agent
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The ping miss hook is required; without it connection loss would go
    /// unnoticed.
    #[error("a handle_ping_miss hook is required")]
    MissingPingMissHook,

    #[error("invalid device identifier: {0}")]
    Device(#[from] DeviceIdError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// Configuration error
    #[error("configuration error: {reason}")]
    Configuration { reason: String },
}

impl AgentError {
    /// Create a configuration error with a reason
    pub fn config<T: Into<String>>(reason: T) -> Self {
        AgentError::Configuration {
            reason: reason.into(),
        }
    }
}

pub type Result<T> = core::result::Result<T, AgentError>;
