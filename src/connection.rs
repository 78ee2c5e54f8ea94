//! WebSocket connection and upgrade handshake
//!
//! The pipeline only ever sees [`FrameConnection`], an object-safe view of a
//! connected duplex frame channel; tests drive the whole client with scripted
//! mocks behind the same trait. [`WsConnection`] is the production
//! implementation on top of `tokio-tungstenite`.
//!
//! The split tungstenite sink does not serialize concurrent writers, so all
//! writes (data and control alike) go through one async mutex. Sender
//! workers and pong replies share the same write path and never interleave at
//! the frame level.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, LOCATION, USER_AGENT};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use crate::errors::{AgentError, HttpHandshakeError, TransportError};
use crate::wrp::DeviceId;

/// Upgrade attempts follow redirects; past this many something is wrong.
const MAX_REDIRECTS: usize = 10;

/// One frame as the pipeline sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A binary data frame carrying an encoded message.
    Binary(Vec<u8>),
    /// A protocol ping with its application payload.
    Ping(Vec<u8>),
    /// The peer closed the connection, with the close code if it sent one.
    Close(Option<u16>),
}

/// A connected duplex frame channel.
///
/// `read_frame` is intended for a single reader task; writes may come from
/// many tasks concurrently and implementations must serialize them.
#[async_trait]
pub trait FrameConnection: Send + Sync {
    /// Write one binary data frame.
    async fn write_binary(&self, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Write a pong control frame carrying `payload`, giving up after
    /// `deadline`.
    async fn write_pong(&self, payload: Vec<u8>, deadline: Duration)
        -> Result<(), TransportError>;

    /// Read the next frame of interest (binary, ping, or close).
    async fn read_frame(&self) -> Result<Frame, TransportError>;

    /// Close the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

// ----------------------------------------------------------------------------
// Tungstenite-backed Connection
// ----------------------------------------------------------------------------

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// The production [`FrameConnection`] over a tungstenite WebSocket.
pub struct WsConnection {
    writer: Mutex<SplitSink<WsStream, WsMessage>>,
    reader: Mutex<SplitStream<WsStream>>,
}

impl WsConnection {
    pub fn new(stream: WsStream) -> Self {
        let (writer, reader) = stream.split();
        Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
        }
    }
}

#[async_trait]
impl FrameConnection for WsConnection {
    async fn write_binary(&self, frame: Vec<u8>) -> Result<(), TransportError> {
        self.writer
            .lock()
            .await
            .send(WsMessage::Binary(frame))
            .await
            .map_err(|e| TransportError::Write {
                reason: e.to_string(),
            })
    }

    async fn write_pong(
        &self,
        payload: Vec<u8>,
        deadline: Duration,
    ) -> Result<(), TransportError> {
        let write = async {
            self.writer
                .lock()
                .await
                .send(WsMessage::Pong(payload))
                .await
                .map_err(|e| TransportError::Write {
                    reason: e.to_string(),
                })
        };
        match tokio::time::timeout(deadline, write).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::WriteTimeout {
                duration_ms: deadline.as_millis() as u64,
            }),
        }
    }

    async fn read_frame(&self) -> Result<Frame, TransportError> {
        let mut reader = self.reader.lock().await;
        loop {
            match reader.next().await {
                Some(Ok(WsMessage::Binary(bytes))) => return Ok(Frame::Binary(bytes)),
                Some(Ok(WsMessage::Ping(payload))) => return Ok(Frame::Ping(payload)),
                Some(Ok(WsMessage::Close(frame))) => {
                    return Ok(Frame::Close(frame.map(|f| f.code.into())))
                }
                Some(Ok(other)) => {
                    // Text and pong frames are not part of the protocol here.
                    debug!(kind = ?other, "ignoring unexpected frame");
                }
                Some(Err(e)) => {
                    return Err(TransportError::Read {
                        reason: e.to_string(),
                    })
                }
                None => {
                    return Err(TransportError::Read {
                        reason: "socket stream ended".to_string(),
                    })
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.writer
            .lock()
            .await
            .close()
            .await
            .map_err(|e| TransportError::Close {
                reason: e.to_string(),
            })
    }
}

// ----------------------------------------------------------------------------
// Upgrade Handshake
// ----------------------------------------------------------------------------

/// Immutable device identity advertised during the upgrade handshake.
pub struct ClientHeader {
    pub device_name: String,
    pub firmware_name: String,
    pub model_name: String,
    pub manufacturer: String,
}

impl ClientHeader {
    pub(crate) fn user_agent(&self) -> String {
        format!(
            "WebPA-1.6({};{}/{};)",
            self.firmware_name, self.model_name, self.manufacturer
        )
    }
}

/// Dial the cluster and perform the upgrade handshake.
///
/// The destination URL's `http` scheme is rewritten to `ws`, the device
/// identity travels in `X-Webpa-*` headers, and temporary redirects are
/// followed. Returns the open connection together with the URL that finally
/// accepted the upgrade.
pub async fn connect(
    header: &ClientHeader,
    destination_url: &str,
) -> Result<(WsConnection, String), AgentError> {
    DeviceId::parse(&header.device_name)?;

    let mut ws_url = destination_url.replacen("http", "ws", 1);

    for _ in 0..MAX_REDIRECTS {
        let request = build_upgrade_request(header, &ws_url)?;
        match connect_async(request).await {
            Ok((stream, _response)) => {
                debug!(url = %ws_url, "websocket connection established");
                return Ok((WsConnection::new(stream), ws_url));
            }
            Err(WsError::Http(response))
                if response.status() == StatusCode::TEMPORARY_REDIRECT =>
            {
                let location = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| {
                        TransportError::Handshake {
                            url: ws_url.clone(),
                            reason: "redirect response without a location header".to_string(),
                        }
                    })?;
                let next = location.replacen("http", "ws", 1);
                warn!(from = %ws_url, to = %next, "following handshake redirect");
                ws_url = next;
            }
            Err(WsError::Http(response)) => {
                let status = response.status().as_u16();
                let body = response.body().as_deref().unwrap_or_default();
                return Err(TransportError::Http(HttpHandshakeError::from_response(
                    status, body,
                ))
                .into());
            }
            Err(e) => {
                return Err(TransportError::Handshake {
                    url: ws_url,
                    reason: e.to_string(),
                }
                .into());
            }
        }
    }

    Err(TransportError::Handshake {
        url: ws_url,
        reason: format!("exceeded {MAX_REDIRECTS} handshake redirects"),
    }
    .into())
}

fn build_upgrade_request(
    header: &ClientHeader,
    ws_url: &str,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, AgentError> {
    let mut request = ws_url
        .into_client_request()
        .map_err(|e| TransportError::Handshake {
            url: ws_url.to_string(),
            reason: e.to_string(),
        })?;

    let headers = request.headers_mut();
    for (name, value) in [
        ("X-Webpa-Device-Name", &header.device_name),
        ("X-Webpa-Firmware-Name", &header.firmware_name),
        ("X-Webpa-Model-Name", &header.model_name),
        ("X-Webpa-Manufacturer", &header.manufacturer),
    ] {
        let value = HeaderValue::from_str(value).map_err(|_| {
            AgentError::config(format!("header {name} contains invalid characters"))
        })?;
        headers.insert(name, value);
    }
    let user_agent = HeaderValue::from_str(&header.user_agent())
        .map_err(|_| AgentError::config("user agent contains invalid characters"))?;
    headers.insert(USER_AGENT, user_agent);

    Ok(request)
}

/// The host portion of an accepted upgrade URL, without scheme or port.
pub(crate) fn host_from_url(ws_url: &str) -> String {
    let without_scheme = ws_url
        .strip_prefix("wss://")
        .or_else(|| ws_url.strip_prefix("ws://"))
        .unwrap_or(ws_url);
    let authority = without_scheme.split('/').next().unwrap_or(without_scheme);
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) => host.to_string(),
        _ => authority.to_string(),
    }
}
