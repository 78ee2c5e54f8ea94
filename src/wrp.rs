//! WRP message envelope
//!
//! The Web Routing Protocol envelope: a MessagePack-encoded record carrying a
//! destination, a source, a transaction id, an optional status, and an opaque
//! payload. Field names follow the wire protocol (`msg_type`, `dest`, ...),
//! and encoding uses named MessagePack maps so peers can evolve independently.
//!
//! The agent never rewrites a received message; the only message it authors
//! itself is the 503 reply produced when no handler matches a destination.

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

use crate::errors::{CodecError, DeviceIdError};

// ----------------------------------------------------------------------------
// Message Types
// ----------------------------------------------------------------------------

/// Integer-coded WRP message classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Auth = 2,
    SimpleRequestResponse = 3,
    SimpleEvent = 4,
    Create = 5,
    Retrieve = 6,
    Update = 7,
    Delete = 8,
    ServiceRegistration = 9,
    ServiceAlive = 10,
    Unknown = 11,
}

impl MessageType {
    pub fn from_code(code: i64) -> Self {
        match code {
            2 => MessageType::Auth,
            3 => MessageType::SimpleRequestResponse,
            4 => MessageType::SimpleEvent,
            5 => MessageType::Create,
            6 => MessageType::Retrieve,
            7 => MessageType::Update,
            8 => MessageType::Delete,
            9 => MessageType::ServiceRegistration,
            10 => MessageType::ServiceAlive,
            _ => MessageType::Unknown,
        }
    }

    pub fn code(self) -> i64 {
        self as i64
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(self.code())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = i64::deserialize(deserializer)?;
        Ok(MessageType::from_code(code))
    }
}

// ----------------------------------------------------------------------------
// Message
// ----------------------------------------------------------------------------

/// One WRP envelope.
///
/// Optional fields are omitted from the wire encoding when unset, matching
/// the named-map convention of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub msg_type: MessageType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(rename = "dest", default, skip_serializing_if = "String::is_empty")]
    pub destination: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction_uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accept: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partner_ids: Option<Vec<String>>,
    #[serde(default, with = "serde_bytes")]
    pub payload: Vec<u8>,
}

impl Message {
    /// A bare event message for the given destination.
    pub fn event<S: Into<String>>(source: S, destination: S, payload: Vec<u8>) -> Self {
        Self {
            msg_type: MessageType::SimpleEvent,
            source: source.into(),
            destination: destination.into(),
            payload,
            ..Self::default()
        }
    }

    /// Encode into the MessagePack wire form.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, CodecError> {
        Ok(rmp_serde::to_vec_named(self)?)
    }

    /// Decode from the MessagePack wire form.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}

impl Default for Message {
    fn default() -> Self {
        Self {
            msg_type: MessageType::Unknown,
            source: String::new(),
            destination: String::new(),
            transaction_uuid: None,
            content_type: None,
            accept: None,
            status: None,
            headers: None,
            metadata: None,
            partner_ids: None,
            payload: Vec::new(),
        }
    }
}

/// Build the reply sent upstream when an inbound message cannot be routed:
/// a request/response addressed back at the message's source, carrying the
/// reason as a small JSON body.
pub fn error_response(
    transaction_uuid: Option<String>,
    destination: &str,
    source: &DeviceId,
    status: i64,
    reason: &str,
) -> Message {
    Message {
        msg_type: MessageType::SimpleRequestResponse,
        source: source.to_string(),
        destination: destination.to_string(),
        transaction_uuid,
        content_type: Some("application/json".to_string()),
        status: Some(status),
        payload: serde_json::json!({ "err": reason }).to_string().into_bytes(),
        ..Message::default()
    }
}

// ----------------------------------------------------------------------------
// Device Identifiers
// ----------------------------------------------------------------------------

static MAC_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new("^[0-9a-f]{12}$").expect("mac id pattern is valid")
});

/// A canonical device identifier of the form `<scheme>:<id>`.
///
/// Supported schemes are `mac`, `uuid`, `dns`, and `serial`. Mac identifiers
/// are normalized: separators are stripped and the digits lowercased, and the
/// result must be exactly 12 hexadecimal digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn parse(raw: &str) -> Result<Self, DeviceIdError> {
        let Some((scheme, id)) = raw.split_once(':') else {
            return Err(DeviceIdError::MissingScheme { id: raw.to_string() });
        };

        // A service suffix ("mac:112233445566/service") is not part of the
        // identity.
        let id = id.split('/').next().unwrap_or(id);

        match scheme.to_ascii_lowercase().as_str() {
            "mac" => {
                let digits: String = id
                    .chars()
                    .filter(|c| !matches!(c, ':' | '-' | '.'))
                    .collect::<String>()
                    .to_ascii_lowercase();
                if !MAC_ID.is_match(&digits) {
                    return Err(DeviceIdError::InvalidMac { id: id.to_string() });
                }
                Ok(Self(format!("mac:{digits}")))
            }
            scheme @ ("uuid" | "dns" | "serial") => Ok(Self(format!("{scheme}:{id}"))),
            other => Err(DeviceIdError::UnsupportedScheme {
                scheme: other.to_string(),
            }),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
