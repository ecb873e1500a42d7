use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::errors::ProtocolError;

/// Maximum message size (4MB) — local Unix socket, a page of package records
/// stays far below this even with long labels.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// Snapshot of one installed package as seen by the platform package registry.
///
/// Owned by the enumeration service until it is copied across the socket;
/// the uid already includes the device-user offset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRecord {
    pub package_name: String,
    pub uid: u32,
    pub label: String,
    /// Install timestamp in milliseconds since the Unix epoch (0 if unknown)
    pub install_time: i64,
    /// Whether the package belongs to the system image / a system uid
    pub system: bool,
    /// Optional path to the package icon, resolvable by the consumer
    pub icon_path: Option<PathBuf>,
}

/// Request sent from the manager to the enumeration service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Number of packages in the service's aggregated cache
    PackageCount,
    /// One page of the aggregated package list.
    ///
    /// Returns `cache[start..min(start + max_count, len)]`; an out-of-range
    /// `start` yields an empty page, never an error — empty signals exhaustion.
    Packages { start: u32, max_count: u32 },
    /// Liveness check
    Ping,
    /// Stop the service
    Shutdown,
}

impl Request {
    /// Return the variant name as a static string (for lightweight error reporting)
    pub fn variant_name(&self) -> &'static str {
        match self {
            Request::PackageCount => "PackageCount",
            Request::Packages { .. } => "Packages",
            Request::Ping => "Ping",
            Request::Shutdown => "Shutdown",
        }
    }
}

/// Response sent from the enumeration service to the manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    Ok {
        message: Option<String>,
        data: Option<ResponseData>,
    },
    Error {
        message: String,
    },
}

impl Response {
    pub fn ok_with_message(msg: impl Into<String>) -> Self {
        Response::Ok {
            message: Some(msg.into()),
            data: None,
        }
    }

    pub fn ok_with_data(data: ResponseData) -> Self {
        Response::Ok {
            message: None,
            data: Some(data),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Response::Error {
            message: msg.into(),
        }
    }
}

/// Data payload in a response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ResponseData {
    PackageCount(u32),
    Packages(Vec<PackageRecord>),
}

/// Client-to-server message with request ID for multiplexing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: u64,
    pub request: Request,
}

/// Server-to-client message answering one envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    pub id: u64,
    pub response: Response,
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

fn encode_frame<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let size = bincode::serialized_size(value).map_err(ProtocolError::Encode)?;
    if size > MAX_MESSAGE_SIZE as u64 {
        return Err(ProtocolError::MessageTooLarge);
    }
    let len = size as u32;
    let mut frame = Vec::with_capacity(4 + size as usize);
    frame.extend_from_slice(&len.to_be_bytes());
    bincode::serialize_into(&mut frame, value).map_err(ProtocolError::Encode)?;
    Ok(frame)
}

/// Encode a request envelope to length-prefixed bincode bytes
pub fn encode_envelope(envelope: &RequestEnvelope) -> Result<Vec<u8>> {
    encode_frame(envelope)
}

/// Decode a request envelope from raw bincode payload (framing already stripped)
pub fn decode_envelope(bytes: &[u8]) -> Result<RequestEnvelope> {
    bincode::deserialize(bytes).map_err(ProtocolError::Decode)
}

/// Encode a response envelope to length-prefixed bincode bytes
pub fn encode_response(envelope: &ResponseEnvelope) -> Result<Vec<u8>> {
    encode_frame(envelope)
}

/// Decode a response envelope from raw bincode payload (framing already stripped)
pub fn decode_response(bytes: &[u8]) -> Result<ResponseEnvelope> {
    bincode::deserialize(bytes).map_err(ProtocolError::Decode)
}
