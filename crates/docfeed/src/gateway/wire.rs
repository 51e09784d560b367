//! Framing for the live gateway connection.
//!
//! Every frame is a fixed 16-byte big-endian header followed by a bincode body:
//!
//! ```text
//! magic:4 | version:1 | kind:1 | reserved:2 | batch_id:4 | payload_length:4
//! ```
//!
//! Request frames carry a list of operations, reply frames a list of per-operation results.
//! Replies may arrive in any order and in any grouping; they are correlated by operation id only.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::{Reply, ReplyStatus, WireOperation};
use crate::error::{FeedError, Result};
use crate::operation::{OperationId, OperationKind};

/// Frame header size in bytes.
pub const FRAME_HEADER_SIZE: usize = 16;

/// Magic number opening every frame.
pub const MAGIC: u32 = 0xD0CF_EED1;

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Largest accepted frame body (64 MiB).
pub const MAX_FRAME_PAYLOAD: u32 = 64 * 1024 * 1024;

/// Frame body type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Client to gateway: operations.
    Request = 1,
    /// Gateway to client: results.
    Reply = 2,
}

impl FrameKind {
    fn from_u8(b: u8) -> Result<Self> {
        match b {
            1 => Ok(FrameKind::Request),
            2 => Ok(FrameKind::Reply),
            other => Err(FeedError::InvalidFrame {
                reason: format!("unknown frame kind {other}"),
            }),
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body type.
    pub kind: FrameKind,
    /// Sender-chosen batch number, echoed in replies for logging only.
    pub batch_id: u32,
    /// Body length in bytes.
    pub payload_length: u32,
}

impl FrameHeader {
    /// Encodes the header.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = [0u8; FRAME_HEADER_SIZE];
        buf[0..4].copy_from_slice(&MAGIC.to_be_bytes());
        buf[4] = PROTOCOL_VERSION;
        buf[5] = self.kind as u8;
        buf[8..12].copy_from_slice(&self.batch_id.to_be_bytes());
        buf[12..16].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decodes and validates a header.
    pub fn decode(buf: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
        if magic != MAGIC {
            return Err(FeedError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        if buf[4] != PROTOCOL_VERSION {
            return Err(FeedError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: buf[4],
            });
        }
        let kind = FrameKind::from_u8(buf[5])?;
        let batch_id = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let payload_length = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
        if payload_length > MAX_FRAME_PAYLOAD {
            return Err(FeedError::FrameTooLarge {
                size: payload_length,
                max_size: MAX_FRAME_PAYLOAD,
            });
        }
        Ok(Self {
            kind,
            batch_id,
            payload_length,
        })
    }
}

#[derive(Serialize)]
struct RequestItemRef<'a> {
    id: &'a str,
    kind: OperationKind,
    route: Option<&'a str>,
    #[serde(with = "serde_bytes")]
    payload: &'a [u8],
}

/// One operation as decoded from a request frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RequestItem {
    /// Operation id.
    pub id: String,
    /// Operation kind.
    pub kind: OperationKind,
    /// Backend route, if the cluster has one.
    pub route: Option<String>,
    /// Document payload.
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// Result status on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireStatus {
    /// Accepted.
    Ok,
    /// Retry may succeed.
    Transient,
    /// Rejected.
    Permanent,
}

/// One per-operation result in a reply frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireReply {
    /// Id of the answered operation.
    pub id: String,
    /// Verdict.
    pub status: WireStatus,
    /// Error detail; empty on success.
    pub message: String,
}

impl WireReply {
    /// Success for `id`.
    pub fn ok(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: WireStatus::Ok,
            message: String::new(),
        }
    }

    /// Permanent failure for `id`.
    pub fn permanent(id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: WireStatus::Permanent,
            message: message.into(),
        }
    }

    /// Converts into the connection-independent reply.
    pub fn into_reply(self) -> Reply {
        let status = match self.status {
            WireStatus::Ok => ReplyStatus::Ok,
            WireStatus::Transient => ReplyStatus::Transient(self.message),
            WireStatus::Permanent => ReplyStatus::Permanent(self.message),
        };
        Reply {
            id: OperationId::from(self.id),
            status,
        }
    }
}

fn frame(kind: FrameKind, batch_id: u32, body: Vec<u8>) -> Result<Vec<u8>> {
    let payload_length = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_PAYLOAD)
        .ok_or(FeedError::FrameTooLarge {
            size: u32::try_from(body.len()).unwrap_or(u32::MAX),
            max_size: MAX_FRAME_PAYLOAD,
        })?;
    let header = FrameHeader {
        kind,
        batch_id,
        payload_length,
    };
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body.len());
    out.extend_from_slice(&header.encode());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Encodes a request frame for `operations`, tagging each with `route`.
pub fn encode_request_frame(
    batch_id: u32,
    operations: &[WireOperation],
    route: Option<&str>,
) -> Result<Vec<u8>> {
    let items: Vec<RequestItemRef<'_>> = operations
        .iter()
        .map(|op| RequestItemRef {
            id: op.id.as_str(),
            kind: op.kind,
            route,
            payload: &op.payload,
        })
        .collect();
    frame(FrameKind::Request, batch_id, bincode::serialize(&items)?)
}

/// Body size of a request frame carrying only `operation`.
pub fn request_body_size(operation: &WireOperation, route: Option<&str>) -> Result<u64> {
    let item = [RequestItemRef {
        id: operation.id.as_str(),
        kind: operation.kind,
        route,
        payload: &operation.payload,
    }];
    Ok(bincode::serialized_size(&item[..])?)
}

/// Whether `operation` fits in a request frame on its own.
pub fn fits_in_frame(operation: &WireOperation, route: Option<&str>) -> bool {
    request_body_size(operation, route).is_ok_and(|size| size <= u64::from(MAX_FRAME_PAYLOAD))
}

/// Encodes a reply frame.
pub fn encode_reply_frame(batch_id: u32, replies: &[WireReply]) -> Result<Vec<u8>> {
    frame(FrameKind::Reply, batch_id, bincode::serialize(replies)?)
}

/// Decodes the body of a request frame.
pub fn decode_requests(body: &[u8]) -> Result<Vec<RequestItem>> {
    Ok(bincode::deserialize(body)?)
}

/// Decodes the body of a reply frame.
pub fn decode_replies(body: &[u8]) -> Result<Vec<WireReply>> {
    Ok(bincode::deserialize(body)?)
}

/// Reads one frame.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<(FrameHeader, Vec<u8>)> {
    let mut header_buf = [0u8; FRAME_HEADER_SIZE];
    reader.read_exact(&mut header_buf).await?;
    let header = FrameHeader::decode(&header_buf)?;
    let mut body = vec![0u8; header.payload_length as usize];
    if !body.is_empty() {
        reader.read_exact(&mut body).await?;
    }
    Ok((header, body))
}

/// Splits a batch into consecutive runs whose payloads total at most `max_chunk_bytes`.
///
/// An operation larger than the limit travels alone.
pub fn chunks(operations: &[WireOperation], max_chunk_bytes: usize) -> Vec<&[WireOperation]> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut bytes = 0usize;
    for (i, op) in operations.iter().enumerate() {
        if i > start && bytes.saturating_add(op.size()) > max_chunk_bytes {
            out.push(&operations[start..i]);
            start = i;
            bytes = 0;
        }
        bytes = bytes.saturating_add(op.size());
    }
    if start < operations.len() {
        out.push(&operations[start..]);
    }
    out
}
