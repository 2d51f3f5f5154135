//! Framing for the development relay.
//!
//! Frame layout: `len: u32 LE | type: u8 | payload`, where `len` counts the
//! type byte plus the payload. Requests and events are JSON; blob chunks use
//! a compact binary layout so uploads are not inflated by encoding.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::{CoreError, Message, NewMessage, WriteReceipt};

pub type RequestId = u64;
pub type SubscriptionId = u64;
pub type UploadId = u64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ClientRequest {
    Append {
        request_id: RequestId,
        message: NewMessage,
    },
    Subscribe {
        subscription_id: SubscriptionId,
        limit: usize,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
    },
    BeginUpload {
        request_id: RequestId,
        path: String,
        total_bytes: u64,
        mime_type: String,
    },
    ResolveUrl {
        request_id: RequestId,
        path: String,
    },
    DeleteObject {
        request_id: RequestId,
        path: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "data")]
pub enum ServerEvent {
    Appended {
        request_id: RequestId,
        receipt: WriteReceipt,
    },
    /// Full current window for a live query, newest first.
    Snapshot {
        subscription_id: SubscriptionId,
        messages: Vec<Message>,
    },
    UploadAccepted {
        request_id: RequestId,
        upload_id: UploadId,
    },
    UploadProgress {
        upload_id: UploadId,
        transferred: u64,
        total: u64,
    },
    UploadCompleted {
        upload_id: UploadId,
        path: String,
    },
    UploadFailed {
        upload_id: UploadId,
        message: String,
    },
    UrlResolved {
        request_id: RequestId,
        url: String,
    },
    ObjectDeleted {
        request_id: RequestId,
    },
    Error {
        request_id: Option<RequestId>,
        message: String,
    },
}

impl ServerEvent {
    /// Request this event answers, if it answers one.
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ServerEvent::Appended { request_id, .. }
            | ServerEvent::UploadAccepted { request_id, .. }
            | ServerEvent::UrlResolved { request_id, .. }
            | ServerEvent::ObjectDeleted { request_id } => Some(*request_id),
            ServerEvent::Error { request_id, .. } => *request_id,
            ServerEvent::Snapshot { .. }
            | ServerEvent::UploadProgress { .. }
            | ServerEvent::UploadCompleted { .. }
            | ServerEvent::UploadFailed { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobChunk {
    pub upload_id: UploadId,
    pub offset: u64,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Request(ClientRequest),
    Event(ServerEvent),
    Chunk(BlobChunk),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Request = 0,
    Event = 1,
    BlobChunk = 2,
}

pub fn encode_frame(message: &WireMessage) -> Result<Vec<u8>, CoreError> {
    let (message_type, payload) = match message {
        WireMessage::Request(request) => (
            MessageType::Request as u8,
            serde_json::to_vec(request).map_err(|err| CoreError::Serialization(err.to_string()))?,
        ),
        WireMessage::Event(event) => (
            MessageType::Event as u8,
            serde_json::to_vec(event).map_err(|err| CoreError::Serialization(err.to_string()))?,
        ),
        WireMessage::Chunk(chunk) => (MessageType::BlobChunk as u8, encode_blob_chunk(chunk)?),
    };

    let frame_len = 1usize
        .checked_add(payload.len())
        .ok_or(CoreError::InvalidFrameLength)?;
    let frame_len_u32 = u32::try_from(frame_len).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(4 + frame_len);
    out.put_u32_le(frame_len_u32);
    out.put_u8(message_type);
    out.extend_from_slice(&payload);
    Ok(out.to_vec())
}

pub fn decode_frame(frame: &[u8]) -> Result<WireMessage, CoreError> {
    if frame.len() < 5 {
        return Err(CoreError::InvalidFrameLength);
    }

    let mut cursor = frame;
    let expected_len = cursor.get_u32_le() as usize;
    if expected_len + 4 != frame.len() {
        return Err(CoreError::InvalidFrameLength);
    }

    let message_type = cursor.get_u8();
    let payload = cursor;

    match message_type {
        x if x == MessageType::Request as u8 => {
            let request: ClientRequest = serde_json::from_slice(payload)
                .map_err(|err| CoreError::Serialization(err.to_string()))?;
            Ok(WireMessage::Request(request))
        }
        x if x == MessageType::Event as u8 => {
            let event: ServerEvent = serde_json::from_slice(payload)
                .map_err(|err| CoreError::Serialization(err.to_string()))?;
            Ok(WireMessage::Event(event))
        }
        x if x == MessageType::BlobChunk as u8 => Ok(WireMessage::Chunk(decode_blob_chunk(payload)?)),
        other => Err(CoreError::UnsupportedMessageType(other)),
    }
}

fn encode_blob_chunk(chunk: &BlobChunk) -> Result<Vec<u8>, CoreError> {
    // Layout:
    // - upload_id: u64
    // - offset: u64
    // - data_len: u32
    // - data bytes
    let data_len = u32::try_from(chunk.data.len()).map_err(|_| CoreError::InvalidFrameLength)?;

    let mut out = BytesMut::with_capacity(8 + 8 + 4 + chunk.data.len());
    out.put_u64_le(chunk.upload_id);
    out.put_u64_le(chunk.offset);
    out.put_u32_le(data_len);
    out.extend_from_slice(&chunk.data);
    Ok(out.to_vec())
}

fn decode_blob_chunk(mut bytes: &[u8]) -> Result<BlobChunk, CoreError> {
    if bytes.len() < 8 + 8 + 4 {
        return Err(CoreError::InvalidFrameLength);
    }

    let upload_id = bytes.get_u64_le();
    let offset = bytes.get_u64_le();
    let data_len = bytes.get_u32_le() as usize;
    if bytes.len() != data_len {
        return Err(CoreError::InvalidFrameLength);
    }

    Ok(BlobChunk {
        upload_id,
        offset,
        data: bytes.to_vec(),
    })
}
