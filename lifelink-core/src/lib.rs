use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;

pub mod device;
pub mod format;
pub mod model;
pub mod storage;
pub mod wire;

pub use device::{DeviceTag, classify_device};
pub use model::{Attachment, Identity, Message, MessageId, NewMessage, WriteReceipt};
pub use storage::{StoragePlacement, StorageRoute, route_upload};

/// Size of the live message window.
pub const MESSAGE_WINDOW: usize = 100;
pub const MAX_RELAY_MESSAGE_BYTES: usize = 1024 * 1024;
pub const BLOB_CHUNK_BYTES: usize = 64 * 1024;
/// Longest text body, in UTF-8 bytes, a message may carry.
pub const MAX_MESSAGE_BODY_BYTES: usize = 64 * 1024;
/// Largest frame a relay pushes to a client. Each windowed message reached
/// the relay inside one inbound frame, so a full snapshot stays under the
/// window times that frame plus per-message bookkeeping.
pub const MAX_SNAPSHOT_FRAME_BYTES: usize = MESSAGE_WINDOW * (MAX_RELAY_MESSAGE_BYTES + 1024);
pub const ANONYMOUS_DISPLAY_NAME: &str = "Anonymous";

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid frame length")]
    InvalidFrameLength,
    #[error("unsupported message type {0}")]
    UnsupportedMessageType(u8),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("message must carry a body or an attachment")]
    EmptyMessage,
    #[error("message body is {len} bytes, limit is {max}")]
    BodyTooLarge { len: usize, max: usize },
}

pub fn now_unix_ms() -> u64 {
    let duration = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| Duration::from_secs(0));
    duration.as_millis() as u64
}
