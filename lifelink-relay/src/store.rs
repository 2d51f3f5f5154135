use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use lifelink_core::{Message, NewMessage, WriteReceipt, wire::UploadId};
use rand::{Rng, distr::Alphanumeric};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const MAX_UPLOAD_BYTES: u64 = 256 * 1024 * 1024;
const MESSAGE_ID_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("invalid object path {0:?}")]
    InvalidPath(String),
    #[error("upload of {size} bytes exceeds limit of {max} bytes")]
    UploadTooLarge { size: u64, max: u64 },
    #[error("unknown upload {0}")]
    UnknownUpload(UploadId),
    #[error("chunk at offset {offset} does not continue upload at {received}")]
    OutOfOrderChunk { offset: u64, received: u64 },
    #[error("chunk overruns declared size {total}")]
    Overrun { total: u64 },
    #[error("object {0:?} not found")]
    NotFound(String),
}

/// Append-only message collection.
#[derive(Debug, Default)]
pub struct DocumentLog {
    messages: Vec<Message>,
    next_sequence: u64,
    last_sent_at: u64,
}

impl DocumentLog {
    pub fn append(&mut self, draft: NewMessage, now_ms: u64) -> Result<WriteReceipt, StoreError> {
        draft
            .validate()
            .map_err(|err| StoreError::InvalidMessage(err.to_string()))?;

        // Server timestamps never go backwards, so timestamp order and
        // sequence order agree.
        let sent_at = now_ms.max(self.last_sent_at);
        self.last_sent_at = sent_at;
        self.next_sequence += 1;

        let receipt = WriteReceipt {
            id: random_message_id(),
            sent_at,
        };
        self.messages
            .push(Message::from_draft(draft, &receipt, self.next_sequence));
        Ok(receipt)
    }

    /// Newest `limit` messages, newest first.
    pub fn recent(&self, limit: usize) -> Vec<Message> {
        self.messages.iter().rev().take(limit).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub mime_type: String,
    pub sha256_hex: String,
}

#[derive(Debug)]
struct PartialUpload {
    path: String,
    total: u64,
    mime_type: String,
    received: BytesMut,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOutcome {
    Progress { transferred: u64, total: u64 },
    Completed { path: String, total: u64 },
}

#[derive(Debug, Default)]
pub struct BlobObjects {
    objects: HashMap<String, StoredObject>,
    uploads: HashMap<UploadId, PartialUpload>,
    next_upload_id: UploadId,
}

impl BlobObjects {
    pub fn begin_upload(
        &mut self,
        path: &str,
        total: u64,
        mime_type: &str,
    ) -> Result<UploadId, StoreError> {
        validate_path(path)?;
        if total > MAX_UPLOAD_BYTES {
            return Err(StoreError::UploadTooLarge {
                size: total,
                max: MAX_UPLOAD_BYTES,
            });
        }

        self.next_upload_id += 1;
        let upload_id = self.next_upload_id;
        self.uploads.insert(
            upload_id,
            PartialUpload {
                path: path.to_owned(),
                total,
                mime_type: mime_type.to_owned(),
                received: BytesMut::with_capacity(total.min(8 * 1024 * 1024) as usize),
            },
        );
        Ok(upload_id)
    }

    /// Apply the next chunk of an upload. A chunk that repeats bytes already
    /// received is acknowledged without being applied again.
    pub fn apply_chunk(
        &mut self,
        upload_id: UploadId,
        offset: u64,
        data: &[u8],
    ) -> Result<ChunkOutcome, StoreError> {
        let upload = self
            .uploads
            .get_mut(&upload_id)
            .ok_or(StoreError::UnknownUpload(upload_id))?;

        let received = upload.received.len() as u64;
        if offset < received {
            return Ok(ChunkOutcome::Progress {
                transferred: received,
                total: upload.total,
            });
        }
        if offset > received {
            return Err(StoreError::OutOfOrderChunk { offset, received });
        }
        if received + data.len() as u64 > upload.total {
            return Err(StoreError::Overrun {
                total: upload.total,
            });
        }

        upload.received.extend_from_slice(data);
        let transferred = upload.received.len() as u64;
        if transferred < upload.total {
            return Ok(ChunkOutcome::Progress {
                transferred,
                total: upload.total,
            });
        }

        let Some(upload) = self.uploads.remove(&upload_id) else {
            return Err(StoreError::UnknownUpload(upload_id));
        };
        let data = upload.received.freeze();
        let object = StoredObject {
            sha256_hex: hex::encode(Sha256::digest(&data)),
            data,
            mime_type: upload.mime_type,
        };
        self.objects.insert(upload.path.clone(), object);
        Ok(ChunkOutcome::Completed {
            path: upload.path,
            total: upload.total,
        })
    }

    /// Zero-byte uploads complete as soon as they begin.
    pub fn complete_if_empty(&mut self, upload_id: UploadId) -> Option<ChunkOutcome> {
        let total = self.uploads.get(&upload_id)?.total;
        if total != 0 {
            return None;
        }
        self.apply_chunk(upload_id, 0, &[]).ok()
    }

    pub fn abort_upload(&mut self, upload_id: UploadId) {
        self.uploads.remove(&upload_id);
    }

    pub fn get(&self, path: &str) -> Option<StoredObject> {
        self.objects.get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.contains_key(path)
    }

    pub fn delete(&mut self, path: &str) -> Result<(), StoreError> {
        self.objects
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(path.to_owned()))
    }
}

fn validate_path(path: &str) -> Result<(), StoreError> {
    let valid = !path.trim().is_empty()
        && !path.starts_with('/')
        && path
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..");
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidPath(path.to_owned()))
    }
}

fn random_message_id() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(MESSAGE_ID_LEN)
        .map(char::from)
        .collect()
}
