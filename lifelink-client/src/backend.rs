//! Contracts of the external services the pipeline consumes.
//!
//! The document store and blob store are black boxes; anything that honours
//! these traits (the relay adapter in [`crate::remote`], a hosted service, a
//! test double) can back the chat pipeline.

use std::future::Future;

use bytes::Bytes;
use lifelink_core::{Message, NewMessage, WriteReceipt};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BackendError {
    #[error("not connected to backend")]
    Disconnected,
    #[error("request timed out")]
    TimedOut,
    #[error("request rejected: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
}

/// Cumulative progress of one blob upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadProgress {
    pub transferred: u64,
    pub total: u64,
}

impl UploadProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        (self.transferred as f64 / self.total as f64).clamp(0.0, 1.0)
    }
}

/// A running live query. Each item is the complete current window, newest
/// first. Dropping the query releases it on the backend.
pub struct LiveQuery {
    snapshots: mpsc::UnboundedReceiver<Vec<Message>>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl LiveQuery {
    pub fn new(
        snapshots: mpsc::UnboundedReceiver<Vec<Message>>,
        release: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            snapshots,
            release: Some(Box::new(release)),
        }
    }

    /// Next full snapshot, or `None` once the backend has closed the feed.
    pub async fn next_snapshot(&mut self) -> Option<Vec<Message>> {
        self.snapshots.recv().await
    }
}

impl std::fmt::Debug for LiveQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveQuery")
            .field("released", &self.release.is_none())
            .finish()
    }
}

impl Drop for LiveQuery {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

/// Ordered, append-only message collection with live queries.
pub trait DocumentStore: Send + Sync + 'static {
    /// Append a message; the backend assigns id, timestamp and sequence.
    fn append(
        &self,
        message: NewMessage,
    ) -> impl Future<Output = Result<WriteReceipt, BackendError>> + Send;

    /// Live query over the `limit` most recent messages, newest first.
    fn live_query(
        &self,
        limit: usize,
    ) -> impl Future<Output = Result<LiveQuery, BackendError>> + Send;
}

/// Object storage with resumable, progress-reporting uploads.
pub trait BlobStore: Send + Sync + 'static {
    /// Store `data` at `path`. Cumulative progress is reported on `progress`
    /// in non-decreasing order; the future resolves once the object is durable.
    fn upload(
        &self,
        path: &str,
        data: Bytes,
        mime_type: &str,
        progress: mpsc::UnboundedSender<UploadProgress>,
    ) -> impl Future<Output = Result<(), BackendError>> + Send;

    /// Public retrieval URL of a stored object.
    fn download_url(&self, path: &str) -> impl Future<Output = Result<String, BackendError>> + Send;

    fn delete(&self, path: &str) -> impl Future<Output = Result<(), BackendError>> + Send;
}
