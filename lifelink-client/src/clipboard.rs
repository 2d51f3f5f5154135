use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use lifelink_core::MessageId;
use thiserror::Error;
use tracing::{debug, warn};

/// How long a copied message keeps its "copied" marker.
pub const COPY_ACK_WINDOW: Duration = Duration::from_millis(1500);

#[derive(Debug, Error)]
pub enum ClipboardError {
    #[error("clipboard unavailable: {0}")]
    Unavailable(String),
    #[error("clipboard write failed: {0}")]
    Write(String),
}

pub trait ClipboardWriter: Send + Sync + 'static {
    fn write_text(&self, text: &str) -> Result<(), ClipboardError>;
}

/// The operating system clipboard.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClipboard;

impl ClipboardWriter for SystemClipboard {
    fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        let mut clipboard =
            arboard::Clipboard::new().map_err(|err| ClipboardError::Unavailable(err.to_string()))?;
        clipboard
            .set_text(text.to_owned())
            .map_err(|err| ClipboardError::Write(err.to_string()))
    }
}

#[derive(Debug, Default)]
struct CopyMarker {
    message_id: Option<MessageId>,
    generation: u64,
}

pub struct ClipboardBridge<W> {
    writer: Arc<W>,
    marker: Arc<Mutex<CopyMarker>>,
}

impl<W: ClipboardWriter> ClipboardBridge<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Arc::new(writer),
            marker: Arc::new(Mutex::new(CopyMarker::default())),
        }
    }

    /// Copy a message body and mark the message as just copied for
    /// [`COPY_ACK_WINDOW`]. Empty text and write failures leave the marker
    /// untouched; failures are only logged.
    pub async fn copy(&self, text: &str, message_id: &str) {
        if text.is_empty() {
            return;
        }

        let writer = self.writer.clone();
        let owned = text.to_owned();
        let written = tokio::task::spawn_blocking(move || writer.write_text(&owned))
            .await
            .map_err(|err| ClipboardError::Write(err.to_string()))
            .and_then(|result| result);
        if let Err(err) = written {
            warn!(id = %message_id, "copy failed: {}", err);
            return;
        }

        let generation = {
            let mut marker = self.marker.lock().unwrap_or_else(PoisonError::into_inner);
            marker.generation += 1;
            marker.message_id = Some(message_id.to_owned());
            marker.generation
        };
        debug!(id = %message_id, "message copied");

        // A later copy bumps the generation, so this reset becomes a no-op.
        let marker = self.marker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(COPY_ACK_WINDOW).await;
            let mut marker = marker.lock().unwrap_or_else(PoisonError::into_inner);
            if marker.generation == generation {
                marker.message_id = None;
            }
        });
    }

    pub fn just_copied(&self) -> Option<MessageId> {
        self.marker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .message_id
            .clone()
    }

    pub fn is_just_copied(&self, message_id: &str) -> bool {
        self.just_copied().as_deref() == Some(message_id)
    }
}
