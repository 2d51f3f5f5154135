use std::sync::{Arc, Mutex, PoisonError};

use lifelink_core::{DeviceTag, Identity, MAX_MESSAGE_BODY_BYTES, MessageId, NewMessage};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::backend::{BackendError, DocumentStore};

#[derive(Debug, Error)]
pub enum SendError {
    #[error("message is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("message write failed: {0}")]
    Backend(#[from] BackendError),
}

/// Shared text of the input field.
#[derive(Debug, Clone, Default)]
pub struct ComposerInput {
    text: Arc<Mutex<String>>,
}

impl ComposerInput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, text: impl Into<String>) {
        *self.lock() = text.into();
    }

    pub fn text(&self) -> String {
        self.lock().clone()
    }

    /// Clear the field and hand its text over, unless it is blank.
    fn take_sendable(&self) -> Option<String> {
        let mut text = self.lock();
        if text.trim().is_empty() {
            return None;
        }
        Some(std::mem::take(&mut *text))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, String> {
        self.text.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
pub enum SubmitOutcome {
    /// Input was blank; nothing was written.
    Ignored,
    Sent(MessageId),
    /// The write failed and the text was put back into the input.
    RolledBack(SendError),
}

pub struct MessageComposer<S> {
    store: Arc<S>,
}

impl<S: DocumentStore> MessageComposer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Append a text message. Whitespace-only text is a no-op returning
    /// `Ok(None)`. The body is sent as typed, untrimmed, and may not exceed
    /// `MAX_MESSAGE_BODY_BYTES`.
    pub async fn send(
        &self,
        text: &str,
        sender: &Identity,
        device: DeviceTag,
    ) -> Result<Option<MessageId>, SendError> {
        if text.trim().is_empty() {
            debug!("ignoring blank message");
            return Ok(None);
        }
        if text.len() > MAX_MESSAGE_BODY_BYTES {
            return Err(SendError::TooLong {
                len: text.len(),
                max: MAX_MESSAGE_BODY_BYTES,
            });
        }

        let draft = NewMessage::text(sender, text, device);
        let receipt = self.store.append(draft).await?;
        info!(id = %receipt.id, device = %device, "message sent");
        Ok(Some(receipt.id))
    }

    /// Send what is in `input`, clearing it first so typing can continue.
    /// On failure the original text is written back.
    pub async fn submit(
        &self,
        input: &ComposerInput,
        sender: &Identity,
        device: DeviceTag,
    ) -> SubmitOutcome {
        let Some(text) = input.take_sendable() else {
            return SubmitOutcome::Ignored;
        };

        match self.send(&text, sender, device).await {
            Ok(Some(id)) => SubmitOutcome::Sent(id),
            Ok(None) => SubmitOutcome::Ignored,
            Err(err) => {
                warn!("send failed, restoring input: {}", err);
                input.set(text);
                SubmitOutcome::RolledBack(err)
            }
        }
    }
}
