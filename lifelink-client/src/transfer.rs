//! Single-slot file upload pipeline.
//!
//! A transfer uploads the file to the blob store (durable or temporary area
//! by size), resolves its public URL and appends a file message. Temporary
//! objects get a deferred deletion once the upload has landed.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use lifelink_core::{
    Attachment, DeviceTag, Identity, MessageId, NewMessage, now_unix_ms, route_upload,
};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::backend::{BlobStore, DocumentStore, UploadProgress};

/// How long a failed transfer stays visible before it is cleared.
pub const ERROR_DISPLAY_WINDOW: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("another file transfer is already in progress")]
    Busy,
    #[error("file is empty")]
    EmptyFile,
    #[error("path {0} has no file name")]
    NoFileName(PathBuf),
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A file picked for upload.
#[derive(Debug, Clone)]
pub struct FileSource {
    pub name: String,
    pub mime_type: String,
    pub data: Bytes,
}

impl FileSource {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            data: data.into(),
        }
    }

    /// Read a file from disk, guessing its content type from the extension.
    pub async fn from_path(path: &Path) -> Result<Self, TransferError> {
        let name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| TransferError::NoFileName(path.to_path_buf()))?;
        let data = tokio::fs::read(path)
            .await
            .map_err(|source| TransferError::Read {
                path: path.to_path_buf(),
                source,
            })?;
        let mime_type = mime_guess::from_path(path)
            .first_or_octet_stream()
            .essence_str()
            .to_owned();
        Ok(Self::new(name, mime_type, data))
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPhase {
    Uploading,
    Completed,
    Failed,
}

/// What the host renders for the transfer in flight.
#[derive(Debug, Clone, PartialEq)]
pub struct FileTransferState {
    pub file_name: String,
    pub file_size_bytes: u64,
    pub phase: TransferPhase,
    /// Fraction in `[0, 1]`, never decreasing during one transfer.
    pub progress: f64,
    pub error: Option<String>,
    pub url: Option<String>,
}

impl FileTransferState {
    fn started(file: &FileSource) -> Self {
        Self {
            file_name: file.name.clone(),
            file_size_bytes: file.size(),
            phase: TransferPhase::Uploading,
            progress: 0.0,
            error: None,
            url: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledDeletion {
    pub path: String,
    pub due_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransferOutcome {
    Completed {
        path: String,
        url: String,
        message_id: MessageId,
        completed_at_ms: u64,
        deletion: Option<ScheduledDeletion>,
    },
    Failed {
        error: String,
    },
}

/// Handle to a running transfer.
#[derive(Debug)]
pub struct TransferTask {
    handle: JoinHandle<TransferOutcome>,
}

impl TransferTask {
    pub async fn wait(self) -> TransferOutcome {
        match self.handle.await {
            Ok(outcome) => outcome,
            Err(err) => TransferOutcome::Failed {
                error: format!("transfer task ended abnormally: {err}"),
            },
        }
    }
}

pub struct FileTransferManager<S, B> {
    store: Arc<S>,
    blobs: Arc<B>,
    active: Arc<AtomicBool>,
}

impl<S, B> Clone for FileTransferManager<S, B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            blobs: self.blobs.clone(),
            active: self.active.clone(),
        }
    }
}

impl<S: DocumentStore, B: BlobStore> FileTransferManager<S, B> {
    pub fn new(store: Arc<S>, blobs: Arc<B>) -> Self {
        Self {
            store,
            blobs,
            active: Arc::new(AtomicBool::new(false)),
        }
    }

    /// True from the moment a transfer starts until its state is cleared.
    pub fn is_busy(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Start uploading `file`. `on_progress` receives every state change and
    /// finally `None` when the transfer state is cleared.
    ///
    /// Must be called from within a tokio runtime.
    pub fn upload<F>(
        &self,
        file: FileSource,
        sender: &Identity,
        device: DeviceTag,
        on_progress: F,
    ) -> Result<TransferTask, TransferError>
    where
        F: FnMut(Option<FileTransferState>) + Send + 'static,
    {
        if file.data.is_empty() {
            debug!(file = %file.name, "ignoring empty file");
            return Err(TransferError::EmptyFile);
        }
        if self
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(file = %file.name, "transfer rejected, another one is in progress");
            return Err(TransferError::Busy);
        }

        let pipeline = TransferPipeline {
            store: self.store.clone(),
            blobs: self.blobs.clone(),
            sender: sender.clone(),
            device,
            file,
            on_progress,
            slot: SlotGuard(self.active.clone()),
        };
        Ok(TransferTask {
            handle: tokio::spawn(pipeline.run()),
        })
    }
}

/// Frees the transfer slot when dropped.
struct SlotGuard(Arc<AtomicBool>);

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct TransferPipeline<S, B, F> {
    store: Arc<S>,
    blobs: Arc<B>,
    sender: Identity,
    device: DeviceTag,
    file: FileSource,
    on_progress: F,
    slot: SlotGuard,
}

impl<S, B, F> TransferPipeline<S, B, F>
where
    S: DocumentStore,
    B: BlobStore,
    F: FnMut(Option<FileTransferState>) + Send + 'static,
{
    async fn run(self) -> TransferOutcome {
        let TransferPipeline {
            store,
            blobs,
            sender,
            device,
            file,
            mut on_progress,
            slot,
        } = self;

        let route = route_upload(&sender.uid, now_unix_ms(), &file.name, file.size());
        let mut state = FileTransferState::started(&file);
        on_progress(Some(state.clone()));
        info!(
            path = %route.path,
            size = file.size(),
            placement = ?route.placement,
            "upload started"
        );

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let result = {
            let upload = blobs.upload(&route.path, file.data.clone(), &file.mime_type, progress_tx);
            tokio::pin!(upload);
            loop {
                tokio::select! {
                    biased;
                    Some(progress) = progress_rx.recv() => {
                        report_progress(&mut on_progress, &mut state, progress);
                    }
                    result = &mut upload => break result,
                }
            }
        };
        while let Ok(progress) = progress_rx.try_recv() {
            report_progress(&mut on_progress, &mut state, progress);
        }

        if let Err(err) = result {
            return fail(on_progress, state, format!("upload failed: {err}"), slot);
        }

        let completed_at_ms = now_unix_ms();
        let deletion = route.retention().map(|retention| {
            schedule_deletion(blobs.clone(), route.path.clone(), retention, completed_at_ms)
        });

        let url = match blobs.download_url(&route.path).await {
            Ok(url) => url,
            Err(err) => {
                return fail(on_progress, state, format!("could not resolve file URL: {err}"), slot);
            }
        };

        state.phase = TransferPhase::Completed;
        state.progress = 1.0;
        state.url = Some(url.clone());
        on_progress(Some(state.clone()));

        let attachment = Attachment {
            url: url.clone(),
            file_name: file.name.clone(),
            file_size_bytes: file.size(),
            mime_type: file.mime_type.clone(),
        };
        let message_id = match store.append(NewMessage::file(&sender, attachment, device)).await {
            Ok(receipt) => receipt.id,
            Err(err) => {
                return fail(on_progress, state, format!("file message write failed: {err}"), slot);
            }
        };

        info!(path = %route.path, id = %message_id, "file message sent");
        on_progress(None);
        drop(slot);

        TransferOutcome::Completed {
            path: route.path,
            url,
            message_id,
            completed_at_ms,
            deletion,
        }
    }
}

fn report_progress<F>(on_progress: &mut F, state: &mut FileTransferState, progress: UploadProgress)
where
    F: FnMut(Option<FileTransferState>),
{
    let fraction = progress.fraction().max(state.progress);
    if fraction == state.progress {
        return;
    }
    state.progress = fraction;
    on_progress(Some(state.clone()));
}

/// Surface the error, then clear the state and free the slot after
/// [`ERROR_DISPLAY_WINDOW`].
fn fail<F>(
    mut on_progress: F,
    mut state: FileTransferState,
    error: String,
    slot: SlotGuard,
) -> TransferOutcome
where
    F: FnMut(Option<FileTransferState>) + Send + 'static,
{
    error!(file = %state.file_name, "{}", error);
    state.phase = TransferPhase::Failed;
    state.error = Some(error.clone());
    on_progress(Some(state));

    tokio::spawn(async move {
        tokio::time::sleep(ERROR_DISPLAY_WINDOW).await;
        on_progress(None);
        drop(slot);
    });

    TransferOutcome::Failed { error }
}

fn schedule_deletion<B: BlobStore>(
    blobs: Arc<B>,
    path: String,
    retention: Duration,
    completed_at_ms: u64,
) -> ScheduledDeletion {
    let due_at_ms = completed_at_ms.saturating_add(retention.as_millis() as u64);
    info!(path = %path, due_at_ms, "temporary upload scheduled for deletion");

    let task_path = path.clone();
    tokio::spawn(async move {
        tokio::time::sleep(retention).await;
        match blobs.delete(&task_path).await {
            Ok(()) => info!(path = %task_path, "temporary upload deleted"),
            Err(err) => warn!(path = %task_path, "deferred deletion failed: {}", err),
        }
    });

    ScheduledDeletion { path, due_at_ms }
}
