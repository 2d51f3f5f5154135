#![allow(dead_code)]

use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use bytes::Bytes;
use lifelink_client::{
    BackendError, BlobStore, ClipboardError, ClipboardWriter, DocumentStore, LiveQuery,
    UploadProgress,
};
use lifelink_core::{DeviceTag, Identity, Message, NewMessage, WriteReceipt};
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedUpload {
    pub path: String,
    pub size: u64,
    pub mime_type: String,
}

#[derive(Default)]
struct FakeState {
    messages: Vec<Message>,
    next_sequence: u64,
    clock_ms: u64,
    fail_appends: bool,
    fail_uploads: bool,
    upload_hold: Option<oneshot::Receiver<()>>,
    uploads: Vec<RecordedUpload>,
    objects: HashSet<String>,
    deleted: Vec<String>,
    subscribers: Vec<(usize, mpsc::UnboundedSender<Vec<Message>>)>,
}

/// In-memory document and blob store with failure switches.
#[derive(Default)]
pub struct FakeBackend {
    state: Mutex<FakeState>,
    releases: Arc<AtomicUsize>,
}

impl FakeBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_appends(&self, fail: bool) {
        self.state.lock().unwrap().fail_appends = fail;
    }

    pub fn fail_uploads(&self, fail: bool) {
        self.state.lock().unwrap().fail_uploads = fail;
    }

    /// Make the next upload wait until the returned sender fires.
    pub fn hold_next_upload(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().unwrap().upload_hold = Some(rx);
        tx
    }

    pub fn messages(&self) -> Vec<Message> {
        self.state.lock().unwrap().messages.clone()
    }

    pub fn uploads(&self) -> Vec<RecordedUpload> {
        self.state.lock().unwrap().uploads.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn has_object(&self, path: &str) -> bool {
        self.state.lock().unwrap().objects.contains(path)
    }

    pub fn live_query_releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Push an arbitrary newest-first window to every live query.
    pub fn push_snapshot(&self, window: Vec<Message>) {
        let state = self.state.lock().unwrap();
        for (_, tx) in &state.subscribers {
            let _ = tx.send(window.clone());
        }
    }

    /// End every live query as a dropped backend connection would.
    pub fn close_live_queries(&self) {
        self.state.lock().unwrap().subscribers.clear();
    }

    fn notify(state: &mut FakeState) {
        state.subscribers.retain(|(limit, tx)| {
            let window: Vec<Message> = state.messages.iter().rev().take(*limit).cloned().collect();
            tx.send(window).is_ok()
        });
    }
}

impl DocumentStore for FakeBackend {
    async fn append(&self, message: NewMessage) -> Result<WriteReceipt, BackendError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_appends {
            return Err(BackendError::Rejected("document store offline".to_owned()));
        }
        state.clock_ms += 10;
        state.next_sequence += 1;
        let receipt = WriteReceipt {
            id: format!("msg-{}", state.next_sequence),
            sent_at: state.clock_ms,
        };
        let sequence = state.next_sequence;
        state
            .messages
            .push(Message::from_draft(message, &receipt, sequence));
        Self::notify(&mut state);
        Ok(receipt)
    }

    async fn live_query(&self, limit: usize) -> Result<LiveQuery, BackendError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().unwrap();
        let initial: Vec<Message> = state.messages.iter().rev().take(limit).cloned().collect();
        let _ = tx.send(initial);
        state.subscribers.push((limit, tx));

        let releases = self.releases.clone();
        Ok(LiveQuery::new(rx, move || {
            releases.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

impl BlobStore for FakeBackend {
    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        mime_type: &str,
        progress: mpsc::UnboundedSender<UploadProgress>,
    ) -> Result<(), BackendError> {
        let hold = self.state.lock().unwrap().upload_hold.take();
        if let Some(hold) = hold {
            let _ = hold.await;
        }

        let total = data.len() as u64;
        let fail = {
            let mut state = self.state.lock().unwrap();
            state.uploads.push(RecordedUpload {
                path: path.to_owned(),
                size: total,
                mime_type: mime_type.to_owned(),
            });
            state.fail_uploads
        };

        // Includes a stale report, as resumable uploads can produce.
        for transferred in [total / 4, total / 2, total / 4, total * 3 / 4] {
            let _ = progress.send(UploadProgress { transferred, total });
        }
        if fail {
            return Err(BackendError::Transport("connection reset".to_owned()));
        }
        let _ = progress.send(UploadProgress {
            transferred: total,
            total,
        });

        self.state.lock().unwrap().objects.insert(path.to_owned());
        Ok(())
    }

    async fn download_url(&self, path: &str) -> Result<String, BackendError> {
        Ok(format!("https://blobs.test/{path}"))
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock().unwrap();
        state.objects.remove(path);
        state.deleted.push(path.to_owned());
        Ok(())
    }
}

/// Clipboard that records writes instead of touching the system.
#[derive(Default, Clone)]
pub struct FakeClipboard {
    writes: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl FakeClipboard {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn writes(&self) -> Vec<String> {
        self.writes.lock().unwrap().clone()
    }
}

impl ClipboardWriter for FakeClipboard {
    fn write_text(&self, text: &str) -> Result<(), ClipboardError> {
        if self.fail {
            return Err(ClipboardError::Unavailable("no display".to_owned()));
        }
        self.writes.lock().unwrap().push(text.to_owned());
        Ok(())
    }
}

pub fn identity() -> Identity {
    Identity {
        uid: "uid-ada".to_owned(),
        display_name: Some("Ada".to_owned()),
        email: Some("ada@example.com".to_owned()),
        avatar_url: Some("https://example.com/ada.png".to_owned()),
    }
}

pub fn stored(id: &str, sent_at: Option<u64>, sequence: u64) -> Message {
    Message {
        id: id.to_owned(),
        sender_id: "uid-ada".to_owned(),
        sender_display_name: "Ada".to_owned(),
        sender_email: String::new(),
        sender_avatar_url: String::new(),
        body: Some(id.to_owned()),
        attachment: None,
        sent_at,
        sequence,
        origin_device_tag: DeviceTag::Desktop,
    }
}
