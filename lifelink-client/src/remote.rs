//! Document and blob store adapter speaking the relay's framed WebSocket
//! protocol.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use lifelink_core::{
    BLOB_CHUNK_BYTES, MAX_SNAPSHOT_FRAME_BYTES, Message, NewMessage, WriteReceipt,
    wire::{
        BlobChunk, ClientRequest, RequestId, ServerEvent, SubscriptionId, UploadId, WireMessage,
        decode_frame, encode_frame,
    },
};
use tokio::{
    net::TcpStream,
    sync::{mpsc, oneshot},
    time::timeout,
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async_with_config,
    tungstenite::{Message as WsMessage, protocol::WebSocketConfig},
};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::backend::{BackendError, BlobStore, DocumentStore, LiveQuery, UploadProgress};

const MAX_CONNECT_ATTEMPTS: u32 = 3;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
const BACKOFF_BASE_MS: u64 = 200;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Connection to a relay. Cheap to clone; all clones share one socket.
#[derive(Debug, Clone)]
pub struct RelayBackend {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    outbound: mpsc::UnboundedSender<WireMessage>,
    connected: AtomicBool,
    next_id: AtomicU64,
    pending: Mutex<HashMap<RequestId, oneshot::Sender<ServerEvent>>>,
    live_queries: Mutex<HashMap<SubscriptionId, mpsc::UnboundedSender<Vec<Message>>>>,
    uploads: Mutex<HashMap<UploadId, mpsc::UnboundedSender<ServerEvent>>>,
    // Event channels opened when an upload is accepted, waiting for the
    // uploader to pick them up.
    accepted_uploads: Mutex<HashMap<UploadId, mpsc::UnboundedReceiver<ServerEvent>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl RelayBackend {
    /// Connect to the relay WebSocket endpoint, retrying with exponential
    /// backoff. The connection is not re-established once it drops.
    pub async fn connect(server_url: &str) -> Result<Self, BackendError> {
        let url = Url::parse(server_url)
            .map_err(|err| BackendError::Transport(format!("invalid server URL: {err}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(BackendError::Transport(format!(
                "server URL must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }

        let ws_stream = connect_with_retry(server_url).await?;
        info!(server_url, "connected to relay");

        let (write_half, read_half) = ws_stream.split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            outbound: outbound_tx,
            connected: AtomicBool::new(true),
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            live_queries: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
            accepted_uploads: Mutex::new(HashMap::new()),
        });

        tokio::spawn(network_send_task(write_half, outbound_rx));
        tokio::spawn(network_receive_task(read_half, Arc::downgrade(&inner)));

        Ok(Self { inner })
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn send(&self, message: WireMessage) -> Result<(), BackendError> {
        if !self.is_connected() {
            return Err(BackendError::Disconnected);
        }
        self.inner
            .outbound
            .send(message)
            .map_err(|_| BackendError::Disconnected)
    }

    /// Send a request and wait for the event that answers it.
    async fn request(
        &self,
        build: impl FnOnce(RequestId) -> ClientRequest,
    ) -> Result<ServerEvent, BackendError> {
        let request_id = self.next_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        lock(&self.inner.pending).insert(request_id, reply_tx);

        if let Err(err) = self.send(WireMessage::Request(build(request_id))) {
            lock(&self.inner.pending).remove(&request_id);
            return Err(err);
        }
        // The receive task may have drained `pending` before the insert.
        if !self.is_connected() {
            lock(&self.inner.pending).remove(&request_id);
            return Err(BackendError::Disconnected);
        }

        match timeout(REQUEST_TIMEOUT, reply_rx).await {
            Ok(Ok(ServerEvent::Error { message, .. })) => Err(BackendError::Rejected(message)),
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(BackendError::Disconnected),
            Err(_) => {
                lock(&self.inner.pending).remove(&request_id);
                Err(BackendError::TimedOut)
            }
        }
    }

    /// Stream the blob one chunk at a time, waiting for each acknowledgement
    /// before sending the next.
    async fn stream_chunks(
        &self,
        upload_id: UploadId,
        data: &Bytes,
        progress: &mpsc::UnboundedSender<UploadProgress>,
        events: &mut mpsc::UnboundedReceiver<ServerEvent>,
    ) -> Result<(), BackendError> {
        let mut offset = 0_u64;
        for chunk in data.chunks(BLOB_CHUNK_BYTES) {
            self.send(WireMessage::Chunk(BlobChunk {
                upload_id,
                offset,
                data: chunk.to_vec(),
            }))?;
            offset += chunk.len() as u64;

            loop {
                match next_upload_event(events, progress).await? {
                    UploadStep::Progress(transferred) if transferred >= offset => break,
                    UploadStep::Progress(_) => {}
                    UploadStep::Completed => return Ok(()),
                }
            }
        }

        loop {
            if let UploadStep::Completed = next_upload_event(events, progress).await? {
                return Ok(());
            }
        }
    }
}

enum UploadStep {
    Progress(u64),
    Completed,
}

async fn next_upload_event(
    events: &mut mpsc::UnboundedReceiver<ServerEvent>,
    progress: &mpsc::UnboundedSender<UploadProgress>,
) -> Result<UploadStep, BackendError> {
    loop {
        let event = match timeout(REQUEST_TIMEOUT, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => return Err(BackendError::Disconnected),
            Err(_) => return Err(BackendError::TimedOut),
        };
        match event {
            ServerEvent::UploadProgress {
                transferred, total, ..
            } => {
                let _ = progress.send(UploadProgress { transferred, total });
                return Ok(UploadStep::Progress(transferred));
            }
            ServerEvent::UploadCompleted { path, .. } => {
                debug!(path = %path, "upload committed");
                return Ok(UploadStep::Completed);
            }
            ServerEvent::UploadFailed { message, .. } => {
                return Err(BackendError::Rejected(message));
            }
            other => debug!(?other, "ignoring unexpected upload event"),
        }
    }
}

fn unexpected(event: ServerEvent) -> BackendError {
    BackendError::Transport(format!("unexpected reply: {event:?}"))
}

impl DocumentStore for RelayBackend {
    async fn append(&self, message: NewMessage) -> Result<WriteReceipt, BackendError> {
        match self
            .request(|request_id| ClientRequest::Append {
                request_id,
                message,
            })
            .await?
        {
            ServerEvent::Appended { receipt, .. } => Ok(receipt),
            other => Err(unexpected(other)),
        }
    }

    async fn live_query(&self, limit: usize) -> Result<LiveQuery, BackendError> {
        let subscription_id = self.next_id();
        let (snapshot_tx, snapshot_rx) = mpsc::unbounded_channel();
        lock(&self.inner.live_queries).insert(subscription_id, snapshot_tx);

        if let Err(err) = self.send(WireMessage::Request(ClientRequest::Subscribe {
            subscription_id,
            limit,
        })) {
            lock(&self.inner.live_queries).remove(&subscription_id);
            return Err(err);
        }
        debug!(subscription_id, limit, "live query requested");

        let inner = Arc::downgrade(&self.inner);
        Ok(LiveQuery::new(snapshot_rx, move || {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            lock(&inner.live_queries).remove(&subscription_id);
            if inner.connected.load(Ordering::Acquire) {
                let _ = inner
                    .outbound
                    .send(WireMessage::Request(ClientRequest::Unsubscribe {
                        subscription_id,
                    }));
            }
            debug!(subscription_id, "live query released");
        }))
    }
}

impl BlobStore for RelayBackend {
    async fn upload(
        &self,
        path: &str,
        data: Bytes,
        mime_type: &str,
        progress: mpsc::UnboundedSender<UploadProgress>,
    ) -> Result<(), BackendError> {
        let total_bytes = data.len() as u64;
        let upload_id = match self
            .request(|request_id| ClientRequest::BeginUpload {
                request_id,
                path: path.to_owned(),
                total_bytes,
                mime_type: mime_type.to_owned(),
            })
            .await?
        {
            ServerEvent::UploadAccepted { upload_id, .. } => upload_id,
            other => return Err(unexpected(other)),
        };

        let mut events = lock(&self.inner.accepted_uploads)
            .remove(&upload_id)
            .ok_or(BackendError::Disconnected)?;
        debug!(upload_id, path, total_bytes, "upload accepted");

        let result = self
            .stream_chunks(upload_id, &data, &progress, &mut events)
            .await;
        lock(&self.inner.uploads).remove(&upload_id);
        result
    }

    async fn download_url(&self, path: &str) -> Result<String, BackendError> {
        match self
            .request(|request_id| ClientRequest::ResolveUrl {
                request_id,
                path: path.to_owned(),
            })
            .await?
        {
            ServerEvent::UrlResolved { url, .. } => Ok(url),
            other => Err(unexpected(other)),
        }
    }

    async fn delete(&self, path: &str) -> Result<(), BackendError> {
        match self
            .request(|request_id| ClientRequest::DeleteObject {
                request_id,
                path: path.to_owned(),
            })
            .await?
        {
            ServerEvent::ObjectDeleted { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

/// Reads must fit a full live-query window, which can exceed tungstenite's
/// default frame limit.
fn socket_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_frame_size(Some(MAX_SNAPSHOT_FRAME_BYTES))
        .max_message_size(Some(MAX_SNAPSHOT_FRAME_BYTES))
}

async fn connect_with_retry(server_url: &str) -> Result<WsStream, BackendError> {
    let mut attempt: u32 = 1;
    loop {
        info!(
            attempt,
            max_attempts = MAX_CONNECT_ATTEMPTS,
            server_url,
            "connecting"
        );

        let failure = match timeout(
            CONNECT_TIMEOUT,
            connect_async_with_config(server_url, Some(socket_config()), false),
        )
        .await {
            Ok(Ok((ws_stream, _))) => return Ok(ws_stream),
            Ok(Err(err)) => format!("connect failed: {err}"),
            Err(_) => format!("connect timed out after {:?}", CONNECT_TIMEOUT),
        };
        error!(attempt, server_url, "{failure}");
        if attempt >= MAX_CONNECT_ATTEMPTS {
            return Err(BackendError::Transport(failure));
        }

        let backoff_ms = BACKOFF_BASE_MS.saturating_mul(1_u64 << (attempt - 1));
        tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
        attempt += 1;
    }
}

async fn network_send_task(
    mut ws_write: futures::stream::SplitSink<WsStream, WsMessage>,
    mut outgoing_rx: mpsc::UnboundedReceiver<WireMessage>,
) {
    while let Some(message) = outgoing_rx.recv().await {
        match encode_frame(&message) {
            Ok(frame) => {
                if ws_write.send(WsMessage::Binary(frame.into())).await.is_err() {
                    break;
                }
            }
            Err(err) => warn!("failed to encode outgoing frame: {}", err),
        }
    }
    let _ = ws_write.close().await;
}

async fn network_receive_task(mut ws_read: futures::stream::SplitStream<WsStream>, inner: Weak<Inner>) {
    while let Some(next) = ws_read.next().await {
        let message = match next {
            Ok(message) => message,
            Err(err) => {
                warn!("relay read failed: {}", err);
                break;
            }
        };

        let data = match message {
            WsMessage::Binary(data) => data,
            WsMessage::Close(_) => break,
            _ => continue,
        };

        let event = match decode_frame(&data) {
            Ok(WireMessage::Event(event)) => event,
            Ok(other) => {
                warn!(?other, "ignoring non-event frame from relay");
                continue;
            }
            Err(err) => {
                warn!("decode frame failed: {}", err);
                continue;
            }
        };

        let Some(inner) = inner.upgrade() else {
            break;
        };
        dispatch(&inner, event);
    }

    if let Some(inner) = inner.upgrade() {
        inner.connected.store(false, Ordering::Release);
        // Dropping the senders wakes every waiter with a disconnect.
        lock(&inner.pending).clear();
        lock(&inner.live_queries).clear();
        lock(&inner.uploads).clear();
        lock(&inner.accepted_uploads).clear();
    }
    info!("relay connection closed");
}

fn dispatch(inner: &Inner, event: ServerEvent) {
    match event {
        ServerEvent::Snapshot {
            subscription_id,
            messages,
        } => {
            if let Some(tx) = lock(&inner.live_queries).get(&subscription_id) {
                let _ = tx.send(messages);
            }
        }
        ServerEvent::UploadProgress { upload_id, .. }
        | ServerEvent::UploadCompleted { upload_id, .. }
        | ServerEvent::UploadFailed { upload_id, .. } => {
            if let Some(tx) = lock(&inner.uploads).get(&upload_id) {
                let _ = tx.send(event);
            }
        }
        event => {
            if let ServerEvent::UploadAccepted { upload_id, .. } = &event {
                let (tx, rx) = mpsc::unbounded_channel();
                lock(&inner.uploads).insert(*upload_id, tx);
                lock(&inner.accepted_uploads).insert(*upload_id, rx);
            }
            let Some(request_id) = event.request_id() else {
                warn!(?event, "relay reported an error");
                return;
            };
            match lock(&inner.pending).remove(&request_id) {
                Some(reply_tx) => {
                    let _ = reply_tx.send(event);
                }
                None => debug!(request_id, "reply for unknown request"),
            }
        }
    }
}
