use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use axum::{
    Json, Router,
    extract::{
        Path, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use lifelink_core::{
    MAX_RELAY_MESSAGE_BYTES, now_unix_ms,
    wire::{
        BlobChunk, ClientRequest, ServerEvent, SubscriptionId, UploadId, WireMessage,
        decode_frame, encode_frame,
    },
};
use tokio::{
    net::TcpListener,
    sync::{RwLock, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use url::Url;

pub mod store;

use store::{BlobObjects, ChunkOutcome, DocumentLog};

/// Upper bound on a single live query window.
pub const MAX_LIVE_QUERY_LIMIT: usize = 500;

#[derive(Debug, Default)]
struct RelayState {
    log: DocumentLog,
    blobs: BlobObjects,
}

#[derive(Debug, Clone)]
pub struct AppState {
    inner: Arc<RwLock<RelayState>>,
    changes: Arc<watch::Sender<u64>>,
    public_url: Arc<Url>,
    next_connection_id: Arc<AtomicU64>,
}

impl AppState {
    #[must_use]
    pub fn new(public_url: Url) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Arc::new(RwLock::new(RelayState::default())),
            changes: Arc::new(changes),
            public_url: Arc::new(public_url),
            next_connection_id: Arc::new(AtomicU64::new(1)),
        }
    }

    pub async fn message_count(&self) -> usize {
        self.inner.read().await.log.len()
    }

    pub async fn has_object(&self, path: &str) -> bool {
        self.inner.read().await.blobs.contains(path)
    }

    /// Public retrieval URL for a stored object.
    pub fn object_url(&self, path: &str) -> String {
        let mut url = (*self.public_url).clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .push("blobs")
                .extend(path.split('/'));
        }
        url.to_string()
    }

    fn notify_change(&self) {
        self.changes.send_modify(|revision| *revision += 1);
    }
}

#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    refill_per_second: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_per_second: f64) -> Self {
        Self {
            capacity,
            refill_per_second,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn consume(&mut self, amount: f64) -> bool {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        self.tokens =
            (self.tokens + elapsed.as_secs_f64() * self.refill_per_second).min(self.capacity);
        if self.tokens >= amount {
            self.tokens -= amount;
            true
        } else {
            false
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(healthz_handler))
        .route("/blobs/{*path}", get(blob_handler))
        .with_state(state)
}

pub async fn serve(listener: TcpListener, state: AppState) -> Result<(), String> {
    info!(
        "relay listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, build_router(state))
        .await
        .map_err(|err| err.to_string())
}

async fn healthz_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({"ok": true, "messages": state.message_count().await}))
}

async fn blob_handler(Path(path): Path<String>, State(state): State<AppState>) -> Response {
    let object = state.inner.read().await.blobs.get(&path);
    match object {
        Some(object) => (
            [
                (header::CONTENT_TYPE, object.mime_type),
                (header::ETAG, format!("\"{}\"", object.sha256_hex)),
            ],
            object.data,
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.max_frame_size(MAX_RELAY_MESSAGE_BYTES)
        .max_message_size(MAX_RELAY_MESSAGE_BYTES)
        .on_upgrade(move |socket| async move {
            if let Err(err) = handle_socket(state, socket).await {
                warn!("socket session ended with error: {}", err);
            }
        })
}

async fn handle_socket(state: AppState, socket: WebSocket) -> Result<(), String> {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();

    // Pongs queued by the read half only go out when the write half sends,
    // so an idle connection needs periodic pings to stay alive behind proxies.
    const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(KEEPALIVE_INTERVAL);
        ping_interval.tick().await; // skip first immediate tick

        loop {
            tokio::select! {
                msg = outbound_rx.recv() => {
                    match msg {
                        Some(message) => {
                            if ws_sender.send(message).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let connection_id = state.next_connection_id.fetch_add(1, Ordering::Relaxed);
    info!(connection_id, "client connected");

    let mut session = Session::new(connection_id, outbound_tx);
    let mut result = Ok(());

    while let Some(next_message) = ws_receiver.next().await {
        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                result = Err(format!("websocket receive error: {err}"));
                break;
            }
        };

        match message {
            Message::Binary(data) => {
                if data.len() > MAX_RELAY_MESSAGE_BYTES {
                    warn!(connection_id, "dropping oversized message");
                    continue;
                }

                let wire = match decode_frame(&data) {
                    Ok(wire) => wire,
                    Err(err) => {
                        warn!(connection_id, "failed to decode frame: {}", err);
                        continue;
                    }
                };

                match wire {
                    WireMessage::Request(request) => session.handle_request(&state, request).await,
                    WireMessage::Chunk(chunk) => session.handle_chunk(&state, chunk).await,
                    WireMessage::Event(_) => {
                        warn!(connection_id, "unexpected server event from client");
                    }
                }
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) | Message::Text(_) => {}
        }
    }

    session.close(&state).await;
    send_task.abort();
    info!(connection_id, "client disconnected");
    result
}

/// Per-connection bookkeeping: live queries and uploads this client owns.
struct Session {
    connection_id: u64,
    outbound: mpsc::UnboundedSender<Message>,
    live_queries: HashMap<SubscriptionId, JoinHandle<()>>,
    uploads: HashSet<UploadId>,
    append_limiter: TokenBucket,
}

impl Session {
    fn new(connection_id: u64, outbound: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            connection_id,
            outbound,
            live_queries: HashMap::new(),
            uploads: HashSet::new(),
            append_limiter: TokenBucket::new(24.0, 12.0),
        }
    }

    async fn handle_request(&mut self, state: &AppState, request: ClientRequest) {
        match request {
            ClientRequest::Append {
                request_id,
                message,
            } => {
                if !self.append_limiter.consume(1.0) {
                    warn!(connection_id = self.connection_id, "rate limit exceeded");
                    self.send(ServerEvent::Error {
                        request_id: Some(request_id),
                        message: "rate limit exceeded".to_owned(),
                    });
                    return;
                }

                let result = state.inner.write().await.log.append(message, now_unix_ms());
                match result {
                    Ok(receipt) => {
                        debug!(connection_id = self.connection_id, id = %receipt.id, "message appended");
                        self.send(ServerEvent::Appended {
                            request_id,
                            receipt,
                        });
                        state.notify_change();
                    }
                    Err(err) => self.send(ServerEvent::Error {
                        request_id: Some(request_id),
                        message: err.to_string(),
                    }),
                }
            }
            ClientRequest::Subscribe {
                subscription_id,
                limit,
            } => {
                let limit = limit.min(MAX_LIVE_QUERY_LIMIT);
                let task = tokio::spawn(live_query_task(
                    state.clone(),
                    subscription_id,
                    limit,
                    self.outbound.clone(),
                ));
                if let Some(previous) = self.live_queries.insert(subscription_id, task) {
                    previous.abort();
                }
                debug!(connection_id = self.connection_id, subscription_id, limit, "live query started");
            }
            ClientRequest::Unsubscribe { subscription_id } => {
                if let Some(task) = self.live_queries.remove(&subscription_id) {
                    task.abort();
                    debug!(connection_id = self.connection_id, subscription_id, "live query stopped");
                }
            }
            ClientRequest::BeginUpload {
                request_id,
                path,
                total_bytes,
                mime_type,
            } => {
                let result = {
                    let mut relay = state.inner.write().await;
                    relay
                        .blobs
                        .begin_upload(&path, total_bytes, &mime_type)
                        .map(|upload_id| (upload_id, relay.blobs.complete_if_empty(upload_id)))
                };
                match result {
                    Ok((upload_id, completed)) => {
                        info!(connection_id = self.connection_id, upload_id, %path, total_bytes, "upload started");
                        self.send(ServerEvent::UploadAccepted {
                            request_id,
                            upload_id,
                        });
                        if let Some(ChunkOutcome::Completed { path, .. }) = completed {
                            self.send(ServerEvent::UploadCompleted { upload_id, path });
                        } else {
                            self.uploads.insert(upload_id);
                        }
                    }
                    Err(err) => self.send(ServerEvent::Error {
                        request_id: Some(request_id),
                        message: err.to_string(),
                    }),
                }
            }
            ClientRequest::ResolveUrl { request_id, path } => {
                if state.has_object(&path).await {
                    self.send(ServerEvent::UrlResolved {
                        request_id,
                        url: state.object_url(&path),
                    });
                } else {
                    self.send(ServerEvent::Error {
                        request_id: Some(request_id),
                        message: format!("object {path:?} not found"),
                    });
                }
            }
            ClientRequest::DeleteObject { request_id, path } => {
                let result = state.inner.write().await.blobs.delete(&path);
                match result {
                    Ok(()) => {
                        info!(connection_id = self.connection_id, %path, "object deleted");
                        self.send(ServerEvent::ObjectDeleted { request_id });
                    }
                    Err(err) => self.send(ServerEvent::Error {
                        request_id: Some(request_id),
                        message: err.to_string(),
                    }),
                }
            }
        }
    }

    async fn handle_chunk(&mut self, state: &AppState, chunk: BlobChunk) {
        let upload_id = chunk.upload_id;
        if !self.uploads.contains(&upload_id) {
            warn!(connection_id = self.connection_id, upload_id, "chunk for unknown upload");
            return;
        }

        let outcome = state
            .inner
            .write()
            .await
            .blobs
            .apply_chunk(upload_id, chunk.offset, &chunk.data);
        match outcome {
            Ok(ChunkOutcome::Progress { transferred, total }) => {
                self.send(ServerEvent::UploadProgress {
                    upload_id,
                    transferred,
                    total,
                });
            }
            Ok(ChunkOutcome::Completed { path, total }) => {
                self.uploads.remove(&upload_id);
                info!(connection_id = self.connection_id, upload_id, %path, "upload completed");
                self.send(ServerEvent::UploadProgress {
                    upload_id,
                    transferred: total,
                    total,
                });
                self.send(ServerEvent::UploadCompleted { upload_id, path });
            }
            Err(err) => {
                self.uploads.remove(&upload_id);
                state.inner.write().await.blobs.abort_upload(upload_id);
                warn!(connection_id = self.connection_id, upload_id, "upload failed: {}", err);
                self.send(ServerEvent::UploadFailed {
                    upload_id,
                    message: err.to_string(),
                });
            }
        }
    }

    async fn close(self, state: &AppState) {
        for (_, task) in self.live_queries {
            task.abort();
        }
        if !self.uploads.is_empty() {
            let mut relay = state.inner.write().await;
            for upload_id in self.uploads {
                relay.blobs.abort_upload(upload_id);
            }
        }
    }

    fn send(&self, event: ServerEvent) {
        send_event(&self.outbound, event);
    }
}

/// Push the full window now and again after every change to the log.
async fn live_query_task(
    state: AppState,
    subscription_id: SubscriptionId,
    limit: usize,
    outbound: mpsc::UnboundedSender<Message>,
) {
    let mut changes = state.changes.subscribe();
    loop {
        let messages = state.inner.read().await.log.recent(limit);
        if !send_event(
            &outbound,
            ServerEvent::Snapshot {
                subscription_id,
                messages,
            },
        ) {
            break;
        }
        if changes.changed().await.is_err() {
            break;
        }
    }
}

fn send_event(outbound: &mpsc::UnboundedSender<Message>, event: ServerEvent) -> bool {
    let frame = match encode_frame(&WireMessage::Event(event)) {
        Ok(frame) => frame,
        Err(err) => {
            error!("failed to serialize server event: {}", err);
            return true;
        }
    };
    outbound.send(Message::Binary(frame.into())).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_urls_are_rooted_at_public_url() {
        let state = AppState::new(Url::parse("http://127.0.0.1:8080/").unwrap());
        assert_eq!(
            state.object_url("files/u1/1-report final.pdf"),
            "http://127.0.0.1:8080/blobs/files/u1/1-report%20final.pdf"
        );
    }

    #[test]
    fn token_bucket_limits_bursts() {
        let mut bucket = TokenBucket::new(2.0, 0.0);
        assert!(bucket.consume(1.0));
        assert!(bucket.consume(1.0));
        assert!(!bucket.consume(1.0));
    }
}
