use std::time::Duration;

use futures::{SinkExt, StreamExt};
use lifelink_core::{
    DeviceTag, Identity, MESSAGE_WINDOW, Message as ChatMessage, NewMessage,
    wire::{BlobChunk, ClientRequest, ServerEvent, WireMessage, decode_frame, encode_frame},
};
use lifelink_relay::{AppState, build_router};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time::timeout,
};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;
type WsWrite = futures::stream::SplitSink<WsStream, Message>;
type WsRead = futures::stream::SplitStream<WsStream>;

struct TestClient {
    write: WsWrite,
    read: WsRead,
}

struct TestRelay {
    ws_url: String,
    http_addr: String,
    state: AppState,
    shutdown_tx: oneshot::Sender<()>,
}

#[tokio::test]
async fn live_query_pushes_full_window_after_append() {
    let relay = start_relay().await;

    let mut watcher = connect_client(&relay.ws_url).await;
    let mut writer = connect_client(&relay.ws_url).await;

    send_request(
        &mut watcher,
        ClientRequest::Subscribe {
            subscription_id: 1,
            limit: MESSAGE_WINDOW,
        },
    )
    .await;
    let initial = recv_snapshot(&mut watcher, Duration::from_secs(2))
        .await
        .expect("initial snapshot");
    assert!(initial.is_empty());

    send_request(
        &mut writer,
        ClientRequest::Append {
            request_id: 7,
            message: draft("hello"),
        },
    )
    .await;
    let receipt = match recv_event(&mut writer, Duration::from_secs(2)).await {
        Some(ServerEvent::Appended {
            request_id: 7,
            receipt,
        }) => receipt,
        other => panic!("expected append receipt, got {other:?}"),
    };

    let snapshot = recv_snapshot(&mut watcher, Duration::from_secs(2))
        .await
        .expect("snapshot after append");
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].id, receipt.id);
    assert_eq!(snapshot[0].body.as_deref(), Some("hello"));
    assert_eq!(snapshot[0].sent_at, Some(receipt.sent_at));
    assert_eq!(snapshot[0].sender_id, "uid-relay");

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn snapshots_are_newest_first_and_bounded() {
    let relay = start_relay().await;
    let mut client = connect_client(&relay.ws_url).await;

    for index in 0..5_u64 {
        send_request(
            &mut client,
            ClientRequest::Append {
                request_id: index,
                message: draft(&format!("m{index}")),
            },
        )
        .await;
    }
    // Wait until every append is acknowledged.
    let mut acked = 0;
    while acked < 5 {
        match recv_event(&mut client, Duration::from_secs(2)).await {
            Some(ServerEvent::Appended { .. }) => acked += 1,
            Some(_) => {}
            None => panic!("missing append receipt"),
        }
    }

    send_request(
        &mut client,
        ClientRequest::Subscribe {
            subscription_id: 2,
            limit: 3,
        },
    )
    .await;
    let snapshot = recv_snapshot(&mut client, Duration::from_secs(2))
        .await
        .expect("snapshot");
    let bodies: Vec<_> = snapshot.iter().filter_map(|m| m.body.clone()).collect();
    assert_eq!(bodies, vec!["m4", "m3", "m2"]);

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn unsubscribe_stops_snapshots() {
    let relay = start_relay().await;
    let mut watcher = connect_client(&relay.ws_url).await;
    let mut writer = connect_client(&relay.ws_url).await;

    send_request(
        &mut watcher,
        ClientRequest::Subscribe {
            subscription_id: 5,
            limit: 10,
        },
    )
    .await;
    recv_snapshot(&mut watcher, Duration::from_secs(2))
        .await
        .expect("initial snapshot");

    send_request(&mut watcher, ClientRequest::Unsubscribe { subscription_id: 5 }).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    send_request(
        &mut writer,
        ClientRequest::Append {
            request_id: 1,
            message: draft("after unsubscribe"),
        },
    )
    .await;

    let late = recv_snapshot(&mut watcher, Duration::from_millis(400)).await;
    assert!(late.is_none(), "snapshot delivered after unsubscribe");

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn blank_message_is_refused() {
    let relay = start_relay().await;
    let mut client = connect_client(&relay.ws_url).await;

    send_request(
        &mut client,
        ClientRequest::Append {
            request_id: 3,
            message: draft("   "),
        },
    )
    .await;
    match recv_event(&mut client, Duration::from_secs(2)).await {
        Some(ServerEvent::Error {
            request_id: Some(3),
            ..
        }) => {}
        other => panic!("expected error reply, got {other:?}"),
    }
    assert_eq!(relay.state.message_count().await, 0);

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn appends_are_rate_limited() {
    let relay = start_relay().await;
    let mut client = connect_client(&relay.ws_url).await;

    for index in 0..40_u64 {
        send_request(
            &mut client,
            ClientRequest::Append {
                request_id: index,
                message: draft("spam"),
            },
        )
        .await;
    }

    let mut limited = 0;
    let mut accepted = 0;
    while limited + accepted < 40 {
        match recv_event(&mut client, Duration::from_secs(2)).await {
            Some(ServerEvent::Appended { .. }) => accepted += 1,
            Some(ServerEvent::Error { message, .. }) => {
                assert!(message.contains("rate limit"), "unexpected error: {message}");
                limited += 1;
            }
            Some(_) => {}
            None => break,
        }
    }
    assert!(limited > 0, "no append was rate limited");
    assert!(accepted >= 24);

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn malformed_frame_is_dropped_and_connection_survives() {
    let relay = start_relay().await;
    let mut client = connect_client(&relay.ws_url).await;

    client
        .write
        .send(Message::Binary(vec![0xFF, 0x00, 0xAB, 0xCD].into()))
        .await
        .expect("send malformed frame");

    send_request(
        &mut client,
        ClientRequest::Append {
            request_id: 11,
            message: draft("still here"),
        },
    )
    .await;
    match recv_event(&mut client, Duration::from_secs(2)).await {
        Some(ServerEvent::Appended { request_id: 11, .. }) => {}
        other => panic!("expected append receipt, got {other:?}"),
    }

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn oversized_frame_is_not_applied() {
    let relay = start_relay().await;
    let mut client = connect_client(&relay.ws_url).await;

    let oversized = vec![0_u8; lifelink_core::MAX_RELAY_MESSAGE_BYTES + 1];
    let _ = client.write.send(Message::Binary(oversized.into())).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(relay.state.message_count().await, 0);
    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn chunked_upload_is_served_and_deleted() {
    let relay = start_relay().await;
    let mut client = connect_client(&relay.ws_url).await;
    let path = "files/uid-relay/1700000000000-notes.txt";
    let body = b"first half|second half".to_vec();

    send_request(
        &mut client,
        ClientRequest::BeginUpload {
            request_id: 1,
            path: path.to_owned(),
            total_bytes: body.len() as u64,
            mime_type: "text/plain".to_owned(),
        },
    )
    .await;
    let upload_id = match recv_event(&mut client, Duration::from_secs(2)).await {
        Some(ServerEvent::UploadAccepted {
            request_id: 1,
            upload_id,
        }) => upload_id,
        other => panic!("expected upload accepted, got {other:?}"),
    };

    let (first, second) = body.split_at(10);
    send_chunk(&mut client, upload_id, 0, first).await;
    match recv_event(&mut client, Duration::from_secs(2)).await {
        Some(ServerEvent::UploadProgress {
            transferred, total, ..
        }) => {
            assert_eq!(transferred, 10);
            assert_eq!(total, body.len() as u64);
        }
        other => panic!("expected progress, got {other:?}"),
    }

    send_chunk(&mut client, upload_id, 10, second).await;
    let mut completed = false;
    while !completed {
        match recv_event(&mut client, Duration::from_secs(2)).await {
            Some(ServerEvent::UploadProgress { transferred, .. }) => {
                assert_eq!(transferred, body.len() as u64)
            }
            Some(ServerEvent::UploadCompleted { path: done, .. }) => {
                assert_eq!(done, path);
                completed = true;
            }
            other => panic!("unexpected event {other:?}"),
        }
    }
    assert!(relay.state.has_object(path).await);

    send_request(
        &mut client,
        ClientRequest::ResolveUrl {
            request_id: 2,
            path: path.to_owned(),
        },
    )
    .await;
    let url = match recv_event(&mut client, Duration::from_secs(2)).await {
        Some(ServerEvent::UrlResolved { request_id: 2, url }) => url,
        other => panic!("expected url, got {other:?}"),
    };
    let url_path = Url::parse(&url).expect("valid url").path().to_owned();
    let (status, served) = http_get(&relay.http_addr, &url_path).await;
    assert_eq!(status, 200);
    assert_eq!(served, body);

    send_request(
        &mut client,
        ClientRequest::DeleteObject {
            request_id: 3,
            path: path.to_owned(),
        },
    )
    .await;
    match recv_event(&mut client, Duration::from_secs(2)).await {
        Some(ServerEvent::ObjectDeleted { request_id: 3 }) => {}
        other => panic!("expected delete ack, got {other:?}"),
    }
    let (status, _) = http_get(&relay.http_addr, &url_path).await;
    assert_eq!(status, 404);

    let _ = relay.shutdown_tx.send(());
}

#[tokio::test]
async fn chunks_for_another_connections_upload_are_ignored() {
    let relay = start_relay().await;
    let mut owner = connect_client(&relay.ws_url).await;
    let mut intruder = connect_client(&relay.ws_url).await;

    send_request(
        &mut owner,
        ClientRequest::BeginUpload {
            request_id: 1,
            path: "files/u/1-x".to_owned(),
            total_bytes: 3,
            mime_type: "application/octet-stream".to_owned(),
        },
    )
    .await;
    let upload_id = match recv_event(&mut owner, Duration::from_secs(2)).await {
        Some(ServerEvent::UploadAccepted { upload_id, .. }) => upload_id,
        other => panic!("expected upload accepted, got {other:?}"),
    };

    send_chunk(&mut intruder, upload_id, 0, b"abc").await;
    assert!(
        recv_event(&mut intruder, Duration::from_millis(300))
            .await
            .is_none()
    );
    assert!(!relay.state.has_object("files/u/1-x").await);

    let _ = relay.shutdown_tx.send(());
}

fn draft(body: &str) -> NewMessage {
    let sender = Identity {
        uid: "uid-relay".to_owned(),
        display_name: Some("Relay Test".to_owned()),
        email: Some("relay@example.com".to_owned()),
        avatar_url: None,
    };
    NewMessage::text(&sender, body, DeviceTag::Desktop)
}

async fn start_relay() -> TestRelay {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral relay socket");
    let address = listener.local_addr().expect("relay local addr");
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let public_url = Url::parse(&format!("http://{address}")).expect("public url");
    let state = AppState::new(public_url);

    let server = axum::serve(listener, build_router(state.clone())).with_graceful_shutdown(async {
        let _ = shutdown_rx.await;
    });
    tokio::spawn(async move {
        let _ = server.await;
    });

    TestRelay {
        ws_url: format!("ws://{address}/ws"),
        http_addr: address.to_string(),
        state,
        shutdown_tx,
    }
}

async fn connect_client(ws_url: &str) -> TestClient {
    let (ws_stream, _) = connect_async(ws_url).await.expect("connect websocket");
    let (write, read) = ws_stream.split();
    TestClient { write, read }
}

async fn send_request(client: &mut TestClient, request: ClientRequest) {
    let frame = encode_frame(&WireMessage::Request(request)).expect("encode request");
    client
        .write
        .send(Message::Binary(frame.into()))
        .await
        .expect("send request");
}

async fn send_chunk(client: &mut TestClient, upload_id: u64, offset: u64, data: &[u8]) {
    let frame = encode_frame(&WireMessage::Chunk(BlobChunk {
        upload_id,
        offset,
        data: data.to_vec(),
    }))
    .expect("encode chunk");
    client
        .write
        .send(Message::Binary(frame.into()))
        .await
        .expect("send chunk");
}

async fn recv_snapshot(client: &mut TestClient, wait: Duration) -> Option<Vec<ChatMessage>> {
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        let remaining = deadline.checked_duration_since(tokio::time::Instant::now())?;
        match recv_event(client, remaining).await {
            Some(ServerEvent::Snapshot { messages, .. }) => return Some(messages),
            Some(_) => continue,
            None => return None,
        }
    }
}

async fn recv_event(client: &mut TestClient, wait: Duration) -> Option<ServerEvent> {
    let next = timeout(wait, client.read.next()).await.ok()?;
    let ws_result = next?;
    let message = ws_result.ok()?;

    match message {
        Message::Binary(bytes) => match decode_frame(&bytes).ok()? {
            WireMessage::Event(event) => Some(event),
            _ => None,
        },
        _ => None,
    }
}

async fn http_get(addr: &str, path: &str) -> (u16, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).await.expect("connect http");
    let request = format!("GET {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n\r\n");
    stream
        .write_all(request.as_bytes())
        .await
        .expect("write http request");

    let mut raw = Vec::new();
    stream
        .read_to_end(&mut raw)
        .await
        .expect("read http response");

    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("http header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).to_string();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .expect("http status code");
    (status, raw[split + 4..].to_vec())
}
