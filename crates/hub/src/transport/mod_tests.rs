// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use super::{Server, ServerEvent};

async fn start_server() -> (Arc<Server>, u16, mpsc::Receiver<ServerEvent>) {
    let (events_tx, events_rx) = mpsc::channel(64);
    let server = Server::new(events_tx);
    let port = server.start(0).await.unwrap();
    (server, port, events_rx)
}

/// One-shot HTTP exchange; the server closes the socket after responding.
async fn http_roundtrip(port: u16, raw: &str) -> String {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(raw.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    String::from_utf8(response).unwrap()
}

fn encode_masked_text(payload: &[u8]) -> Vec<u8> {
    let mask = [3, 1, 4, 1];
    let mut frame = vec![0x81, 0x80 | payload.len() as u8];
    frame.extend_from_slice(&mask);
    frame.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
    frame
}

#[tokio::test]
async fn post_messages_dispatches_notification() {
    let (_server, port, mut events) = start_server().await;
    let body = "{\"message\":\"Build done\",\"workspacePath\":\"/work/app\",\
                \"terminal\":{\"type\":\"tmux\",\"pane_id\":\"%5\"}}";
    let raw = format!(
        "POST /messages HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    );
    let response = http_roundtrip(port, &raw).await;
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.ends_with("{\"status\":\"ok\"}"));

    match tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(ServerEvent::Notification { payload }) => {
            assert_eq!(payload.message, "Build done");
            assert_eq!(payload.workspace_path, "/work/app");
            assert_eq!(payload.terminal.unwrap().pane_id, "%5");
        }
        other => panic!("expected notification, got {other:?}"),
    }
}

#[tokio::test]
async fn post_without_body_is_missing_body() {
    let (_server, port, _events) = start_server().await;
    let response =
        http_roundtrip(port, "POST /messages HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(response.ends_with("{\"error\":\"Missing body\"}"));
}

#[tokio::test]
async fn undecodable_body_is_bad_request() {
    let (_server, port, _events) = start_server().await;
    let response = http_roundtrip(
        port,
        "POST /messages HTTP/1.1\r\nContent-Length: 9\r\n\r\nnot JSON!",
    )
    .await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    assert!(response.ends_with("{\"error\":\"Bad request\"}"));
}

#[tokio::test]
async fn malformed_request_line_is_bad_request() {
    let (_server, port, _events) = start_server().await;
    let response = http_roundtrip(port, "NONSENSE\r\n\r\n").await;
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

#[tokio::test]
async fn unknown_routes_are_not_found() {
    let (_server, port, _events) = start_server().await;
    for raw in [
        "GET /health HTTP/1.1\r\n\r\n",
        "DELETE /messages HTTP/1.1\r\n\r\n",
        "GET /tim-agent HTTP/1.1\r\n\r\n",
    ] {
        let response = http_roundtrip(port, raw).await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "for {raw:?}");
        assert!(response.ends_with("{\"error\":\"Not found\"}"));
    }
}

#[tokio::test]
async fn upgrade_computes_rfc_accept_key() {
    let (_server, port, mut events) = start_server().await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(
            b"GET /tim-agent HTTP/1.1\r\n\
              Host: 127.0.0.1\r\n\
              Upgrade: websocket\r\n\
              Connection: Upgrade\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
              Sec-WebSocket-Version: 13\r\n\r\n",
        )
        .await
        .unwrap();

    let mut buf = Vec::new();
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        let mut chunk = [0u8; 1024];
        let n = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut chunk))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0);
        buf.extend_from_slice(&chunk[..n]);
    }
    let head = String::from_utf8(buf).unwrap();
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
    assert!(head.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));

    // First agent frame flows through to the event channel.
    stream.write_all(&encode_masked_text(b"{\"type\":\"replay_start\"}")).await.unwrap();
    match tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(ServerEvent::Message { text, .. }) => {
            assert_eq!(text, "{\"type\":\"replay_start\"}");
        }
        other => panic!("expected message, got {other:?}"),
    }
}

#[tokio::test]
async fn start_is_idempotent() {
    let (server, port, _events) = start_server().await;
    assert_eq!(server.start(0).await.unwrap(), port);
    assert_eq!(server.bound_port(), Some(port));
}

#[tokio::test]
async fn occupied_port_is_a_start_error() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = taken.local_addr().unwrap().port();

    let (events_tx, _events_rx) = mpsc::channel(8);
    let server = Server::new(events_tx);
    let err = server.start(port).await.unwrap_err();
    assert!(err.to_string().contains(&port.to_string()));

    // A failed bind does not latch the started flag.
    let retry = server.start(0).await;
    assert!(retry.is_ok());
}

#[tokio::test]
async fn stop_disconnects_live_connections() {
    let (server, port, mut events) = start_server().await;
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream
        .write_all(
            b"GET /tim-agent HTTP/1.1\r\nUpgrade: websocket\r\n\
              Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .await
        .unwrap();

    // Wait for the registry to hold the connection.
    tokio::time::timeout(Duration::from_secs(2), async {
        while server.connection_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    server.stop();
    match tokio::time::timeout(Duration::from_secs(2), events.recv()).await.unwrap() {
        Some(ServerEvent::Disconnected { .. }) => {}
        other => panic!("expected disconnect, got {other:?}"),
    }
}
