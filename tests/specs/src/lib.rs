// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end spec tests.
//!
//! Starts an in-process hub on an ephemeral loopback port and exercises it
//! exactly as a headless agent would: tungstenite for the WebSocket side,
//! raw TCP for the HTTP side.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use timhub::config::Config;
use timhub::notify::RecordingNotifier;
use timhub::run::{self, Hub};
use timhub::session::Session;

pub type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// An in-process hub plus the recording notification sink.
pub struct TestHub {
    pub hub: Hub,
    pub port: u16,
    pub notifier: Arc<RecordingNotifier>,
}

/// Start a hub on an ephemeral port with tracking disabled.
pub async fn start_hub() -> anyhow::Result<TestHub> {
    let config = Config::try_parse_from(["timhub", "--port", "0", "--no-tracking"])?;
    let notifier = Arc::new(RecordingNotifier::default());
    let sink: Arc<dyn timhub::notify::Notifier> = notifier.clone();
    let hub = run::start(&config, sink).await?;
    let port = hub.bound_port().ok_or_else(|| anyhow::anyhow!("no bound port"))?;
    Ok(TestHub { hub, port, notifier })
}

/// Connect a fake agent to the hub's WebSocket endpoint.
pub async fn connect_agent(port: u16) -> anyhow::Result<AgentSocket> {
    let (socket, response) =
        tokio_tungstenite::connect_async(format!("ws://127.0.0.1:{port}/tim-agent")).await?;
    anyhow::ensure!(response.status().as_u16() == 101, "expected 101 upgrade");
    Ok(socket)
}

/// Send one JSON envelope as a text frame.
pub async fn send_json(socket: &mut AgentSocket, value: serde_json::Value) -> anyhow::Result<()> {
    socket.send(Message::text(value.to_string())).await?;
    Ok(())
}

/// Read frames until the next text message, skipping ping/pong.
pub async fn next_text(socket: &mut AgentSocket) -> anyhow::Result<String> {
    let deadline = Duration::from_secs(3);
    loop {
        let frame = tokio::time::timeout(deadline, socket.next())
            .await?
            .ok_or_else(|| anyhow::anyhow!("socket closed"))?;
        match frame? {
            Message::Text(text) => return Ok(text.to_string()),
            Message::Ping(_) | Message::Pong(_) => {}
            other => anyhow::bail!("unexpected frame: {other:?}"),
        }
    }
}

/// Poll the aggregator until `pred` holds or a 3s deadline passes.
pub async fn wait_for_sessions(
    hub: &TestHub,
    pred: impl Fn(&[Session]) -> bool,
) -> anyhow::Result<Vec<Session>> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    loop {
        let sessions = hub.hub.aggregator.sessions().await;
        if pred(&sessions) {
            return Ok(sessions);
        }
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not reached; sessions: {sessions:#?}");
        }
        tokio::time::sleep(Duration::from_millis(15)).await;
    }
}

/// One-shot HTTP exchange against the loopback endpoint.
pub async fn http_roundtrip(port: u16, raw: String) -> anyhow::Result<String> {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).await?;
    stream.write_all(raw.as_bytes()).await?;
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), stream.read_to_end(&mut response)).await??;
    Ok(String::from_utf8(response)?)
}

/// `POST /messages` with a JSON body.
pub async fn post_messages(port: u16, body: serde_json::Value) -> anyhow::Result<String> {
    let body = body.to_string();
    http_roundtrip(
        port,
        format!(
            "POST /messages HTTP/1.1\r\nHost: 127.0.0.1\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        ),
    )
    .await
}
