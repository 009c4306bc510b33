// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Loopback dual-protocol server.
//!
//! One TCP endpoint speaks plain HTTP/1.1 (`POST /messages`) and upgrades
//! `GET /tim-agent` to WebSocket. No HTTP framework sits in this path; the
//! parser in [`http`] and the codec in [`frame`] are the whole stack.
//! Decoded traffic is forwarded as [`ServerEvent`]s on a single channel so
//! session-state mutation stays serialized downstream.

pub mod conn;
pub mod frame;
pub mod http;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use conn::WsConnection;

use crate::error::SendError;
use crate::protocol::{AgentBound, MessagePayload};

/// Default loopback port.
pub const DEFAULT_PORT: u16 = 8123;

/// Traffic surfaced by the server, in arrival order per connection.
#[derive(Debug)]
pub enum ServerEvent {
    /// One WebSocket text message from an agent.
    Message { connection_id: String, text: String },
    /// The agent's socket is gone; fired exactly once per connection.
    Disconnected { connection_id: String },
    /// A `POST /messages` notification.
    Notification { payload: MessagePayload },
}

/// The loopback listener plus the live-connection registry.
pub struct Server {
    registry: RwLock<HashMap<String, Arc<WsConnection>>>,
    events_tx: mpsc::Sender<ServerEvent>,
    cancel: CancellationToken,
    started: AtomicBool,
    bound_port: AtomicU16,
}

impl Server {
    pub fn new(events_tx: mpsc::Sender<ServerEvent>) -> Arc<Self> {
        Arc::new(Self {
            registry: RwLock::new(HashMap::new()),
            events_tx,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            bound_port: AtomicU16::new(0),
        })
    }

    /// Bind the loopback listener and start accepting. Pass port 0 for an
    /// ephemeral port. Calling `start` again is a no-op returning the
    /// already-bound port.
    pub async fn start(self: &Arc<Self>, port: u16) -> anyhow::Result<u16> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(self.bound_port.load(Ordering::Acquire));
        }

        let listener = match TcpListener::bind(("127.0.0.1", port)).await {
            Ok(listener) => listener,
            Err(err) => {
                self.started.store(false, Ordering::Release);
                return Err(err).with_context(|| format!("cannot listen on 127.0.0.1:{port}"));
            }
        };
        let bound = listener.local_addr().context("listener has no local address")?.port();
        self.bound_port.store(bound, Ordering::Release);
        info!(port = bound, "listening for agents");

        let server = Arc::clone(self);
        tokio::spawn(server.accept_loop(listener));
        Ok(bound)
    }

    /// Port actually bound, once `start` has succeeded.
    pub fn bound_port(&self) -> Option<u16> {
        match self.bound_port.load(Ordering::Acquire) {
            0 => None,
            port => Some(port),
        }
    }

    /// Serialize an envelope onto a connection's writer.
    pub fn send(&self, connection_id: &str, envelope: &AgentBound) -> Result<(), SendError> {
        let conn = {
            let registry = self.registry.read().map_err(|_| SendError::Transport)?;
            registry.get(connection_id).cloned().ok_or(SendError::Transport)?
        };
        let text = serde_json::to_string(envelope).map_err(|_| SendError::Transport)?;
        conn.send_text(&text)
    }

    /// Forget a connection after its disconnect event was observed.
    pub fn drop_connection(&self, connection_id: &str) {
        if let Ok(mut registry) = self.registry.write() {
            registry.remove(connection_id);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Cancel the listener and every live connection. Each connection's
    /// disconnect event still fires exactly once.
    pub fn stop(&self) {
        self.cancel.cancel();
        if let Ok(mut registry) = self.registry.write() {
            registry.clear();
        }
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let server = Arc::clone(&self);
                        tokio::spawn(server.handle_client(stream));
                    }
                    Err(err) => {
                        warn!(%err, "accept failed");
                    }
                },
            }
        }
    }

    async fn handle_client(self: Arc<Self>, mut stream: TcpStream) {
        let request = match http::read_request(&mut stream).await {
            Ok(request) => request,
            Err(err) => {
                debug!(?err, "rejecting malformed request");
                respond(stream, 400, "Bad Request", "{\"error\":\"Bad request\"}").await;
                return;
            }
        };

        match (request.method.as_str(), request.path.as_str()) {
            ("GET", "/tim-agent") if wants_upgrade(&request) => {
                let Some(key) = request.header("sec-websocket-key") else {
                    respond(stream, 400, "Bad Request", "{\"error\":\"Bad request\"}").await;
                    return;
                };
                self.upgrade(stream, key.to_owned(), request.leftover);
            }
            ("POST", "/messages") => {
                if request.body.is_empty() {
                    respond(stream, 400, "Bad Request", "{\"error\":\"Missing body\"}").await;
                    return;
                }
                match serde_json::from_slice::<MessagePayload>(&request.body) {
                    Ok(payload) => {
                        let _ = self.events_tx.send(ServerEvent::Notification { payload }).await;
                        respond(stream, 200, "OK", "{\"status\":\"ok\"}").await;
                    }
                    Err(err) => {
                        debug!(%err, "undecodable notification body");
                        respond(stream, 400, "Bad Request", "{\"error\":\"Bad request\"}").await;
                    }
                }
            }
            _ => {
                respond(stream, 404, "Not Found", "{\"error\":\"Not found\"}").await;
            }
        }
    }

    /// Hand the socket to a WebSocket connection; the 101 response is the
    /// writer's first flush, ahead of any data frame.
    fn upgrade(&self, stream: TcpStream, key: String, leftover: Vec<u8>) {
        let connection_id = uuid::Uuid::new_v4().to_string();
        let response = http::upgrade_response(&frame::accept_key(&key));
        let conn = WsConnection::spawn(
            connection_id.clone(),
            stream,
            leftover,
            response,
            self.events_tx.clone(),
            &self.cancel,
        );
        if let Ok(mut registry) = self.registry.write() {
            registry.insert(connection_id.clone(), conn);
        }
        info!(connection = %connection_id, "agent connected");
    }
}

fn wants_upgrade(request: &http::Request) -> bool {
    request
        .header("upgrade")
        .map(|v| v.to_ascii_lowercase().split(',').any(|t| t.trim() == "websocket"))
        .unwrap_or(false)
}

async fn respond(mut stream: TcpStream, status: u16, reason: &str, body: &str) {
    let bytes = http::json_response(status, reason, body);
    let _ = stream.write_all(&bytes).await;
    let _ = stream.shutdown().await;
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
