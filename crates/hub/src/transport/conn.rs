// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One WebSocket connection: read loop, fragment reassembly, ping/pong,
//! close handshake, and a single serialized writer task.
//!
//! Lifecycle is `Upgrading → Open → Closing → Closed`. The 101 response is
//! the writer task's first write, so it always flushes before any data
//! frame (the writer is the only task that touches the socket's write
//! half). A compare-and-swap on `closed` guarantees the disconnect event
//! fires exactly once no matter which path ends the connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::SendError;
use crate::transport::frame::{self, Frame, Opcode, ProtocolError, MAX_PAYLOAD};
use crate::transport::ServerEvent;

/// Commands for the writer task. `Close` writes its bytes (if any), shuts
/// the socket down and ends the task.
enum WriteCmd {
    Frame(Vec<u8>),
    Close(Vec<u8>),
}

/// Handle to a live WebSocket connection.
pub struct WsConnection {
    pub id: String,
    writer_tx: mpsc::Sender<WriteCmd>,
    events_tx: mpsc::Sender<ServerEvent>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl WsConnection {
    /// Take ownership of an upgraded socket and start the read and writer
    /// tasks. `leftover` is the post-header tail of the HTTP parse buffer;
    /// `response` is the serialized 101 reply, flushed before anything else.
    pub fn spawn<S>(
        id: String,
        socket: S,
        leftover: Vec<u8>,
        response: Vec<u8>,
        events_tx: mpsc::Sender<ServerEvent>,
        parent: &CancellationToken,
    ) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(socket);
        let (writer_tx, writer_rx) = mpsc::channel(64);

        let conn = Arc::new(Self {
            id,
            writer_tx,
            events_tx,
            closed: AtomicBool::new(false),
            cancel: parent.child_token(),
        });

        tokio::spawn(Arc::clone(&conn).write_loop(writer, writer_rx, response));
        tokio::spawn(Arc::clone(&conn).read_loop(reader, leftover));

        conn
    }

    /// Enqueue one text frame. Ordering across calls is preserved by the
    /// writer channel.
    pub fn send_text(&self, text: &str) -> Result<(), SendError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SendError::Transport);
        }
        let bytes = frame::encode(Opcode::Text, text.as_bytes());
        self.writer_tx.try_send(WriteCmd::Frame(bytes)).map_err(|_| SendError::Transport)
    }

    /// Close the connection with a normal-closure frame. Safe to call more
    /// than once; only the first call has any effect.
    pub async fn close(&self) {
        self.finish(frame::encode_close(1000)).await;
    }

    /// Terminal transition. The CAS makes every shutdown path converge on a
    /// single disconnect event and a single writer teardown.
    async fn finish(&self, close_bytes: Vec<u8>) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.writer_tx.send(WriteCmd::Close(close_bytes)).await;
        self.cancel.cancel();
        let _ = self.events_tx.send(ServerEvent::Disconnected { connection_id: self.id.clone() }).await;
    }

    async fn protocol_violation(&self, err: ProtocolError) {
        debug!(connection = %self.id, %err, code = err.close_code(), "websocket protocol violation");
        self.finish(frame::encode_close(err.close_code())).await;
    }

    async fn write_loop<W>(
        self: Arc<Self>,
        mut writer: W,
        mut rx: mpsc::Receiver<WriteCmd>,
        response: Vec<u8>,
    ) where
        W: AsyncWrite + Send + Unpin,
    {
        if writer.write_all(&response).await.is_err() || writer.flush().await.is_err() {
            self.finish(Vec::new()).await;
            return;
        }

        while let Some(cmd) = rx.recv().await {
            match cmd {
                WriteCmd::Frame(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        self.finish(Vec::new()).await;
                        return;
                    }
                }
                WriteCmd::Close(bytes) => {
                    if !bytes.is_empty() {
                        let _ = writer.write_all(&bytes).await;
                    }
                    let _ = writer.shutdown().await;
                    return;
                }
            }
        }
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: R, leftover: Vec<u8>)
    where
        R: AsyncRead + Send + Unpin,
    {
        let mut buf = leftover;
        let mut fragments: Vec<u8> = Vec::new();
        let mut fragment_opcode: Option<Opcode> = None;

        loop {
            // Drain every complete frame already buffered.
            loop {
                match frame::decode(&buf) {
                    Err(err) => {
                        self.protocol_violation(err).await;
                        return;
                    }
                    Ok(None) => break,
                    Ok(Some((parsed, consumed))) => {
                        buf.drain(..consumed);
                        if !self.handle_frame(parsed, &mut fragments, &mut fragment_opcode).await {
                            return;
                        }
                    }
                }
            }

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.finish(frame::encode_close(1001)).await;
                    return;
                }
                read = reader.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        self.finish(Vec::new()).await;
                        return;
                    }
                    Ok(_) => {}
                    Err(err) => {
                        trace!(connection = %self.id, %err, "socket read error");
                        self.finish(Vec::new()).await;
                        return;
                    }
                },
            }
        }
    }

    /// Apply one frame. Returns `false` once the connection is finished.
    async fn handle_frame(
        &self,
        parsed: Frame,
        fragments: &mut Vec<u8>,
        fragment_opcode: &mut Option<Opcode>,
    ) -> bool {
        match parsed.opcode {
            Opcode::Text | Opcode::Binary => {
                if fragment_opcode.is_some() {
                    self.protocol_violation(ProtocolError::NestedFragment).await;
                    return false;
                }
                if parsed.opcode == Opcode::Binary {
                    self.protocol_violation(ProtocolError::BinaryUnsupported).await;
                    return false;
                }
                if parsed.fin {
                    return self.deliver_text(parsed.payload).await;
                }
                *fragment_opcode = Some(parsed.opcode);
                *fragments = parsed.payload;
                true
            }
            Opcode::Continuation => {
                if fragment_opcode.is_none() {
                    self.protocol_violation(ProtocolError::StrayContinuation).await;
                    return false;
                }
                if fragments.len() + parsed.payload.len() > MAX_PAYLOAD {
                    let total = (fragments.len() + parsed.payload.len()) as u64;
                    self.protocol_violation(ProtocolError::PayloadTooLarge(total)).await;
                    return false;
                }
                fragments.extend_from_slice(&parsed.payload);
                if parsed.fin {
                    *fragment_opcode = None;
                    let message = std::mem::take(fragments);
                    return self.deliver_text(message).await;
                }
                true
            }
            Opcode::Ping => {
                let pong = frame::encode(Opcode::Pong, &parsed.payload);
                let _ = self.writer_tx.try_send(WriteCmd::Frame(pong));
                true
            }
            Opcode::Pong => true,
            Opcode::Close => {
                if let Err(err) = frame::validate_close(&parsed.payload) {
                    self.protocol_violation(err).await;
                    return false;
                }
                // Echo the peer's payload verbatim, then disconnect.
                let echo = frame::encode(Opcode::Close, &parsed.payload);
                self.finish(echo).await;
                false
            }
        }
    }

    async fn deliver_text(&self, payload: Vec<u8>) -> bool {
        let text = match frame::utf8_text(payload) {
            Ok(text) => text,
            Err(err) => {
                self.protocol_violation(err).await;
                return false;
            }
        };
        self.events_tx
            .send(ServerEvent::Message { connection_id: self.id.clone(), text })
            .await
            .is_ok()
    }
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("id", &self.id)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
#[path = "conn_tests.rs"]
mod tests;
