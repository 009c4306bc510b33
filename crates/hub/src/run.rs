// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Top-level wiring — shared by `main` and integration tests.
//!
//! Builds the loopback server, the session aggregator and the tracking
//! store, then runs the dispatcher task that pumps server events into the
//! aggregator in arrival order. The dispatcher is the single consumer of
//! the event channel, which is what serializes all session-state mutation.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::notify::Notifier;
use crate::protocol::decode_headless;
use crate::session::SessionAggregator;
use crate::tracking::TrackingStore;
use crate::transport::{Server, ServerEvent};

/// A started hub: server, aggregator and tracking store, fully wired.
pub struct Hub {
    pub server: Arc<Server>,
    pub aggregator: Arc<SessionAggregator>,
    pub tracking: TrackingStore,
    tracking_started: bool,
}

/// Initialize tracing once, honoring `RUST_LOG` when set.
pub fn init_logging(config: &Config) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = if config.log_format == "json" {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = result {
        debug!(%err, "logging already initialized");
    }
}

/// Bind the server and wire everything together.
///
/// The send hook is installed after a successful bind, so the aggregator
/// can never route output to a transport that does not exist yet.
pub async fn start(config: &Config, notifier: Arc<dyn Notifier>) -> anyhow::Result<Hub> {
    let (events_tx, events_rx) = mpsc::channel(256);
    let server = Server::new(events_tx);
    let aggregator = Arc::new(SessionAggregator::new(notifier));

    server.start(config.port).await?;

    let hook_server = Arc::clone(&server);
    aggregator.install_send_hook(Arc::new(move |connection_id, envelope| {
        hook_server.send(connection_id, envelope)
    }));

    tokio::spawn(dispatch(events_rx, Arc::clone(&server), Arc::clone(&aggregator)));

    let tracking =
        TrackingStore::with_interval(config.database_path(), config.refresh_interval());
    let tracking_started = !config.no_tracking;
    if tracking_started {
        tracking.acquire().await;
    }

    Ok(Hub { server, aggregator, tracking, tracking_started })
}

impl Hub {
    pub fn bound_port(&self) -> Option<u16> {
        self.server.bound_port()
    }

    /// Orderly shutdown: every live connection fires its disconnect event
    /// exactly once, then the tracking loop stops.
    pub async fn stop(&self) {
        self.server.stop();
        if self.tracking_started {
            self.tracking.release().await;
        }
    }
}

/// Pump server events into the aggregator, preserving arrival order.
async fn dispatch(
    mut events_rx: mpsc::Receiver<ServerEvent>,
    server: Arc<Server>,
    aggregator: Arc<SessionAggregator>,
) {
    while let Some(event) = events_rx.recv().await {
        match event {
            ServerEvent::Message { connection_id, text } => {
                if let Some(envelope) = decode_headless(&text) {
                    aggregator.apply_envelope(&connection_id, envelope).await;
                }
            }
            ServerEvent::Disconnected { connection_id } => {
                server.drop_connection(&connection_id);
                aggregator.mark_disconnected(&connection_id).await;
            }
            ServerEvent::Notification { payload } => {
                aggregator.ingest_notification(payload).await;
            }
        }
    }
}
