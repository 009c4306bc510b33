// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! OS user-notification sink.
//!
//! The aggregator only ever calls `notify(title, body)`; actual delivery
//! (notification center, dbus, toast) lives outside the core. The default
//! sink logs through `tracing` so headless runs still surface banners.

use std::sync::Arc;

/// Abstract user-notification sink. Implementations must not block.
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, body: &str);
}

/// Default sink: emit the banner on the log stream.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, body: &str) {
        tracing::info!(title, body, "user notification");
    }
}

/// Sink that records deliveries; used by tests to assert on banners.
#[derive(Default)]
pub struct RecordingNotifier {
    pub delivered: std::sync::Mutex<Vec<(String, String)>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, body: &str) {
        if let Ok(mut delivered) = self.delivered.lock() {
            delivered.push((title.to_owned(), body.to_owned()));
        }
    }
}

/// Convenience constructor for the default sink.
pub fn log_notifier() -> Arc<dyn Notifier> {
    Arc::new(LogNotifier)
}
