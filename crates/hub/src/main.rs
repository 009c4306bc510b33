// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::{error, info};

use timhub::config::Config;

#[tokio::main]
async fn main() {
    let config = Config::parse();
    if let Err(err) = config.validate() {
        eprintln!("error: {err}");
        std::process::exit(2);
    }
    timhub::run::init_logging(&config);

    let hub = match timhub::run::start(&config, timhub::notify::log_notifier()).await {
        Ok(hub) => hub,
        Err(err) => {
            error!("fatal: {err:#}");
            std::process::exit(1);
        }
    };

    wait_for_shutdown().await;
    info!("shutting down");
    hub.stop().await;
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            error!("cannot install SIGTERM handler: {err}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
