// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::tracking::db;

/// Loopback companion hub for headless Tim agents.
#[derive(Debug, Parser)]
#[command(name = "timhub", version, about)]
pub struct Config {
    /// TCP port for the loopback endpoint (0 picks an ephemeral port).
    #[arg(long, env = "TIM_PORT", default_value_t = crate::transport::DEFAULT_PORT)]
    pub port: u16,

    /// Tracking database path. Default: platform config dir discovery.
    #[arg(long, env = "TIM_DATABASE_PATH")]
    pub database: Option<PathBuf>,

    /// Tracking refresh interval in seconds.
    #[arg(long, env = "TIM_REFRESH_INTERVAL", default_value = "10")]
    pub refresh_interval: u64,

    /// Disable the tracking projection entirely.
    #[arg(long, env = "TIM_NO_TRACKING")]
    pub no_tracking: bool,

    /// Log format (json or text).
    #[arg(long, env = "TIM_LOG_FORMAT", default_value = "text")]
    pub log_format: String,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "TIM_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Config {
    /// Validate the configuration after parsing.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.log_format.as_str() {
            "json" | "text" => {}
            other => anyhow::bail!("invalid log format: {other}"),
        }
        if self.refresh_interval == 0 {
            anyhow::bail!("refresh interval must be at least 1 second");
        }
        Ok(())
    }

    /// Resolved tracking database location.
    pub fn database_path(&self) -> PathBuf {
        self.database.clone().unwrap_or_else(db::database_path)
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
