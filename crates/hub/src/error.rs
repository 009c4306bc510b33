// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error codes for outgoing sends from the aggregator to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendError {
    /// No session with the given id.
    UnknownSession,
    /// The session exists but has no live WebSocket.
    InactiveSession,
    /// No transport send hook has been registered yet.
    NoHandler,
    /// The connection's writer is gone (socket already closing).
    Transport,
}

impl SendError {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownSession => "UNKNOWN_SESSION",
            Self::InactiveSession => "INACTIVE_SESSION",
            Self::NoHandler => "NO_HANDLER",
            Self::Transport => "TRANSPORT",
        }
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for SendError {}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
