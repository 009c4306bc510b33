// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Presentation-independent session messages.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One rendered entry in a session's message log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionMessage {
    pub seq: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Body>,
    pub category: Category,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl SessionMessage {
    /// Plain text content, for either text or monospaced bodies.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            Some(Body::Text { text }) | Some(Body::Monospaced { text }) => Some(text),
            _ => None,
        }
    }
}

/// Message body. A closed sum; the UI picks the rendering per variant.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    Text { text: String },
    Monospaced { text: String },
    TodoList { items: Vec<TodoItem> },
    FileChanges { files: Vec<FileChange> },
    KeyValuePairs { pairs: Vec<KeyValue> },
}

impl Body {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn mono(text: impl Into<String>) -> Self {
        Self::Monospaced { text: text.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TodoItem {
    pub label: String,
    pub status: TodoStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Completed,
    InProgress,
    Pending,
    Blocked,
    Unknown,
}

impl TodoStatus {
    /// Map a wire status string; anything outside the known set is `Unknown`.
    pub fn from_wire(status: &str) -> Self {
        match status {
            "completed" => Self::Completed,
            "in_progress" => Self::InProgress,
            "pending" => Self::Pending,
            "blocked" => Self::Blocked,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileChange {
    pub path: String,
    pub kind: FileChangeKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Added,
    Updated,
    Removed,
    Unknown,
}

impl FileChangeKind {
    pub fn from_wire(kind: &str) -> Self {
        match kind {
            "added" => Self::Added,
            "updated" => Self::Updated,
            "removed" => Self::Removed,
            _ => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self { key: key.into(), value: value.into() }
    }
}

/// Coarse message class used for filtering and styling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Lifecycle,
    LlmOutput,
    ToolUse,
    FileChange,
    Command,
    Progress,
    Error,
    Log,
    UserInput,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lifecycle => "lifecycle",
            Self::LlmOutput => "llm_output",
            Self::ToolUse => "tool_use",
            Self::FileChange => "file_change",
            Self::Command => "command",
            Self::Progress => "progress",
            Self::Error => "error",
            Self::Log => "log",
            Self::UserInput => "user_input",
        }
    }
}
