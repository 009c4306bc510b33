// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Wire types for the agent tunnel.
//!
//! Internally-tagged JSON enums (`{"type": "output", ...}`) at three
//! layers: the outer `HeadlessMessage` envelope, the `TunnelMessage`
//! stream inside `output`, and the `StructuredPayload` alphabet inside
//! `structured`. Unknown outer types are logged once per process and
//! dropped; unknown structured types survive as [`StructuredPayload::
//! Unknown`] so a misbehaving agent never stalls the stream.

pub mod format;
pub mod value;

use std::collections::BTreeSet;
use std::sync::{Mutex, OnceLock};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub use value::{json_to_string, PromptResponseValue};

/// Identity block sent by an agent right after the upgrade.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionInfo {
    pub command: String,
    pub plan_id: Option<i64>,
    pub plan_title: Option<String>,
    pub workspace_path: Option<String>,
    pub git_remote: Option<String>,
    pub terminal_type: Option<String>,
    pub terminal_pane_id: Option<String>,
}

impl SessionInfo {
    /// Terminal reference, present iff a pane id was sent.
    pub fn terminal(&self) -> Option<TerminalRef> {
        self.terminal_pane_id.as_ref().map(|pane_id| TerminalRef {
            kind: self.terminal_type.clone().unwrap_or_else(|| "unknown".to_owned()),
            pane_id: pane_id.clone(),
        })
    }
}

/// Terminal pane reference shared by session identity and notifications.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TerminalRef {
    #[serde(rename = "type")]
    pub kind: String,
    pub pane_id: String,
}

/// Body of `POST /messages`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MessagePayload {
    pub message: String,
    pub workspace_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub terminal: Option<TerminalRef>,
}

/// Outer envelope: one JSON object per WebSocket text message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HeadlessMessage {
    SessionInfo(SessionInfo),
    Output { seq: i64, message: TunnelMessage },
    ReplayStart,
    ReplayEnd,
}

/// Event stream inside `output`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TunnelMessage {
    Log {
        #[serde(default)]
        args: Vec<String>,
    },
    Error {
        #[serde(default)]
        args: Vec<String>,
    },
    Warn {
        #[serde(default)]
        args: Vec<String>,
    },
    Debug {
        #[serde(default)]
        args: Vec<String>,
    },
    Stdout {
        #[serde(default)]
        data: String,
    },
    Stderr {
        #[serde(default)]
        data: String,
    },
    Structured { message: StructuredMessage },
}

/// A structured event plus its optional ISO-8601 timestamp.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuredMessage {
    pub timestamp: Option<String>,
    pub payload: StructuredPayload,
}

impl<'de> Deserialize<'de> for StructuredMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = Value::deserialize(deserializer)?;
        let timestamp = raw.get("timestamp").and_then(Value::as_str).map(str::to_owned);
        let payload = match StructuredPayload::deserialize(&raw) {
            Ok(payload) => payload,
            Err(err) => {
                let tag =
                    raw.get("type").and_then(Value::as_str).unwrap_or("(missing)").to_owned();
                debug!(%tag, %err, "unrecognized structured message");
                StructuredPayload::Unknown { type_name: tag }
            }
        };
        Ok(Self { timestamp, payload })
    }
}

/// The structured event alphabet. Every field is defaulted so a sparse
/// message from an older agent still decodes.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StructuredPayload {
    AgentSessionStart {
        #[serde(default)]
        executor: Option<String>,
        #[serde(default)]
        mode: Option<String>,
        #[serde(default, rename = "planId")]
        plan_id: Option<i64>,
    },
    AgentSessionEnd {
        #[serde(default)]
        success: Option<bool>,
        #[serde(default, rename = "durationMs")]
        duration_ms: Option<f64>,
        #[serde(default)]
        cost: Option<f64>,
        #[serde(default)]
        turns: Option<i64>,
        #[serde(default)]
        summary: Option<String>,
    },
    AgentIterationStart {
        #[serde(default)]
        iteration: i64,
        #[serde(default, rename = "taskTitle")]
        task_title: Option<String>,
        #[serde(default, rename = "taskDescription")]
        task_description: Option<String>,
    },
    AgentStepStart {
        #[serde(default)]
        phase: String,
        #[serde(default)]
        message: Option<String>,
    },
    AgentStepEnd {
        #[serde(default)]
        phase: String,
        #[serde(default = "default_true")]
        success: bool,
        #[serde(default)]
        summary: Option<String>,
    },
    LlmThinking {
        #[serde(default)]
        text: String,
    },
    LlmResponse {
        #[serde(default)]
        text: String,
        #[serde(default, rename = "isUserRequest")]
        is_user_request: bool,
    },
    LlmToolUse {
        #[serde(default, rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        input: Option<Value>,
        #[serde(default, rename = "inputSummary")]
        input_summary: Option<String>,
    },
    LlmToolResult {
        #[serde(default, rename = "toolName")]
        tool_name: String,
        #[serde(default)]
        result: Option<Value>,
    },
    LlmStatus {
        #[serde(default)]
        status: String,
        #[serde(default)]
        detail: Option<String>,
    },
    TodoUpdate {
        #[serde(default)]
        todos: Vec<TodoEntry>,
    },
    FileWrite {
        #[serde(default)]
        path: String,
        #[serde(default)]
        lines: i64,
    },
    FileEdit {
        #[serde(default)]
        path: String,
        #[serde(default)]
        diff: String,
    },
    FileChangeSummary {
        #[serde(default)]
        changes: Vec<FileChangeEntry>,
    },
    CommandExec {
        #[serde(default)]
        command: String,
        #[serde(default)]
        cwd: Option<String>,
    },
    CommandResult {
        #[serde(default)]
        command: String,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default, rename = "exitCode")]
        exit_code: i64,
        #[serde(default)]
        stdout: Option<String>,
        #[serde(default)]
        stderr: Option<String>,
    },
    ReviewStart {
        #[serde(default)]
        message: Option<String>,
    },
    ReviewResult {
        #[serde(default)]
        result: Option<String>,
    },
    ReviewVerdict {
        #[serde(default)]
        verdict: String,
        #[serde(default)]
        reason: Option<String>,
    },
    WorkflowProgress {
        #[serde(default)]
        phase: Option<String>,
        #[serde(default)]
        message: Option<String>,
    },
    FailureReport {
        #[serde(default)]
        summary: String,
        #[serde(default)]
        sections: Vec<FailureSection>,
    },
    TaskCompletion {
        #[serde(default)]
        title: String,
        #[serde(default, rename = "planComplete")]
        plan_complete: bool,
    },
    ExecutionSummary {
        #[serde(default)]
        title: Option<String>,
        #[serde(default)]
        success: Option<bool>,
        #[serde(default, rename = "durationMs")]
        duration_ms: Option<f64>,
        #[serde(default)]
        cost: Option<f64>,
        #[serde(default)]
        turns: Option<i64>,
    },
    TokenUsage {
        #[serde(default)]
        input: Option<i64>,
        #[serde(default)]
        cached: Option<i64>,
        #[serde(default)]
        output: Option<i64>,
        #[serde(default)]
        reasoning: Option<i64>,
        #[serde(default)]
        total: Option<i64>,
    },
    InputRequired {
        #[serde(default)]
        prompt: Option<String>,
    },
    PromptRequest {
        #[serde(default, rename = "requestId")]
        request_id: String,
        #[serde(default, rename = "promptType")]
        prompt_type: String,
        #[serde(default)]
        config: PromptConfig,
    },
    PromptAnswered {
        #[serde(default, rename = "requestId")]
        request_id: Option<String>,
        #[serde(default, rename = "promptType")]
        prompt_type: String,
        #[serde(default)]
        source: String,
        #[serde(default)]
        value: Option<Value>,
    },
    PlanDiscovery {
        #[serde(default, rename = "planId")]
        plan_id: Option<i64>,
        #[serde(default)]
        title: String,
    },
    UserTerminalInput {
        #[serde(default)]
        content: String,
        #[serde(default)]
        source: Option<String>,
    },
    WorkspaceInfo {
        #[serde(default, rename = "workspacePath")]
        workspace_path: Option<String>,
        #[serde(default)]
        branch: Option<String>,
        #[serde(default, rename = "gitRemote")]
        git_remote: Option<String>,
    },
    /// Catch-all for tags outside the alphabet; never deserialized directly.
    #[serde(skip)]
    Unknown { type_name: String },
}

fn default_true() -> bool {
    true
}

/// One todo line inside `todo_update`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TodoEntry {
    pub label: String,
    pub status: String,
}

/// One path inside `file_change_summary`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FileChangeEntry {
    pub path: String,
    pub kind: String,
}

/// One labeled section of a `failure_report`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct FailureSection {
    pub label: String,
    pub content: String,
}

/// Interactive prompt configuration carried by `prompt_request`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptConfig {
    pub message: String,
    #[serde(rename = "default")]
    pub default_value: Option<PromptResponseValue>,
    pub choices: Option<Vec<PromptChoice>>,
    pub page_size: Option<i64>,
    pub validation_hint: Option<String>,
    pub command: Option<String>,
}

/// One selectable choice in a prompt.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PromptChoice {
    pub name: String,
    pub value: Option<PromptResponseValue>,
    pub description: Option<String>,
    pub checked: Option<bool>,
}

/// Envelope sent back to an agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentBound {
    UserInput {
        content: String,
    },
    PromptResponse {
        #[serde(rename = "requestId")]
        request_id: String,
        value: Value,
    },
}

/// Decode one WebSocket text message into the outer envelope.
///
/// Unknown or malformed envelopes return `None`; each distinct unknown
/// `type` is logged once per process.
pub fn decode_headless(text: &str) -> Option<HeadlessMessage> {
    let raw: Value = match serde_json::from_str(text) {
        Ok(raw) => raw,
        Err(err) => {
            debug!(%err, "undecodable tunnel payload");
            return None;
        }
    };
    let tag = raw.get("type").and_then(Value::as_str).unwrap_or("(missing)").to_owned();
    match serde_json::from_value::<HeadlessMessage>(raw) {
        Ok(message) => Some(message),
        Err(err) => {
            if seen_unknown_types().lock().map(|mut s| s.insert(tag.clone())).unwrap_or(false) {
                debug!(%tag, %err, "ignoring unrecognized message type");
            }
            None
        }
    }
}

fn seen_unknown_types() -> &'static Mutex<BTreeSet<String>> {
    static SEEN: OnceLock<Mutex<BTreeSet<String>>> = OnceLock::new();
    SEEN.get_or_init(|| Mutex::new(BTreeSet::new()))
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
