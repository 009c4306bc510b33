// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Normalizes tunnel events into [`SessionMessage`]s.
//!
//! All presentation strings live here so the aggregator and UI never touch
//! raw wire payloads.

use chrono::{DateTime, Utc};

use crate::protocol::value::json_to_string;
use crate::protocol::{StructuredMessage, StructuredPayload, TunnelMessage};
use crate::session::message::{
    Body, Category, FileChange, FileChangeKind, KeyValue, SessionMessage, TodoItem, TodoStatus,
};

/// Lines kept before long monospaced output is cut.
const TRUNCATE_AT: usize = 40;

/// Render one tunnel event as a session message.
pub fn format_tunnel(seq: i64, message: &TunnelMessage) -> SessionMessage {
    match message {
        TunnelMessage::Log { args } | TunnelMessage::Debug { args } => {
            plain(seq, Body::text(args.join(" ")), Category::Log)
        }
        TunnelMessage::Error { args } | TunnelMessage::Warn { args } => {
            plain(seq, Body::text(args.join(" ")), Category::Error)
        }
        TunnelMessage::Stdout { data } => plain(seq, Body::text(data.clone()), Category::Log),
        TunnelMessage::Stderr { data } => plain(seq, Body::text(data.clone()), Category::Error),
        TunnelMessage::Structured { message } => format_structured(seq, message),
    }
}

fn plain(seq: i64, body: Body, category: Category) -> SessionMessage {
    SessionMessage { seq, title: None, body: Some(body), category, timestamp: None }
}

fn format_structured(seq: i64, message: &StructuredMessage) -> SessionMessage {
    let timestamp = parse_timestamp(message.timestamp.as_deref());
    let (title, body, category) = render(&message.payload);
    SessionMessage { seq, title, body, category, timestamp }
}

/// Parse an ISO-8601 timestamp, accepting both `…Z` and fractional forms.
pub fn parse_timestamp(raw: Option<&str>) -> Option<DateTime<Utc>> {
    let raw = raw?;
    DateTime::parse_from_rfc3339(raw).ok().map(|t| t.with_timezone(&Utc))
}

fn render(payload: &StructuredPayload) -> (Option<String>, Option<Body>, Category) {
    use StructuredPayload as P;

    match payload {
        P::AgentSessionStart { executor, mode, plan_id } => {
            let mut pairs = Vec::new();
            push_kv(&mut pairs, "Executor", executor.clone());
            push_kv(&mut pairs, "Mode", mode.clone());
            push_kv(&mut pairs, "Plan", plan_id.map(|id| id.to_string()));
            (Some("Starting".to_owned()), kv_body(pairs), Category::Lifecycle)
        }
        P::AgentSessionEnd { success, duration_ms, cost, turns, summary } => {
            let mut pairs = Vec::new();
            push_kv(&mut pairs, "Success", success.map(|s| s.to_string()));
            push_kv(&mut pairs, "Duration", duration_ms.map(format_duration));
            push_kv(&mut pairs, "Cost", cost.map(format_cost));
            push_kv(&mut pairs, "Turns", turns.map(|t| t.to_string()));
            push_kv(&mut pairs, "Summary", summary.clone());
            (Some("Done".to_owned()), kv_body(pairs), Category::Lifecycle)
        }
        P::AgentIterationStart { iteration, task_title, task_description } => {
            let body = match (task_title, task_description) {
                (None, None) => None,
                (title, description) => {
                    let mut text = title.clone().unwrap_or_default();
                    if let Some(description) = description {
                        if !text.is_empty() {
                            text.push('\n');
                        }
                        text.push_str(description);
                    }
                    Some(Body::text(text))
                }
            };
            (Some(format!("Iteration {iteration}")), body, Category::Lifecycle)
        }
        P::AgentStepStart { phase, message } => (
            Some(format!("Step Start: {phase}")),
            message.clone().map(Body::text),
            Category::Lifecycle,
        ),
        P::AgentStepEnd { phase, success, summary } => {
            let mark = if *success { "✓" } else { "✗" };
            let category = if *success { Category::Lifecycle } else { Category::Error };
            (Some(format!("Step End: {phase} {mark}")), summary.clone().map(Body::text), category)
        }
        P::LlmThinking { text } => {
            (Some("Thinking".to_owned()), Some(Body::text(text.clone())), Category::LlmOutput)
        }
        P::LlmResponse { text, is_user_request } => {
            let title = if *is_user_request { "User" } else { "Model Response" };
            (Some(title.to_owned()), Some(Body::text(text.clone())), Category::LlmOutput)
        }
        P::LlmToolUse { tool_name, input, input_summary } => {
            let rendered = match input_summary {
                Some(summary) => summary.clone(),
                None => input.as_ref().map(json_to_string).unwrap_or_default(),
            };
            (
                Some(format!("Invoke Tool: {tool_name}")),
                Some(Body::mono(rendered)),
                Category::ToolUse,
            )
        }
        P::LlmToolResult { tool_name, result } => {
            let rendered = result.as_ref().map(json_to_string).unwrap_or_default();
            // Task results summarize subagent work; keep them whole.
            let rendered =
                if tool_name == "Task" { rendered } else { truncate_lines(&rendered) };
            (
                Some(format!("Tool Result: {tool_name}")),
                Some(Body::mono(rendered)),
                Category::ToolUse,
            )
        }
        P::LlmStatus { status, detail } => {
            let text = match detail {
                Some(detail) => format!("{status}: {detail}"),
                None => status.clone(),
            };
            (Some("Status".to_owned()), Some(Body::text(text)), Category::Log)
        }
        P::TodoUpdate { todos } => {
            let items = todos
                .iter()
                .map(|t| TodoItem {
                    label: t.label.clone(),
                    status: TodoStatus::from_wire(&t.status),
                })
                .collect();
            (
                Some("Todo Update".to_owned()),
                Some(Body::TodoList { items }),
                Category::Progress,
            )
        }
        P::FileWrite { path, lines } => (
            Some("Invoke Tool: Write".to_owned()),
            Some(Body::mono(format!("{path} ({lines} lines)"))),
            Category::FileChange,
        ),
        P::FileEdit { path, diff } => (
            Some("Invoke Tool: Edit".to_owned()),
            Some(Body::mono(format!("{path}\n{diff}"))),
            Category::FileChange,
        ),
        P::FileChangeSummary { changes } => {
            let files = changes
                .iter()
                .map(|c| FileChange {
                    path: c.path.clone(),
                    kind: FileChangeKind::from_wire(&c.kind),
                })
                .collect();
            (
                Some("File Changes".to_owned()),
                Some(Body::FileChanges { files }),
                Category::FileChange,
            )
        }
        P::CommandExec { command, cwd } => {
            let mut text = command.clone();
            if let Some(cwd) = cwd {
                text.push_str(&format!("\ncwd: {cwd}"));
            }
            (Some("Exec Begin".to_owned()), Some(Body::mono(text)), Category::Command)
        }
        P::CommandResult { command, cwd, exit_code, stdout, stderr } => {
            let mut lines = vec![command.clone()];
            if let Some(cwd) = cwd {
                lines.push(format!("cwd: {cwd}"));
            }
            if *exit_code != 0 {
                lines.push(format!("Exit Code: {exit_code}"));
            }
            if let Some(stdout) = stdout {
                if !stdout.is_empty() {
                    lines.push(truncate_lines(stdout));
                }
            }
            if let Some(stderr) = stderr {
                if !stderr.is_empty() {
                    lines.push(truncate_lines(stderr));
                }
            }
            (Some("Exec Finished".to_owned()), Some(Body::mono(lines.join("\n"))), Category::Command)
        }
        P::ReviewStart { message } => (
            Some("Executing Review".to_owned()),
            message.clone().map(Body::text),
            Category::Lifecycle,
        ),
        P::ReviewResult { result } => (
            Some("Review Result".to_owned()),
            result.as_deref().map(|r| Body::text(truncate_lines(r))),
            Category::Lifecycle,
        ),
        P::ReviewVerdict { verdict, reason } => {
            let text = match reason {
                Some(reason) => format!("{verdict}: {reason}"),
                None => verdict.clone(),
            };
            (Some("Review Verdict".to_owned()), Some(Body::text(text)), Category::Lifecycle)
        }
        P::WorkflowProgress { phase, message } => {
            let body = message.as_ref().map(|m| match phase {
                Some(phase) => Body::text(format!("[{phase}] {m}")),
                None => Body::text(m.clone()),
            });
            (None, body, Category::Progress)
        }
        P::FailureReport { summary, sections } => {
            let mut text = format!("FAILED: {summary}");
            for section in sections {
                text.push_str(&format!("\n\n{}:\n{}", section.label, section.content));
            }
            (None, Some(Body::text(text)), Category::Error)
        }
        P::TaskCompletion { title, plan_complete } => {
            let suffix = if *plan_complete { " (plan complete)" } else { "" };
            (
                None,
                Some(Body::text(format!("Task complete: {title}{suffix}"))),
                Category::Lifecycle,
            )
        }
        P::ExecutionSummary { title, success, duration_ms, cost, turns } => {
            let mut pairs = Vec::new();
            push_kv(&mut pairs, "Plan", title.clone());
            push_kv(&mut pairs, "Success", success.map(|s| s.to_string()));
            push_kv(&mut pairs, "Duration", duration_ms.map(format_duration));
            push_kv(&mut pairs, "Cost", cost.map(format_cost));
            push_kv(&mut pairs, "Turns", turns.map(|t| t.to_string()));
            (Some("Execution Summary".to_owned()), kv_body(pairs), Category::Lifecycle)
        }
        P::TokenUsage { input, cached, output, reasoning, total } => {
            let mut parts = Vec::new();
            push_part(&mut parts, "input", *input);
            push_part(&mut parts, "cached", *cached);
            push_part(&mut parts, "output", *output);
            push_part(&mut parts, "reasoning", *reasoning);
            push_part(&mut parts, "total", *total);
            (Some("Usage".to_owned()), Some(Body::text(parts.join(" "))), Category::Log)
        }
        P::InputRequired { prompt } => (
            Some("Input Required".to_owned()),
            prompt.clone().map(Body::text),
            Category::Progress,
        ),
        P::PromptRequest { prompt_type, config, .. } => (
            None,
            Some(Body::text(format!("Prompt ({prompt_type}): {}", config.message))),
            Category::Progress,
        ),
        P::PromptAnswered { prompt_type, source, .. } => (
            None,
            Some(Body::text(format!("Prompt answered ({prompt_type}) by {source}"))),
            Category::Log,
        ),
        P::PlanDiscovery { plan_id, title } => {
            let id = plan_id.map(|id| id.to_string()).unwrap_or_else(|| "?".to_owned());
            (
                Some("Plan Discovery".to_owned()),
                Some(Body::text(format!("Found ready plan: {id} - {title}"))),
                Category::Lifecycle,
            )
        }
        P::UserTerminalInput { content, .. } => {
            (Some("You".to_owned()), Some(Body::text(content.clone())), Category::UserInput)
        }
        P::WorkspaceInfo { workspace_path, branch, git_remote } => {
            let mut pairs = Vec::new();
            push_kv(&mut pairs, "Workspace", workspace_path.clone());
            push_kv(&mut pairs, "Branch", branch.clone());
            push_kv(&mut pairs, "Remote", git_remote.clone());
            (Some("Workspace".to_owned()), kv_body(pairs), Category::Log)
        }
        P::Unknown { type_name } => (
            None,
            Some(Body::text(format!("Unknown message type: {type_name}"))),
            Category::Log,
        ),
    }
}

/// Keep the first 40 lines; longer text gains a truncation marker line.
pub fn truncate_lines(text: &str) -> String {
    let total = text.lines().count();
    if total <= TRUNCATE_AT {
        return text.to_owned();
    }
    let kept: Vec<&str> = text.lines().take(TRUNCATE_AT).collect();
    format!("{}\n... ({} lines truncated)", kept.join("\n"), total - TRUNCATE_AT)
}

fn push_kv(pairs: &mut Vec<KeyValue>, key: &str, value: Option<String>) {
    if let Some(value) = value {
        pairs.push(KeyValue::new(key, value));
    }
}

fn push_part(parts: &mut Vec<String>, key: &str, value: Option<i64>) {
    if let Some(value) = value {
        parts.push(format!("{key}={value}"));
    }
}

fn kv_body(pairs: Vec<KeyValue>) -> Option<Body> {
    if pairs.is_empty() {
        None
    } else {
        Some(Body::KeyValuePairs { pairs })
    }
}

fn format_duration(ms: f64) -> String {
    format!("{:.1}s", ms / 1000.0)
}

fn format_cost(cost: f64) -> String {
    format!("${cost:.4}")
}

#[cfg(test)]
#[path = "format_tests.rs"]
mod tests;
