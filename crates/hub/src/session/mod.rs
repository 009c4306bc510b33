// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Session aggregation engine.
//!
//! Single owner of all session state. Every mutation runs under one async
//! lock (the UI-executor equivalent), and each committed mutation emits
//! exactly one change signal for UI observers. Messages that arrive before
//! their `session_info` are parked in `pending_messages`; messages inside
//! a replay window are parked in `replay_messages` and flushed atomically
//! at `replay_end`.

pub mod message;

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, Mutex};
use tracing::debug;

use crate::error::SendError;
use crate::notify::Notifier;
use crate::protocol::format::format_tunnel;
use crate::protocol::{
    AgentBound, HeadlessMessage, MessagePayload, PromptConfig, SessionInfo, StructuredPayload,
    TerminalRef, TunnelMessage,
};
use message::{Body, Category, SessionMessage};

/// Banner title for every OS notification this core emits.
const NOTIFY_TITLE: &str = "Tim";

/// Banner body used when an agent's socket goes away.
const DISCONNECT_BANNER: &str = "Agent session disconnected";

/// Transport back-reference: installed once by the server after bind.
pub type SendHook = Arc<dyn Fn(&str, &AgentBound) -> Result<(), SendError> + Send + Sync>;

/// An outstanding interactive prompt.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptRequest {
    pub request_id: String,
    pub prompt_type: String,
    pub config: PromptConfig,
}

/// Live state for one agent session.
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub connection_id: String,
    pub connected_at: DateTime<Utc>,
    pub is_active: bool,
    /// Empty iff the session exists only because of a notification.
    pub command: String,
    pub plan_id: Option<i64>,
    pub plan_title: Option<String>,
    pub workspace_path: Option<String>,
    pub git_remote: Option<String>,
    pub terminal: Option<TerminalRef>,
    pub messages: Vec<SessionMessage>,
    pub pending_prompt: Option<PromptRequest>,
    pub unread_notification: bool,
    pub notification_message: Option<String>,
    /// Bumped on each replay flush; the UI snaps its scroll position.
    pub force_scroll_version: u64,
}

impl Session {
    pub fn is_notification_only(&self) -> bool {
        self.command.is_empty()
    }

    fn pane_id(&self) -> Option<&str> {
        self.terminal.as_ref().map(|t| t.pane_id.as_str())
    }

    fn apply_identity(&mut self, info: &SessionInfo) {
        self.command = info.command.clone();
        self.plan_id = info.plan_id;
        self.plan_title = info.plan_title.clone();
        self.workspace_path = info.workspace_path.clone();
        self.git_remote = info.git_remote.clone();
        self.terminal = info.terminal();
    }
}

#[derive(Default)]
struct AggregatorState {
    /// Head of the list is the newest session.
    sessions: Vec<Session>,
    selected: Option<String>,
    pending_messages: HashMap<String, Vec<SessionMessage>>,
    replay_messages: HashMap<String, Vec<SessionMessage>>,
    replaying: HashSet<String>,
}

impl AggregatorState {
    fn by_connection(&mut self, connection_id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.connection_id == connection_id)
    }

    fn by_session(&mut self, session_id: &str) -> Option<&mut Session> {
        self.sessions.iter_mut().find(|s| s.session_id == session_id)
    }
}

/// Owner of all sessions. See module docs for the locking discipline.
pub struct SessionAggregator {
    state: Mutex<AggregatorState>,
    change_tx: broadcast::Sender<()>,
    notifier: Arc<dyn Notifier>,
    send_hook: OnceLock<SendHook>,
}

impl SessionAggregator {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        let (change_tx, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(AggregatorState::default()),
            change_tx,
            notifier,
            send_hook: OnceLock::new(),
        }
    }

    /// Install the transport send hook. Later installs are ignored.
    pub fn install_send_hook(&self, hook: SendHook) {
        let _ = self.send_hook.set(hook);
    }

    /// Subscribe to change signals; one signal per committed mutation.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.change_tx.subscribe()
    }

    /// Snapshot of all sessions, newest first.
    pub async fn sessions(&self) -> Vec<Session> {
        self.state.lock().await.sessions.clone()
    }

    pub async fn selected_session_id(&self) -> Option<String> {
        self.state.lock().await.selected.clone()
    }

    /// Route one decoded envelope from a connection.
    pub async fn apply_envelope(&self, connection_id: &str, envelope: HeadlessMessage) {
        match envelope {
            HeadlessMessage::SessionInfo(info) => self.add_session(connection_id, info).await,
            HeadlessMessage::Output { seq, message } => {
                self.apply_output(connection_id, seq, &message).await;
            }
            HeadlessMessage::ReplayStart => self.start_replay(connection_id).await,
            HeadlessMessage::ReplayEnd => self.end_replay(connection_id).await,
        }
    }

    /// Apply one `output` event: side effects first, then the rendered
    /// message. A `user_terminal_input` that originated from this GUI is
    /// not appended again; `send_user_input` already echoed it locally.
    pub async fn apply_output(&self, connection_id: &str, seq: i64, message: &TunnelMessage) {
        if let TunnelMessage::Structured { message: structured } = message {
            match &structured.payload {
                StructuredPayload::PromptRequest { request_id, prompt_type, config } => {
                    self.set_active_prompt(
                        connection_id,
                        PromptRequest {
                            request_id: request_id.clone(),
                            prompt_type: prompt_type.clone(),
                            config: config.clone(),
                        },
                    )
                    .await;
                }
                StructuredPayload::PromptAnswered { request_id, .. } => {
                    let request_id = request_id.clone().unwrap_or_default();
                    self.clear_active_prompt(connection_id, &request_id).await;
                }
                StructuredPayload::InputRequired { .. }
                | StructuredPayload::PlanDiscovery { .. }
                | StructuredPayload::ExecutionSummary { .. } => {
                    self.ingest_agent_notification(connection_id, &structured.payload).await;
                    self.ingest_session_metadata(connection_id, &structured.payload).await;
                }
                StructuredPayload::UserTerminalInput { source, .. } => {
                    if source.as_deref() == Some("gui") {
                        return;
                    }
                }
                _ => {}
            }
        }
        self.append_message(connection_id, format_tunnel(seq, message)).await;
    }

    /// Register or reconcile a session for `connection_id`.
    pub async fn add_session(&self, connection_id: &str, info: SessionInfo) {
        {
            let mut state = self.state.lock().await;

            // Repeat session_info on a live connection refreshes identity.
            if let Some(session) = state.by_connection(connection_id) {
                session.apply_identity(&info);
                drop(state);
                self.changed();
                return;
            }

            let flushed = state.pending_messages.remove(connection_id).unwrap_or_default();

            if let Some(index) = find_reconcilable(&state.sessions, &info) {
                let selected_empty = state.selected.is_none();
                let session = &mut state.sessions[index];
                session.connection_id = connection_id.to_owned();
                session.apply_identity(&info);
                session.is_active = true;
                session.connected_at = Utc::now();
                session.messages.extend(flushed);
                if selected_empty {
                    state.selected = Some(state.sessions[index].session_id.clone());
                }
            } else {
                let session = Session {
                    session_id: uuid::Uuid::new_v4().to_string(),
                    connection_id: connection_id.to_owned(),
                    connected_at: Utc::now(),
                    is_active: true,
                    command: info.command.clone(),
                    plan_id: info.plan_id,
                    plan_title: info.plan_title.clone(),
                    workspace_path: info.workspace_path.clone(),
                    git_remote: info.git_remote.clone(),
                    terminal: info.terminal(),
                    messages: flushed,
                    pending_prompt: None,
                    unread_notification: false,
                    notification_message: None,
                    force_scroll_version: 0,
                };
                if state.selected.is_none() {
                    state.selected = Some(session.session_id.clone());
                }
                state.sessions.insert(0, session);
            }
        }
        self.changed();
    }

    /// Append a decoded message, honoring replay and pre-info buffering.
    pub async fn append_message(&self, connection_id: &str, message: SessionMessage) {
        {
            let mut state = self.state.lock().await;
            if state.replaying.contains(connection_id) {
                state.replay_messages.entry(connection_id.to_owned()).or_default().push(message);
            } else if let Some(session) = state.by_connection(connection_id) {
                session.messages.push(message);
            } else {
                state.pending_messages.entry(connection_id.to_owned()).or_default().push(message);
            }
        }
        self.changed();
    }

    pub async fn start_replay(&self, connection_id: &str) {
        self.state.lock().await.replaying.insert(connection_id.to_owned());
        self.changed();
    }

    /// Close the replay window and flush buffered messages in order.
    pub async fn end_replay(&self, connection_id: &str) {
        {
            let mut state = self.state.lock().await;
            state.replaying.remove(connection_id);
            let drained = state.replay_messages.remove(connection_id).unwrap_or_default();
            if let Some(session) = state.by_connection(connection_id) {
                session.messages.extend(drained);
                session.force_scroll_version += 1;
            } else {
                state
                    .pending_messages
                    .entry(connection_id.to_owned())
                    .or_default()
                    .extend(drained);
            }
        }
        self.changed();
    }

    /// Replace the pending prompt; replayed prompts never become active.
    pub async fn set_active_prompt(&self, connection_id: &str, prompt: PromptRequest) {
        {
            let mut state = self.state.lock().await;
            if state.replaying.contains(connection_id) {
                return;
            }
            match state.by_connection(connection_id) {
                Some(session) => session.pending_prompt = Some(prompt),
                None => return,
            }
        }
        self.changed();
    }

    /// Clear the pending prompt iff `request_id` names the current one.
    pub async fn clear_active_prompt(&self, connection_id: &str, request_id: &str) {
        {
            let mut state = self.state.lock().await;
            if state.replaying.contains(connection_id) {
                return;
            }
            let Some(session) = state.by_connection(connection_id) else {
                return;
            };
            let matches =
                session.pending_prompt.as_ref().is_some_and(|p| p.request_id == request_id);
            if !matches {
                return;
            }
            session.pending_prompt = None;
        }
        self.changed();
    }

    /// Send typed user input to the agent and echo it into the log.
    pub async fn send_user_input(&self, session_id: &str, text: &str) -> Result<(), SendError> {
        {
            let mut state = self.state.lock().await;
            let hook = self.send_hook.get().ok_or(SendError::NoHandler)?;
            let session = state.by_session(session_id).ok_or(SendError::UnknownSession)?;
            if !session.is_active {
                return Err(SendError::InactiveSession);
            }
            hook(&session.connection_id, &AgentBound::UserInput { content: text.to_owned() })?;

            let seq = session.messages.last().map(|m| m.seq + 1).unwrap_or(1);
            session.messages.push(SessionMessage {
                seq,
                title: Some("You".to_owned()),
                body: Some(Body::text(text)),
                category: Category::UserInput,
                timestamp: Some(Utc::now()),
            });
        }
        self.changed();
        Ok(())
    }

    /// Answer the agent's interactive prompt. The prompt itself is cleared
    /// by the agent's `prompt_answered` event, not here.
    pub async fn send_prompt_response(
        &self,
        session_id: &str,
        request_id: &str,
        value: &crate::protocol::PromptResponseValue,
    ) -> Result<(), SendError> {
        let mut state = self.state.lock().await;
        let hook = self.send_hook.get().ok_or(SendError::NoHandler)?;
        let session = state.by_session(session_id).ok_or(SendError::UnknownSession)?;
        if !session.is_active {
            return Err(SendError::InactiveSession);
        }
        hook(
            &session.connection_id,
            &AgentBound::PromptResponse {
                request_id: request_id.to_owned(),
                value: value.to_json(),
            },
        )
    }

    /// Ingest a `POST /messages` notification; see the pane-matching rules
    /// on [`find_notification_target`].
    pub async fn ingest_notification(&self, payload: MessagePayload) {
        {
            let mut state = self.state.lock().await;
            match find_notification_target(&state.sessions, &payload) {
                Some(index) => {
                    let session = &mut state.sessions[index];
                    session.notification_message = Some(payload.message.clone());
                    session.unread_notification = true;
                }
                None => {
                    let workspace_path = (!payload.workspace_path.is_empty())
                        .then(|| payload.workspace_path.clone());
                    // A pane-less session for the same workspace supplies
                    // plan identity hints for the new entry.
                    let hints = workspace_path.as_ref().and_then(|path| {
                        state
                            .sessions
                            .iter()
                            .find(|s| {
                                s.terminal.is_none() && s.workspace_path.as_deref() == Some(path)
                            })
                            .map(|s| (s.plan_id, s.plan_title.clone()))
                    });
                    let (plan_id, plan_title) = hints.unwrap_or((None, None));
                    state.sessions.insert(
                        0,
                        Session {
                            session_id: uuid::Uuid::new_v4().to_string(),
                            connection_id: format!("notif-{}", uuid::Uuid::new_v4()),
                            connected_at: Utc::now(),
                            is_active: false,
                            command: String::new(),
                            plan_id,
                            plan_title,
                            workspace_path,
                            git_remote: None,
                            terminal: payload.terminal.clone(),
                            messages: Vec::new(),
                            pending_prompt: None,
                            unread_notification: true,
                            notification_message: Some(payload.message.clone()),
                            force_scroll_version: 0,
                        },
                    );
                }
            }
        }
        self.notifier.notify(NOTIFY_TITLE, &payload.message);
        self.changed();
    }

    /// Agent-side notification events (`input_required`) raise the banner.
    pub async fn ingest_agent_notification(
        &self,
        connection_id: &str,
        payload: &StructuredPayload,
    ) {
        let StructuredPayload::InputRequired { prompt } = payload else {
            return;
        };
        let banner = match prompt.as_deref().filter(|p| !p.is_empty()) {
            Some(prompt) => format!("Input required: {prompt}"),
            None => "Input required".to_owned(),
        };
        {
            let mut state = self.state.lock().await;
            let Some(session) = state.by_connection(connection_id) else {
                return;
            };
            session.notification_message = Some(banner.clone());
            session.unread_notification = true;
        }
        self.notifier.notify(NOTIFY_TITLE, &banner);
        self.changed();
    }

    /// Late plan-title discovery refreshes the session's identity.
    pub async fn ingest_session_metadata(
        &self,
        connection_id: &str,
        payload: &StructuredPayload,
    ) {
        let title = match payload {
            StructuredPayload::PlanDiscovery { title, .. } => title.trim(),
            StructuredPayload::ExecutionSummary { title: Some(title), .. } => title.trim(),
            _ => return,
        };
        if title.is_empty() {
            return;
        }
        {
            let mut state = self.state.lock().await;
            let Some(session) = state.by_connection(connection_id) else {
                return;
            };
            session.plan_title = Some(title.to_owned());
        }
        self.changed();
    }

    /// The agent's socket went away.
    pub async fn mark_disconnected(&self, connection_id: &str) {
        let known = {
            let mut state = self.state.lock().await;
            state.pending_messages.remove(connection_id);
            state.replay_messages.remove(connection_id);
            state.replaying.remove(connection_id);
            match state.by_connection(connection_id) {
                Some(session) => {
                    session.is_active = false;
                    session.pending_prompt = None;
                    session.notification_message = Some(DISCONNECT_BANNER.to_owned());
                    session.unread_notification = true;
                    true
                }
                None => false,
            }
        };
        if known {
            self.notifier.notify(NOTIFY_TITLE, DISCONNECT_BANNER);
        }
        self.changed();
    }

    /// Remove a disconnected session. Active sessions are refused.
    pub async fn dismiss_session(&self, session_id: &str) -> bool {
        {
            let mut state = self.state.lock().await;
            let Some(index) = state.sessions.iter().position(|s| s.session_id == session_id)
            else {
                return false;
            };
            if state.sessions[index].is_active {
                debug!(session_id, "refusing to dismiss active session");
                return false;
            }
            state.sessions.remove(index);
            if state.selected.as_deref() == Some(session_id) {
                state.selected = None;
            }
        }
        self.changed();
        true
    }

    pub async fn dismiss_all_disconnected(&self) {
        {
            let mut state = self.state.lock().await;
            state.sessions.retain(|s| s.is_active);
            if let Some(selected) = state.selected.clone() {
                if !state.sessions.iter().any(|s| s.session_id == selected) {
                    state.selected = None;
                }
            }
        }
        self.changed();
    }

    pub async fn mark_notification_read(&self, session_id: &str) {
        {
            let mut state = self.state.lock().await;
            let Some(session) = state.by_session(session_id) else {
                return;
            };
            session.unread_notification = false;
        }
        self.changed();
    }

    /// Tapping a list row selects the session and clears its badge.
    pub async fn handle_list_item_tap(&self, session_id: &str) {
        {
            let mut state = self.state.lock().await;
            if state.sessions.iter().any(|s| s.session_id == session_id) {
                state.selected = Some(session_id.to_owned());
                if let Some(session) = state.by_session(session_id) {
                    session.unread_notification = false;
                }
            }
        }
        self.changed();
    }

    /// Tapping the terminal icon activates the pane elsewhere; here it only
    /// clears the badge.
    pub async fn handle_terminal_icon_tap(&self, session_id: &str) {
        self.mark_notification_read(session_id).await;
    }

    fn changed(&self) {
        let _ = self.change_tx.send(());
    }
}

/// Find the notification-only session a new `session_info` reconciles with.
///
/// A session carrying a pane id matches only on pane id; the workspace
/// fallback is reserved for pane-less sessions so a new pane's traffic is
/// never grafted onto an older workspace entry.
fn find_reconcilable(sessions: &[Session], info: &SessionInfo) -> Option<usize> {
    match info.terminal_pane_id.as_deref() {
        Some(pane_id) => sessions
            .iter()
            .position(|s| s.is_notification_only() && s.pane_id() == Some(pane_id)),
        None => {
            let workspace = info.workspace_path.as_deref()?;
            sessions.iter().position(|s| {
                s.is_notification_only() && s.workspace_path.as_deref() == Some(workspace)
            })
        }
    }
}

/// Find the session a loopback notification lands on. A notification with
/// a pane id never falls back to workspace matching.
fn find_notification_target(sessions: &[Session], payload: &MessagePayload) -> Option<usize> {
    match &payload.terminal {
        Some(terminal) => {
            sessions.iter().position(|s| s.pane_id() == Some(terminal.pane_id.as_str()))
        }
        None => {
            if payload.workspace_path.is_empty() {
                return None;
            }
            sessions
                .iter()
                .position(|s| s.workspace_path.as_deref() == Some(payload.workspace_path.as_str()))
        }
    }
}

#[cfg(test)]
#[path = "aggregator_tests.rs"]
mod tests;
