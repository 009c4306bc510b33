// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Notification ingestion and session reconciliation, end to end.

use serde_json::json;

use timhub_specs::{connect_agent, post_messages, send_json, start_hub, wait_for_sessions};

#[tokio::test]
async fn notification_then_websocket_reconciles_by_pane() {
    let hub = start_hub().await.unwrap();

    let response = post_messages(
        hub.port,
        json!({
            "message": "Agent needs input",
            "workspacePath": "/work/app",
            "terminal": {"type": "tmux", "pane_id": "%7"},
        }),
    )
    .await
    .unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

    // A notification-only session appears and the OS sink fires.
    let sessions = wait_for_sessions(&hub, |s| s.len() == 1).await.unwrap();
    assert!(sessions[0].is_notification_only());
    assert!(!sessions[0].is_active);
    assert_eq!(
        hub.notifier.delivered.lock().unwrap().as_slice(),
        [("Tim".to_owned(), "Agent needs input".to_owned())]
    );

    // The real agent for that pane arrives and adopts the session.
    let mut agent = connect_agent(hub.port).await.unwrap();
    send_json(
        &mut agent,
        json!({
            "type": "session_info",
            "command": "tim run",
            "workspacePath": "/work/app",
            "terminalType": "tmux",
            "terminalPaneId": "%7",
        }),
    )
    .await
    .unwrap();

    let sessions = wait_for_sessions(&hub, |s| s.len() == 1 && s[0].is_active).await.unwrap();
    assert_eq!(sessions[0].command, "tim run");
    assert!(sessions[0].unread_notification, "banner survives reconciliation");

    hub.hub.stop().await;
}

#[tokio::test]
async fn different_pane_never_merges_by_workspace() {
    let hub = start_hub().await.unwrap();

    post_messages(
        hub.port,
        json!({
            "message": "ping",
            "workspacePath": "/work/app",
            "terminal": {"type": "tmux", "pane_id": "%1"},
        }),
    )
    .await
    .unwrap();
    wait_for_sessions(&hub, |s| s.len() == 1).await.unwrap();

    let mut agent = connect_agent(hub.port).await.unwrap();
    send_json(
        &mut agent,
        json!({
            "type": "session_info",
            "command": "tim run",
            "workspacePath": "/work/app",
            "terminalType": "tmux",
            "terminalPaneId": "%2",
        }),
    )
    .await
    .unwrap();

    let sessions = wait_for_sessions(&hub, |s| s.len() == 2).await.unwrap();
    let active: Vec<bool> = sessions.iter().map(|s| s.is_active).collect();
    assert!(active.contains(&true) && active.contains(&false));

    hub.hub.stop().await;
}

#[tokio::test]
async fn workspace_notification_lands_on_live_session() {
    let hub = start_hub().await.unwrap();

    let mut agent = connect_agent(hub.port).await.unwrap();
    send_json(
        &mut agent,
        json!({"type": "session_info", "command": "tim run", "workspacePath": "/work/app"}),
    )
    .await
    .unwrap();
    wait_for_sessions(&hub, |s| s.len() == 1).await.unwrap();

    post_messages(hub.port, json!({"message": "All done", "workspacePath": "/work/app"}))
        .await
        .unwrap();

    let sessions = wait_for_sessions(&hub, |s| s[0].unread_notification).await.unwrap();
    assert_eq!(sessions.len(), 1, "no extra session is created");
    assert_eq!(sessions[0].notification_message.as_deref(), Some("All done"));

    hub.hub.stop().await;
}

#[tokio::test]
async fn input_required_event_raises_banner() {
    let hub = start_hub().await.unwrap();

    let mut agent = connect_agent(hub.port).await.unwrap();
    send_json(&mut agent, json!({"type": "session_info", "command": "tim run"})).await.unwrap();
    send_json(
        &mut agent,
        json!({"type": "output", "seq": 1, "message": {"type": "structured", "message": {
            "type": "input_required",
            "prompt": "choose a branch",
        }}}),
    )
    .await
    .unwrap();

    let sessions = wait_for_sessions(&hub, |s| {
        s.len() == 1 && s[0].unread_notification
    })
    .await
    .unwrap();
    assert_eq!(
        sessions[0].notification_message.as_deref(),
        Some("Input required: choose a branch")
    );
    assert_eq!(
        hub.notifier.delivered.lock().unwrap().as_slice(),
        [("Tim".to_owned(), "Input required: choose a branch".to_owned())]
    );

    hub.hub.stop().await;
}
