// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end agent flows over a real loopback socket.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio_tungstenite::tungstenite::Message;

use timhub::session::message::Category;
use timhub_specs::{connect_agent, next_text, send_json, start_hub, wait_for_sessions};

#[tokio::test]
async fn session_info_then_outputs_build_the_log() {
    let hub = start_hub().await.unwrap();
    let mut agent = connect_agent(hub.port).await.unwrap();

    send_json(&mut agent, json!({"type": "session_info", "command": "agent", "terminalPaneId": "42"}))
        .await
        .unwrap();
    send_json(
        &mut agent,
        json!({"type": "output", "seq": 1, "message": {"type": "structured", "message": {"type": "agent_session_start"}}}),
    )
    .await
    .unwrap();
    send_json(
        &mut agent,
        json!({"type": "output", "seq": 2, "message": {"type": "stderr", "data": "boom"}}),
    )
    .await
    .unwrap();

    let sessions = wait_for_sessions(&hub, |s| {
        s.len() == 1 && s[0].messages.len() == 2
    })
    .await
    .unwrap();
    let session = &sessions[0];
    assert_eq!(session.command, "agent");
    assert!(session.is_active);
    assert_eq!(session.messages[0].seq, 1);
    assert_eq!(session.messages[1].category, Category::Error);
    assert_eq!(session.messages[1].text(), Some("boom"));

    hub.hub.stop().await;
}

#[tokio::test]
async fn output_before_session_info_is_flushed_in_order() {
    let hub = start_hub().await.unwrap();
    let mut agent = connect_agent(hub.port).await.unwrap();

    send_json(
        &mut agent,
        json!({"type": "output", "seq": 1, "message": {"type": "log", "args": ["hi"]}}),
    )
    .await
    .unwrap();
    send_json(&mut agent, json!({"type": "session_info", "command": "x"})).await.unwrap();

    let sessions = wait_for_sessions(&hub, |s| s.len() == 1 && s[0].messages.len() == 1)
        .await
        .unwrap();
    assert_eq!(sessions[0].messages[0].text(), Some("hi"));
    assert_eq!(sessions[0].messages[0].category, Category::Log);

    hub.hub.stop().await;
}

#[tokio::test]
async fn replay_window_flushes_atomically() {
    let hub = start_hub().await.unwrap();
    let mut agent = connect_agent(hub.port).await.unwrap();

    send_json(&mut agent, json!({"type": "session_info", "command": "agent"})).await.unwrap();
    send_json(&mut agent, json!({"type": "replay_start"})).await.unwrap();
    send_json(
        &mut agent,
        json!({"type": "output", "seq": 1, "message": {"type": "log", "args": ["one"]}}),
    )
    .await
    .unwrap();
    send_json(
        &mut agent,
        json!({"type": "output", "seq": 2, "message": {"type": "log", "args": ["two"]}}),
    )
    .await
    .unwrap();
    send_json(&mut agent, json!({"type": "replay_end"})).await.unwrap();

    let sessions =
        wait_for_sessions(&hub, |s| s.len() == 1 && s[0].force_scroll_version == 1)
            .await
            .unwrap();
    assert_eq!(sessions[0].messages.len(), 2);
    assert_eq!(sessions[0].messages[0].text(), Some("one"));
    assert_eq!(sessions[0].messages[1].text(), Some("two"));

    hub.hub.stop().await;
}

#[tokio::test]
async fn binary_frames_close_with_1003_and_disconnect() {
    let hub = start_hub().await.unwrap();
    let mut agent = connect_agent(hub.port).await.unwrap();

    send_json(&mut agent, json!({"type": "session_info", "command": "agent"})).await.unwrap();
    wait_for_sessions(&hub, |s| s.len() == 1).await.unwrap();

    agent.send(Message::binary(vec![0u8, 1, 2])).await.unwrap();

    // The server answers with close code 1003 (unsupported data).
    let mut close_code = None;
    while let Some(Ok(frame)) = agent.next().await {
        if let Message::Close(Some(frame)) = frame {
            close_code = Some(u16::from(frame.code));
            break;
        }
    }
    assert_eq!(close_code, Some(1003));

    // The aggregator sees the disconnect exactly once.
    let sessions = wait_for_sessions(&hub, |s| !s[0].is_active).await.unwrap();
    assert_eq!(
        sessions[0].notification_message.as_deref(),
        Some("Agent session disconnected")
    );

    hub.hub.stop().await;
}

#[tokio::test]
async fn user_input_reaches_agent_and_gui_echo_is_suppressed() {
    let hub = start_hub().await.unwrap();
    let mut agent = connect_agent(hub.port).await.unwrap();

    send_json(&mut agent, json!({"type": "session_info", "command": "agent"})).await.unwrap();
    let sessions = wait_for_sessions(&hub, |s| s.len() == 1).await.unwrap();
    let session_id = sessions[0].session_id.clone();

    hub.hub.aggregator.send_user_input(&session_id, "hello").await.unwrap();

    // The agent receives the typed envelope.
    let received: serde_json::Value =
        serde_json::from_str(&next_text(&mut agent).await.unwrap()).unwrap();
    assert_eq!(received, json!({"type": "user_input", "content": "hello"}));

    // Local echo appended exactly one message.
    let sessions = wait_for_sessions(&hub, |s| s[0].messages.len() == 1).await.unwrap();
    assert_eq!(sessions[0].messages[0].title.as_deref(), Some("You"));

    // The agent's gui-tagged echo must not double it.
    send_json(
        &mut agent,
        json!({"type": "output", "seq": 5, "message": {"type": "structured", "message": {"type": "user_terminal_input", "content": "hello", "source": "gui"}}}),
    )
    .await
    .unwrap();
    send_json(
        &mut agent,
        json!({"type": "output", "seq": 6, "message": {"type": "log", "args": ["after"]}}),
    )
    .await
    .unwrap();

    let sessions = wait_for_sessions(&hub, |s| s[0].messages.len() == 2).await.unwrap();
    assert_eq!(sessions[0].messages[1].text(), Some("after"));

    hub.hub.stop().await;
}

#[tokio::test]
async fn prompt_roundtrip_sets_answers_and_clears() {
    let hub = start_hub().await.unwrap();
    let mut agent = connect_agent(hub.port).await.unwrap();

    send_json(&mut agent, json!({"type": "session_info", "command": "agent"})).await.unwrap();
    send_json(
        &mut agent,
        json!({"type": "output", "seq": 1, "message": {"type": "structured", "message": {
            "type": "prompt_request",
            "requestId": "r1",
            "promptType": "confirm",
            "config": {"message": "Proceed?"},
        }}}),
    )
    .await
    .unwrap();

    let sessions = wait_for_sessions(&hub, |s| {
        s.len() == 1 && s[0].pending_prompt.is_some()
    })
    .await
    .unwrap();
    let session_id = sessions[0].session_id.clone();
    assert_eq!(sessions[0].pending_prompt.as_ref().unwrap().request_id, "r1");

    hub.hub
        .aggregator
        .send_prompt_response(&session_id, "r1", &timhub::protocol::PromptResponseValue::Bool(true))
        .await
        .unwrap();

    let received: serde_json::Value =
        serde_json::from_str(&next_text(&mut agent).await.unwrap()).unwrap();
    assert_eq!(received, json!({"type": "prompt_response", "requestId": "r1", "value": true}));

    // The agent acknowledges; the pending prompt clears.
    send_json(
        &mut agent,
        json!({"type": "output", "seq": 2, "message": {"type": "structured", "message": {
            "type": "prompt_answered",
            "requestId": "r1",
            "promptType": "confirm",
            "source": "gui",
        }}}),
    )
    .await
    .unwrap();

    wait_for_sessions(&hub, |s| s[0].pending_prompt.is_none()).await.unwrap();

    hub.hub.stop().await;
}

#[tokio::test]
async fn agent_close_marks_session_disconnected() {
    let hub = start_hub().await.unwrap();
    let mut agent = connect_agent(hub.port).await.unwrap();

    send_json(&mut agent, json!({"type": "session_info", "command": "agent"})).await.unwrap();
    wait_for_sessions(&hub, |s| s.len() == 1).await.unwrap();

    agent.close(None).await.unwrap();

    let sessions = wait_for_sessions(&hub, |s| !s[0].is_active).await.unwrap();
    assert!(sessions[0].pending_prompt.is_none());
    assert!(sessions[0].unread_notification);

    hub.hub.stop().await;
}

#[tokio::test]
async fn stop_closes_live_agents() {
    let hub = start_hub().await.unwrap();
    let mut agent = connect_agent(hub.port).await.unwrap();
    send_json(&mut agent, json!({"type": "session_info", "command": "agent"})).await.unwrap();
    wait_for_sessions(&hub, |s| s.len() == 1).await.unwrap();

    hub.hub.stop().await;

    // The agent observes the shutdown: a close frame (1001), an error, or
    // the socket simply ending. Anything else within the deadline fails.
    tokio::time::timeout(std::time::Duration::from_secs(3), async {
        loop {
            match agent.next().await {
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                Some(Ok(_)) => {}
            }
        }
    })
    .await
    .unwrap();
}
