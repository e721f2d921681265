//! The state WebSocket pushes the full session list as JSON on connect and
//! after every lifecycle change.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use common::{sample_info, spawn_server, state_with_session, FakeLink};
use webmux::hostipc::client::HostLink;

async fn next_json(
    ws: &mut (impl StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin),
) -> serde_json::Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .expect("state message within deadline")
            .expect("stream open")
            .expect("no ws error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).expect("valid JSON");
        }
    }
}

fn session_ids(update: &serde_json::Value) -> Vec<String> {
    update["sessions"]["sessions"]
        .as_array()
        .expect("sessions array")
        .iter()
        .map(|s| s["id"].as_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn full_list_on_connect() {
    let (state, _link) = state_with_session("abcd1234");
    let addr = spawn_server(state).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/state"))
        .await
        .expect("state websocket connect");

    let update = next_json(&mut ws).await;
    assert_eq!(session_ids(&update), vec!["abcd1234".to_string()]);

    // The wire shape carries camelCase session records.
    let record = &update["sessions"]["sessions"][0];
    assert_eq!(record["isRunning"], true);
    assert_eq!(record["cols"], 80);
    assert_eq!(record["shellType"], "default");
}

#[tokio::test]
async fn updates_follow_lifecycle_changes() {
    let (state, _link) = state_with_session("abcd1234");
    let sessions = state.sessions.clone();
    let addr = spawn_server(state).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/state"))
        .await
        .expect("state websocket connect");
    let initial = next_json(&mut ws).await;
    assert_eq!(session_ids(&initial).len(), 1);

    let link = FakeLink::new();
    sessions.adopt_session(sample_info("wxyz5678"), link as Arc<dyn HostLink>);

    let update = next_json(&mut ws).await;
    let mut ids = session_ids(&update);
    ids.sort();
    assert_eq!(ids, vec!["abcd1234".to_string(), "wxyz5678".to_string()]);

    sessions.close_session("abcd1234");
    let update = next_json(&mut ws).await;
    assert_eq!(session_ids(&update), vec!["wxyz5678".to_string()]);
}

#[tokio::test]
async fn burst_of_changes_collapses() {
    let (state, _link) = state_with_session("abcd1234");
    let sessions = state.sessions.clone();
    let addr = spawn_server(state).await;

    let (mut ws, _) = connect_async(format!("ws://{addr}/ws/state"))
        .await
        .expect("state websocket connect");
    let _initial = next_json(&mut ws).await;

    // Rapid-fire changes inside the debounce window.
    for id in ["e1e1e1e1", "e2e2e2e2", "e3e3e3e3"] {
        let link = FakeLink::new();
        sessions.adopt_session(sample_info(id), link as Arc<dyn HostLink>);
    }

    // Updates are debounced; whatever arrives converges on the full list
    // without needing one message per change.
    let mut update = next_json(&mut ws).await;
    while session_ids(&update).len() < 4 {
        update = next_json(&mut ws).await;
    }
    assert_eq!(session_ids(&update).len(), 4);
}
