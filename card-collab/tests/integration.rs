//! Integration tests for end-to-end WebSocket collaboration.
//!
//! These tests start a real gateway and connect real providers,
//! verifying the full merge → relay → persist → debounced write pipeline.

use async_trait::async_trait;
use card_collab::client::{connect, ConnectedProvider, LocalUser, ProviderEvent};
use card_collab::config::ServerConfig;
use card_collab::debounce::CardUpdater;
use card_collab::gateway::Gateway;
use card_collab::protocol::{Actor, ClientMessage, RoomId, ServerMessage};
use card_collab::store::DocumentStore;
use card_collab::Result;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message;

// ─── Helpers ─────────────────────────────────────────────────────────────────

/// Records every description write.
#[derive(Default)]
struct RecordingUpdater {
    calls: Mutex<Vec<(String, Value, Option<String>)>>,
}

impl RecordingUpdater {
    fn calls(&self) -> Vec<(String, Value, Option<String>)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl CardUpdater for RecordingUpdater {
    async fn update_card_description(
        &self,
        card_id: &str,
        content: Value,
        actor: Option<&Actor>,
    ) -> Result<()> {
        self.calls.lock().push((
            card_id.to_string(),
            content,
            actor.map(|a| a.user_id.clone()),
        ));
        Ok(())
    }
}

struct TestGateway {
    url: String,
    gateway: Arc<Gateway>,
    updater: Arc<RecordingUpdater>,
    shutdown: Option<oneshot::Sender<()>>,
    server: JoinHandle<()>,
}

impl TestGateway {
    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        timeout(Duration::from_secs(5), &mut self.server)
            .await
            .expect("gateway did not stop")
            .unwrap();
    }
}

/// Start a gateway on a free port.
async fn start_gateway(save_debounce: Duration, store: DocumentStore) -> TestGateway {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        save_debounce,
        broadcast_capacity: 64,
        ..ServerConfig::bound_to(addr)
    };
    let updater = Arc::new(RecordingUpdater::default());
    let gateway = Gateway::new(config, store, updater.clone());

    let (tx, rx) = oneshot::channel::<()>();
    let server = {
        let gateway = gateway.clone();
        tokio::spawn(async move {
            gateway
                .serve(listener, async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        })
    };

    TestGateway {
        url: format!("ws://{addr}"),
        gateway,
        updater,
        shutdown: Some(tx),
        server,
    }
}

fn actor(id: &str, name: &str) -> Actor {
    Actor {
        user_id: id.into(),
        name: Some(name.into()),
    }
}

async fn join(
    tg: &TestGateway,
    card: &str,
    user: &str,
) -> (ConnectedProvider, mpsc::UnboundedReceiver<ProviderEvent>) {
    let who = actor(&format!("u-{}", user.to_lowercase()), user);
    let (provider, mut events) = connect(&tg.url, card, LocalUser::new(user), Some(&who))
        .await
        .unwrap();
    wait_for_event(&mut events, |e| *e == ProviderEvent::Synced).await;
    (provider, events)
}

async fn wait_for_event(
    events: &mut mpsc::UnboundedReceiver<ProviderEvent>,
    pred: impl Fn(&ProviderEvent) -> bool,
) -> ProviderEvent {
    timeout(Duration::from_secs(3), async {
        loop {
            match events.recv().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for provider event")
}

/// Poll `cond` until it holds.
async fn eventually(what: &str, cond: impl Fn() -> bool) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never held: {what}");
}

async fn stored_text(tg: &TestGateway, card: &str) -> Option<String> {
    tg.gateway
        .registry()
        .store()
        .load(&RoomId::for_card(card))
        .await
        .unwrap()
        .map(|doc| doc.plain_text())
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_hello_world_end_to_end() {
    let tg = start_gateway(Duration::from_millis(800), DocumentStore::in_memory()).await;
    let (alice, _alice_events) = join(&tg, "1", "Alice").await;
    let (bob, _bob_events) = join(&tg, "1", "Bob").await;

    alice.with(|p| p.document().append_text("Hello"));
    eventually("bob sees Hello", || bob.plain_text() == "Hello").await;

    bob.with(|p| p.document().append_text(" world"));
    eventually("alice sees Hello world", || alice.plain_text() == "Hello world").await;
    assert_eq!(bob.plain_text(), "Hello world");

    for _ in 0..300 {
        if stored_text(&tg, "1").await.as_deref() == Some("Hello world") {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(stored_text(&tg, "1").await.as_deref(), Some("Hello world"));

    // One debounced write carrying the final content and the last editor.
    eventually("description written", || !tg.updater.calls().is_empty()).await;
    sleep(Duration::from_millis(300)).await;
    let calls = tg.updater.calls();
    assert_eq!(calls.len(), 1, "writes: {calls:?}");
    let (card_id, content, acting) = &calls[0];
    assert_eq!(card_id, "1");
    assert_eq!(
        *content,
        json!({
            "type": "doc",
            "content": [
                { "type": "paragraph", "content": [ { "type": "text", "text": "Hello world" } ] }
            ]
        })
    );
    assert_eq!(acting.as_deref(), Some("u-bob"));

    alice.close().await.unwrap();
    bob.close().await.unwrap();
    tg.stop().await;
}

#[tokio::test]
async fn test_rooms_isolated_over_websocket() {
    let tg = start_gateway(Duration::from_millis(50), DocumentStore::in_memory()).await;
    let (alice, _a) = join(&tg, "1", "Alice").await;
    let (carol, _c) = join(&tg, "2", "Carol").await;

    alice.with(|p| p.document().append_text("card one only"));
    eventually("card 1 written", || {
        tg.updater.calls().iter().any(|(card, _, _)| card == "1")
    })
    .await;

    assert_eq!(carol.plain_text(), "");
    assert_eq!(stored_text(&tg, "2").await, None);
    assert!(tg.updater.calls().iter().all(|(card, _, _)| card == "1"));

    alice.close().await.unwrap();
    carol.close().await.unwrap();
    tg.stop().await;
}

#[tokio::test]
async fn test_late_joiner_receives_full_state() {
    let tg = start_gateway(Duration::from_millis(50), DocumentStore::in_memory()).await;
    let (alice, _a) = join(&tg, "1", "Alice").await;

    alice.with(|p| {
        p.document().append_text("first");
        p.document().push_paragraph("second");
    });
    for _ in 0..300 {
        if stored_text(&tg, "1").await.as_deref() == Some("first\nsecond") {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }

    let (late, _l) = join(&tg, "1", "Late").await;
    assert_eq!(late.plain_text(), "first\nsecond");

    alice.close().await.unwrap();
    late.close().await.unwrap();
    tg.stop().await;
}

#[tokio::test]
async fn test_presence_cleanup_after_disconnect() {
    let tg = start_gateway(Duration::from_millis(50), DocumentStore::in_memory()).await;
    let (alice, _a) = join(&tg, "1", "Alice").await;
    let (bob, _b) = join(&tg, "1", "Bob").await;

    eventually("bob sees alice", || {
        bob.remote_presence()
            .iter()
            .any(|(_, state)| state.user.name == "Alice")
    })
    .await;
    eventually("alice sees bob", || {
        alice
            .remote_presence()
            .iter()
            .any(|(_, state)| state.user.name == "Bob")
    })
    .await;

    alice.close().await.unwrap();
    eventually("alice gone for bob", || bob.remote_presence().is_empty()).await;

    let room = tg.gateway.registry().get(&RoomId::for_card("1")).await.unwrap();
    let names: Vec<String> = room
        .lock()
        .await
        .presence
        .remote_states()
        .into_iter()
        .map(|(_, s)| s.user.name)
        .collect();
    assert_eq!(names, vec!["Bob".to_string()]);

    bob.close().await.unwrap();
    tg.stop().await;
}

#[tokio::test]
async fn test_malformed_frame_keeps_connection_open() {
    let tg = start_gateway(Duration::from_millis(50), DocumentStore::in_memory()).await;
    let (mut ws, _) = tokio_tungstenite::connect_async(tg.url.as_str()).await.unwrap();

    ws.send(Message::text("{not json")).await.unwrap();
    ws.send(Message::text(
        r#"{"event":"card:update","data":{"cardId":"3","update":"AAA="}}"#,
    ))
    .await
    .unwrap();
    let join = ClientMessage::Join {
        card_id: "3".into(),
    };
    ws.send(Message::text(join.encode().unwrap())).await.unwrap();

    let mut events = Vec::new();
    while events.len() < 2 {
        let frame = timeout(Duration::from_secs(3), ws.next())
            .await
            .expect("no reply")
            .expect("socket closed")
            .unwrap();
        if let Message::Text(text) = frame {
            events.push(ServerMessage::decode(text.as_str()).unwrap());
        }
    }
    assert!(matches!(events[0], ServerMessage::Awareness { .. }));
    assert!(matches!(events[1], ServerMessage::Sync { .. }));

    tg.stop().await;
}

#[tokio::test]
async fn test_shutdown_flushes_pending_writes() {
    let tg = start_gateway(Duration::from_secs(60), DocumentStore::in_memory()).await;
    let (alice, _a) = join(&tg, "1", "Alice").await;

    alice.with(|p| p.document().append_text("save me"));
    eventually("write scheduled", || tg.gateway.debouncer().is_pending("1")).await;
    assert!(tg.updater.calls().is_empty());

    let updater = tg.updater.clone();
    tg.stop().await;
    let calls = updater.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].2.as_deref(), Some("u-alice"));

    alice.close().await.unwrap();
}

#[tokio::test]
async fn test_room_evicted_after_everyone_leaves() {
    let tg = start_gateway(Duration::from_millis(50), DocumentStore::in_memory()).await;
    let (alice, _a) = join(&tg, "1", "Alice").await;
    alice.with(|p| p.document().append_text("kept on disk"));
    for _ in 0..300 {
        if stored_text(&tg, "1").await.is_some() {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    alice.close().await.unwrap();

    for _ in 0..300 {
        if tg.gateway.registry().room_count().await == 0 {
            break;
        }
        sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(tg.gateway.registry().room_count().await, 0);

    // Rejoining reloads from the store.
    let (again, _g) = join(&tg, "1", "Alice").await;
    assert_eq!(again.plain_text(), "kept on disk");
    again.close().await.unwrap();
    tg.stop().await;
}
