use std::{sync::Arc, time::Duration};

use axum::extract::ws::Message;
use keyfury_back::{
    config::AppConfig,
    dao::kv_store::memory::MemoryStore,
    services::{stats_service, timer_sync, websocket_service},
    state::{AppState, SharedState, hub::ClientConnection, room::RoomCode},
};
use serde_json::{Value, json};
use tokio::{sync::mpsc, time::sleep};
use uuid::Uuid;

struct Client {
    id: Uuid,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Client {
    fn connect(state: &SharedState) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = Uuid::new_v4();
        state.hub().register(ClientConnection { id, tx });
        Self { id, rx }
    }

    async fn send(&self, state: &SharedState, event: &str, data: Value) {
        let frame = json!({ "event": event, "data": data }).to_string();
        websocket_service::dispatch(state, self.id, &frame).await;
    }

    fn drain(&mut self) -> Vec<Value> {
        let mut events = Vec::new();
        while let Ok(message) = self.rx.try_recv() {
            if let Message::Text(text) = message {
                events.push(serde_json::from_str(text.as_str()).unwrap());
            }
        }
        events
    }
}

fn named<'a>(events: &'a [Value], name: &str) -> Vec<&'a Value> {
    events.iter().filter(|event| event["event"] == name).collect()
}

fn code(raw: &str) -> RoomCode {
    RoomCode::parse(raw).unwrap()
}

async fn new_state() -> SharedState {
    AppState::with_store(AppConfig::default(), Arc::new(MemoryStore::new())).await
}

async fn leader_ids(state: &SharedState, room: &RoomCode) -> Vec<String> {
    let store = state.store().await.unwrap();
    store
        .players(room)
        .await
        .unwrap()
        .into_iter()
        .filter(|(_, player)| player.is_leader)
        .map(|(id, _)| id)
        .collect()
}

async fn open_room(state: &SharedState, room: &str, players: &[&str]) -> Vec<Client> {
    let mut clients = Vec::new();
    for (index, user) in players.iter().enumerate() {
        let client = Client::connect(state);
        let event = if index == 0 { "createRoom" } else { "joinRoom" };
        client
            .send(
                state,
                event,
                json!({ "roomId": room, "userId": user, "username": user.to_uppercase() }),
            )
            .await;
        clients.push(client);
    }
    clients
}

#[tokio::test(start_paused = true)]
async fn create_join_leave_scenario() {
    let state = new_state().await;
    let room = code("R1");
    let store = state.store().await.unwrap();

    let mut c1 = Client::connect(&state);
    c1.send(
        &state,
        "createRoom",
        json!({ "roomId": "r1", "userId": "u1", "username": "one" }),
    )
    .await;
    let events = c1.drain();
    assert_eq!(events[0], json!({ "event": "createRoomAck", "data": { "success": true } }));
    assert_eq!(named(&events, "roomUpdate").len(), 1);
    assert_eq!(store.players(&room).await.unwrap().len(), 1);
    assert_eq!(leader_ids(&state, &room).await, vec!["u1"]);

    let mut c2 = Client::connect(&state);
    c2.send(
        &state,
        "joinRoom",
        json!({ "roomId": "R1", "userId": "u2", "username": "two" }),
    )
    .await;
    let joined = c2.drain();
    assert_eq!(named(&joined, "chatHistory").len(), 1);
    let update = named(&joined, "roomUpdate")[0];
    assert_eq!(update["data"].as_array().unwrap().len(), 2);
    assert_eq!(store.players(&room).await.unwrap().len(), 2);
    assert_eq!(leader_ids(&state, &room).await, vec!["u1"]);

    c1.send(&state, "leaveRoom", json!({ "roomId": "R1", "userId": "u1" }))
        .await;
    assert_eq!(store.players(&room).await.unwrap().len(), 1);
    assert_eq!(leader_ids(&state, &room).await, vec!["u2"]);
    assert_eq!(store.leader(&room).await.unwrap().as_deref(), Some("u2"));

    c2.send(&state, "leaveRoom", json!({ "roomId": "R1", "userId": "u2" }))
        .await;
    assert!(!store.room_exists(&room).await.unwrap());
    assert!(store.leader(&room).await.unwrap().is_none());
    assert!(store.session_start(&room).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn duplicate_create_is_nacked() {
    let state = new_state().await;
    let _owner = open_room(&state, "R1", &["u1"]).await;

    let mut other = Client::connect(&state);
    other
        .send(
            &state,
            "createRoom",
            json!({ "roomId": "R1", "userId": "u9", "username": "nine" }),
        )
        .await;
    let events = other.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["event"], "createRoomAck");
    assert_eq!(events[0]["data"]["success"], false);
    assert!(events[0]["data"]["message"].is_string());
}

#[tokio::test(start_paused = true)]
async fn joining_missing_room_reports_error() {
    let state = new_state().await;
    let mut client = Client::connect(&state);
    client
        .send(
            &state,
            "joinRoom",
            json!({ "roomId": "GHOST", "userId": "u1", "username": "one" }),
        )
        .await;
    let events = client.drain();
    assert_eq!(events, vec![json!({ "event": "error", "data": { "message": "Room not found" } })]);
}

#[tokio::test(start_paused = true)]
async fn round_counts_down_then_times_out_once() {
    let state = new_state().await;
    tokio::spawn(timer_sync::run(state.clone()));
    let room = code("R1");
    let mut clients = open_room(&state, "R1", &["u1", "u2"]).await;
    clients[1].drain();

    clients[0]
        .send(&state, "startTest", json!({ "roomId": "R1", "userId": "u1" }))
        .await;
    assert!(state.active_rooms().contains(&room));

    sleep(Duration::from_millis(5_500)).await;
    let events = clients[1].drain();
    let countdown: Vec<u64> = events
        .iter()
        .filter_map(|event| match event["event"].as_str() {
            Some("gameStarting") | Some("countdownUpdate") => event["data"]["countdown"].as_u64(),
            _ => None,
        })
        .collect();
    assert_eq!(countdown, vec![5, 4, 3, 2, 1]);
    let started = named(&events, "testStarted");
    assert_eq!(started.len(), 1);
    assert!(started[0]["data"]["startTime"].as_u64().is_some());

    sleep(Duration::from_secs(20)).await;
    let syncs = clients[1].drain();
    let last_sync = named(&syncs, "timerSync").last().copied().cloned().unwrap();
    assert_eq!(last_sync["data"]["running"], true);
    assert!(last_sync["data"]["serverTime"].as_u64().is_some());
    let remaining = last_sync["data"]["remaining"].as_u64().unwrap();
    assert!((118..=121).contains(&remaining), "remaining {remaining}");

    // Deadline is 140 s + 2 s guard after launch, i.e. 147 s after the start request.
    sleep(Duration::from_secs(121)).await;
    assert!(named(&clients[1].drain(), "testEnded").is_empty());

    sleep(Duration::from_secs(1)).await;
    let ended_events = clients[1].drain();
    let ended = named(&ended_events, "testEnded");
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0]["data"]["reason"], "time_up");
    assert!(!state.active_rooms().contains(&room));

    sleep(Duration::from_secs(300)).await;
    assert!(named(&clients[1].drain(), "testEnded").is_empty());
    let store = state.store().await.unwrap();
    assert!(store.session_start(&room).await.unwrap().is_none());
    assert!(store.room_exists(&room).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn on_demand_timer_sync() {
    let state = new_state().await;
    let mut clients = open_room(&state, "R1", &["u1"]).await;
    clients[0].drain();

    clients[0]
        .send(&state, "getTimerSync", json!({ "roomId": "R1" }))
        .await;
    let idle = clients[0].drain();
    assert_eq!(idle.len(), 1);
    assert_eq!(idle[0]["data"]["running"], false);
    assert_eq!(idle[0]["data"]["remaining"], 140);
    assert!(idle[0]["data"]["serverTime"].as_u64().is_some());

    clients[0]
        .send(&state, "startTest", json!({ "roomId": "R1", "userId": "u1" }))
        .await;
    sleep(Duration::from_millis(5_500)).await;
    sleep(Duration::from_secs(10)).await;
    clients[0].drain();

    clients[0]
        .send(&state, "getTimerSync", json!({ "roomId": "R1" }))
        .await;
    let running = clients[0].drain();
    assert_eq!(running[0]["data"]["running"], true);
    assert_eq!(running[0]["data"]["remaining"], 130);
}

#[tokio::test(start_paused = true)]
async fn all_finished_ends_round_exactly_once() {
    let state = new_state().await;
    let room = code("R1");
    let mut clients = open_room(&state, "R1", &["u1", "u2"]).await;

    clients[0]
        .send(&state, "startTest", json!({ "roomId": "R1", "userId": "u1" }))
        .await;
    sleep(Duration::from_millis(5_500)).await;
    for client in clients.iter_mut() {
        client.drain();
    }

    let finish = |user: &str| json!({ "roomId": "R1", "userId": user, "wpm": 88.0, "progress": 100.0, "accuracy": 97.0 });
    clients[0].send(&state, "updateStats", finish("u1")).await;
    let first = clients[0].drain();
    assert_eq!(named(&first, "liveStats").len(), 1);
    assert_eq!(named(&first, "playerFinished").len(), 1);
    assert!(named(&clients[1].drain(), "playerFinished").is_empty());

    clients[1].send(&state, "updateStats", finish("u2")).await;
    // A late duplicate after the round ended changes nothing.
    clients[1].send(&state, "updateStats", finish("u2")).await;

    let events = clients[0].drain();
    let ended = named(&events, "testEnded");
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0]["data"]["reason"], "all_finished");
    assert!(named(&events, "liveStats").is_empty());
    assert!(!state.active_rooms().contains(&room));

    sleep(Duration::from_secs(200)).await;
    assert!(named(&clients[0].drain(), "testEnded").is_empty());
}

#[tokio::test(start_paused = true)]
async fn progress_is_monotonic_and_frozen_after_finish() {
    let state = new_state().await;
    let room = code("R1");
    let clients = open_room(&state, "R1", &["u1", "u2"]).await;
    clients[0]
        .send(&state, "startTest", json!({ "roomId": "R1", "userId": "u1" }))
        .await;
    sleep(Duration::from_millis(5_500)).await;

    let stats = |wpm: f64, progress: f64| {
        json!({ "roomId": "R1", "userId": "u1", "wpm": wpm, "progress": progress, "accuracy": 95.0 })
    };
    clients[0].send(&state, "updateStats", stats(40.0, 50.0)).await;
    clients[0].send(&state, "updateStats", stats(45.0, 30.0)).await;

    let store = state.store().await.unwrap();
    let player = store.player(&room, "u1").await.unwrap().unwrap();
    assert_eq!(player.progress, 50.0);
    assert_eq!(player.wpm, 45.0);
    assert_eq!(player.performance_history.len(), 2);

    clients[0].send(&state, "updateStats", stats(60.0, 120.0)).await;
    clients[0].send(&state, "updateStats", stats(10.0, 10.0)).await;
    let player = store.player(&room, "u1").await.unwrap().unwrap();
    assert!(player.finished);
    assert_eq!(player.progress, 100.0);
    assert_eq!(player.wpm, 60.0);
    assert_eq!(player.finish_time, Some(0));
    assert_eq!(player.performance_history.len(), 3);

    // A new round resets every player.
    clients[0]
        .send(&state, "startTest", json!({ "roomId": "R1", "userId": "u1" }))
        .await;
    let player = store.player(&room, "u1").await.unwrap().unwrap();
    assert_eq!(player.progress, 0.0);
    assert!(!player.finished);
    assert!(player.performance_history.is_empty());
    assert_eq!(player.accuracy, 100.0);
}

#[tokio::test(start_paused = true)]
async fn stats_outside_a_round_or_room_are_ignored() {
    let state = new_state().await;
    let room = code("R1");
    let mut clients = open_room(&state, "R1", &["u1"]).await;
    clients[0].drain();

    let stats = |user: &str| json!({ "roomId": "R1", "userId": user, "wpm": 10.0, "progress": 10.0, "accuracy": 90.0 });
    clients[0].send(&state, "updateStats", stats("u1")).await;
    clients[0].send(&state, "updateStats", stats("ghost")).await;

    assert!(clients[0].drain().is_empty());
    let store = state.store().await.unwrap();
    let player = store.player(&room, "u1").await.unwrap().unwrap();
    assert_eq!(player.progress, 0.0);
    assert!(player.performance_history.is_empty());
}

#[tokio::test(start_paused = true)]
async fn non_leader_cannot_start_or_end() {
    let state = new_state().await;
    let room = code("R1");
    let mut clients = open_room(&state, "R1", &["u1", "u2"]).await;
    clients[0].drain();

    clients[1]
        .send(&state, "startTest", json!({ "roomId": "R1", "userId": "u2" }))
        .await;
    assert!(clients[0].drain().is_empty());
    assert!(!state.active_rooms().contains(&room));

    clients[0]
        .send(&state, "startTest", json!({ "roomId": "R1", "userId": "u1" }))
        .await;
    sleep(Duration::from_millis(5_500)).await;
    clients[1].send(&state, "endTest", json!({ "roomId": "R1" })).await;
    let events = clients[0].drain();
    assert!(named(&events, "testEnded").is_empty());

    clients[0].send(&state, "endTest", json!({ "roomId": "R1" })).await;
    let events = clients[1].drain();
    let ended = named(&events, "testEnded");
    assert_eq!(ended.len(), 1);
    assert_eq!(ended[0]["data"]["reason"], "manual_end");

    sleep(Duration::from_secs(200)).await;
    assert!(named(&clients[1].drain(), "testEnded").is_empty());
}

#[tokio::test(start_paused = true)]
async fn restart_during_countdown_launches_once() {
    let state = new_state().await;
    let mut clients = open_room(&state, "R1", &["u1"]).await;
    let start = json!({ "roomId": "R1", "userId": "u1" });

    clients[0].send(&state, "startTest", start.clone()).await;
    sleep(Duration::from_millis(2_500)).await;
    clients[0].send(&state, "startTest", start).await;
    sleep(Duration::from_secs(10)).await;

    let events = clients[0].drain();
    assert_eq!(named(&events, "gameStarting").len(), 2);
    assert_eq!(named(&events, "testStarted").len(), 1);
}

#[tokio::test(start_paused = true)]
async fn emptied_room_cancels_its_round() {
    let state = new_state().await;
    let room = code("R1");
    let clients = open_room(&state, "R1", &["u1", "u2"]).await;
    clients[0]
        .send(&state, "startTest", json!({ "roomId": "R1", "userId": "u1" }))
        .await;
    sleep(Duration::from_millis(5_500)).await;

    clients[0]
        .send(&state, "leaveRoom", json!({ "roomId": "R1", "userId": "u1" }))
        .await;
    clients[1]
        .send(&state, "leaveRoom", json!({ "roomId": "R1", "userId": "u2" }))
        .await;

    assert!(!state.active_rooms().contains(&room));
    assert!(state.rounds().generation(&room).is_none());
    let store = state.store().await.unwrap();
    assert!(!store.room_exists(&room).await.unwrap());
    assert!(store.session_start(&room).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn exactly_one_leader_through_departures() {
    let state = new_state().await;
    let room = code("R1");
    let users = ["u1", "u2", "u3", "u4"];
    let clients = open_room(&state, "R1", &users).await;

    for (index, departing) in ["u3", "u1", "u4"].iter().enumerate() {
        let client = &clients[users.iter().position(|user| user == departing).unwrap()];
        client
            .send(&state, "leaveRoom", json!({ "roomId": "R1", "userId": departing }))
            .await;

        let store = state.store().await.unwrap();
        assert_eq!(store.players(&room).await.unwrap().len(), users.len() - index - 1);
        let leaders = leader_ids(&state, &room).await;
        assert_eq!(leaders.len(), 1);
        assert_eq!(store.leader(&room).await.unwrap().as_ref(), leaders.first());
    }
    assert_eq!(leader_ids(&state, &room).await, vec!["u2"]);
}

#[tokio::test(start_paused = true)]
async fn chat_history_is_pushed_on_join() {
    let state = new_state().await;
    let clients = open_room(&state, "R1", &["u1"]).await;
    clients[0]
        .send(&state, "chatMessage", json!({ "roomId": "R1", "userId": "u1", "message": "hi" }))
        .await;

    let mut joiner = Client::connect(&state);
    joiner
        .send(
            &state,
            "joinRoom",
            json!({ "roomId": "R1", "userId": "u2", "username": "two" }),
        )
        .await;
    let events = joiner.drain();
    let history = named(&events, "chatHistory");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0]["data"][0]["message"], "hi");
    assert_eq!(history[0]["data"][0]["username"], "U1");
}

#[tokio::test(start_paused = true)]
async fn results_project_final_standings() {
    let state = new_state().await;
    let room = code("R1");
    let clients = open_room(&state, "R1", &["u1", "u2"]).await;
    clients[0]
        .send(&state, "startTest", json!({ "roomId": "R1", "userId": "u1" }))
        .await;
    sleep(Duration::from_millis(5_500)).await;
    clients[1]
        .send(
            &state,
            "updateStats",
            json!({ "roomId": "R1", "userId": "u2", "wpm": 70.0, "progress": 40.0, "accuracy": 92.0 }),
        )
        .await;

    let results = stats_service::get_results(&state, &room).await.unwrap();
    let value = serde_json::to_value(&results).unwrap();
    assert_eq!(value["players"][0]["userId"], "u1");
    assert_eq!(value["players"][1]["finalWpm"], 70.0);
    assert_eq!(value["players"][1]["performanceHistory"].as_array().unwrap().len(), 1);

    assert!(stats_service::get_results(&state, &code("GHOST")).await.is_err());
}
