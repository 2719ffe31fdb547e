//! End-to-end websocket sessions against a bound server.
//!
//! These run on the real clock, so they never wait on game timers: the
//! countdown is either not reached or configured far beyond the test.

use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use quizroom_core::SessionConfig;
use quizroom_proto::{Envelope, ErrorCode, Phase, ServerMessage};
use quizroom_server::{
    Coordinator, CoordinatorConfig, RedbStorage, Server, ServerRuntimeConfig, Storage, SystemEnv,
    TimingConfig,
};
use tempfile::TempDir;
use tokio::{net::TcpStream, sync::oneshot, task::JoinHandle};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const QUESTIONS: &str = r#"[
    {"id": 1, "theme_id": 1, "text": "Q1", "correct_answer": "A1", "wrong_answers": ["B", "C", "D"]},
    {"id": 2, "theme_id": 1, "text": "Q2", "correct_answer": "A2", "wrong_answers": ["B", "C", "D"]},
    {"id": 3, "theme_id": 1, "text": "Q3", "correct_answer": "A3", "wrong_answers": ["B", "C", "D"]}
]"#;

const CREATE_ROOM: &str = r#"{"type":"create_room","payload":{"max_players":2,"question_count":3,"time_limit":10,"theme_ids":[1]}}"#;

struct Running {
    url: String,
    coordinator: Coordinator<SystemEnv>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
    dir: TempDir,
}

async fn start() -> Running {
    start_with(CoordinatorConfig::default()).await
}

async fn start_with(coordinator: CoordinatorConfig) -> Running {
    let dir = tempfile::tempdir().unwrap();
    let questions_path = dir.path().join("questions.json");
    std::fs::write(&questions_path, QUESTIONS).unwrap();

    let config = ServerRuntimeConfig {
        bind_address: "127.0.0.1:0".to_string(),
        questions_path: Some(questions_path),
        db_path: Some(dir.path().join("events.redb")),
        coordinator,
    };
    let server = Server::bind(config).await.unwrap();
    let url = format!("ws://{}/ws", server.local_addr().unwrap());
    let coordinator = server.coordinator().clone();

    let (shutdown, rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        server
            .run_until(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    Running { url, coordinator, shutdown, task, dir }
}

async fn connect(url: &str, player_id: &str) -> Socket {
    let (socket, _) = connect_async(format!("{url}?player_id={player_id}&username={player_id}"))
        .await
        .unwrap();
    socket
}

async fn send(socket: &mut Socket, text: &str) {
    socket.send(Message::text(text)).await.unwrap();
}

/// Next application frame, skipping transport pings.
async fn recv(socket: &mut Socket) -> Envelope {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Text(text) = frame {
            return Envelope::decode(text.as_str()).unwrap();
        }
    }
}

/// Read until the server's close frame and return its code.
async fn close_code(socket: &mut Socket) -> u16 {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Close(frame) = frame {
            return frame.map(|f| u16::from(f.code)).unwrap();
        }
    }
}

/// Alice creates a two-seat room and bob joins it. Returns the room code
/// with both lobby broadcasts consumed.
async fn seat_two(alice: &mut Socket, bob: &mut Socket) -> String {
    send(alice, CREATE_ROOM).await;
    let ServerMessage::RoomUpdate(update) = recv(alice).await.message else {
        panic!("expected room_update");
    };
    let room_code = update.room_code;

    send(bob, &join_room(&room_code)).await;
    for socket in [alice, bob] {
        assert_eq!(recv(socket).await.message.kind(), "player_joined");
        assert_eq!(recv(socket).await.message.kind(), "room_update");
    }
    room_code
}

fn join_room(room_code: &str) -> String {
    format!(r#"{{"type":"join_room","payload":{{"room_code":"{room_code}"}}}}"#)
}

#[tokio::test]
async fn ping_gets_direct_pong() {
    let running = start().await;
    let mut socket = connect(&running.url, "alice").await;

    send(&mut socket, r#"{"type":"ping"}"#).await;
    let reply = recv(&mut socket).await;

    assert!(matches!(reply.message, ServerMessage::Pong(_)));
    assert_eq!(reply.seq, None);
    assert!(reply.timestamp > 0);

    socket.close(None).await.unwrap();
    running.shutdown.send(()).unwrap();
    running.task.await.unwrap();
}

#[tokio::test]
async fn malformed_and_binary_frames_get_invalid_message() {
    let running = start().await;
    let mut socket = connect(&running.url, "alice").await;

    send(&mut socket, "not json").await;
    let reply = recv(&mut socket).await;
    assert!(
        matches!(&reply.message, ServerMessage::Error(e) if e.code == ErrorCode::InvalidMessage)
    );

    send(&mut socket, r#"{"type":"join_room","payload":{"room_code":7}}"#).await;
    let reply = recv(&mut socket).await;
    assert!(
        matches!(&reply.message, ServerMessage::Error(e) if e.code == ErrorCode::InvalidMessage)
    );

    socket.send(Message::binary(vec![1u8, 2, 3])).await.unwrap();
    let reply = recv(&mut socket).await;
    assert!(
        matches!(&reply.message, ServerMessage::Error(e) if e.code == ErrorCode::InvalidMessage)
    );

    // Unknown types are ignored; the session stays usable
    send(&mut socket, r#"{"type":"dance"}"#).await;
    send(&mut socket, r#"{"type":"ping"}"#).await;
    assert!(matches!(recv(&mut socket).await.message, ServerMessage::Pong(_)));

    socket.close(None).await.unwrap();
    running.shutdown.send(()).unwrap();
    running.task.await.unwrap();
}

#[tokio::test]
async fn lobby_broadcasts_reach_every_seat_and_persist() {
    let running = start().await;
    let mut alice = connect(&running.url, "alice").await;
    let mut bob = connect(&running.url, "bob").await;

    send(&mut alice, CREATE_ROOM).await;
    let created = recv(&mut alice).await;
    let ServerMessage::RoomUpdate(update) = &created.message else {
        panic!("expected room_update, got {:?}", created.message);
    };
    assert_eq!(created.seq, Some(1));
    assert_eq!(update.host_player_id, "alice");
    let room_code = update.room_code.clone();

    send(&mut bob, &join_room(&room_code)).await;
    for socket in [&mut alice, &mut bob] {
        let joined = recv(socket).await;
        assert_eq!(joined.seq, Some(2));
        assert_eq!(joined.message.kind(), "player_joined");
    }
    assert_eq!(recv(&mut alice).await.seq, Some(3));
    let seen_by_bob = recv(&mut bob).await;
    assert_eq!(seen_by_bob.seq, Some(3));
    let ServerMessage::RoomUpdate(update) = &seen_by_bob.message else {
        panic!("expected room_update, got {:?}", seen_by_bob.message);
    };
    assert_eq!(update.players.len(), 2);

    // Close both sockets before shutdown so the last disconnects are logged
    alice.close(None).await.unwrap();
    bob.close(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    running.shutdown.send(()).unwrap();
    running.task.await.unwrap();

    let storage = RedbStorage::open(running.dir.path().join("events.redb")).unwrap();
    let games = storage.list_games().unwrap();
    assert_eq!(games.len(), 1);
    let game_id = &games[0];
    let game = storage.load_game(game_id).unwrap().unwrap();
    assert_eq!(game.room_code, room_code);
    assert_eq!(game.max_players, 2);

    let players = storage.load_players(game_id).unwrap();
    let ids: Vec<&str> = players.iter().map(|p| p.player_id.as_str()).collect();
    assert_eq!(ids, vec!["alice", "bob"]);

    let events = storage.load_events(game_id, 0, 100).unwrap();
    assert!(events.windows(2).all(|w| w[0].log_index < w[1].log_index));
    let seqs: Vec<u64> = events.iter().filter_map(|e| e.sequence_num).collect();
    assert!(seqs.starts_with(&[1, 2, 3]), "{seqs:?}");
}

#[tokio::test]
async fn burst_past_the_bucket_is_rate_limited() {
    let running = start().await;
    let mut socket = connect(&running.url, "alice").await;

    // Burst capacity is 40; refill over the burst is far below the excess
    for _ in 0..80 {
        send(&mut socket, r#"{"type":"ping"}"#).await;
    }

    let mut pongs = 0;
    let mut limited = 0;
    for _ in 0..80 {
        match recv(&mut socket).await.message {
            ServerMessage::Pong(_) => pongs += 1,
            ServerMessage::Error(e) => {
                assert_eq!(e.code, ErrorCode::RateLimited);
                limited += 1;
            },
            other => panic!("unexpected reply {other:?}"),
        }
    }
    assert!(pongs >= 40, "{pongs} pongs");
    assert!(limited > 0);

    socket.close(None).await.unwrap();
    running.shutdown.send(()).unwrap();
    running.task.await.unwrap();
}

#[tokio::test]
async fn silent_client_times_out_and_room_sees_disconnect() {
    let mut config = CoordinatorConfig::default();
    config.session = SessionConfig {
        idle_timeout: Duration::from_millis(400),
        ping_interval: Duration::from_secs(60),
        ..SessionConfig::default()
    };
    config.timing = TimingConfig { countdown: Duration::from_secs(60), ..TimingConfig::default() };
    let running = start_with(config).await;

    let mut alice = connect(&running.url, "alice").await;
    let mut bob = connect(&running.url, "bob").await;
    let room_code = seat_two(&mut alice, &mut bob).await;

    // Last thing bob ever sends; the game enters its countdown
    send(&mut bob, r#"{"type":"player_ready","payload":{"ready":true}}"#).await;

    // Alice keeps talking until she hears that bob dropped
    let deadline = Instant::now() + Duration::from_secs(5);
    let notice = loop {
        assert!(Instant::now() < deadline, "no player_disconnected for bob");
        send(&mut alice, r#"{"type":"ping"}"#).await;
        let Ok(frame) = tokio::time::timeout(Duration::from_millis(100), alice.next()).await else {
            continue;
        };
        let Some(Ok(Message::Text(text))) = frame else {
            continue;
        };
        if let ServerMessage::PlayerDisconnected(notice) =
            Envelope::decode(text.as_str()).unwrap().message
        {
            break notice;
        }
    };
    assert_eq!(notice.player_id, "bob");

    // 1001: going away
    assert_eq!(close_code(&mut bob).await, 1001);

    let room = running.coordinator.room_by_code(&room_code).await.unwrap();
    let live = room.lock().await;
    assert_eq!(live.phase(), Phase::Countdown);
    assert!(!live.player("bob").unwrap().connected);
    assert!(live.player("alice").unwrap().connected);
    drop(live);

    alice.close(None).await.unwrap();
    running.shutdown.send(()).unwrap();
    running.task.await.unwrap();
}

#[tokio::test]
async fn overflowing_queue_closes_session_and_frees_seat() {
    // One frame of headroom and no tolerance: a join fans out two
    // broadcasts in one step, so both seats overflow on it
    let mut config = CoordinatorConfig::default();
    config.session =
        SessionConfig { send_queue_capacity: 1, max_consecutive_drops: 1, ..SessionConfig::default() };
    let running = start_with(config).await;

    let mut alice = connect(&running.url, "alice").await;
    let mut bob = connect(&running.url, "bob").await;
    send(&mut alice, CREATE_ROOM).await;
    let ServerMessage::RoomUpdate(update) = recv(&mut alice).await.message else {
        panic!("expected room_update");
    };
    assert_eq!(running.coordinator.room_count().await, 1);

    send(&mut bob, &join_room(&update.room_code)).await;

    // 1008: policy violation
    assert_eq!(close_code(&mut bob).await, 1008);
    assert_eq!(close_code(&mut alice).await, 1008);

    // Both lobby seats are released through the disconnect path
    let deadline = Instant::now() + Duration::from_secs(5);
    while running.coordinator.room_count().await > 0 {
        assert!(Instant::now() < deadline, "room still registered");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    running.shutdown.send(()).unwrap();
    running.task.await.unwrap();
}
