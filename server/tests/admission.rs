//! Admission-path scenarios driven through a fake transport: tokens are
//! minted directly, sockets are channel pairs, and the bus is in-process.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use jsonwebtoken::{encode, EncodingKey, Header};
use roomcast_bus::{Bus, BusMessage, MemoryBus, Subscription};
use roomcast_protocol::{
    subjects, RoomChange, RoomDirectory, RoomServerEvent, TokenClaims, TokenSecret, TOKEN_SUBJECT,
};
use roomcast_server::{
    AdmitError, RoomEvent, RoomOptions, RoomServer, ServerEvent, SocketCommand, SocketHandle,
};

const SECRET: &[u8] = b"test-secret";

fn claims(public_url: &str, room_id: &str, client_id: &str) -> TokenClaims {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    TokenClaims {
        sub: TOKEN_SUBJECT.to_string(),
        exp: now + 60,
        public_url: public_url.to_string(),
        room_id: room_id.to_string(),
        room_properties: None,
        client_id: client_id.to_string(),
        client_properties: None,
        join_only: false,
    }
}

fn sign(claims: &TokenClaims) -> String {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(SECRET),
    )
    .unwrap()
}

fn mint(public_url: &str, room_id: &str, client_id: &str) -> String {
    sign(&claims(public_url, room_id, client_id))
}

fn memory_bus() -> Arc<dyn Bus> {
    Arc::new(MemoryBus::new())
}

async fn start_server(bus: &Arc<dyn Bus>, public_url: &str) -> Arc<RoomServer> {
    RoomServer::builder()
        .public_url(public_url)
        .secret(TokenSecret::new(SECRET.to_vec()))
        .start(Arc::clone(bus))
        .await
        .expect("room server should start")
}

async fn next_room_event(events: &mut Subscription) -> RoomServerEvent {
    let message: BusMessage = tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .expect("timed out waiting for a room event")
        .expect("bus subscription closed");
    serde_json::from_slice(&message.payload).expect("room event should decode")
}

#[tokio::test]
async fn admitted_client_joins_and_messages_flow() {
    let bus = memory_bus();
    let mut fleet_events = bus.subscribe(subjects::SERVER_EVENT).await.unwrap();
    let server = start_server(&bus, "rs-a").await;

    let (socket, _rx) = SocketHandle::channel();
    let admitted = server
        .admit(&mint("rs-a", "R1", "C1"), socket)
        .await
        .expect("admission should succeed");

    assert_eq!(admitted.room_id(), "R1");
    assert_eq!(server.client_count(), 1);
    let room = server.room("R1").await.expect("room should exist");
    assert!(room.contains("C1").await);

    // the fleet hears about the room, then the member
    match next_room_event(&mut fleet_events).await.change {
        RoomChange::NewRoom { .. } => {}
        other => panic!("unexpected change: {other:?}"),
    }
    match next_room_event(&mut fleet_events).await.change {
        RoomChange::RoomJoined { client } => assert_eq!(client.id, "C1"),
        other => panic!("unexpected change: {other:?}"),
    }

    // an application frame surfaces as a room message event
    let mut room_events = room.subscribe();
    admitted.receive("hello".to_string()).await;
    match room_events.recv().await.unwrap() {
        RoomEvent::Message { from, data } => {
            assert_eq!(from, "C1");
            assert_eq!(data, "hello");
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn token_for_another_server_is_refused() {
    let bus = memory_bus();
    let server = start_server(&bus, "rs-a").await;

    let (socket, _rx) = SocketHandle::channel();
    let err = server
        .admit(&mint("rs-b", "R1", "C1"), socket)
        .await
        .unwrap_err();

    assert!(matches!(err, AdmitError::WrongServer));
    let envelope = err.envelope();
    assert_eq!(envelope.error, "Authentication Failed");
    assert_eq!(
        envelope.message,
        "The authentication token is intended for another room server."
    );
    assert_eq!(server.client_count(), 0);
    assert!(server.room("R1").await.is_none());
}

#[tokio::test]
async fn expired_and_garbage_tokens_are_refused() {
    let bus = memory_bus();
    let server = start_server(&bus, "rs-a").await;

    let mut expired = claims("rs-a", "R1", "C1");
    expired.exp = 1;
    let (socket, _rx) = SocketHandle::channel();
    let err = server.admit(&sign(&expired), socket).await.unwrap_err();
    assert!(matches!(err, AdmitError::InvalidToken(_)));
    assert_eq!(err.envelope().error, "Authentication Failed");

    let (socket, _rx) = SocketHandle::channel();
    assert!(matches!(
        server.admit("not-a-token", socket).await,
        Err(AdmitError::InvalidToken(_))
    ));
}

#[tokio::test]
async fn wrong_subject_is_refused() {
    let bus = memory_bus();
    let server = start_server(&bus, "rs-a").await;

    let mut wrong = claims("rs-a", "R1", "C1");
    wrong.sub = "createRoom".to_string();
    let (socket, _rx) = SocketHandle::channel();
    assert!(matches!(
        server.admit(&sign(&wrong), socket).await,
        Err(AdmitError::InvalidToken(_))
    ));
}

#[tokio::test]
async fn duplicate_client_id_is_refused() {
    let bus = memory_bus();
    let server = start_server(&bus, "rs-a").await;

    let (socket, _rx1) = SocketHandle::channel();
    server
        .admit(&mint("rs-a", "R1", "C1"), socket)
        .await
        .unwrap();

    let (socket, _rx2) = SocketHandle::channel();
    let err = server
        .admit(&mint("rs-a", "R1", "C1"), socket)
        .await
        .unwrap_err();

    assert!(matches!(err, AdmitError::AlreadyConnected));
    assert_eq!(
        err.envelope().message,
        "You are already connected to this room."
    );
    assert_eq!(server.client_count(), 1);
    assert_eq!(server.room("R1").await.unwrap().client_count().await, 1);
}

#[tokio::test]
async fn join_only_tokens_require_an_existing_room() {
    let bus = memory_bus();
    let server = start_server(&bus, "rs-a").await;

    let mut join_only = claims("rs-a", "R1", "C1");
    join_only.join_only = true;
    let (socket, _rx) = SocketHandle::channel();
    let err = server.admit(&sign(&join_only), socket).await.unwrap_err();
    assert!(matches!(err, AdmitError::UnknownRoom));
    assert_eq!(
        err.envelope().message,
        "The room you are trying to join does not exist."
    );

    // once the room exists the same flag admits
    let (socket, _rx1) = SocketHandle::channel();
    server
        .admit(&mint("rs-a", "R1", "C0"), socket)
        .await
        .unwrap();
    let mut join_only = claims("rs-a", "R1", "C1");
    join_only.join_only = true;
    let (socket, _rx2) = SocketHandle::channel();
    assert!(server.admit(&sign(&join_only), socket).await.is_ok());
}

#[tokio::test]
async fn room_properties_are_first_writer_wins() {
    let bus = memory_bus();
    let server = start_server(&bus, "rs-a").await;

    let mut first = claims("rs-a", "R1", "C1");
    first.room_properties = Some(serde_json::json!({"topic": "chess"}));
    let (socket, _rx1) = SocketHandle::channel();
    server.admit(&sign(&first), socket).await.unwrap();

    let mut second = claims("rs-a", "R1", "C2");
    second.room_properties = Some(serde_json::json!({"topic": "go"}));
    let (socket, _rx2) = SocketHandle::channel();
    server.admit(&sign(&second), socket).await.unwrap();

    let room = server.room("R1").await.unwrap();
    assert_eq!(
        room.properties().await,
        Some(serde_json::json!({"topic": "chess"}))
    );
}

#[tokio::test]
async fn empty_rooms_are_collected() {
    let bus = memory_bus();
    let mut fleet_events = bus.subscribe(subjects::SERVER_EVENT).await.unwrap();
    let server = start_server(&bus, "rs-a").await;

    let (socket, _rx) = SocketHandle::channel();
    server
        .admit(&mint("rs-a", "R1", "C1"), socket)
        .await
        .unwrap();
    server.connection_closed("R1", "C1").await;

    // newRoom, roomJoined, roomLeft, then the collection
    let mut changes = Vec::new();
    for _ in 0..4 {
        changes.push(next_room_event(&mut fleet_events).await.change);
    }
    assert!(matches!(changes[2], RoomChange::RoomLeft { .. }));
    assert!(matches!(changes[3], RoomChange::RoomRemoved));
    assert!(server.room("R1").await.is_none());
    assert_eq!(server.client_count(), 0);
}

#[tokio::test]
async fn keep_alive_rooms_survive_their_last_member() {
    let bus = memory_bus();
    let server = RoomServer::builder()
        .public_url("rs-a")
        .secret(TokenSecret::new(SECRET.to_vec()))
        .room_defaults(RoomOptions {
            keep_alive: true,
            ..RoomOptions::default()
        })
        .start(Arc::clone(&bus))
        .await
        .unwrap();

    let (socket, _rx) = SocketHandle::channel();
    let admitted = server
        .admit(&mint("rs-a", "R1", "C1"), socket)
        .await
        .unwrap();
    let original = Arc::clone(admitted.room());

    let mut room_events = original.subscribe();
    server.connection_closed("R1", "C1").await;
    assert!(matches!(
        room_events.recv().await.unwrap(),
        RoomEvent::Left(_)
    ));

    // the room instance survives and accepts a later join
    let survivor = server.room("R1").await.expect("room should survive");
    assert!(Arc::ptr_eq(&original, &survivor));
    let (socket, _rx) = SocketHandle::channel();
    server
        .admit(&mint("rs-a", "R1", "C2"), socket)
        .await
        .unwrap();
    assert!(survivor.contains("C2").await);
}

#[tokio::test(start_paused = true)]
async fn heartbeat_evicts_silent_clients_and_collects_the_room() {
    let bus = memory_bus();
    let server = RoomServer::builder()
        .public_url("rs-a")
        .secret(TokenSecret::new(SECRET.to_vec()))
        .room_defaults(RoomOptions {
            ping_interval: Some(Duration::from_millis(50)),
            missed_pings_limit: 2,
            keep_alive: false,
        })
        .start(Arc::clone(&bus))
        .await
        .unwrap();

    let (socket, mut rx) = SocketHandle::channel();
    let admitted = server
        .admit(&mint("rs-a", "R1", "C1"), socket)
        .await
        .unwrap();
    let mut room_events = admitted.room().subscribe();

    // never pong; eviction after at most limit silent intervals
    tokio::time::sleep(Duration::from_millis(200)).await;

    match tokio::time::timeout(Duration::from_secs(5), room_events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        RoomEvent::Left(summary) => assert_eq!(summary.id, "C1"),
        other => panic!("unexpected event: {other:?}"),
    }
    assert_eq!(server.client_count(), 0);

    let mut saw_close = false;
    while let Ok(Some(command)) = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await
    {
        if command == SocketCommand::Close {
            saw_close = true;
            break;
        }
    }
    assert!(saw_close, "evicted client should be force-closed");

    // the emptied room is collected
    for _ in 0..100 {
        if server.room("R1").await.is_none() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("room was never collected");
}

#[tokio::test]
async fn rooms_requests_are_answered_with_the_directory() {
    let bus = memory_bus();
    let server = start_server(&bus, "rs-a").await;

    let (socket, _rx) = SocketHandle::channel();
    server
        .admit(&mint("rs-a", "R1", "C1"), socket)
        .await
        .unwrap();

    let reply = bus
        .request(
            &subjects::rooms("rs-a"),
            Vec::new(),
            Duration::from_secs(5),
        )
        .await
        .expect("the server should answer");
    let directory: RoomDirectory = serde_json::from_slice(&reply).unwrap();
    assert!(directory["R1"].clients.contains_key("C1"));
    assert_eq!(server.client_count(), 1);
}

#[tokio::test]
async fn rosters_are_withheld_without_client_sync() {
    let bus = memory_bus();
    let server = RoomServer::builder()
        .public_url("rs-a")
        .secret(TokenSecret::new(SECRET.to_vec()))
        .sync_clients(false)
        .start(Arc::clone(&bus))
        .await
        .unwrap();

    let (socket, _rx) = SocketHandle::channel();
    server
        .admit(&mint("rs-a", "R1", "C1"), socket)
        .await
        .unwrap();

    let reply = bus
        .request(
            &subjects::rooms("rs-a"),
            Vec::new(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    let directory: RoomDirectory = serde_json::from_slice(&reply).unwrap();
    assert!(directory["R1"].clients.is_empty());
}

#[tokio::test]
async fn broadcasts_are_reemitted_locally() {
    let bus = memory_bus();
    let server = start_server(&bus, "rs-a").await;
    let mut events = server.subscribe();

    bus.publish(
        subjects::BROADCAST,
        serde_json::to_vec(&serde_json::json!({"motd": "welcome"})).unwrap(),
    )
    .await
    .unwrap();

    match tokio::time::timeout(Duration::from_secs(10), events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        ServerEvent::Broadcast(value) => {
            assert_eq!(value, serde_json::json!({"motd": "welcome"}))
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn stop_tears_down_rooms_and_notifies_the_fleet() {
    let bus = memory_bus();
    let mut stops = bus.subscribe(subjects::SERVER_STOP).await.unwrap();
    let stopped_flag = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stopped_flag);
    let server = RoomServer::builder()
        .public_url("rs-a")
        .secret(TokenSecret::new(SECRET.to_vec()))
        .on_stop(move || flag.store(true, Ordering::SeqCst))
        .start(Arc::clone(&bus))
        .await
        .unwrap();

    let (socket, mut rx) = SocketHandle::channel();
    server
        .admit(&mint("rs-a", "R1", "C1"), socket)
        .await
        .unwrap();
    let mut events = server.subscribe();

    server.stop().await;
    server.stop().await;

    // the client is disconnected and the fleet told exactly once
    loop {
        match rx.recv().await {
            Some(SocketCommand::Close) => break,
            Some(_) => continue,
            None => panic!("socket closed without a close command"),
        }
    }
    let stop_notice = tokio::time::timeout(Duration::from_secs(10), stops.recv())
        .await
        .unwrap()
        .unwrap();
    let public_url: String = serde_json::from_slice(&stop_notice.payload).unwrap();
    assert_eq!(public_url, "rs-a");

    assert!(matches!(
        tokio::time::timeout(Duration::from_secs(10), events.recv())
            .await
            .unwrap()
            .unwrap(),
        ServerEvent::Stopped
    ));
    assert!(stopped_flag.load(Ordering::SeqCst));
    assert_eq!(server.client_count(), 0);

    // admissions are refused once stopping
    let (socket, _rx) = SocketHandle::channel();
    assert!(matches!(
        server.admit(&mint("rs-a", "R2", "C2"), socket).await,
        Err(AdmitError::Stopping)
    ));
}
