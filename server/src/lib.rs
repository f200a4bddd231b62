//! Room server runtime.
//!
//! A room server terminates WebSocket clients into named rooms, fans
//! messages out, probes liveness and garbage-collects empty rooms, while
//! keeping the rest of the fleet informed over the bus: a 1 Hz `ping` with
//! its client count, `rs.event` messages for every room and membership
//! change, a `rooms.<publicUrl>` request/reply for initial state sync, and
//! `rs.stop` on shutdown.
//!
//! The WebSocket transport itself stays outside the core: any accept loop
//! can drive [`RoomServer::admit`] with the first frame of a new socket and
//! a [`SocketHandle`] for the write half. [`ws`] is the shipped actix
//! binding.

mod builder;
mod client;
mod error;
mod room;
mod socket;
mod token;
pub mod ws;

pub use builder::RoomServerBuilder;
pub use client::Client;
pub use error::{AdmitError, ServerError};
pub use room::{Room, RoomEvent, RoomOptions};
pub use socket::{SocketClosed, SocketCommand, SocketHandle};
pub use token::TokenVerifier;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use roomcast_bus::Bus;
use roomcast_protocol::{subjects, Ping, RoomChange, RoomDirectory, RoomServerEvent, TokenSecret};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;

const SERVER_PING_INTERVAL: Duration = Duration::from_secs(1);
const EVENT_BUFFER: usize = 64;

pub(crate) type StopCallback = Box<dyn FnOnce() + Send>;

/// Local events a room server surfaces to its embedding application.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// An application broadcast received on the bus.
    Broadcast(Value),
    /// Shutdown finished.
    Stopped,
}

/// Transport-side handle for one admitted connection.
#[derive(Debug)]
pub struct AdmittedClient {
    room: Arc<Room>,
    client_id: String,
    missed_pings: Arc<AtomicU32>,
}

impl AdmittedClient {
    pub fn room(&self) -> &Arc<Room> {
        &self.room
    }

    pub fn room_id(&self) -> &str {
        self.room.id()
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Reset the liveness counter; the transport calls this on every pong.
    pub fn record_pong(&self) {
        self.missed_pings.store(0, Ordering::Relaxed);
    }

    /// Forward an application frame into the room.
    pub async fn receive(&self, data: String) {
        self.room.receive(&self.client_id, data).await;
    }
}

/// One room server process: the rooms it owns, the clients inside them and
/// the bus plumbing that keeps discovery nodes in sync.
pub struct RoomServer {
    public_url: String,
    sync_rooms: bool,
    sync_clients: bool,
    room_defaults: RoomOptions,
    bus: Arc<dyn Bus>,
    verifier: TokenVerifier,
    rooms: Mutex<HashMap<String, Arc<Room>>>,
    client_total: Arc<AtomicUsize>,
    events: broadcast::Sender<ServerEvent>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    on_stop: std::sync::Mutex<Option<StopCallback>>,
    stopped: AtomicBool,
    weak_self: Weak<RoomServer>,
}

impl RoomServer {
    pub fn builder() -> RoomServerBuilder {
        RoomServerBuilder::new()
    }

    pub(crate) async fn start(
        bus: Arc<dyn Bus>,
        public_url: String,
        secret: &TokenSecret,
        sync_rooms: bool,
        sync_clients: bool,
        room_defaults: RoomOptions,
        on_stop: Option<StopCallback>,
    ) -> Result<Arc<Self>, ServerError> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let server = Arc::new_cyclic(|weak_self| Self {
            public_url,
            sync_rooms,
            sync_clients,
            room_defaults,
            bus,
            verifier: TokenVerifier::new(secret),
            rooms: Mutex::new(HashMap::new()),
            client_total: Arc::new(AtomicUsize::new(0)),
            events,
            tasks: std::sync::Mutex::new(Vec::new()),
            on_stop: std::sync::Mutex::new(on_stop),
            stopped: AtomicBool::new(false),
            weak_self: weak_self.clone(),
        });

        server.spawn_broadcast_relay().await?;
        server.spawn_directory_responder().await?;
        server.spawn_ping_loop();
        tracing::info!(public_url = %server.public_url, "room server started");
        Ok(server)
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    /// Total clients across all rooms.
    pub fn client_count(&self) -> usize {
        self.client_total.load(Ordering::Relaxed)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub async fn room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.rooms.lock().await.get(room_id).cloned()
    }

    /// Snapshot of every room, rosters included iff client sync is on.
    /// This is also the reply body of a `rooms.<publicUrl>` request.
    pub async fn room_directory(&self) -> RoomDirectory {
        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.values().cloned().collect();
        let mut directory = RoomDirectory::new();
        for room in rooms {
            directory.insert(room.id().to_string(), room.summary(self.sync_clients).await);
        }
        directory
    }

    /// Publish an application broadcast for every fleet member to relay.
    pub async fn broadcast(&self, message: Value) -> Result<(), ServerError> {
        let payload = serde_json::to_vec(&message)?;
        self.bus.publish(subjects::BROADCAST, payload).await?;
        Ok(())
    }

    /// Admit the socket that presented `token` as its first frame.
    ///
    /// Resolves the named room, creating it on demand with the token's
    /// `roomProperties` and the server's room defaults; an existing room
    /// keeps its own properties (first writer wins). Join-only tokens are
    /// refused when the room does not exist, duplicate client ids when it
    /// does. On success the client is already a member and the returned
    /// handle is what the transport keeps.
    pub async fn admit(
        &self,
        token: &str,
        socket: SocketHandle,
    ) -> Result<AdmittedClient, AdmitError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(AdmitError::Stopping);
        }
        let claims = self.verifier.verify(token)?;
        if claims.public_url != self.public_url {
            return Err(AdmitError::WrongServer);
        }

        let mut rooms = self.rooms.lock().await;
        let room = match rooms.get(&claims.room_id) {
            Some(existing) => Arc::clone(existing),
            None => {
                if claims.join_only {
                    return Err(AdmitError::UnknownRoom);
                }
                let room = Room::new(
                    claims.room_id.clone(),
                    self.public_url.clone(),
                    claims.room_properties.clone(),
                    self.room_defaults.clone(),
                    Arc::clone(&self.client_total),
                );
                room.start_heartbeat();
                self.watch_room(&room);
                rooms.insert(claims.room_id.clone(), Arc::clone(&room));
                tracing::info!(room = %claims.room_id, "room created");
                self.publish_change(
                    &claims.room_id,
                    RoomChange::NewRoom {
                        properties: claims.room_properties,
                    },
                )
                .await;
                room
            }
        };

        if room.contains(&claims.client_id).await {
            return Err(AdmitError::AlreadyConnected);
        }
        let client = Client::new(claims.client_id.clone(), claims.client_properties, socket);
        let missed_pings = client.missed_pings_handle();
        if !room.join(client).await {
            return Err(AdmitError::AlreadyConnected);
        }
        tracing::debug!(room = %claims.room_id, client = %claims.client_id, "client admitted");
        Ok(AdmittedClient {
            room,
            client_id: claims.client_id,
            missed_pings,
        })
    }

    /// Close notification from the transport. Removes the member if it is
    /// still present; the room's event stream then drives the bus sync and
    /// the empty-room collection.
    pub async fn connection_closed(&self, room_id: &str, client_id: &str) {
        let room = self.rooms.lock().await.get(room_id).cloned();
        if let Some(room) = room {
            room.leave(client_id).await;
        }
    }

    /// Tear down every room, notify the fleet and signal local listeners.
    /// Idempotent; new admissions are refused as soon as it begins.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(public_url = %self.public_url, "room server stopping");
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }

        let rooms: Vec<Arc<Room>> = self.rooms.lock().await.drain().map(|(_, r)| r).collect();
        for room in rooms {
            room.terminate().await;
        }

        match serde_json::to_vec(&self.public_url) {
            Ok(payload) => {
                if let Err(err) = self.bus.publish(subjects::SERVER_STOP, payload).await {
                    tracing::warn!(%err, "failed to publish stop notice");
                }
            }
            Err(err) => tracing::warn!(%err, "failed to encode stop notice"),
        }

        let _ = self.events.send(ServerEvent::Stopped);
        if let Some(callback) = self.on_stop.lock().unwrap().take() {
            callback();
        }
    }

    /// React to one room's events: mirror them onto the bus and collect the
    /// room once it empties. The watcher ends with the room.
    fn watch_room(&self, room: &Arc<Room>) {
        let mut events = room.subscribe();
        let server = self.weak_self.clone();
        let room_id = room.id().to_string();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(RoomEvent::Joined(client)) => {
                        let Some(server) = server.upgrade() else { break };
                        server
                            .publish_change(&room_id, RoomChange::RoomJoined { client })
                            .await;
                    }
                    Ok(RoomEvent::Left(client)) => {
                        let Some(server) = server.upgrade() else { break };
                        server
                            .publish_change(&room_id, RoomChange::RoomLeft { client })
                            .await;
                        server.collect_room(&room_id).await;
                    }
                    Ok(RoomEvent::Terminated) => {
                        if let Some(server) = server.upgrade() {
                            server.room_terminated(&room_id).await;
                        }
                        break;
                    }
                    Ok(RoomEvent::Message { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(room = %room_id, missed, "room event stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    /// Remove the room if it is empty and not pinned by `keep_alive`.
    async fn collect_room(&self, room_id: &str) {
        let removed = {
            let mut rooms = self.rooms.lock().await;
            let Some(room) = rooms.get(room_id).cloned() else {
                return;
            };
            if room.keep_alive() || !room.is_empty().await {
                return;
            }
            rooms.remove(room_id)
        };
        if let Some(room) = removed {
            room.clear_ping_interval();
            tracing::info!(room = %room_id, "empty room removed");
            self.publish_change(room_id, RoomChange::RoomRemoved).await;
        }
    }

    /// Finish the teardown of a room that terminated itself.
    async fn room_terminated(&self, room_id: &str) {
        let removed = self.rooms.lock().await.remove(room_id);
        if removed.is_some() {
            tracing::info!(room = %room_id, "room terminated");
            self.publish_change(room_id, RoomChange::RoomRemoved).await;
        }
    }

    async fn publish_change(&self, room_id: &str, change: RoomChange) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let enabled = match change {
            RoomChange::NewRoom { .. } | RoomChange::RoomRemoved => self.sync_rooms,
            RoomChange::RoomJoined { .. } | RoomChange::RoomLeft { .. } => {
                self.sync_rooms && self.sync_clients
            }
        };
        if !enabled {
            return;
        }
        let event = RoomServerEvent {
            public_url: self.public_url.clone(),
            room_id: room_id.to_string(),
            change,
        };
        match serde_json::to_vec(&event) {
            Ok(payload) => {
                if let Err(err) = self.bus.publish(subjects::SERVER_EVENT, payload).await {
                    tracing::warn!(%err, "failed to publish room event");
                }
            }
            Err(err) => tracing::warn!(%err, "failed to encode room event"),
        }
    }

    async fn spawn_broadcast_relay(&self) -> Result<(), ServerError> {
        let mut messages = self.bus.subscribe(subjects::BROADCAST).await?;
        let server = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let Some(server) = server.upgrade() else { break };
                match serde_json::from_slice::<Value>(&message.payload) {
                    Ok(value) => {
                        let _ = server.events.send(ServerEvent::Broadcast(value));
                    }
                    Err(err) => tracing::warn!(%err, "ignoring malformed broadcast payload"),
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    async fn spawn_directory_responder(&self) -> Result<(), ServerError> {
        let mut requests = self.bus.subscribe(&subjects::rooms(&self.public_url)).await?;
        let server = self.weak_self.clone();
        let bus = Arc::clone(&self.bus);
        let handle = tokio::spawn(async move {
            while let Some(request) = requests.recv().await {
                let Some(server) = server.upgrade() else { break };
                let Some(reply) = request.reply else { continue };
                let directory = server.room_directory().await;
                match serde_json::to_vec(&directory) {
                    Ok(payload) => {
                        if let Err(err) = bus.publish(&reply, payload).await {
                            tracing::warn!(%err, "failed to answer rooms request");
                        }
                    }
                    Err(err) => tracing::warn!(%err, "failed to encode room directory"),
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    fn spawn_ping_loop(&self) {
        let server = self.weak_self.clone();
        let bus = Arc::clone(&self.bus);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SERVER_PING_INTERVAL);
            // the first ping carries `reset` so discovery nodes discard any
            // stale mirror of this publicUrl
            let mut reset = true;
            loop {
                ticker.tick().await;
                let Some(server) = server.upgrade() else { break };
                let ping = Ping {
                    public_url: server.public_url.clone(),
                    client_count: server.client_count() as u64,
                    reset,
                };
                reset = false;
                match serde_json::to_vec(&ping) {
                    Ok(payload) => {
                        if let Err(err) = bus.publish(subjects::PING, payload).await {
                            tracing::warn!(%err, "failed to publish ping");
                        }
                    }
                    Err(err) => tracing::warn!(%err, "failed to encode ping"),
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }
}
