//! Rooms: named client groups with broadcast, heartbeat probing and a typed
//! event surface.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use roomcast_protocol::{ClientSummary, RoomSummary};
use serde_json::Value;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;

use crate::client::Client;

const EVENT_BUFFER: usize = 256;

/// Per-room configuration, fixed at creation.
#[derive(Debug, Clone)]
pub struct RoomOptions {
    /// Probe cadence. `None` disables the heartbeat entirely.
    pub ping_interval: Option<Duration>,
    /// Consecutive silent intervals a member survives.
    pub missed_pings_limit: u32,
    /// Keep the room alive after the last member leaves.
    pub keep_alive: bool,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            ping_interval: None,
            missed_pings_limit: 1,
            keep_alive: false,
        }
    }
}

/// Room lifecycle and traffic, observed through [`Room::subscribe`].
/// Events are enqueued inside the same critical section as the state change,
/// so a `Joined` listener always observes the member already present.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    Joined(ClientSummary),
    Left(ClientSummary),
    /// An application frame received from a member, relayed verbatim.
    Message { from: String, data: String },
    Terminated,
}

/// A named group of clients on one room server.
#[derive(Debug)]
pub struct Room {
    id: String,
    public_url: String,
    options: RoomOptions,
    properties: RwLock<Option<Value>>,
    clients: RwLock<HashMap<String, Client>>,
    /// Server-wide client total, shared with the owning server.
    server_total: Arc<AtomicUsize>,
    events: broadcast::Sender<RoomEvent>,
    terminated: AtomicBool,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
    weak_self: Weak<Room>,
}

impl Room {
    pub(crate) fn new(
        id: String,
        public_url: String,
        properties: Option<Value>,
        options: RoomOptions,
        server_total: Arc<AtomicUsize>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Arc::new_cyclic(|weak_self| Self {
            id,
            public_url,
            options,
            properties: RwLock::new(properties),
            clients: RwLock::new(HashMap::new()),
            server_total,
            events,
            terminated: AtomicBool::new(false),
            heartbeat: Mutex::new(None),
            weak_self: weak_self.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn public_url(&self) -> &str {
        &self.public_url
    }

    pub fn options(&self) -> &RoomOptions {
        &self.options
    }

    pub fn keep_alive(&self) -> bool {
        self.options.keep_alive
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RoomEvent> {
        self.events.subscribe()
    }

    pub async fn properties(&self) -> Option<Value> {
        self.properties.read().await.clone()
    }

    /// Last writer wins; changes are not propagated to discovery nodes.
    pub async fn set_properties(&self, properties: Option<Value>) {
        *self.properties.write().await = properties;
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    pub async fn contains(&self, client_id: &str) -> bool {
        self.clients.read().await.contains_key(client_id)
    }

    pub async fn summary(&self, include_clients: bool) -> RoomSummary {
        let clients = if include_clients {
            self.clients
                .read()
                .await
                .values()
                .map(|client| (client.id().to_string(), client.summary()))
                .collect()
        } else {
            BTreeMap::new()
        };
        RoomSummary {
            id: self.id.clone(),
            public_url: self.public_url.clone(),
            clients,
            properties: self.properties.read().await.clone(),
        }
    }

    /// Insert a member. A second client with an id already present is a
    /// no-op; a terminated room refuses and closes the socket.
    pub(crate) async fn join(&self, client: Client) -> bool {
        if self.terminated.load(Ordering::SeqCst) {
            client.disconnect().await;
            return false;
        }
        let mut clients = self.clients.write().await;
        if clients.contains_key(client.id()) {
            return false;
        }
        let summary = client.summary();
        clients.insert(client.id().to_string(), client);
        self.server_total.fetch_add(1, Ordering::Relaxed);
        let _ = self.events.send(RoomEvent::Joined(summary));
        true
    }

    /// Remove a member, emit `Left` and disconnect its socket. Absent ids
    /// are a no-op; returns whether a member was removed.
    pub async fn leave(&self, client_id: &str) -> bool {
        let client = {
            let mut clients = self.clients.write().await;
            let Some(client) = clients.remove(client_id) else {
                return false;
            };
            self.server_total.fetch_sub(1, Ordering::Relaxed);
            let _ = self.events.send(RoomEvent::Left(client.summary()));
            client
        };
        client.disconnect().await;
        true
    }

    /// Best-effort broadcast. A member whose socket rejects the write is
    /// dropped from the room; everyone else is unaffected.
    pub async fn send(&self, message: &str) {
        let failed = {
            let clients = self.clients.read().await;
            let mut failed = Vec::new();
            for (id, client) in clients.iter() {
                if client.send(message.to_string()).await.is_err() {
                    failed.push(id.clone());
                }
            }
            failed
        };
        self.drop_failed(failed).await;
    }

    /// Send to one member, verified by id at call time.
    pub async fn send_to(&self, client_id: &str, message: &str) {
        let failed = {
            let clients = self.clients.read().await;
            match clients.get(client_id) {
                Some(client) => client.send(message.to_string()).await.is_err(),
                None => false,
            }
        };
        if failed {
            self.drop_failed(vec![client_id.to_string()]).await;
        }
    }

    /// Send to every member except `client_id`.
    pub async fn send_to_others(&self, client_id: &str, message: &str) {
        let failed = {
            let clients = self.clients.read().await;
            let mut failed = Vec::new();
            for (id, client) in clients.iter() {
                if id != client_id && client.send(message.to_string()).await.is_err() {
                    failed.push(id.clone());
                }
            }
            failed
        };
        self.drop_failed(failed).await;
    }

    async fn drop_failed(&self, failed: Vec<String>) {
        for id in failed {
            tracing::debug!(room = %self.id, client = %id, "socket write failed, dropping client");
            self.leave(&id).await;
        }
    }

    /// Surface an application frame from a member as a `Message` event.
    pub(crate) async fn receive(&self, from: &str, data: String) {
        if self.clients.read().await.contains_key(from) {
            let _ = self.events.send(RoomEvent::Message {
                from: from.to_string(),
                data,
            });
        }
    }

    /// Disconnect every member and emit `Terminated`. The owning server
    /// reacts to the event to finish the teardown; no `Joined`/`Left` is
    /// emitted afterwards.
    pub async fn terminate(&self) {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return;
        }
        self.clear_ping_interval();
        let drained: Vec<Client> = {
            let mut clients = self.clients.write().await;
            let drained: Vec<Client> = clients.drain().map(|(_, client)| client).collect();
            self.server_total.fetch_sub(drained.len(), Ordering::Relaxed);
            for client in &drained {
                let _ = self.events.send(RoomEvent::Left(client.summary()));
            }
            drained
        };
        for client in drained {
            client.disconnect().await;
        }
        let _ = self.events.send(RoomEvent::Terminated);
    }

    /// Stop the heartbeat timer. Idempotent.
    pub fn clear_ping_interval(&self) {
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Spawn the per-room probe loop. Every interval each member either gets
    /// probed (counter incremented, ping frame sent) or, once the counter
    /// reaches the limit, force-dropped. A pong resets the counter to zero.
    pub(crate) fn start_heartbeat(&self) {
        let Some(interval) = self.options.ping_interval else {
            return;
        };
        let limit = self.options.missed_pings_limit;
        let room = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval yields immediately; the first probe comes one
            // interval after creation
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(room) = room.upgrade() else {
                    break;
                };
                let expired = {
                    let clients = room.clients.read().await;
                    let mut expired = Vec::new();
                    for (id, client) in clients.iter() {
                        if client.missed_pings() >= limit {
                            expired.push(id.clone());
                        } else {
                            client.mark_missed_ping();
                            if client.ping().is_err() {
                                expired.push(id.clone());
                            }
                        }
                    }
                    expired
                };
                for id in expired {
                    tracing::debug!(room = %room.id, client = %id, "heartbeat expired, dropping client");
                    room.leave(&id).await;
                }
            }
        });
        *self.heartbeat.lock().unwrap() = Some(handle);
    }
}

impl Drop for Room {
    fn drop(&mut self) {
        if let Some(handle) = self.heartbeat.lock().unwrap().take() {
            handle.abort();
        }
    }
}
