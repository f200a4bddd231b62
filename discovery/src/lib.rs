//! Discovery node: an eventually-consistent mirror of the room-server
//! fleet.
//!
//! Every room server announces itself with a 1 Hz `ping` and narrates its
//! room and membership changes on `rs.event`. A discovery node folds those
//! into per-server [`RoomServerRecord`]s, answers load questions
//! ([`Discovery::least_loaded_server`]), relays application broadcasts, and
//! mints the signed join tokens that pin a client to one server. Servers
//! that stop announce `rs.stop`; servers that vanish are evicted once their
//! ping goes stale.
//!
//! Any number of discovery nodes can run against the same bus; each builds
//! its own mirror independently and they converge without coordination.

mod error;
mod record;
mod token;

pub use error::DiscoveryError;
pub use record::RoomServerRecord;
pub use token::{TokenIssuer, TokenRequest};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use roomcast_bus::Bus;
use roomcast_protocol::{
    subjects, ClientSummary, Ping, RoomChange, RoomDirectory, RoomServerEvent, RoomSummary,
    TokenSecret, TOKEN_TTL_SECS,
};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// A server is evicted after this long without a ping.
pub const SERVER_TIMEOUT: Duration = Duration::from_secs(5);

const EVENT_BUFFER: usize = 256;

/// Mirror changes and relayed broadcasts, observed through
/// [`Discovery::subscribe`].
#[derive(Debug, Clone)]
pub enum DiscoveryEvent {
    NewServer {
        public_url: String,
    },
    ServerRemoved {
        public_url: String,
    },
    NewRoom {
        room: RoomSummary,
    },
    RoomRemoved {
        public_url: String,
        room_id: String,
    },
    RoomJoined {
        public_url: String,
        room_id: String,
        client: ClientSummary,
    },
    RoomLeft {
        public_url: String,
        room_id: String,
        client: ClientSummary,
    },
    /// An application broadcast received on the bus.
    Broadcast(Value),
}

/// Builder for a [`Discovery`] node. The token secret is required.
pub struct DiscoveryBuilder {
    secret: Option<TokenSecret>,
    server_timeout: Duration,
    token_ttl: Duration,
}

impl DiscoveryBuilder {
    pub fn new() -> Self {
        Self {
            secret: None,
            server_timeout: SERVER_TIMEOUT,
            token_ttl: Duration::from_secs(TOKEN_TTL_SECS),
        }
    }

    /// Shared secret join tokens are signed with.
    pub fn secret(mut self, secret: TokenSecret) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Ping age after which a server is evicted.
    pub fn server_timeout(mut self, timeout: Duration) -> Self {
        self.server_timeout = timeout;
        self
    }

    /// Default lifetime of issued tokens.
    pub fn token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Wire the node to the bus and start ingesting.
    pub async fn start(self, bus: Arc<dyn Bus>) -> Result<Arc<Discovery>, DiscoveryError> {
        let secret = self
            .secret
            .ok_or_else(|| DiscoveryError::Config("token secret is required".into()))?;
        Discovery::start(bus, &secret, self.server_timeout, self.token_ttl).await
    }
}

impl Default for DiscoveryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// One discovery process: the fleet mirror, the liveness loop and the token
/// issuer.
pub struct Discovery {
    bus: Arc<dyn Bus>,
    issuer: TokenIssuer,
    server_timeout: Duration,
    records: Mutex<BTreeMap<String, RoomServerRecord>>,
    events: broadcast::Sender<DiscoveryEvent>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
    weak_self: Weak<Discovery>,
}

impl Discovery {
    pub fn builder() -> DiscoveryBuilder {
        DiscoveryBuilder::new()
    }

    async fn start(
        bus: Arc<dyn Bus>,
        secret: &TokenSecret,
        server_timeout: Duration,
        token_ttl: Duration,
    ) -> Result<Arc<Self>, DiscoveryError> {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        let discovery = Arc::new_cyclic(|weak_self| Self {
            issuer: TokenIssuer::new(secret, token_ttl),
            server_timeout,
            records: Mutex::new(BTreeMap::new()),
            events,
            tasks: std::sync::Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
            bus,
            weak_self: weak_self.clone(),
        });

        discovery.spawn_ping_ingest().await?;
        discovery.spawn_event_ingest().await?;
        discovery.spawn_stop_ingest().await?;
        discovery.spawn_broadcast_relay().await?;
        discovery.spawn_liveness_loop();
        tracing::info!("discovery node started");
        Ok(discovery)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DiscoveryEvent> {
        self.events.subscribe()
    }

    /// Sign a join token for `request`, subject `joinRoom`.
    pub fn generate_token(&self, request: TokenRequest) -> Result<String, DiscoveryError> {
        Ok(self.issuer.issue(request)?)
    }

    /// Client count of a mirrored server, as of its most recent ping.
    pub async fn get_client_count(&self, public_url: &str) -> Option<u64> {
        self.records
            .lock()
            .await
            .get(public_url)
            .map(|record| record.client_count)
    }

    /// The mirrored server with the smallest client count. Ties break by
    /// mirror iteration order, so the answer is stable within one node.
    pub async fn least_loaded_server(&self) -> Option<RoomServerRecord> {
        self.records
            .lock()
            .await
            .values()
            .min_by_key(|record| record.client_count)
            .cloned()
    }

    /// The live aggregated view of the fleet.
    pub async fn snapshot(&self) -> Vec<RoomServerRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    /// Publish an application broadcast for every fleet member to relay.
    pub async fn broadcast(&self, message: Value) -> Result<(), DiscoveryError> {
        let payload = serde_json::to_vec(&message)?;
        self.bus.publish(subjects::BROADCAST, payload).await?;
        Ok(())
    }

    /// Unsubscribe everything and stop the liveness loop. Idempotent; no
    /// events are emitted during shutdown.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        tracing::info!("discovery node stopped");
    }

    async fn ingest_ping(&self, ping: Ping) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut records = self.records.lock().await;
        if ping.reset {
            // a restarted server; whatever we mirrored is stale
            records.remove(&ping.public_url);
        }
        match records.get_mut(&ping.public_url) {
            Some(record) => {
                record.client_count = ping.client_count;
                record.last_ping = Instant::now();
            }
            None => {
                tracing::info!(server = %ping.public_url, "room server discovered");
                records.insert(
                    ping.public_url.clone(),
                    RoomServerRecord::new(ping.public_url.clone(), ping.client_count),
                );
                let _ = self.events.send(DiscoveryEvent::NewServer {
                    public_url: ping.public_url.clone(),
                });
                self.request_rooms(ping.public_url);
            }
        }
    }

    /// One-shot state sync for a newly-discovered server. If the request
    /// goes unanswered the record keeps an empty room map until events
    /// repopulate it; there is no retry.
    fn request_rooms(&self, public_url: String) {
        let bus = Arc::clone(&self.bus);
        let discovery = self.weak_self.clone();
        let timeout = self.server_timeout;
        tokio::spawn(async move {
            match bus
                .request(&subjects::rooms(&public_url), Vec::new(), timeout)
                .await
            {
                Ok(payload) => match serde_json::from_slice::<RoomDirectory>(&payload) {
                    Ok(directory) => {
                        let Some(discovery) = discovery.upgrade() else {
                            return;
                        };
                        let mut records = discovery.records.lock().await;
                        if let Some(record) = records.get_mut(&public_url) {
                            record.rooms = directory;
                        }
                    }
                    Err(err) => {
                        tracing::warn!(server = %public_url, %err, "malformed rooms reply")
                    }
                },
                Err(err) => tracing::debug!(server = %public_url, %err, "rooms request unanswered"),
            }
        });
    }

    async fn ingest_event(&self, event: RoomServerEvent) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let mut records = self.records.lock().await;
        let Some(record) = records.get_mut(&event.public_url) else {
            // pings are authoritative for server existence
            tracing::debug!(server = %event.public_url, "dropping event for unknown server");
            return;
        };

        match event.change {
            RoomChange::NewRoom { properties } => {
                if !record.rooms.contains_key(&event.room_id) {
                    let room = RoomSummary {
                        id: event.room_id.clone(),
                        public_url: event.public_url.clone(),
                        clients: BTreeMap::new(),
                        properties,
                    };
                    record.rooms.insert(event.room_id, room.clone());
                    let _ = self.events.send(DiscoveryEvent::NewRoom { room });
                }
            }
            RoomChange::RoomRemoved => {
                if let Some(room) = record.rooms.remove(&event.room_id) {
                    self.drop_room(&event.public_url, room);
                }
            }
            RoomChange::RoomJoined { client } => {
                if let Some(room) = record.rooms.get_mut(&event.room_id) {
                    room.clients.insert(client.id.clone(), client.clone());
                    let _ = self.events.send(DiscoveryEvent::RoomJoined {
                        public_url: event.public_url,
                        room_id: event.room_id,
                        client,
                    });
                }
            }
            RoomChange::RoomLeft { client } => {
                if let Some(room) = record.rooms.get_mut(&event.room_id) {
                    room.clients.remove(&client.id);
                    let _ = self.events.send(DiscoveryEvent::RoomLeft {
                        public_url: event.public_url,
                        room_id: event.room_id,
                        client,
                    });
                }
            }
        }
    }

    /// Mirror a room teardown: every mirrored client leaves, then the room
    /// goes away.
    fn drop_room(&self, public_url: &str, room: RoomSummary) {
        let RoomSummary { id, clients, .. } = room;
        for (_, client) in clients {
            let _ = self.events.send(DiscoveryEvent::RoomLeft {
                public_url: public_url.to_string(),
                room_id: id.clone(),
                client,
            });
        }
        let _ = self.events.send(DiscoveryEvent::RoomRemoved {
            public_url: public_url.to_string(),
            room_id: id,
        });
    }

    async fn evict(&self, public_url: &str) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        let record = self.records.lock().await.remove(public_url);
        let Some(record) = record else { return };
        for (_, room) in record.rooms {
            self.drop_room(public_url, room);
        }
        let _ = self.events.send(DiscoveryEvent::ServerRemoved {
            public_url: public_url.to_string(),
        });
        tracing::info!(server = %public_url, "room server evicted");
    }

    async fn evict_expired(&self) {
        let expired: Vec<String> = {
            let records = self.records.lock().await;
            records
                .values()
                .filter(|record| record.last_ping.elapsed() > self.server_timeout)
                .map(|record| record.public_url.clone())
                .collect()
        };
        for public_url in expired {
            tracing::warn!(server = %public_url, "ping timeout");
            self.evict(&public_url).await;
        }
    }

    async fn spawn_ping_ingest(&self) -> Result<(), DiscoveryError> {
        let mut pings = self.bus.subscribe(subjects::PING).await?;
        let discovery = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = pings.recv().await {
                let Some(discovery) = discovery.upgrade() else { break };
                match serde_json::from_slice::<Ping>(&message.payload) {
                    Ok(ping) => discovery.ingest_ping(ping).await,
                    Err(err) => tracing::warn!(%err, "ignoring malformed ping"),
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    async fn spawn_event_ingest(&self) -> Result<(), DiscoveryError> {
        let mut events = self.bus.subscribe(subjects::SERVER_EVENT).await?;
        let discovery = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = events.recv().await {
                let Some(discovery) = discovery.upgrade() else { break };
                match serde_json::from_slice::<RoomServerEvent>(&message.payload) {
                    Ok(event) => discovery.ingest_event(event).await,
                    Err(err) => tracing::warn!(%err, "ignoring malformed room event"),
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    async fn spawn_stop_ingest(&self) -> Result<(), DiscoveryError> {
        let mut stops = self.bus.subscribe(subjects::SERVER_STOP).await?;
        let discovery = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = stops.recv().await {
                let Some(discovery) = discovery.upgrade() else { break };
                match serde_json::from_slice::<String>(&message.payload) {
                    Ok(public_url) => discovery.evict(&public_url).await,
                    Err(err) => tracing::warn!(%err, "ignoring malformed stop notice"),
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    async fn spawn_broadcast_relay(&self) -> Result<(), DiscoveryError> {
        let mut messages = self.bus.subscribe(subjects::BROADCAST).await?;
        let discovery = self.weak_self.clone();
        let handle = tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                let Some(discovery) = discovery.upgrade() else { break };
                match serde_json::from_slice::<Value>(&message.payload) {
                    Ok(value) => {
                        let _ = discovery.events.send(DiscoveryEvent::Broadcast(value));
                    }
                    Err(err) => tracing::warn!(%err, "ignoring malformed broadcast payload"),
                }
            }
        });
        self.tasks.lock().unwrap().push(handle);
        Ok(())
    }

    fn spawn_liveness_loop(&self) {
        let discovery = self.weak_self.clone();
        let period = self.server_timeout / 2;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(discovery) = discovery.upgrade() else { break };
                discovery.evict_expired().await;
            }
        });
        self.tasks.lock().unwrap().push(handle);
    }
}
