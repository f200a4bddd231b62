//! Mirror of one remote room server.

use std::collections::BTreeMap;

use roomcast_protocol::RoomSummary;
use tokio::time::Instant;

/// What a discovery node knows about one room server: the client count from
/// its most recent ping and a tree-shaped snapshot of its rooms. Eventually
/// consistent; the count may lag actual membership between pings.
#[derive(Debug, Clone)]
pub struct RoomServerRecord {
    pub public_url: String,
    pub client_count: u64,
    pub rooms: BTreeMap<String, RoomSummary>,
    pub last_ping: Instant,
}

impl RoomServerRecord {
    pub(crate) fn new(public_url: String, client_count: u64) -> Self {
        Self {
            public_url,
            client_count,
            rooms: BTreeMap::new(),
            last_ping: Instant::now(),
        }
    }
}
