use std::sync::Arc;

use roomcast_bus::Bus;
use roomcast_protocol::TokenSecret;

use crate::error::ServerError;
use crate::room::RoomOptions;
use crate::{RoomServer, StopCallback};

/// Builder for a [`RoomServer`]. `public_url` and the token secret are
/// required; everything else has fleet defaults.
pub struct RoomServerBuilder {
    public_url: Option<String>,
    secret: Option<TokenSecret>,
    sync_rooms: bool,
    sync_clients: bool,
    room_defaults: RoomOptions,
    on_stop: Option<StopCallback>,
}

impl RoomServerBuilder {
    pub fn new() -> Self {
        Self {
            public_url: None,
            secret: None,
            sync_rooms: true,
            sync_clients: true,
            room_defaults: RoomOptions::default(),
            on_stop: None,
        }
    }

    /// Externally-reachable address clients dial. Doubles as this server's
    /// routing key on the bus, so it must be unique across the fleet.
    pub fn public_url(mut self, public_url: impl Into<String>) -> Self {
        self.public_url = Some(public_url.into());
        self
    }

    /// Shared secret the join tokens are verified against.
    pub fn secret(mut self, secret: TokenSecret) -> Self {
        self.secret = Some(secret);
        self
    }

    /// Publish room lifecycle events on the bus. Disabling also disables
    /// client sync.
    pub fn sync_rooms(mut self, enabled: bool) -> Self {
        self.sync_rooms = enabled;
        self
    }

    /// Include client join/leave events and rosters in fleet sync.
    pub fn sync_clients(mut self, enabled: bool) -> Self {
        self.sync_clients = enabled;
        self
    }

    /// Options applied to every room this server creates.
    pub fn room_defaults(mut self, options: RoomOptions) -> Self {
        self.room_defaults = options;
        self
    }

    /// Invoked once after shutdown completes.
    pub fn on_stop<F>(mut self, callback: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.on_stop = Some(Box::new(callback));
        self
    }

    /// Wire the server to the bus and start its background loops.
    pub async fn start(self, bus: Arc<dyn Bus>) -> Result<Arc<RoomServer>, ServerError> {
        let public_url = self
            .public_url
            .ok_or_else(|| ServerError::Config("public_url is required".into()))?;
        let secret = self
            .secret
            .ok_or_else(|| ServerError::Config("token secret is required".into()))?;

        RoomServer::start(
            bus,
            public_url,
            &secret,
            self.sync_rooms,
            self.sync_clients,
            self.room_defaults,
            self.on_stop,
        )
        .await
    }
}

impl Default for RoomServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
