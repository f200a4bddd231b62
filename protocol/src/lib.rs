//! Wire types shared by room servers and discovery nodes.
//!
//! Everything in this crate crosses a process boundary: the bus subjects and
//! their payloads, the room/client summaries that discovery mirrors, the
//! claims inside the signed join token, and the rejection envelope a room
//! server sends before closing a socket. Field names serialize in camelCase
//! so payloads stay readable to every party on the bus.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Bus subjects. Matching is exact; the only parameterised subject is the
/// per-server `rooms.<publicUrl>` request channel.
pub mod subjects {
    /// 1 Hz heartbeat from every room server, payload [`Ping`](super::Ping).
    pub const PING: &str = "ping";
    /// Published once on room-server shutdown, payload is the bare
    /// `publicUrl` string.
    pub const SERVER_STOP: &str = "rs.stop";
    /// Room/client lifecycle changes, payload [`RoomServerEvent`](super::RoomServerEvent).
    pub const SERVER_EVENT: &str = "rs.event";
    /// Opaque application broadcasts, relayed by every discovery node.
    pub const BROADCAST: &str = "broadcast";

    /// Request/reply subject a room server answers with its
    /// [`RoomDirectory`](super::RoomDirectory).
    pub fn rooms(public_url: &str) -> String {
        format!("rooms.{public_url}")
    }
}

/// Subject claim every join token must carry.
pub const TOKEN_SUBJECT: &str = "joinRoom";

/// Default join-token lifetime.
pub const TOKEN_TTL_SECS: u64 = 60;

fn is_false(value: &bool) -> bool {
    !*value
}

/// Minimal projection of a connected client, the only client shape that
/// leaves its room server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSummary {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

/// Projection of a room as mirrored by discovery nodes. `public_url` names
/// the owning room server so remote observers know where to connect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub id: String,
    pub public_url: String,
    #[serde(default)]
    pub clients: BTreeMap<String, ClientSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

/// Reply body of a `rooms.<publicUrl>` request.
pub type RoomDirectory = BTreeMap<String, RoomSummary>;

/// Periodic heartbeat carrying the server's current load. The first ping
/// after startup sets `reset` so discovery nodes discard any stale mirror
/// of the same `publicUrl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ping {
    pub public_url: String,
    pub client_count: u64,
    #[serde(default, skip_serializing_if = "is_false")]
    pub reset: bool,
}

/// A room or membership change on one room server, published on
/// [`subjects::SERVER_EVENT`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomServerEvent {
    pub public_url: String,
    pub room_id: String,
    #[serde(flatten)]
    pub change: RoomChange,
}

/// The `subject` discriminant of a [`RoomServerEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "subject", rename_all = "camelCase")]
pub enum RoomChange {
    NewRoom {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        properties: Option<Value>,
    },
    RoomRemoved,
    RoomJoined { client: ClientSummary },
    RoomLeft { client: ClientSummary },
}

/// Envelope sent to a WebSocket client before the server closes the socket
/// on any rejection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub message: String,
}

impl ErrorEnvelope {
    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self {
            error: "Authentication Failed".to_string(),
            message: message.into(),
        }
    }
}

/// Claims inside the signed join token. The token binds a client identity
/// to one room on one room server and admits exactly one join.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    /// Always [`TOKEN_SUBJECT`]; verification rejects anything else.
    pub sub: String,
    /// Expiry, Unix seconds.
    pub exp: u64,
    /// The room server the holder must dial.
    pub public_url: String,
    pub room_id: String,
    /// Applied only when the join creates the room; ignored otherwise.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_properties: Option<Value>,
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_properties: Option<Value>,
    /// When set, the token admits into an existing room only.
    #[serde(default, skip_serializing_if = "is_false")]
    pub join_only: bool,
}

/// Environment variable holding the shared token secret.
pub const SECRET_ENV_VAR: &str = "DISCOVERY_SECRET";

/// Development-only fallback secret.
pub const DEV_SECRET: &str = "defaultSecret";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("{SECRET_ENV_VAR} is not set and the process is not in development mode")]
    Unset,
}

/// Shared HMAC secret for signing and verifying join tokens.
///
/// Both discovery and the room server take this explicitly at construction;
/// nothing else in the workspace reads the environment.
#[derive(Clone)]
pub struct TokenSecret(Vec<u8>);

impl TokenSecret {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self(secret.into())
    }

    /// Read the secret from [`SECRET_ENV_VAR`]. Outside development mode an
    /// unset variable is an error rather than a silently-shared default.
    pub fn from_env(development: bool) -> Result<Self, SecretError> {
        Self::from_env_value(std::env::var(SECRET_ENV_VAR).ok(), development)
    }

    fn from_env_value(value: Option<String>, development: bool) -> Result<Self, SecretError> {
        match value {
            Some(secret) if !secret.is_empty() => Ok(Self::new(secret.into_bytes())),
            _ if development => Ok(Self::new(DEV_SECRET.as_bytes().to_vec())),
            _ => Err(SecretError::Unset),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for TokenSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TokenSecret(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn summaries_serialize_in_camel_case() {
        let summary = RoomSummary {
            id: "R1".into(),
            public_url: "rs-a".into(),
            clients: BTreeMap::from([(
                "C1".into(),
                ClientSummary {
                    id: "C1".into(),
                    properties: Some(json!({"name": "alice"})),
                },
            )]),
            properties: None,
        };

        assert_eq!(
            serde_json::to_value(&summary).unwrap(),
            json!({
                "id": "R1",
                "publicUrl": "rs-a",
                "clients": {"C1": {"id": "C1", "properties": {"name": "alice"}}},
            })
        );
    }

    #[test]
    fn ping_omits_reset_unless_set() {
        let ping = Ping {
            public_url: "rs-a".into(),
            client_count: 3,
            reset: false,
        };
        assert_eq!(
            serde_json::to_value(&ping).unwrap(),
            json!({"publicUrl": "rs-a", "clientCount": 3})
        );

        let first: Ping =
            serde_json::from_value(json!({"publicUrl": "rs-a", "clientCount": 0, "reset": true}))
                .unwrap();
        assert!(first.reset);
    }

    #[test]
    fn room_change_uses_subject_tag() {
        let event = RoomServerEvent {
            public_url: "rs-a".into(),
            room_id: "R1".into(),
            change: RoomChange::RoomJoined {
                client: ClientSummary {
                    id: "C1".into(),
                    properties: None,
                },
            },
        };

        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({
                "publicUrl": "rs-a",
                "roomId": "R1",
                "subject": "roomJoined",
                "client": {"id": "C1"},
            })
        );

        let back: RoomServerEvent = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn room_removed_round_trips() {
        let value = json!({"publicUrl": "rs-a", "roomId": "R1", "subject": "roomRemoved"});
        let event: RoomServerEvent = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(event.change, RoomChange::RoomRemoved);
        assert_eq!(serde_json::to_value(&event).unwrap(), value);
    }

    #[test]
    fn token_claims_round_trip() {
        let claims = TokenClaims {
            sub: TOKEN_SUBJECT.into(),
            exp: 1_700_000_000,
            public_url: "rs-a".into(),
            room_id: "R1".into(),
            room_properties: Some(json!({"topic": "lobby"})),
            client_id: "C1".into(),
            client_properties: None,
            join_only: true,
        };

        let value = serde_json::to_value(&claims).unwrap();
        assert_eq!(value["sub"], "joinRoom");
        assert_eq!(value["publicUrl"], "rs-a");
        assert_eq!(value["joinOnly"], true);
        assert!(value.get("clientProperties").is_none());

        let back: TokenClaims = serde_json::from_value(value).unwrap();
        assert_eq!(back, claims);
    }

    #[test]
    fn secret_falls_back_only_in_development() {
        let dev = TokenSecret::from_env_value(None, true).unwrap();
        assert_eq!(dev.as_bytes(), DEV_SECRET.as_bytes());

        assert!(matches!(
            TokenSecret::from_env_value(None, false),
            Err(SecretError::Unset)
        ));
        assert!(matches!(
            TokenSecret::from_env_value(Some(String::new()), false),
            Err(SecretError::Unset)
        ));

        let set = TokenSecret::from_env_value(Some("s3cret".into()), false).unwrap();
        assert_eq!(set.as_bytes(), b"s3cret");
    }
}
