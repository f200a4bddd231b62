use roomcast_bus::BusError;
use roomcast_protocol::ErrorEnvelope;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Why a socket was refused admission. Every variant maps onto the envelope
/// sent to the client just before the transport closes the socket.
#[derive(Error, Debug)]
pub enum AdmitError {
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),

    #[error("token addressed to another room server")]
    WrongServer,

    #[error("join-only token for a room that does not exist")]
    UnknownRoom,

    #[error("client id already connected to the room")]
    AlreadyConnected,

    #[error("room server is shutting down")]
    Stopping,
}

impl AdmitError {
    pub fn envelope(&self) -> ErrorEnvelope {
        match self {
            AdmitError::InvalidToken(err) => ErrorEnvelope::authentication_failed(err.to_string()),
            AdmitError::WrongServer => ErrorEnvelope::authentication_failed(
                "The authentication token is intended for another room server.",
            ),
            AdmitError::UnknownRoom => ErrorEnvelope::authentication_failed(
                "The room you are trying to join does not exist.",
            ),
            AdmitError::AlreadyConnected => ErrorEnvelope::authentication_failed(
                "You are already connected to this room.",
            ),
            AdmitError::Stopping => {
                ErrorEnvelope::authentication_failed("The room server is shutting down.")
            }
        }
    }
}
