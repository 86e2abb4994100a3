use crate::types::NetworkId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReplicationError {
    #[error("cannot register entity: actor handle is missing")]
    InvalidActor,

    #[error("entity {0} is not registered")]
    UnknownEntity(NetworkId),

    #[error("zone {0} does not exist")]
    UnknownZone(String),

    #[error("server is full ({max_players} players)")]
    ServerFull { max_players: usize },

    #[error("connection attempt already in progress")]
    AlreadyConnecting,

    #[error("already connected")]
    AlreadyConnected,

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Published for invalid-input failures so that whoever is listening
/// (UI, telemetry) learns about them without the call panicking.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    /// The offending identifier, rendered as text (network or zone ID).
    pub subject: String,
    pub message: String,
}

impl ErrorEvent {
    pub fn from_error(subject: impl Into<String>, error: &ReplicationError) -> Self {
        Self {
            subject: subject.into(),
            message: error.to_string(),
        }
    }
}
