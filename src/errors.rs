use thiserror::Error;

use crate::types::{ChannelName, EntityId, EventTimestamp};

pub type SyncResult<T> = std::result::Result<T, SyncError>;

/// Errors surfaced by the synchronization layer.
///
/// Transport-level failures are retried behind the scenes and only reach the
/// caller once a channel has exhausted its reconnect attempts. Capacity
/// exhaustion is never an error: the pool resolves it by forced reuse.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("channel {channel} failed after {attempts} reconnect attempts")]
    ChannelFailed { channel: ChannelName, attempts: u32 },
    #[error("optimistic patch for {entity} applied at {applied_at} was never confirmed")]
    StalePatch {
        entity: EntityId,
        applied_at: EventTimestamp,
    },
    #[error("client is shut down")]
    Shutdown,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors from the change-feed transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("channel join timed out")]
    JoinTimeout,
    #[error("unknown channel: {0}")]
    UnknownChannel(ChannelName),
    #[error("connection closed")]
    Closed,
    #[error("invalid transport frame: {0}")]
    InvalidFrame(String),
    #[error(transparent)]
    Url(#[from] url::ParseError),
    #[error(transparent)]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
