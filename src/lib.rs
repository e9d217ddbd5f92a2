#![allow(clippy::too_many_arguments)]

pub mod backoff;
pub mod client;
pub mod config;
pub mod errors;
pub mod events;
pub mod pool;
pub mod processor;
pub mod role_filter;
pub mod session;
pub mod store;
pub mod subscription;
pub mod transport;
pub mod types;

pub use backoff::ReconnectBackoff;
pub use client::{SubscriptionHandle, SyncClient, SyncClientBuilder};
pub use config::SyncConfig;
pub use errors::{SyncError, SyncResult, TransportError, TransportResult};
pub use events::{ChangeEvent, EventCallback, EventKind, SubscriptionNotice};
pub use pool::{ChannelState, ConnectionMetrics};
pub use role_filter::{filter_for, Role};
pub use session::{Session, SessionFeed, SessionProvider};
pub use store::OptimisticStore;
pub use subscription::{SubscriptionConfig, SubscriptionKey};
pub use transport::{
    ChangeTransport, ChannelStatus, TopicSpec, TransportFrame, WsTransport, WsTransportConfig,
};
pub use types::{ChannelName, EntityId, EventTimestamp, SubscriptionId, Table};
