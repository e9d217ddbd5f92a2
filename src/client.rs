use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::sync::{oneshot, watch, Mutex};

use crate::{
    config::SyncConfig,
    errors::{SyncError, SyncResult},
    events::{EventCallback, SubscriptionNotice},
    pool::{ChannelPool, ConnectionMetrics},
    session::{Session, SessionProvider},
    store::OptimisticStore,
    subscription::SubscriptionConfig,
    transport::ChangeTransport,
    types::{EntityId, EventTimestamp, SubscriptionId},
};

/// Builder for [`SyncClient`]. Transport and session provider are injected;
/// there is no module-level singleton.
pub struct SyncClientBuilder {
    config: SyncConfig,
    transport: Option<Arc<dyn ChangeTransport>>,
    sessions: Option<Arc<dyn SessionProvider>>,
}

impl SyncClientBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
            transport: None,
            sessions: None,
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ChangeTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn session_provider(mut self, sessions: Arc<dyn SessionProvider>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn build(self) -> SyncResult<SyncClient> {
        self.config
            .validate()
            .map_err(|err| SyncError::InvalidConfig(err.to_string()))?;
        let transport = self
            .transport
            .ok_or_else(|| SyncError::InvalidConfig("transport is required".to_string()))?;
        let sessions = self
            .sessions
            .ok_or_else(|| SyncError::InvalidConfig("session provider is required".to_string()))?;
        Ok(SyncClient::new(self.config, transport, sessions))
    }
}

impl Default for SyncClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

struct ClientInner {
    pool: ChannelPool,
    store: Arc<OptimisticStore>,
    sessions: Arc<dyn SessionProvider>,
    pending: Mutex<Vec<SubscriptionId>>,
    shutdown: watch::Sender<bool>,
}

/// The realtime synchronization service object.
///
/// Constructed once at application startup and passed by reference to
/// consumers; `shutdown` makes teardown explicit.
#[derive(Clone)]
pub struct SyncClient {
    inner: Arc<ClientInner>,
}

impl SyncClient {
    pub fn builder() -> SyncClientBuilder {
        SyncClientBuilder::new()
    }

    fn new(
        config: SyncConfig,
        transport: Arc<dyn ChangeTransport>,
        sessions: Arc<dyn SessionProvider>,
    ) -> Self {
        let store = Arc::new(OptimisticStore::new(config.patch_timeout()));
        let patch_timeout = config.patch_timeout();
        let pool = ChannelPool::new(config, transport, Arc::clone(&store));
        let (shutdown, _) = watch::channel(false);
        let inner = Arc::new(ClientInner {
            pool,
            store,
            sessions,
            pending: Mutex::new(Vec::new()),
            shutdown,
        });
        spawn_session_watcher(Arc::clone(&inner));
        spawn_patch_sweeper(Arc::clone(&inner), patch_timeout);
        Self { inner }
    }

    /// Registers a subscription and returns its cleanup handle.
    ///
    /// When no session exists yet the subscription queues and activates on
    /// sign-in instead of erroring.
    pub async fn subscribe(
        &self,
        config: SubscriptionConfig,
        callback: impl Fn(SubscriptionNotice) + Send + Sync + 'static,
    ) -> SyncResult<SubscriptionHandle> {
        let callback: EventCallback = Arc::new(callback);
        let (id, _existing) = self.inner.pool.register(config, callback).await?;
        match self.inner.sessions.current() {
            Some(session) => self.inner.pool.activate(id, Some(&session)).await,
            None => {
                {
                    let mut pending = self.inner.pending.lock().await;
                    if !pending.contains(&id) {
                        pending.push(id);
                    }
                }
                // The session may have arrived while we queued.
                if let Some(session) = self.inner.sessions.current() {
                    drain_pending(&self.inner, &session).await;
                } else {
                    tracing::info!(subscription = %id, "subscription queued until a session is available");
                }
            }
        }
        Ok(SubscriptionHandle {
            id,
            inner: Arc::clone(&self.inner),
        })
    }

    /// Polling-friendly connection health snapshot.
    pub async fn connection_health(&self) -> ConnectionMetrics {
        self.inner.pool.metrics().await
    }

    /// Effective value of an entity: committed state merged with any pending
    /// optimistic patch.
    pub fn read(&self, entity: &EntityId) -> Option<Value> {
        self.inner.store.read(entity)
    }

    /// Applies a local patch immediately. The receiver resolves once an
    /// authoritative event confirms it, or with `SyncError::StalePatch` if it
    /// times out and is rolled back.
    pub fn apply_optimistic(
        &self,
        entity: EntityId,
        patch: Value,
    ) -> oneshot::Receiver<SyncResult<()>> {
        self.inner
            .store
            .apply_optimistic(entity, patch, EventTimestamp::now(), Instant::now())
    }

    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        self.inner.pool.shutdown().await;
    }
}

/// Cleanup handle returned by [`SyncClient::subscribe`]; the only supported
/// unsubscription path. Safe to call after the owning channel has failed.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    inner: Arc<ClientInner>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub async fn unsubscribe(self) {
        self.inner.pending.lock().await.retain(|id| *id != self.id);
        self.inner.pool.unregister(self.id).await;
    }
}

async fn drain_pending(inner: &Arc<ClientInner>, session: &Session) {
    let queued: Vec<SubscriptionId> = {
        let mut pending = inner.pending.lock().await;
        pending.drain(..).collect()
    };
    for id in queued {
        inner.pool.activate(id, Some(session)).await;
    }
}

/// Watches the session stream: activates queued subscriptions on sign-in,
/// deactivates on sign-out, and forces re-subscription (with recomputed role
/// predicates) when the identity or role changes.
fn spawn_session_watcher(inner: Arc<ClientInner>) {
    tokio::spawn(async move {
        let mut sessions = inner.sessions.watch();
        let mut shutdown = inner.shutdown.subscribe();
        let mut last = inner.sessions.current();
        loop {
            tokio::select! {
                changed = sessions.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                _ = shutdown.changed() => return,
            }
            let next = sessions.borrow_and_update().clone();
            if next == last {
                continue;
            }
            match (&last, &next) {
                (None, Some(session)) => {
                    tracing::info!(identity = %session.identity, "session available; activating queued subscriptions");
                    drain_pending(&inner, session).await;
                }
                (Some(_), None) => {
                    tracing::info!("session ended; deactivating subscriptions");
                    let ids = inner.pool.deactivate_all().await;
                    let mut pending = inner.pending.lock().await;
                    for id in ids {
                        if !pending.contains(&id) {
                            pending.push(id);
                        }
                    }
                }
                (Some(previous), Some(session)) => {
                    tracing::info!(
                        from = %previous.identity,
                        to = %session.identity,
                        "session changed; recreating subscriptions with fresh predicates"
                    );
                    inner.pool.resubscribe_all(Some(session)).await;
                    drain_pending(&inner, session).await;
                }
                (None, None) => {}
            }
            last = next;
        }
    });
}

/// Periodically rolls back optimistic patches that were never superseded,
/// surfacing the failure to their callers.
fn spawn_patch_sweeper(inner: Arc<ClientInner>, patch_timeout: Duration) {
    let period = (patch_timeout / 4).max(Duration::from_millis(25));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut shutdown = inner.shutdown.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    inner.store.roll_back_expired(Instant::now());
                }
                _ = shutdown.changed() => return,
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::time::sleep;

    use super::*;
    use crate::events::{ChangeEvent, EventKind};
    use crate::role_filter::Role;
    use crate::session::SessionFeed;
    use crate::transport::mock::MockTransport;
    use crate::types::{ChannelName, Table};

    struct Harness {
        client: SyncClient,
        transport: Arc<MockTransport>,
        sessions: Arc<SessionFeed>,
    }

    fn harness_with(config: SyncConfig, session: Option<Session>) -> Harness {
        let transport = Arc::new(MockTransport::new());
        let sessions = Arc::new(SessionFeed::new(session));
        let client = SyncClient::builder()
            .config(config)
            .transport(Arc::clone(&transport) as Arc<dyn ChangeTransport>)
            .session_provider(Arc::clone(&sessions) as Arc<dyn SessionProvider>)
            .build()
            .unwrap();
        Harness {
            client,
            transport,
            sessions,
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            backoff_jitter_ms: 1,
            heartbeat_interval_ms: 60_000,
            ..SyncConfig::default()
        }
    }

    fn change(table: &str, kind: EventKind, row: serde_json::Value, ts: i64) -> ChangeEvent {
        ChangeEvent {
            table: Table::from(table),
            kind,
            row,
            old_row: None,
            timestamp: EventTimestamp::millis(ts),
        }
    }

    async fn wait_until(mut cond: impl FnMut() -> bool, what: &str) {
        for _ in 0..400 {
            if cond() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("timed out waiting for {what}");
    }

    #[tokio::test]
    async fn test_builder_requires_transport_and_sessions() {
        assert!(matches!(
            SyncClient::builder().build(),
            Err(SyncError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_subscribe_before_session_queues_until_sign_in() {
        let h = harness_with(fast_config(), None);
        let _handle = h
            .client
            .subscribe(SubscriptionConfig::new("orders"), |_notice| {})
            .await
            .unwrap();

        // No session: nothing joined yet.
        sleep(Duration::from_millis(30)).await;
        assert!(h.transport.joined_channels().is_empty());

        h.sessions
            .set(Some(Session::new("srv-1", Role::Server)));
        wait_until(|| !h.transport.joined_channels().is_empty(), "activation").await;
        let topics = h.transport.topics(&ChannelName::pooled(0));
        assert_eq!(topics[0].filter.as_deref(), Some("server_id=eq.srv-1"));
    }

    #[tokio::test]
    async fn test_session_change_recomputes_predicates() {
        let h = harness_with(
            fast_config(),
            Some(Session::new("srv-1", Role::Server)),
        );
        let _handle = h
            .client
            .subscribe(SubscriptionConfig::new("orders"), |_notice| {})
            .await
            .unwrap();

        let channel = ChannelName::pooled(0);
        wait_until(|| h.transport.joins(&channel) >= 1, "initial join").await;
        assert_eq!(
            h.transport.topics(&channel)[0].filter.as_deref(),
            Some("server_id=eq.srv-1")
        );

        // Admin session: unrestricted predicate, subscriptions recreated on a
        // fresh channel.
        h.sessions.set(Some(Session::new("boss", Role::Admin)));
        wait_until(
            || {
                h.transport.joined_channels().iter().any(|name| {
                    let topics = h.transport.topics(name);
                    !topics.is_empty() && topics[0].filter.is_none()
                })
            },
            "predicate recompute",
        )
        .await;
    }

    #[tokio::test]
    async fn test_sign_out_deactivates_and_requeues() {
        let h = harness_with(
            fast_config(),
            Some(Session::new("srv-1", Role::Server)),
        );
        let _handle = h
            .client
            .subscribe(SubscriptionConfig::new("orders"), |_notice| {})
            .await
            .unwrap();
        let channel = ChannelName::pooled(0);
        wait_until(|| h.transport.joins(&channel) >= 1, "initial join").await;

        h.sessions.set(None);
        wait_until(|| h.transport.joined_channels().is_empty(), "deactivation").await;

        // Registration survives sign-out and reactivates on the next session.
        h.sessions.set(Some(Session::new("srv-2", Role::Server)));
        wait_until(
            || {
                h.transport.joined_channels().iter().any(|name| {
                    h.transport
                        .topics(name)
                        .first()
                        .map(|topic| topic.filter.as_deref() == Some("server_id=eq.srv-2"))
                        .unwrap_or(false)
                })
            },
            "reactivation with new identity",
        )
        .await;
    }

    #[tokio::test]
    async fn test_optimistic_patch_confirmed_by_event() {
        let h = harness_with(
            fast_config(),
            Some(Session::new("boss", Role::Admin)),
        );
        let _handle = h
            .client
            .subscribe(SubscriptionConfig::new("orders"), |_notice| {})
            .await
            .unwrap();
        let channel = ChannelName::pooled(0);
        wait_until(|| h.transport.joins(&channel) >= 1, "join").await;

        let entity = EntityId::new("orders:9");
        let mut confirmation = h
            .client
            .apply_optimistic(entity.clone(), json!({"status": "preparing"}));
        assert_eq!(h.client.read(&entity).unwrap()["status"], "preparing");

        // Authoritative event stamped after the patch supersedes it.
        let future_ts = EventTimestamp::now().into_millis() + 5_000;
        h.transport
            .emit(
                &channel,
                change(
                    "orders",
                    EventKind::Update,
                    json!({"id": 9, "status": "preparing", "station": "grill"}),
                    future_ts,
                ),
            )
            .await;
        wait_until(
            || matches!(confirmation.try_recv(), Ok(Ok(()))),
            "patch confirmation",
        )
        .await;
        assert_eq!(h.client.read(&entity).unwrap()["station"], "grill");
    }

    #[tokio::test]
    async fn test_optimistic_patch_timeout_surfaces_error() {
        let config = SyncConfig {
            patch_timeout_ms: 60,
            ..fast_config()
        };
        let h = harness_with(config, Some(Session::new("boss", Role::Admin)));

        let entity = EntityId::new("orders:9");
        let mut confirmation = h
            .client
            .apply_optimistic(entity.clone(), json!({"status": "preparing"}));

        wait_until(
            || {
                matches!(
                    confirmation.try_recv(),
                    Ok(Err(SyncError::StalePatch { .. }))
                )
            },
            "stale patch rollback",
        )
        .await;
        // Overlay rolled back; no committed value ever existed.
        assert_eq!(h.client.read(&entity), None);
    }

    #[tokio::test]
    async fn test_unsubscribe_via_handle() {
        let h = harness_with(
            fast_config(),
            Some(Session::new("boss", Role::Admin)),
        );
        let handle = h
            .client
            .subscribe(SubscriptionConfig::new("orders"), |_notice| {})
            .await
            .unwrap();
        wait_until(|| !h.transport.joined_channels().is_empty(), "join").await;
        assert_eq!(h.client.connection_health().await.active_subscriptions, 1);

        handle.unsubscribe().await;
        assert_eq!(h.client.connection_health().await.active_subscriptions, 0);
    }

    #[tokio::test]
    async fn test_subscribe_after_shutdown_errors() {
        let h = harness_with(
            fast_config(),
            Some(Session::new("boss", Role::Admin)),
        );
        h.client.shutdown().await;
        let result = h
            .client
            .subscribe(SubscriptionConfig::new("orders"), |_notice| {})
            .await;
        assert!(matches!(result, Err(SyncError::Shutdown)));
    }
}
