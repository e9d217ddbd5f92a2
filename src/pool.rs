use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::{
    sync::{mpsc, Mutex},
    time::{sleep, timeout},
};

use crate::{
    backoff::ReconnectBackoff,
    config::SyncConfig,
    errors::{SyncError, SyncResult, TransportError},
    events::{ChangeEvent, EventCallback, EventKind, SubscriptionNotice},
    processor::{Flush, MessageProcessor},
    role_filter::{filter_for, row_matches},
    session::Session,
    store::OptimisticStore,
    subscription::{deliver, SubscriptionConfig, SubscriptionRegistry},
    transport::{ChangeTransport, ChannelStatus, TopicSpec, TransportFrame},
    types::{ChannelName, SubscriptionId},
};

/// Lifecycle of one pooled channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Active,
    Error,
    Closed,
}

/// Process-wide connection health snapshot, safe to poll at any time.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMetrics {
    pub active_channels: usize,
    pub active_subscriptions: usize,
    pub reconnect_attempts: u64,
    pub messages_total: u64,
    pub messages_per_sec: f64,
    pub last_error: Option<String>,
}

enum ChannelCommand {
    Attach {
        id: SubscriptionId,
        config: SubscriptionConfig,
        callbacks: Vec<EventCallback>,
    },
    Detach {
        id: SubscriptionId,
    },
    PingFailed,
    Shutdown,
}

struct ChannelEntry {
    status: ChannelState,
    subscriptions: HashSet<SubscriptionId>,
    commands: mpsc::UnboundedSender<ChannelCommand>,
    last_activity: Instant,
    reconnect_attempts: u32,
}

struct PoolState {
    registry: SubscriptionRegistry,
    channels: HashMap<ChannelName, ChannelEntry>,
    next_channel: usize,
    closed: bool,
    reconnect_attempts: u64,
    messages_total: u64,
    rate_window_start: Instant,
    rate_window_count: u64,
    rate: f64,
    last_error: Option<String>,
}

struct PoolInner {
    config: SyncConfig,
    backoff: ReconnectBackoff,
    transport: Arc<dyn ChangeTransport>,
    store: Arc<OptimisticStore>,
    state: Mutex<PoolState>,
}

/// Owns the bounded set of physical channels and multiplexes subscriptions
/// across them.
///
/// Registry, channel map and metrics share one mutex, so every pool operation
/// is a single critical section; the lock is never held across a transport
/// await.
pub(crate) struct ChannelPool {
    inner: Arc<PoolInner>,
}

impl ChannelPool {
    pub(crate) fn new(
        config: SyncConfig,
        transport: Arc<dyn ChangeTransport>,
        store: Arc<OptimisticStore>,
    ) -> Self {
        let backoff = config.backoff();
        let inner = Arc::new(PoolInner {
            config,
            backoff,
            transport,
            store,
            state: Mutex::new(PoolState {
                registry: SubscriptionRegistry::new(),
                channels: HashMap::new(),
                next_channel: 0,
                closed: false,
                reconnect_attempts: 0,
                messages_total: 0,
                rate_window_start: Instant::now(),
                rate_window_count: 0,
                rate: 0.0,
                last_error: None,
            }),
        });
        spawn_heartbeat(Arc::clone(&inner));
        Self { inner }
    }

    /// Records the interest without attaching it; activation is the session
    /// gate's call.
    pub(crate) async fn register(
        &self,
        config: SubscriptionConfig,
        callback: EventCallback,
    ) -> SyncResult<(SubscriptionId, bool)> {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return Err(SyncError::Shutdown);
        }
        Ok(state.registry.register(config, callback))
    }

    /// Attaches a registered subscription to a pooled channel, computing the
    /// role predicate from the session when the config carries none.
    pub(crate) async fn activate(&self, id: SubscriptionId, session: Option<&Session>) {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return;
        }
        attach_locked(&self.inner, &mut state, id, session);
    }

    /// Removes a subscription. Unknown ids are a no-op; an emptied channel is
    /// left to the idle-teardown timer rather than torn down immediately.
    pub(crate) async fn unregister(&self, id: SubscriptionId) {
        let mut state = self.inner.state.lock().await;
        let Some(entry) = state.registry.unregister(id) else {
            return;
        };
        if let Some(channel) = entry.channel {
            if let Some(channel_entry) = state.channels.get_mut(&channel) {
                channel_entry.subscriptions.remove(&id);
                let _ = channel_entry.commands.send(ChannelCommand::Detach { id });
            }
        }
    }

    /// Tears down every channel and re-attaches all registered subscriptions
    /// with predicates recomputed for the new session.
    pub(crate) async fn resubscribe_all(&self, session: Option<&Session>) {
        let mut state = self.inner.state.lock().await;
        if state.closed {
            return;
        }
        for (_, entry) in state.channels.drain() {
            let _ = entry.commands.send(ChannelCommand::Shutdown);
        }
        for id in state.registry.list_all() {
            state.registry.clear_channel(id);
            attach_locked(&self.inner, &mut state, id, session);
        }
    }

    /// Tears down every channel but keeps the registrations; returns the ids
    /// so the session gate can queue them for reactivation.
    pub(crate) async fn deactivate_all(&self) -> Vec<SubscriptionId> {
        let mut state = self.inner.state.lock().await;
        for (_, entry) in state.channels.drain() {
            let _ = entry.commands.send(ChannelCommand::Shutdown);
        }
        let ids = state.registry.list_all();
        for id in &ids {
            state.registry.clear_channel(*id);
        }
        ids
    }

    pub(crate) async fn metrics(&self) -> ConnectionMetrics {
        let mut state = self.inner.state.lock().await;
        roll_rate_window(&mut state, Instant::now());
        ConnectionMetrics {
            active_channels: state.channels.len(),
            active_subscriptions: state.registry.len(),
            reconnect_attempts: state.reconnect_attempts,
            messages_total: state.messages_total,
            messages_per_sec: state.rate,
            last_error: state.last_error.clone(),
        }
    }

    pub(crate) async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.closed = true;
        for (_, entry) in state.channels.drain() {
            let _ = entry.commands.send(ChannelCommand::Shutdown);
        }
    }
}

/// Picks or creates a channel and hands the subscription to its task.
/// Call with the pool lock held.
fn attach_locked(
    inner: &Arc<PoolInner>,
    state: &mut PoolState,
    id: SubscriptionId,
    session: Option<&Session>,
) {
    let (mut effective, callbacks, assigned) = match state.registry.entry(id) {
        Some(entry) => (
            entry.config.clone(),
            entry.callbacks.clone(),
            entry.channel.clone(),
        ),
        None => return,
    };
    if effective.predicate.is_none() {
        if let Some(session) = session {
            effective.predicate =
                filter_for(&effective.table, &session.role, &session.identity);
        }
    }

    let max_subs = inner.config.max_subscriptions_per_channel;
    let channel = if let Some(existing) = assigned {
        // Already attached (dedup or reactivation): keep the placement.
        existing
    } else if let Some(name) = least_loaded(state, Some(max_subs)) {
        name
    } else if state.channels.len() < inner.config.max_channels {
        let name = ChannelName::pooled(state.next_channel);
        state.next_channel += 1;
        let commands = spawn_channel(Arc::clone(inner), name.clone());
        state.channels.insert(
            name.clone(),
            ChannelEntry {
                status: ChannelState::Connecting,
                subscriptions: HashSet::new(),
                commands,
                last_activity: Instant::now(),
                reconnect_attempts: 0,
            },
        );
        name
    } else {
        // Pool at capacity: share the least-loaded channel beyond its soft
        // limit rather than reject the subscription.
        let name = least_loaded(state, None).expect("pool at capacity implies channels exist");
        tracing::warn!(
            channel = %name,
            max_per_channel = max_subs,
            "pool at capacity; forcing subscription onto least-loaded channel"
        );
        name
    };

    if let Some(channel_entry) = state.channels.get_mut(&channel) {
        channel_entry.subscriptions.insert(id);
        let _ = channel_entry.commands.send(ChannelCommand::Attach {
            id,
            config: effective,
            callbacks,
        });
    }
    state.registry.assign_channel(id, channel);
}

fn least_loaded(state: &PoolState, under: Option<usize>) -> Option<ChannelName> {
    state
        .channels
        .iter()
        .filter(|(_, entry)| entry.status != ChannelState::Closed)
        .filter(|(_, entry)| under.map_or(true, |cap| entry.subscriptions.len() < cap))
        .min_by_key(|(name, entry)| (entry.subscriptions.len(), (*name).clone()))
        .map(|(name, _)| name.clone())
}

fn roll_rate_window(state: &mut PoolState, now: Instant) {
    let elapsed = now.duration_since(state.rate_window_start);
    if elapsed >= Duration::from_secs(1) {
        state.rate = state.rate_window_count as f64 / elapsed.as_secs_f64();
        state.rate_window_start = now;
        state.rate_window_count = 0;
    }
}

fn spawn_heartbeat(inner: Arc<PoolInner>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(inner.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let targets: Vec<(ChannelName, mpsc::UnboundedSender<ChannelCommand>)> = {
                let state = inner.state.lock().await;
                if state.closed {
                    return;
                }
                state
                    .channels
                    .iter()
                    .filter(|(_, entry)| entry.status == ChannelState::Active)
                    .map(|(name, entry)| (name.clone(), entry.commands.clone()))
                    .collect()
            };
            for (name, commands) in targets {
                match inner.transport.ping(&name).await {
                    Ok(()) => {}
                    Err(TransportError::UnknownChannel(_)) => {
                        // Already defunct on the transport side; do not loop
                        // on it forever.
                        let mut state = inner.state.lock().await;
                        state.channels.remove(&name);
                        let _ = commands.send(ChannelCommand::Shutdown);
                        tracing::warn!(channel = %name, "defunct channel removed from pool");
                    }
                    Err(err) => {
                        tracing::warn!(channel = %name, %err, "heartbeat ping failed");
                        let _ = commands.send(ChannelCommand::PingFailed);
                    }
                }
            }
        }
    });
}

fn spawn_channel(
    inner: Arc<PoolInner>,
    name: ChannelName,
) -> mpsc::UnboundedSender<ChannelCommand> {
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        ChannelTask {
            inner,
            name,
            commands: rx,
            frames: None,
            subs: HashMap::new(),
            idle_since: None,
        }
        .run()
        .await;
    });
    tx
}

struct DeliveryState {
    config: SubscriptionConfig,
    callbacks: Vec<EventCallback>,
    processor: MessageProcessor,
}

/// Task owning one channel end to end: joining, delivery, pacing timers,
/// reconnection and idle teardown.
struct ChannelTask {
    inner: Arc<PoolInner>,
    name: ChannelName,
    commands: mpsc::UnboundedReceiver<ChannelCommand>,
    frames: Option<mpsc::Receiver<TransportFrame>>,
    subs: HashMap<SubscriptionId, DeliveryState>,
    idle_since: Option<Instant>,
}

impl ChannelTask {
    async fn run(mut self) {
        loop {
            let wake = self.next_wake();
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(ChannelCommand::Attach { id, config, callbacks }) => {
                            if !self.handle_attach(id, config, callbacks).await {
                                return;
                            }
                        }
                        Some(ChannelCommand::Detach { id }) => {
                            self.handle_detach(id);
                        }
                        Some(ChannelCommand::PingFailed) => {
                            if !self.handle_failure("heartbeat ping failed").await {
                                return;
                            }
                        }
                        Some(ChannelCommand::Shutdown) | None => {
                            let _ = self.inner.transport.unsubscribe(&self.name).await;
                            return;
                        }
                    }
                }
                frame = recv_frame(&mut self.frames) => {
                    match frame {
                        Some(TransportFrame::Event(event)) => self.handle_event(event).await,
                        Some(TransportFrame::Status(status)) => match status {
                            ChannelStatus::Error
                            | ChannelStatus::TimedOut
                            | ChannelStatus::Closed => {
                                if !self.handle_failure("transport reported failure").await {
                                    return;
                                }
                            }
                            ChannelStatus::Connecting | ChannelStatus::Active => {}
                        },
                        None => {
                            if !self.handle_failure("transport stream ended").await {
                                return;
                            }
                        }
                    }
                }
                _ = sleep_until_opt(wake) => {
                    if !self.handle_timer().await {
                        return;
                    }
                }
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let mut wake: Option<Instant> = None;
        for delivery in self.subs.values() {
            if let Some(deadline) = delivery.processor.next_deadline() {
                wake = Some(wake.map_or(deadline, |current| current.min(deadline)));
            }
        }
        if let Some(since) = self.idle_since {
            let idle_at = since + self.inner.config.idle_teardown();
            wake = Some(wake.map_or(idle_at, |current| current.min(idle_at)));
        }
        wake
    }

    /// Returns false when the task must stop (terminal failure).
    async fn handle_attach(
        &mut self,
        id: SubscriptionId,
        config: SubscriptionConfig,
        callbacks: Vec<EventCallback>,
    ) -> bool {
        self.idle_since = None;
        let topics_before = self.topics();
        match self.subs.get_mut(&id) {
            Some(existing) => {
                // Dedup or reactivation: refresh callbacks and config but keep
                // any buffered events.
                existing.config = config;
                existing.callbacks = callbacks;
            }
            None => {
                let processor = MessageProcessor::new(config.processor_settings());
                self.subs.insert(
                    id,
                    DeliveryState {
                        config,
                        callbacks,
                        processor,
                    },
                );
            }
        }
        let topics_after = self.topics();
        if self.frames.is_none() || topics_after != topics_before {
            return self.rejoin().await;
        }
        true
    }

    fn handle_detach(&mut self, id: SubscriptionId) {
        if let Some(mut delivery) = self.subs.remove(&id) {
            // Flush before teardown so buffered events are not silently lost.
            if let Some(flush) = delivery.processor.drain() {
                dispatch(&delivery.callbacks, flush);
            }
        }
        if self.subs.is_empty() {
            self.idle_since = Some(Instant::now());
        }
    }

    async fn handle_event(&mut self, event: ChangeEvent) {
        let now = Instant::now();
        {
            let mut state = self.inner.state.lock().await;
            state.messages_total += 1;
            state.rate_window_count += 1;
            roll_rate_window(&mut state, now);
            if let Some(entry) = state.channels.get_mut(&self.name) {
                entry.last_activity = now;
            }
        }

        if let Some(entity) = event.entity_id() {
            if event.kind == EventKind::Delete {
                self.inner
                    .store
                    .remove_authoritative(&entity, event.timestamp);
            } else {
                self.inner
                    .store
                    .apply_authoritative(&entity, event.row.clone(), event.timestamp);
            }
        }

        for delivery in self.subs.values_mut() {
            if delivery.config.table != event.table {
                continue;
            }
            if !delivery.config.event.accepts(event.kind) {
                continue;
            }
            if let Some(predicate) = delivery.config.predicate.as_deref() {
                if !row_matches(predicate, &event.row) {
                    continue;
                }
            }
            if let Some(flush) = delivery.processor.accept(event.clone(), now) {
                dispatch(&delivery.callbacks, flush);
            }
        }
    }

    /// Returns false when the task must stop.
    async fn handle_timer(&mut self) -> bool {
        let now = Instant::now();
        for delivery in self.subs.values_mut() {
            if let Some(flush) = delivery.processor.flush_due(now) {
                dispatch(&delivery.callbacks, flush);
            }
        }
        if let Some(since) = self.idle_since {
            if self.subs.is_empty() && now >= since + self.inner.config.idle_teardown() {
                tracing::info!(channel = %self.name, "idle channel torn down");
                self.inner.state.lock().await.channels.remove(&self.name);
                let _ = self.inner.transport.unsubscribe(&self.name).await;
                return false;
            }
        }
        true
    }

    /// Transport-level failure: keep the subscriptions, drop the stream, and
    /// enter the reconnect path.
    async fn handle_failure(&mut self, reason: &str) -> bool {
        tracing::warn!(channel = %self.name, reason, "channel failure");
        self.frames = None;
        self.reconnect(reason).await
    }

    /// Joins the channel once, bounded by the configured join timeout.
    async fn join_once(&self) -> Result<mpsc::Receiver<TransportFrame>, TransportError> {
        let topics = self.topics();
        match timeout(
            self.inner.config.join_timeout(),
            self.inner.transport.subscribe(&self.name, &topics),
        )
        .await
        {
            Ok(Ok(frames)) => Ok(frames),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransportError::JoinTimeout),
        }
    }

    /// Initial join or rejoin-in-place after a topic change. Falls into the
    /// backoff reconnect path on failure.
    async fn rejoin(&mut self) -> bool {
        match self.join_once().await {
            Ok(frames) => {
                self.frames = Some(frames);
                self.mark_active().await;
                true
            }
            Err(err) => {
                tracing::warn!(channel = %self.name, %err, "channel join failed");
                self.reconnect("channel join failed").await
            }
        }
    }

    /// Reconnect loop with exponential backoff. Attached subscriptions are
    /// kept throughout and notified `Resubscribed` on success, or `Failed`
    /// exactly once if the attempt cap is exceeded. Returns false when the
    /// task must stop.
    async fn reconnect(&mut self, reason: &str) -> bool {
        loop {
            let attempts = {
                let mut state = self.inner.state.lock().await;
                state.reconnect_attempts += 1;
                state.last_error = Some(format!("{}: {}", self.name, reason));
                let Some(entry) = state.channels.get_mut(&self.name) else {
                    // Removed from the pool (defunct); nothing left to do.
                    return false;
                };
                entry.status = ChannelState::Error;
                entry.reconnect_attempts += 1;
                entry.reconnect_attempts
            };

            if attempts > self.inner.config.max_reconnect_attempts {
                self.fail_terminally(attempts).await;
                return false;
            }

            let delay = self.inner.backoff.delay(attempts - 1);
            tracing::warn!(
                channel = %self.name,
                attempt = attempts,
                ?delay,
                "scheduling reconnect"
            );
            sleep(delay).await;

            {
                let mut state = self.inner.state.lock().await;
                let Some(entry) = state.channels.get_mut(&self.name) else {
                    return false;
                };
                entry.status = ChannelState::Connecting;
            }

            match self.join_once().await {
                Ok(frames) => {
                    self.frames = Some(frames);
                    self.mark_active().await;
                    let notice = SubscriptionNotice::Resubscribed(self.name.clone());
                    for delivery in self.subs.values() {
                        deliver(&delivery.callbacks, &notice);
                    }
                    tracing::info!(channel = %self.name, attempts, "reconnect completed");
                    return true;
                }
                Err(err) => {
                    tracing::warn!(channel = %self.name, attempt = attempts, %err, "reconnect failed");
                }
            }
        }
    }

    async fn mark_active(&self) {
        let mut state = self.inner.state.lock().await;
        if let Some(entry) = state.channels.get_mut(&self.name) {
            entry.status = ChannelState::Active;
            entry.reconnect_attempts = 0;
            entry.last_activity = Instant::now();
        }
    }

    /// The channel is past its attempt cap: report every attached
    /// subscription as failed (exactly once) and leave the pool.
    async fn fail_terminally(&mut self, attempts: u32) {
        {
            let mut state = self.inner.state.lock().await;
            for id in self.subs.keys() {
                state.registry.unregister(*id);
            }
            state.channels.remove(&self.name);
            state.last_error = Some(
                SyncError::ChannelFailed {
                    channel: self.name.clone(),
                    attempts,
                }
                .to_string(),
            );
        }
        let notice = SubscriptionNotice::Failed {
            channel: self.name.clone(),
            attempts,
        };
        for delivery in self.subs.values() {
            deliver(&delivery.callbacks, &notice);
        }
        tracing::error!(channel = %self.name, attempts, "channel terminally failed");
    }

    /// Distinct topics across attached subscriptions, in stable order so
    /// rejoin decisions can compare before/after.
    fn topics(&self) -> Vec<TopicSpec> {
        let mut topics: Vec<TopicSpec> = Vec::new();
        for delivery in self.subs.values() {
            let spec = TopicSpec::new(
                delivery.config.table.clone(),
                delivery.config.event,
                delivery.config.predicate.clone(),
            );
            if !topics.contains(&spec) {
                topics.push(spec);
            }
        }
        topics.sort_by(|a, b| {
            (a.table.as_str(), a.event.as_str(), a.filter.as_deref())
                .cmp(&(b.table.as_str(), b.event.as_str(), b.filter.as_deref()))
        });
        topics
    }
}

async fn recv_frame(frames: &mut Option<mpsc::Receiver<TransportFrame>>) -> Option<TransportFrame> {
    match frames {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(wake: Option<Instant>) {
    match wake {
        Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
        None => std::future::pending().await,
    }
}

fn dispatch(callbacks: &[EventCallback], flush: Flush) {
    let notice = match flush {
        Flush::Single(event) => SubscriptionNotice::Event(event),
        Flush::Batch(events) => SubscriptionNotice::Batch(events),
    };
    deliver(callbacks, &notice);
}
