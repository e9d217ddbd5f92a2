use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    time::Duration,
};

use crate::{
    events::{EventCallback, EventKind, SubscriptionNotice},
    processor::ProcessorSettings,
    types::{ChannelName, SubscriptionId, Table},
};

/// A logical interest in change events for one table.
///
/// Validated, self-describing configuration; delivery pacing is optional.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub table: Table,
    pub event: EventKind,
    /// Server-side filter predicate, e.g. `server_id=eq.srv-9`. When absent,
    /// the role filter supplies one at activation time.
    pub predicate: Option<String>,
    pub batch_window: Option<Duration>,
    pub quiet_period: bool,
    pub throttle: Option<Duration>,
}

impl SubscriptionConfig {
    pub fn new(table: impl Into<Table>) -> Self {
        Self {
            table: table.into(),
            event: EventKind::Any,
            predicate: None,
            batch_window: None,
            quiet_period: false,
            throttle: None,
        }
    }

    pub fn event(mut self, event: EventKind) -> Self {
        self.event = event;
        self
    }

    pub fn predicate(mut self, predicate: impl Into<String>) -> Self {
        self.predicate = Some(predicate.into());
        self
    }

    pub fn batch_window(mut self, window: Duration) -> Self {
        self.batch_window = Some(window);
        self
    }

    pub fn quiet_period(mut self, quiet: bool) -> Self {
        self.quiet_period = quiet;
        self
    }

    pub fn throttle(mut self, window: Duration) -> Self {
        self.throttle = Some(window);
        self
    }

    /// Derived identity used for deduplication.
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            table: self.table.clone(),
            event: self.event,
            predicate: self.predicate.clone(),
        }
    }

    pub fn processor_settings(&self) -> ProcessorSettings {
        ProcessorSettings {
            throttle: self.throttle,
            batch_window: self.batch_window,
            quiet_period: self.quiet_period,
        }
    }
}

/// Identity of a subscription for deduplication: two interests in the same
/// (table, event, predicate) share one delivery path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionKey {
    pub table: Table,
    pub event: EventKind,
    pub predicate: Option<String>,
}

/// A registered subscription. One entry may carry several callbacks when
/// identical registrations were deduplicated; each callback is invoked on
/// every delivery.
pub struct SubscriptionEntry {
    pub id: SubscriptionId,
    pub config: SubscriptionConfig,
    pub callbacks: Vec<EventCallback>,
    /// Channel the subscription is attached to, once activated.
    pub channel: Option<ChannelName>,
}

/// Tracks logical subscriptions and deduplicates identical registrations.
///
/// Operations never fail: unknown ids are no-ops, duplicates are folded into
/// the existing entry. Not internally synchronized; the client guards it
/// together with the pool map and metrics as one critical section.
#[derive(Default)]
pub struct SubscriptionRegistry {
    next_id: u64,
    entries: HashMap<SubscriptionId, SubscriptionEntry>,
    by_key: HashMap<SubscriptionKey, SubscriptionId>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an interest. An identical active registration is reused:
    /// the callback is appended to the existing entry and the existing id
    /// returned, preventing duplicate delivery paths from repeated UI mount
    /// cycles.
    pub fn register(
        &mut self,
        config: SubscriptionConfig,
        callback: EventCallback,
    ) -> (SubscriptionId, bool) {
        let key = config.key();
        if let Some(&existing) = self.by_key.get(&key) {
            if let Some(entry) = self.entries.get_mut(&existing) {
                tracing::warn!(
                    subscription = %existing,
                    table = %key.table,
                    event = key.event.as_str(),
                    "duplicate subscription folded into existing delivery path"
                );
                entry.callbacks.push(callback);
                return (existing, true);
            }
        }

        self.next_id += 1;
        let id = SubscriptionId::new(self.next_id);
        self.entries.insert(
            id,
            SubscriptionEntry {
                id,
                config,
                callbacks: vec![callback],
                channel: None,
            },
        );
        self.by_key.insert(key, id);
        (id, false)
    }

    /// Removes an entry. Unknown ids are a no-op, making repeated
    /// unregistration safe.
    pub fn unregister(&mut self, id: SubscriptionId) -> Option<SubscriptionEntry> {
        let entry = self.entries.remove(&id)?;
        self.by_key.remove(&entry.config.key());
        Some(entry)
    }

    pub fn entry(&self, id: SubscriptionId) -> Option<&SubscriptionEntry> {
        self.entries.get(&id)
    }

    pub fn entry_mut(&mut self, id: SubscriptionId) -> Option<&mut SubscriptionEntry> {
        self.entries.get_mut(&id)
    }

    pub fn assign_channel(&mut self, id: SubscriptionId, channel: ChannelName) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.channel = Some(channel);
        }
    }

    /// Every registered subscription id, in registration order.
    pub fn list_all(&self) -> Vec<SubscriptionId> {
        let mut ids: Vec<SubscriptionId> = self.entries.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Detaches the entry from its channel assignment (the registration
    /// itself survives, e.g. across a session change).
    pub fn clear_channel(&mut self, id: SubscriptionId) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.channel = None;
        }
    }

    /// Subscriptions watching a table; used to decide whether a channel still
    /// has tenants.
    pub fn list_by_table(&self, table: &Table) -> Vec<SubscriptionId> {
        let mut ids: Vec<SubscriptionId> = self
            .entries
            .values()
            .filter(|entry| &entry.config.table == table)
            .map(|entry| entry.id)
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drains every entry, e.g. when the session identity changes and all
    /// subscriptions must be recreated with fresh predicates.
    pub fn drain(&mut self) -> Vec<SubscriptionEntry> {
        self.by_key.clear();
        self.entries.drain().map(|(_, entry)| entry).collect()
    }
}

/// Invokes every callback with the notice, catching panics at the dispatch
/// boundary so one misbehaving subscriber cannot break delivery to others.
pub fn deliver(callbacks: &[EventCallback], notice: &SubscriptionNotice) {
    for callback in callbacks {
        let result = catch_unwind(AssertUnwindSafe(|| callback(notice.clone())));
        if result.is_err() {
            tracing::error!("subscriber callback panicked; continuing delivery");
        }
    }
}
