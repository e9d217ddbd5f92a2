use std::{
    collections::HashMap,
    sync::Mutex,
    time::{Duration, Instant},
};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::{
    errors::{SyncError, SyncResult},
    types::{EntityId, EventTimestamp},
};

/// An entity's authoritative value plus an optional optimistic overlay.
struct EntityRecord {
    committed: Value,
    pending: Option<PendingPatch>,
}

struct PendingPatch {
    patch: Value,
    applied_at: EventTimestamp,
    applied_instant: Instant,
    waiters: Vec<oneshot::Sender<SyncResult<()>>>,
}

/// Local cache of synchronized entities with optimistic patches reconciled
/// against the authoritative event stream.
///
/// Reconciliation rule: an authoritative event clears a pending patch iff its
/// timestamp is at or after the patch's applied time. Arrival order is never
/// consulted, because arrival order across a reconnect is not reliable.
pub struct OptimisticStore {
    state: Mutex<HashMap<EntityId, EntityRecord>>,
    patch_timeout: Duration,
}

impl OptimisticStore {
    pub fn new(patch_timeout: Duration) -> Self {
        Self {
            state: Mutex::new(HashMap::new()),
            patch_timeout,
        }
    }

    /// Overlays `patch` on the entity immediately, so the caller observes its
    /// own write without waiting for the round trip. The returned receiver
    /// resolves `Ok` once an authoritative event supersedes the patch, or
    /// `Err(SyncError::StalePatch)` if the patch times out and is rolled back.
    pub fn apply_optimistic(
        &self,
        entity: EntityId,
        patch: Value,
        applied_at: EventTimestamp,
        now: Instant,
    ) -> oneshot::Receiver<SyncResult<()>> {
        let (tx, rx) = oneshot::channel();
        let mut state = self.state.lock().expect("store mutex poisoned");
        let record = state.entry(entity).or_insert_with(|| EntityRecord {
            committed: Value::Null,
            pending: None,
        });
        match record.pending.as_mut() {
            // A newer local write folds into the outstanding patch; every
            // waiter resolves when the combined patch reconciles.
            Some(pending) => {
                pending.patch = merge(&pending.patch, &patch);
                pending.applied_at = applied_at.max(pending.applied_at);
                pending.applied_instant = now;
                pending.waiters.push(tx);
            }
            None => {
                record.pending = Some(PendingPatch {
                    patch,
                    applied_at,
                    applied_instant: now,
                    waiters: vec![tx],
                });
            }
        }
        rx
    }

    /// Installs the authoritative value for an entity. Clears the pending
    /// patch when the event timestamp is at or after the patch's applied
    /// time; retains it when the event is stale relative to the local write.
    pub fn apply_authoritative(
        &self,
        entity: &EntityId,
        value: Value,
        event_timestamp: EventTimestamp,
    ) {
        let mut state = self.state.lock().expect("store mutex poisoned");
        let record = state.entry(entity.clone()).or_insert_with(|| EntityRecord {
            committed: Value::Null,
            pending: None,
        });
        record.committed = value;
        let superseded = record
            .pending
            .as_ref()
            .map(|pending| event_timestamp >= pending.applied_at)
            .unwrap_or(false);
        if superseded {
            let pending = record.pending.take().expect("checked above");
            for waiter in pending.waiters {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    /// Removes an entity on an authoritative delete. A delete that predates
    /// an outstanding optimistic patch is stale and ignored.
    pub fn remove_authoritative(&self, entity: &EntityId, event_timestamp: EventTimestamp) {
        let mut state = self.state.lock().expect("store mutex poisoned");
        let Some(record) = state.get_mut(entity) else {
            return;
        };
        if let Some(pending) = record.pending.as_ref() {
            if event_timestamp < pending.applied_at {
                return;
            }
        }
        if let Some(pending) = state.remove(entity).and_then(|record| record.pending) {
            for waiter in pending.waiters {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    /// The effective value: committed merged with the pending patch.
    pub fn read(&self, entity: &EntityId) -> Option<Value> {
        let state = self.state.lock().expect("store mutex poisoned");
        let record = state.get(entity)?;
        Some(match record.pending.as_ref() {
            Some(pending) => merge(&record.committed, &pending.patch),
            None => record.committed.clone(),
        })
    }

    /// Rolls back patches older than the configured timeout, notifying their
    /// callers with a recoverable error. Returns the affected entities.
    pub fn roll_back_expired(&self, now: Instant) -> Vec<EntityId> {
        let mut state = self.state.lock().expect("store mutex poisoned");
        let mut expired = Vec::new();
        for (entity, record) in state.iter_mut() {
            let timed_out = record
                .pending
                .as_ref()
                .map(|pending| now.duration_since(pending.applied_instant) >= self.patch_timeout)
                .unwrap_or(false);
            if !timed_out {
                continue;
            }
            let pending = record.pending.take().expect("checked above");
            tracing::warn!(
                entity = %entity,
                applied_at = %pending.applied_at,
                "optimistic patch never confirmed; rolling back"
            );
            for waiter in pending.waiters {
                let _ = waiter.send(Err(SyncError::StalePatch {
                    entity: entity.clone(),
                    applied_at: pending.applied_at,
                }));
            }
            expired.push(entity.clone());
        }
        // Records that only ever existed as an optimistic guess vanish
        // entirely on rollback.
        state.retain(|_, record| {
            !(record.committed.is_null() && record.pending.is_none())
        });
        expired
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("store mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Shallow object merge: overlay fields win; non-object overlays replace the
/// base outright.
fn merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut out = base_map.clone();
            for (key, value) in overlay_map {
                out.insert(key.clone(), value.clone());
            }
            Value::Object(out)
        }
        _ => overlay.clone(),
    }
}
