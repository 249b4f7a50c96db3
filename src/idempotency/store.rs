//! # Idempotency Store
//!
//! In-memory, process-lifetime deduplication keyed by a caller-supplied key.
//!
//! ## Protocol
//!
//! 1. `get_or_begin(key, payload_hash)` claims the key:
//!    - No live record: a pending placeholder is created, `Begin` is returned
//!      and the caller owns the execution.
//!    - Completed with the same hash: `Existing(result)` (replay, no re-execution).
//!    - Any record with a different hash: `Conflict`.
//!    - Pending with the same hash: `Pending` (wait or reject per policy).
//! 2. The owner finalizes with `complete`, or gives the key back with
//!    `abandon` so a later submission can run it again.
//!
//! Completed records expire after their TTL; pending placeholders older
//! than `pending_timeout` are treated as abandoned. Both are then absent.
//! Every key is its own map entry, so unrelated keys never contend.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::constants::system;

/// What a late arrival does while the first submission is still running
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingPolicy {
    /// Wait up to `max_wait` for the first submission to complete
    Wait { max_wait: Duration },
    /// Fail the late arrival immediately
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdempotencyConfig {
    /// Lifetime of a completed record
    pub ttl: Duration,
    pub pending_policy: PendingPolicy,
    /// Age after which an unfinished placeholder is reclaimable
    pub pending_timeout: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(system::DEFAULT_IDEMPOTENCY_TTL_SECONDS),
            pending_policy: PendingPolicy::Wait {
                max_wait: Duration::from_millis(system::DEFAULT_PENDING_WAIT_MS),
            },
            pending_timeout: Duration::from_millis(system::DEFAULT_PENDING_TIMEOUT_MS),
        }
    }
}

/// Result of claiming a key
#[derive(Debug, Clone, PartialEq)]
pub enum IdempotencyOutcome<T> {
    /// A completed result for the same payload
    Existing(T),
    /// The caller owns execution and must `complete` or `abandon`
    Begin,
    /// Another caller is executing the same payload
    Pending,
    /// The key was first used with a different payload
    Conflict,
}

/// A completed, live record
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord<T> {
    pub key: String,
    pub payload_hash: u64,
    pub result: T,
    pub created_at: Instant,
    pub ttl: Duration,
}

#[derive(Debug)]
enum Slot<T> {
    Pending {
        payload_hash: u64,
        started_at: Instant,
        notify: Arc<Notify>,
    },
    Completed {
        payload_hash: u64,
        result: T,
        created_at: Instant,
        ttl: Duration,
    },
}

impl<T> Slot<T> {
    fn pending(payload_hash: u64) -> Self {
        Slot::Pending {
            payload_hash,
            started_at: Instant::now(),
            notify: Arc::new(Notify::new()),
        }
    }

    fn is_expired(&self, now: Instant, pending_timeout: Duration) -> bool {
        match self {
            Slot::Pending { started_at, .. } => now.duration_since(*started_at) > pending_timeout,
            Slot::Completed { created_at, ttl, .. } => now.duration_since(*created_at) > *ttl,
        }
    }

    fn wake_waiters(&self) {
        if let Slot::Pending { notify, .. } = self {
            notify.notify_waiters();
        }
    }
}

/// Concurrency-safe idempotency store over results of type `T`
#[derive(Debug)]
pub struct IdempotencyStore<T> {
    entries: DashMap<String, Slot<T>>,
    config: IdempotencyConfig,
}

impl<T: Clone + Send + Sync> IdempotencyStore<T> {
    pub fn new(config: IdempotencyConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    /// Claim `key` for `payload_hash`
    pub fn get_or_begin(&self, key: &str, payload_hash: u64) -> IdempotencyOutcome<T> {
        let now = Instant::now();

        match self.entries.entry(key.to_string()) {
            Entry::Vacant(entry) => {
                entry.insert(Slot::pending(payload_hash));
                debug!(key = key, "Idempotency key claimed");
                IdempotencyOutcome::Begin
            }
            Entry::Occupied(mut entry) => {
                if entry.get().is_expired(now, self.config.pending_timeout) {
                    let previous = entry.insert(Slot::pending(payload_hash));
                    previous.wake_waiters();
                    debug!(key = key, "Expired idempotency record replaced");
                    return IdempotencyOutcome::Begin;
                }

                match entry.get() {
                    Slot::Completed {
                        payload_hash: stored,
                        result,
                        ..
                    } if *stored == payload_hash => {
                        debug!(key = key, "Idempotent replay");
                        IdempotencyOutcome::Existing(result.clone())
                    }
                    Slot::Pending {
                        payload_hash: stored,
                        ..
                    } if *stored == payload_hash => IdempotencyOutcome::Pending,
                    _ => {
                        warn!(key = key, "Idempotency key reused with a different payload");
                        IdempotencyOutcome::Conflict
                    }
                }
            }
        }
    }

    /// Finalize a claimed key. Returns false when the claim is no longer
    /// held (reclaimed after `pending_timeout`, or claimed for another payload).
    pub fn complete(&self, key: &str, payload_hash: u64, result: T) -> bool {
        let completed = Slot::Completed {
            payload_hash,
            result,
            created_at: Instant::now(),
            ttl: self.config.ttl,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let held = matches!(
                    entry.get(),
                    Slot::Pending { payload_hash: stored, .. } if *stored == payload_hash
                );
                if held {
                    let previous = entry.insert(completed);
                    previous.wake_waiters();
                    true
                } else {
                    warn!(key = key, "Completion for an idempotency claim no longer held");
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(completed);
                true
            }
        }
    }

    /// Release a claim without a result so a later submission runs again
    pub fn abandon(&self, key: &str, payload_hash: u64) -> bool {
        let removed = self.entries.remove_if(key, |_, slot| {
            matches!(slot, Slot::Pending { payload_hash: stored, .. } if *stored == payload_hash)
        });

        match removed {
            Some((_, slot)) => {
                slot.wake_waiters();
                debug!(key = key, "Idempotency claim abandoned");
                true
            }
            None => false,
        }
    }

    /// Wait for a pending key to settle. Resolves to `Existing`/`Conflict`
    /// once the owner finishes, to `Begin` when the owner abandoned and this
    /// caller took over, or to `Pending` if `max_wait` elapses first.
    pub async fn wait_for(&self, key: &str, payload_hash: u64, max_wait: Duration) -> IdempotencyOutcome<T> {
        let deadline = Instant::now() + max_wait;

        loop {
            let notify = match self.pending_notify(key, payload_hash) {
                Some(notify) => notify,
                None => match self.get_or_begin(key, payload_hash) {
                    IdempotencyOutcome::Pending => continue,
                    outcome => return outcome,
                },
            };

            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // The owner may have finished between the lookup and enable()
            if self.pending_notify(key, payload_hash).is_none() {
                continue;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return IdempotencyOutcome::Pending;
            }
        }
    }

    fn pending_notify(&self, key: &str, payload_hash: u64) -> Option<Arc<Notify>> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        let slot = entry.value();
        if slot.is_expired(now, self.config.pending_timeout) {
            return None;
        }
        match slot {
            Slot::Pending {
                payload_hash: stored,
                notify,
                ..
            } if *stored == payload_hash => Some(Arc::clone(notify)),
            _ => None,
        }
    }

    /// Live completed record for `key`, if any
    pub fn record(&self, key: &str) -> Option<IdempotencyRecord<T>> {
        let entry = self.entries.get(key)?;
        let slot = entry.value();
        if slot.is_expired(Instant::now(), self.config.pending_timeout) {
            return None;
        }
        match slot {
            Slot::Completed {
                payload_hash,
                result,
                created_at,
                ttl,
            } => Some(IdempotencyRecord {
                key: key.to_string(),
                payload_hash: *payload_hash,
                result: result.clone(),
                created_at: *created_at,
                ttl: *ttl,
            }),
            Slot::Pending { .. } => None,
        }
    }

    /// Drop expired records and stale placeholders; returns how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        self.entries.retain(|_, slot| {
            let expired = slot.is_expired(now, self.config.pending_timeout);
            if expired {
                slot.wake_waiters();
                removed += 1;
            }
            !expired
        });
        if removed > 0 {
            debug!(removed = removed, "Purged expired idempotency records");
        }
        removed
    }

    /// Number of entries, including pending and not-yet-purged expired ones
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T: Clone + Send + Sync> Default for IdempotencyStore<T> {
    fn default() -> Self {
        Self::new(IdempotencyConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn store() -> IdempotencyStore<String> {
        IdempotencyStore::new(IdempotencyConfig {
            ttl: Duration::from_secs(60),
            pending_policy: PendingPolicy::Reject,
            pending_timeout: Duration::from_secs(30),
        })
    }

    #[tokio::test]
    async fn test_claim_complete_replay() {
        let store = store();
        assert_eq!(store.get_or_begin("k1", 7), IdempotencyOutcome::Begin);
        assert_eq!(store.get_or_begin("k1", 7), IdempotencyOutcome::Pending);
        assert!(store.complete("k1", 7, "done".to_string()));

        assert_eq!(
            store.get_or_begin("k1", 7),
            IdempotencyOutcome::Existing("done".to_string())
        );
        assert_eq!(
            store.get_or_begin("k1", 7),
            IdempotencyOutcome::Existing("done".to_string())
        );
        assert_eq!(store.record("k1").unwrap().result, "done");
    }

    #[tokio::test]
    async fn test_conflict_is_distinct_from_pending() {
        let store = store();
        assert_eq!(store.get_or_begin("k1", 1), IdempotencyOutcome::Begin);
        assert_eq!(store.get_or_begin("k1", 2), IdempotencyOutcome::Conflict);

        store.complete("k1", 1, "one".to_string());
        assert_eq!(store.get_or_begin("k1", 2), IdempotencyOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_abandon_allows_rerun() {
        let store = store();
        store.get_or_begin("k1", 1);
        assert!(!store.abandon("k1", 2));
        assert!(store.abandon("k1", 1));
        assert_eq!(store.get_or_begin("k1", 1), IdempotencyOutcome::Begin);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_records_are_absent() {
        let store = store();
        store.get_or_begin("done", 1);
        store.complete("done", 1, "x".to_string());
        store.get_or_begin("stuck", 1);

        advance(Duration::from_secs(31)).await;
        assert_eq!(store.get_or_begin("stuck", 2), IdempotencyOutcome::Begin);

        advance(Duration::from_secs(30)).await;
        assert!(store.record("done").is_none());
        assert_eq!(store.purge_expired(), 1);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_observes_completion() {
        let store = Arc::new(store());
        store.get_or_begin("k1", 9);

        let waiter = {
            let store = Arc::clone(&store);
            tokio::spawn(async move { store.wait_for("k1", 9, Duration::from_secs(10)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        store.complete("k1", 9, "result".to_string());

        assert_eq!(
            waiter.await.unwrap(),
            IdempotencyOutcome::Existing("result".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_times_out_and_takes_over_abandoned_keys() {
        let store = store();
        store.get_or_begin("k1", 9);
        assert_eq!(
            store.wait_for("k1", 9, Duration::from_secs(2)).await,
            IdempotencyOutcome::Pending
        );

        store.abandon("k1", 9);
        assert_eq!(
            store.wait_for("k1", 9, Duration::from_secs(2)).await,
            IdempotencyOutcome::Begin
        );
    }
}
