//! Expiry-aware token cache with single-flight fetches.
//!
//! Provides:
//! - Expired (or nearly expired) entries treated as absent
//! - At most one in-flight fetch per key; concurrent callers share its result
//! - A bound on distinct keys, evicting expired then soonest-expiring entries

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{ExchangeError, Stage};
use crate::token::Expiring;

type Outcome<V> = Option<Result<V, ExchangeError>>;

enum Slot<V> {
    Ready(V),
    Pending {
        id: u64,
        done: watch::Receiver<Outcome<V>>,
    },
}

/// Token cache keyed by `K`.
pub struct TokenCache<K, V> {
    /// Used in log lines.
    name: &'static str,
    /// Stage reported when a fetch through this cache is cancelled.
    stage: Stage,
    slots: Mutex<HashMap<K, Slot<V>>>,
    /// Entries this close to expiry are refetched.
    refresh_margin: chrono::Duration,
    max_entries: usize,
    next_id: AtomicU64,
}

impl<K, V> TokenCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Expiring + Clone,
{
    pub fn new(
        name: &'static str,
        stage: Stage,
        refresh_margin: std::time::Duration,
        max_entries: usize,
    ) -> Self {
        Self {
            name,
            stage,
            slots: Mutex::new(HashMap::new()),
            refresh_margin: chrono::Duration::from_std(refresh_margin)
                .unwrap_or_else(|_| chrono::Duration::zero()),
            max_entries: max_entries.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Return the cached value for `key` if it is still live.
    #[cfg(test)]
    pub fn get(&self, key: &K) -> Option<V> {
        let now = Utc::now();
        match self.slots().get(key) {
            Some(Slot::Ready(value)) if self.is_live(value, now) => Some(value.clone()),
            _ => None,
        }
    }

    /// Return the live cached value for `key`, or run `fetch` to produce one.
    ///
    /// If another caller is already fetching `key`, wait for and share its
    /// result instead. Only successful results are stored. Cancellation of
    /// `cancel` aborts the fetch without touching the cache.
    pub async fn get_or_fetch<F, Fut>(
        &self,
        key: &K,
        cancel: &CancellationToken,
        fetch: F,
    ) -> Result<V, ExchangeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, ExchangeError>>,
    {
        let (tx, id) = loop {
            let waiter = {
                let mut slots = self.slots();
                let now = Utc::now();
                match slots.get(key) {
                    Some(Slot::Ready(value)) if self.is_live(value, now) => {
                        debug!(cache = self.name, key = ?key, "Cache hit");
                        return Ok(value.clone());
                    }
                    Some(Slot::Pending { done, .. }) => done.clone(),
                    _ => {
                        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                        let (tx, rx) = watch::channel(None);
                        if !slots.contains_key(key) {
                            self.make_room(&mut slots, now);
                        }
                        slots.insert(key.clone(), Slot::Pending { id, done: rx });
                        break (tx, id);
                    }
                }
            };

            debug!(cache = self.name, key = ?key, "Waiting for in-flight fetch");
            if let Some(result) = self.wait(waiter, cancel).await {
                return result;
            }
            // The fetching caller was dropped before finishing; retry the
            // lookup, which makes this caller (or a peer) the new fetcher.
        };

        debug!(cache = self.name, key = ?key, "Cache miss, fetching");
        let mut flight = Flight {
            cache: self,
            key,
            id,
            tx: Some(tx),
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ExchangeError::Cancelled(self.stage)),
            result = fetch() => result,
        };

        flight.complete(result.clone());
        result
    }

    /// Forget a cached value. An in-flight fetch for `key` is left alone.
    pub fn invalidate(&self, key: &K) -> bool {
        let mut slots = self.slots();
        if matches!(slots.get(key), Some(Slot::Ready(_))) {
            slots.remove(key);
            return true;
        }
        false
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn evict_expired(&self) -> usize {
        let now = Utc::now();
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Ready(value) => value.expires_at() > now,
            Slot::Pending { .. } => true,
        });
        before - slots.len()
    }

    /// Number of keys held, including in-flight ones.
    pub fn len(&self) -> usize {
        self.slots().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn is_live(&self, value: &V, now: DateTime<Utc>) -> bool {
        value.expires_at() - self.refresh_margin > now
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn wait(
        &self,
        mut done: watch::Receiver<Outcome<V>>,
        cancel: &CancellationToken,
    ) -> Outcome<V> {
        loop {
            let current = done.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Some(Err(ExchangeError::Cancelled(self.stage))),
                changed = done.changed() => {
                    if changed.is_err() {
                        return done.borrow().clone();
                    }
                }
            }
        }
    }

    /// Make space for one more key.
    fn make_room(&self, slots: &mut HashMap<K, Slot<V>>, now: DateTime<Utc>) {
        if slots.len() < self.max_entries {
            return;
        }

        slots.retain(|_, slot| match slot {
            Slot::Ready(value) => value.expires_at() > now,
            Slot::Pending { .. } => true,
        });
        if slots.len() < self.max_entries {
            return;
        }

        // Still full: drop whichever cached entry expires soonest
        let soonest = slots
            .iter()
            .filter_map(|(key, slot)| match slot {
                Slot::Ready(value) => Some((key, value.expires_at())),
                Slot::Pending { .. } => None,
            })
            .min_by_key(|(_, expires_at)| *expires_at)
            .map(|(key, _)| key.clone());

        if let Some(key) = soonest {
            debug!(cache = self.name, key = ?key, "Cache full, evicting entry");
            slots.remove(&key);
        }
    }
}

/// An in-flight fetch owned by the caller that started it.
///
/// Dropping it before `complete` (the caller's future was dropped) clears the
/// pending slot without publishing, so waiters retry the fetch themselves.
struct Flight<'a, K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Expiring + Clone,
{
    cache: &'a TokenCache<K, V>,
    key: &'a K,
    id: u64,
    tx: Option<watch::Sender<Outcome<V>>>,
}

impl<K, V> Flight<'_, K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Expiring + Clone,
{
    fn complete(&mut self, result: Result<V, ExchangeError>) {
        let Some(tx) = self.tx.take() else {
            return;
        };

        {
            let mut slots = self.cache.slots();
            let ours = matches!(
                slots.get(self.key),
                Some(Slot::Pending { id, .. }) if *id == self.id
            );
            if ours {
                match &result {
                    Ok(value) => {
                        slots.insert(self.key.clone(), Slot::Ready(value.clone()));
                    }
                    Err(_) => {
                        slots.remove(self.key);
                    }
                }
            }
        }

        // Waiters are notified only after the cache reflects the outcome.
        let _ = tx.send(Some(result));
    }
}

impl<K, V> Drop for Flight<'_, K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Expiring + Clone,
{
    fn drop(&mut self) {
        if self.tx.take().is_none() {
            return;
        }
        let mut slots = self.cache.slots();
        if matches!(
            slots.get(self.key),
            Some(Slot::Pending { id, .. }) if *id == self.id
        ) {
            slots.remove(self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    struct Entry {
        value: String,
        expires_at: DateTime<Utc>,
    }

    impl Expiring for Entry {
        fn expires_at(&self) -> DateTime<Utc> {
            self.expires_at
        }
    }

    fn entry(value: &str, ttl_secs: i64) -> Entry {
        Entry {
            value: value.to_string(),
            expires_at: Utc::now() + chrono::Duration::seconds(ttl_secs),
        }
    }

    fn test_cache(max_entries: usize) -> TokenCache<String, Entry> {
        TokenCache::new("test", Stage::GrantExchange, Duration::ZERO, max_entries)
    }

    #[tokio::test]
    async fn test_hit_skips_fetch() {
        let cache = test_cache(16);
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);
        let key = "k".to_string();

        for _ in 0..3 {
            let value = cache
                .get_or_fetch(&key, &cancel, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(entry("v1", 3600))
                })
                .await
                .unwrap();
            assert_eq!(value.value, "v1");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.get(&key).unwrap().value, "v1");
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let cache = test_cache(16);
        let cancel = CancellationToken::new();
        let key = "k".to_string();

        cache
            .get_or_fetch(&key, &cancel, || async { Ok(entry("old", 0)) })
            .await
            .unwrap();
        assert!(cache.get(&key).is_none(), "Expired entry must read as absent");

        let fresh = cache
            .get_or_fetch(&key, &cancel, || async { Ok(entry("new", 3600)) })
            .await
            .unwrap();
        assert_eq!(fresh.value, "new");
    }

    #[tokio::test]
    async fn test_refresh_margin() {
        let cache: TokenCache<String, Entry> =
            TokenCache::new("test", Stage::AssertionFetch, Duration::from_secs(300), 16);
        let cancel = CancellationToken::new();
        let key = "k".to_string();

        cache
            .get_or_fetch(&key, &cancel, || async { Ok(entry("near", 120)) })
            .await
            .unwrap();
        assert!(cache.get(&key).is_none(), "Entry inside the margin is stale");
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let cache = Arc::new(test_cache(16));
        let calls = Arc::new(AtomicUsize::new(0));
        let key = "shared".to_string();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = Arc::clone(&cache);
            let calls = Arc::clone(&calls);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                cache
                    .get_or_fetch(&key, &cancel, || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        Ok(entry("once", 3600))
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap().value, "once");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_shared_and_not_cached() {
        let cache = test_cache(16);
        let cancel = CancellationToken::new();
        let key = "k".to_string();
        let calls = AtomicUsize::new(0);

        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err::<Entry, _>(ExchangeError::Transport("connection reset".into()))
        };
        let (a, b) = tokio::join!(
            cache.get_or_fetch(&key, &cancel, fetch),
            cache.get_or_fetch(&key, &cancel, || async { Ok(entry("unused", 3600)) }),
        );

        assert!(matches!(a, Err(ExchangeError::Transport(_))));
        assert!(matches!(b, Err(ExchangeError::Transport(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.is_empty(), "Failures must not be cached");

        let retried = cache
            .get_or_fetch(&key, &cancel, || async { Ok(entry("ok", 3600)) })
            .await
            .unwrap();
        assert_eq!(retried.value, "ok");
    }

    #[tokio::test]
    async fn test_cancel_releases_waiters() {
        let cache = test_cache(16);
        let leader_cancel = CancellationToken::new();
        let waiter_cancel = CancellationToken::new();
        let key = "k".to_string();

        let trigger = leader_cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let (leader, waiter) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(
                cache.get_or_fetch(&key, &leader_cancel, || async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(entry("never", 3600))
                }),
                async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    cache
                        .get_or_fetch(&key, &waiter_cancel, || async { Ok(entry("unused", 3600)) })
                        .await
                },
            )
        })
        .await
        .expect("cancellation must not leave callers blocked");

        assert_eq!(leader, Err(ExchangeError::Cancelled(Stage::GrantExchange)));
        assert_eq!(waiter, Err(ExchangeError::Cancelled(Stage::GrantExchange)));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_dropped_leader_clears_pending_slot() {
        let cache = test_cache(16);
        let cancel = CancellationToken::new();
        let key = "k".to_string();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            cache.get_or_fetch(&key, &cancel, || async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(entry("never", 3600))
            }),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(cache.is_empty());

        let value = cache
            .get_or_fetch(&key, &cancel, || async { Ok(entry("next", 3600)) })
            .await
            .unwrap();
        assert_eq!(value.value, "next");
    }

    #[tokio::test]
    async fn test_waiter_takes_over_from_dropped_leader() {
        let cache = test_cache(16);
        let cancel = CancellationToken::new();
        let key = "k".to_string();
        let fetches = Arc::new(AtomicUsize::new(0));

        let leader_fetches = fetches.clone();
        let leader = cache.get_or_fetch(&key, &cancel, || async move {
            leader_fetches.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(entry("never", 3600))
        });

        let waiter_fetches = fetches.clone();
        let waiter = async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cache
                .get_or_fetch(&key, &cancel, || async move {
                    waiter_fetches.fetch_add(1, Ordering::SeqCst);
                    Ok(entry("waiter", 3600))
                })
                .await
        };

        // The leader is abandoned after 50ms, while the waiter is parked on it.
        let (abandoned, value) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(tokio::time::timeout(Duration::from_millis(50), leader), waiter)
        })
        .await
        .expect("waiter must not stay blocked on a dropped leader");

        assert!(abandoned.is_err());
        assert_eq!(value.unwrap().value, "waiter");
        assert_eq!(fetches.load(Ordering::SeqCst), 2);
        assert_eq!(cache.get(&key).unwrap().value, "waiter");
    }

    #[tokio::test]
    async fn test_bounded_size_evicts_soonest_expiry() {
        let cache = test_cache(2);
        let cancel = CancellationToken::new();

        for (key, ttl) in [("a", 60), ("b", 3600), ("c", 7200)] {
            cache
                .get_or_fetch(&key.to_string(), &cancel, || async move { Ok(entry(key, ttl)) })
                .await
                .unwrap();
        }

        assert_eq!(cache.len(), 2);
        assert!(cache.get(&"a".to_string()).is_none());
        assert!(cache.get(&"b".to_string()).is_some());
        assert!(cache.get(&"c".to_string()).is_some());
    }

    #[tokio::test]
    async fn test_invalidate() {
        let cache = test_cache(16);
        let cancel = CancellationToken::new();
        let key = "k".to_string();

        assert!(!cache.invalidate(&key));
        cache
            .get_or_fetch(&key, &cancel, || async { Ok(entry("v", 3600)) })
            .await
            .unwrap();
        assert!(cache.invalidate(&key));
        assert!(cache.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_evict_expired() {
        let cache = test_cache(16);
        let cancel = CancellationToken::new();

        cache
            .get_or_fetch(&"dead".to_string(), &cancel, || async { Ok(entry("x", -10)) })
            .await
            .unwrap();
        cache
            .get_or_fetch(&"live".to_string(), &cancel, || async { Ok(entry("y", 3600)) })
            .await
            .unwrap();

        assert_eq!(cache.evict_expired(), 1);
        assert_eq!(cache.len(), 1);
    }
}
