use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::token_bucket::{BucketSettings, TokenBucket};

/// Busy entries skipped before giving up on making room at the cap.
const EVICTION_PROBES: usize = 32;

/// Per-client token buckets, created on first use.
///
/// The lock only covers finding or inserting an entry. Callers get an
/// `Arc<TokenBucket>` back and consult it after the registry lock is released,
/// so token accounting for one client never blocks lookups for another.
///
/// Entries are kept in access order as well, so making room at the cap and
/// sweeping idle clients only visit the oldest entries instead of the whole map.
#[derive(Debug)]
pub struct LimiterRegistry {
    settings: BucketSettings,
    max_entries: Option<usize>,
    buckets: Mutex<Buckets>,
    created: AtomicU64,
}

#[derive(Debug)]
struct Entry {
    bucket: Arc<TokenBucket>,
    touched: u64,
}

#[derive(Debug, Default)]
struct Buckets {
    entries: HashMap<String, Entry>,
    /// Access stamp to key, oldest first.
    recency: BTreeMap<u64, String>,
    clock: u64,
}

impl Buckets {
    fn touch(&mut self, key: &str) -> Option<Arc<TokenBucket>> {
        let entry = self.entries.get_mut(key)?;

        if let Some(owned_key) = self.recency.remove(&entry.touched) {
            self.clock += 1;
            entry.touched = self.clock;
            self.recency.insert(self.clock, owned_key);
        }

        Some(Arc::clone(&entry.bucket))
    }

    fn insert(&mut self, key: &str, bucket: Arc<TokenBucket>) {
        self.clock += 1;
        self.recency.insert(self.clock, key.to_string());
        self.entries.insert(
            key.to_string(),
            Entry {
                bucket,
                touched: self.clock,
            },
        );
    }

    fn remove(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            self.recency.remove(&entry.touched);
        }
    }

    /// Removes the least recently used entry that nobody else holds.
    ///
    /// Busy entries met on the way are moved to the back. Returns `false` when
    /// nothing could be evicted within `EVICTION_PROBES` steps.
    fn evict_least_recent(&mut self) -> bool {
        for _ in 0..EVICTION_PROBES {
            let Some((_, key)) = self.recency.pop_first() else {
                return false;
            };
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };

            if in_use(&entry.bucket) {
                self.clock += 1;
                entry.touched = self.clock;
                self.recency.insert(self.clock, key);
            } else {
                self.entries.remove(&key);
                return true;
            }
        }
        false
    }

    /// Every admission touches its entry, so access order follows activity
    /// and the walk can stop at the first entry that is not yet idle.
    fn evict_idle(&mut self, max_idle: Duration, now: Instant) -> usize {
        let mut stale = Vec::new();

        for key in self.recency.values() {
            let Some(entry) = self.entries.get(key) else {
                continue;
            };
            if now.saturating_duration_since(entry.bucket.last_activity()) < max_idle {
                break;
            }
            if !in_use(&entry.bucket) {
                stale.push(key.clone());
            }
        }

        for key in &stale {
            self.remove(key);
        }
        stale.len()
    }
}

impl LimiterRegistry {
    pub fn new(settings: BucketSettings) -> Self {
        Self {
            settings,
            max_entries: None,
            buckets: Mutex::new(Buckets::default()),
            created: AtomicU64::new(0),
        }
    }

    /// Caps the number of tracked clients. `0` leaves the registry unbounded.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = (max_entries > 0).then_some(max_entries);
        self
    }

    /// Returns the bucket for `key`, creating it if this is the first time the key is seen.
    ///
    /// Concurrent first calls for the same key all receive the same instance.
    pub fn get_or_create(&self, key: &str) -> Arc<TokenBucket> {
        let mut buckets = self.lock();

        if let Some(bucket) = buckets.touch(key) {
            return bucket;
        }

        if let Some(max) = self.max_entries {
            // With every entry busy nothing is evicted, and the map grows past the
            // cap rather than hand out a second bucket for a held key.
            if buckets.entries.len() >= max {
                buckets.evict_least_recent();
            }
        }

        let bucket = Arc::new(self.settings.build());
        buckets.insert(key, Arc::clone(&bucket));
        self.created.fetch_add(1, Ordering::Relaxed);

        bucket
    }

    /// Existing bucket for `key`, without creating one or refreshing its position.
    pub fn get(&self, key: &str) -> Option<Arc<TokenBucket>> {
        self.lock()
            .entries
            .get(key)
            .map(|entry| Arc::clone(&entry.bucket))
    }

    /// Drops buckets that have seen no traffic for at least `max_idle`.
    ///
    /// Buckets still referenced by an in-progress admission check are kept.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        self.evict_idle_at(max_idle, Instant::now())
    }

    pub fn evict_idle_at(&self, max_idle: Duration, now: Instant) -> usize {
        self.lock().evict_idle(max_idle, now)
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    /// Total buckets created over the registry's lifetime, including evicted ones.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn settings(&self) -> BucketSettings {
        self.settings
    }

    pub fn max_entries(&self) -> Option<usize> {
        self.max_entries
    }

    fn lock(&self) -> MutexGuard<'_, Buckets> {
        // Entries and recency are updated together before the guard drops; a panic
        // can only happen inside bucket construction, before either is touched.
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn in_use(bucket: &Arc<TokenBucket>) -> bool {
    Arc::strong_count(bucket) > 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn registry(burst: u32) -> LimiterRegistry {
        LimiterRegistry::new(BucketSettings::new(Duration::from_secs(1), burst))
    }

    #[test]
    fn test_same_key_returns_same_bucket() {
        let registry = registry(5);
        let first = registry.get_or_create("10.0.0.1");
        let second = registry.get_or_create("10.0.0.1");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.created(), 1);
    }

    #[test]
    fn test_concurrent_first_access_creates_once() {
        let registry = registry(5);
        let threads = 32;
        let barrier = Barrier::new(threads);
        let (barrier, registry) = (&barrier, &registry);

        let buckets: Vec<Arc<TokenBucket>> = thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|_| {
                    scope.spawn(move || {
                        barrier.wait();
                        registry.get_or_create("k")
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        assert!(buckets.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(registry.created(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_keys_evolve_independently() {
        let registry = registry(2);
        let a = registry.get_or_create("a");
        let b = registry.get_or_create("b");
        assert!(!Arc::ptr_eq(&a, &b));

        let now = Instant::now();
        assert!(a.allow_at(now));
        assert!(a.allow_at(now));
        assert!(!a.allow_at(now));

        assert!(b.allow_at(now));
        assert!(b.allow_at(now));
    }

    #[test]
    fn test_get_does_not_create() {
        let registry = registry(1);
        assert!(registry.get("missing").is_none());
        assert!(registry.is_empty());
        assert_eq!(registry.created(), 0);
    }

    #[test]
    fn test_evict_idle_removes_only_stale_entries() {
        let registry = registry(1);
        let start = Instant::now();

        registry.get_or_create("stale").allow_at(start);
        registry
            .get_or_create("fresh")
            .allow_at(start + Duration::from_secs(50));

        let removed = registry.evict_idle_at(Duration::from_secs(30), start + Duration::from_secs(60));
        assert_eq!(removed, 1);
        assert!(registry.get("stale").is_none());
        assert!(registry.get("fresh").is_some());
    }

    #[test]
    fn test_evict_idle_keeps_buckets_in_use() {
        let registry = registry(1);
        let held = registry.get_or_create("busy");
        held.allow_at(Instant::now());

        let far_future = Instant::now() + Duration::from_secs(3600);
        assert_eq!(registry.evict_idle_at(Duration::from_secs(1), far_future), 0);

        drop(held);
        assert_eq!(registry.evict_idle_at(Duration::from_secs(1), far_future), 1);
    }

    #[test]
    fn test_max_entries_evicts_least_recent() {
        let registry = registry(1).with_max_entries(2);
        let start = Instant::now();

        registry.get_or_create("old").allow_at(start + Duration::from_secs(1));
        registry.get_or_create("new").allow_at(start + Duration::from_secs(2));
        registry.get_or_create("newest");

        assert_eq!(registry.len(), 2);
        assert!(registry.get("old").is_none());
        assert!(registry.get("new").is_some());
        assert_eq!(registry.created(), 3);
    }

    #[test]
    fn test_max_entries_zero_is_unbounded() {
        let registry = registry(1).with_max_entries(0);
        assert_eq!(registry.max_entries(), None);

        for i in 0..100 {
            registry.get_or_create(&format!("client-{}", i));
        }
        assert_eq!(registry.len(), 100);
    }

    #[test]
    fn test_recent_access_protects_from_eviction() {
        let registry = registry(1).with_max_entries(2);

        registry.get_or_create("a");
        registry.get_or_create("b");
        registry.get_or_create("a");
        registry.get_or_create("c");

        assert!(registry.get("a").is_some());
        assert!(registry.get("b").is_none());
        assert!(registry.get("c").is_some());
    }

    #[test]
    fn test_cap_exceeded_when_every_entry_is_held() {
        let registry = registry(1).with_max_entries(3);
        let held: Vec<_> = ["a", "b", "c"]
            .iter()
            .map(|key| registry.get_or_create(key))
            .collect();

        let extra = registry.get_or_create("d");

        assert_eq!(registry.len(), 4);
        for (key, bucket) in ["a", "b", "c"].iter().zip(&held) {
            let current = registry.get(key).unwrap();
            assert!(Arc::ptr_eq(&current, bucket));
        }

        drop(held);
        drop(extra);
        registry.get_or_create("e");
        assert_eq!(registry.len(), 4);
        let remaining = ["a", "b", "c"]
            .iter()
            .filter(|key| registry.get(key).is_some())
            .count();
        assert_eq!(remaining, 2);
        assert!(registry.get("d").is_some());
    }

    #[test]
    fn test_inserts_at_cap_stay_cheap() {
        let cap = 100_000;
        let registry = registry(1).with_max_entries(cap);
        for i in 0..cap {
            registry.get_or_create(&format!("client-{}", i));
        }

        let started = Instant::now();
        for i in 0..2_000 {
            registry.get_or_create(&format!("newcomer-{}", i));
        }
        let elapsed = started.elapsed();

        assert_eq!(registry.len(), cap);
        assert!(registry.get("client-0").is_none());
        assert!(registry.get("client-1999").is_none());
        assert!(registry.get("client-2000").is_some());
        // A full scan per insert takes several milliseconds each at this size.
        assert!(
            elapsed < Duration::from_secs(2),
            "2000 inserts at the cap took {:?}",
            elapsed
        );
    }

    #[test]
    fn test_evict_idle_skips_busy_and_stops_at_fresh() {
        let registry = registry(1);
        let start = Instant::now();

        registry.get_or_create("idle-1").allow_at(start);
        let busy = registry.get_or_create("busy");
        busy.allow_at(start);
        registry.get_or_create("idle-2").allow_at(start);
        registry
            .get_or_create("fresh")
            .allow_at(start + Duration::from_secs(100));

        let removed = registry.evict_idle_at(Duration::from_secs(30), start + Duration::from_secs(110));
        assert_eq!(removed, 2);
        assert!(registry.get("busy").is_some());
        assert!(registry.get("fresh").is_some());
        assert_eq!(registry.len(), 2);
    }
}
