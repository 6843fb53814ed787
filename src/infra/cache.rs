use {
    crate::domain::clock::Clock,
    chrono::{DateTime, Utc},
    std::{
        collections::HashMap,
        hash::Hash,
        sync::{Arc, Mutex, PoisonError},
        time::Duration,
    },
};

/// Small keyed cache whose entries expire after a fixed TTL, measured on an
/// injected clock. A zero TTL disables caching.
pub struct TtlCache<K, V> {
    entries: Mutex<HashMap<K, (V, DateTime<Utc>)>>,
    ttl: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl: chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX),
            clock,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.ttl > chrono::Duration::zero()
    }

    pub fn get(&self, key: &K) -> Option<V> {
        if !self.is_enabled() {
            return None;
        }
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        match entries.get(key) {
            Some((value, expires_at)) if *expires_at > now => Some(value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn insert(&self, key: K, value: V) {
        if !self.is_enabled() {
            return;
        }
        let expires_at = self
            .clock
            .now()
            .checked_add_signed(self.ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        // Keys that are never read again would otherwise stay forever.
        entries.retain(|_, (_, at)| *at > now);
        entries.insert(key, (value, expires_at));
    }

    pub fn invalidate(&self, key: &K) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    /// Drop every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let before = entries.len();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FixedClock(Mutex<DateTime<Utc>>);

    impl FixedClock {
        fn advance(&self, secs: i64) {
            let mut now = self.0.lock().unwrap();
            *now += chrono::Duration::seconds(secs);
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            *self.0.lock().unwrap()
        }
    }

    fn cache(ttl_secs: u64) -> (Arc<FixedClock>, TtlCache<String, u32>) {
        let clock = Arc::new(FixedClock(Mutex::new(Utc::now())));
        let cache = TtlCache::new(Duration::from_secs(ttl_secs), clock.clone());
        (clock, cache)
    }

    #[test]
    fn entries_expire_after_ttl() {
        let (clock, cache) = cache(3);
        cache.insert("a".into(), 1);
        assert_eq!(cache.get(&"a".into()), Some(1));

        clock.advance(2);
        assert_eq!(cache.get(&"a".into()), Some(1));

        clock.advance(1);
        assert_eq!(cache.get(&"a".into()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn purge_drops_only_expired() {
        let (clock, cache) = cache(5);
        cache.insert("old".into(), 1);
        clock.advance(4);
        cache.insert("new".into(), 2);
        clock.advance(2);

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.get(&"new".into()), Some(2));
    }

    #[test]
    fn insert_sweeps_out_entries_nobody_reads() {
        let (clock, cache) = cache(3);
        for key in ["a", "b", "c"] {
            cache.insert(key.into(), 1);
        }
        clock.advance(4);
        cache.insert("d".into(), 2);

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"d".into()), Some(2));
    }

    #[test]
    fn zero_ttl_disables_cache() {
        let (_clock, cache) = cache(0);
        cache.insert("a".into(), 1);
        assert_eq!(cache.get(&"a".into()), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn invalidate_removes_entry() {
        let (_clock, cache) = cache(60);
        cache.insert("a".into(), 1);
        cache.invalidate(&"a".into());
        assert_eq!(cache.get(&"a".into()), None);
    }
}
