// =============================================================================
// Idempotency & Cooldown Cache
// =============================================================================
//
// Process-local TTL maps, same `parking_lot::RwLock<HashMap<..>>` shape used
// for every other shared-mutable-state table in this codebase. Two tables:
//   - idempotency keys for client-initiated mutations (`X-Idempotency-Key`),
//     default TTL from `RuntimeConfig::idempotency_ttl_sec`.
//   - signal cooldown keys, keyed by (bot_id, ticker, action), preventing a
//     duplicate alert fired within the cooldown window from being
//     broadcast twice.
//
// Expired entries are swept lazily on insert rather than on a background
// timer — this cache never grows unbounded in practice because webhook and
// mutation volume is bursty, not continuous.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

struct Entry<T> {
    value: T,
    expires_at: Instant,
}

pub struct TtlCache<T> {
    entries: RwLock<HashMap<String, Entry<T>>>,
}

impl<T: Clone> TtlCache<T> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the cached value if present and not expired.
    pub fn get(&self, key: &str) -> Option<T> {
        let entries = self.entries.read();
        entries.get(key).and_then(|e| {
            if e.expires_at > Instant::now() {
                Some(e.value.clone())
            } else {
                None
            }
        })
    }

    /// Insert `value` under `key` with the given TTL, sweeping expired
    /// entries from the table first.
    pub fn insert(&self, key: String, value: T, ttl: Duration) {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.retain(|_, e| e.expires_at > now);
        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
    }

    /// Atomically check-and-set: returns `true` if `key` was absent or
    /// expired (and has now been inserted), `false` if it was already a
    /// live entry. Used for both idempotency keys and signal cooldowns,
    /// where the caller needs a single lock acquisition to avoid a
    /// check-then-insert race between two concurrent requests.
    pub fn try_claim(&self, key: String, value: T, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.write();
        entries.retain(|_, e| e.expires_at > now);

        if entries.contains_key(&key) {
            return false;
        }

        entries.insert(
            key,
            Entry {
                value,
                expires_at: now + ttl,
            },
        );
        true
    }
}

impl<T: Clone> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the cooldown key for a (bot, ticker, action) triple.
pub fn cooldown_key(bot_id: uuid::Uuid, ticker: &str, action: &str) -> String {
    format!("{bot_id}:{}:{action}", ticker.to_ascii_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn try_claim_rejects_duplicate_within_ttl() {
        let cache: TtlCache<()> = TtlCache::new();
        assert!(cache.try_claim("k".into(), (), Duration::from_secs(60)));
        assert!(!cache.try_claim("k".into(), (), Duration::from_secs(60)));
    }

    #[test]
    fn try_claim_allows_reuse_after_expiry() {
        let cache: TtlCache<()> = TtlCache::new();
        assert!(cache.try_claim("k".into(), (), Duration::from_millis(10)));
        sleep(Duration::from_millis(30));
        assert!(cache.try_claim("k".into(), (), Duration::from_secs(60)));
    }

    #[test]
    fn get_returns_none_after_expiry() {
        let cache = TtlCache::new();
        cache.insert("k".into(), 42, Duration::from_millis(10));
        assert_eq!(cache.get("k"), Some(42));
        sleep(Duration::from_millis(30));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn cooldown_key_is_case_insensitive_on_ticker() {
        let bot = uuid::Uuid::new_v4();
        assert_eq!(
            cooldown_key(bot, "btcusdt", "buy"),
            cooldown_key(bot, "BTCUSDT", "buy")
        );
    }
}
