//! Outstanding-response ledger.
//!
//! Maps a request id to the number of responses still expected for it. A
//! sync target with a non-empty ledger is mid-cycle, so the scheduler skips
//! the tick. Entries refresh their expiry on every change; entries nobody
//! touched for `ttl` are swept so a lost response cannot wedge the target.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

pub const DEFAULT_LEDGER_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy)]
struct Entry {
    count: i64,
    expires_at: Instant,
}

#[derive(Debug)]
pub struct FlowLedger {
    entries: Mutex<HashMap<i64, Entry>>,
    ttl: Duration,
}

impl Default for FlowLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_TTL)
    }
}

impl FlowLedger {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<i64, Entry>> {
        // A panic elsewhere cannot leave the map half-updated.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Expect `n` more responses for `id`.
    pub fn increase(&self, id: i64, n: i64) {
        let expires_at = Instant::now() + self.ttl;
        let mut entries = self.lock();
        let entry = entries.entry(id).or_insert(Entry {
            count: 0,
            expires_at,
        });
        entry.count += n;
        entry.expires_at = expires_at;
    }

    /// `n` responses for `id` arrived. The entry goes away at zero.
    pub fn decrease(&self, id: i64, n: i64) {
        let expires_at = Instant::now() + self.ttl;
        let mut entries = self.lock();
        if let Some(entry) = entries.get_mut(&id) {
            entry.count -= n;
            entry.expires_at = expires_at;
            if entry.count <= 0 {
                entries.remove(&id);
            }
        }
    }

    /// Push back the expiry of `id` without changing its count. Unknown ids
    /// are ignored.
    pub fn touch(&self, id: i64) {
        let expires_at = Instant::now() + self.ttl;
        if let Some(entry) = self.lock().get_mut(&id) {
            entry.expires_at = expires_at;
        }
    }

    pub fn remove(&self, id: i64) {
        self.lock().remove(&id);
    }

    pub fn count(&self, id: i64) -> Option<i64> {
        self.lock().get(&id).map(|e| e.count)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// True when nothing is outstanding. Expired entries are dropped first.
    pub fn is_empty(&self) -> bool {
        self.is_empty_at(Instant::now())
    }

    fn is_empty_at(&self, now: Instant) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        let swept = before - entries.len();
        if swept > 0 {
            debug!(swept, "Expired ledger entries");
        }
        entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_increase_decrease() {
        let ledger = FlowLedger::default();
        assert!(ledger.is_empty());

        ledger.increase(7, 1);
        ledger.increase(7, 3);
        assert_eq!(ledger.count(7), Some(4));
        assert!(!ledger.is_empty());

        ledger.decrease(7, 1);
        assert_eq!(ledger.count(7), Some(3));
        ledger.decrease(7, 5);
        assert_eq!(ledger.count(7), None);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_decrease_unknown_is_noop() {
        let ledger = FlowLedger::default();
        ledger.decrease(1, 1);
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn test_listing_pattern() {
        // listing id 1 announces 3 details, each spawning a transfer
        let ledger = FlowLedger::default();
        ledger.increase(1, 1);
        ledger.increase(1, 3);
        ledger.decrease(1, 1);
        for transfer in 10..13 {
            ledger.increase(transfer, 1);
            ledger.decrease(1, 1);
        }
        assert_eq!(ledger.count(1), None);
        assert_eq!(ledger.len(), 3);
        for transfer in 10..13 {
            assert!(!ledger.is_empty());
            ledger.remove(transfer);
        }
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_expired_entries_are_swept() {
        let ledger = FlowLedger::new(Duration::from_secs(5));
        ledger.increase(1, 1);
        assert!(!ledger.is_empty_at(Instant::now()));
        assert!(ledger.is_empty_at(Instant::now() + Duration::from_secs(6)));
        assert_eq!(ledger.len(), 0);
    }

    #[test]
    fn test_touch_refreshes_expiry() {
        let ledger = FlowLedger::new(Duration::from_millis(50));
        ledger.increase(1, 2);
        std::thread::sleep(Duration::from_millis(30));
        ledger.decrease(1, 1);
        std::thread::sleep(Duration::from_millis(30));
        assert!(!ledger.is_empty());
    }

    #[test]
    fn test_touch_keeps_quiet_entry_alive() {
        let ledger = FlowLedger::new(Duration::from_millis(200));
        ledger.increase(9, 1);
        std::thread::sleep(Duration::from_millis(120));
        ledger.touch(9);
        std::thread::sleep(Duration::from_millis(120));
        assert!(!ledger.is_empty());
        assert_eq!(ledger.count(9), Some(1));
        assert!(ledger.is_empty_at(Instant::now() + Duration::from_millis(250)));

        ledger.touch(42);
        assert_eq!(ledger.count(42), None);
    }

    #[test]
    fn test_concurrent_updates() {
        let ledger = Arc::new(FlowLedger::default());
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for i in 0..1000 {
                        ledger.increase(t, 1);
                        if i % 2 == 0 {
                            ledger.decrease(t, 1);
                        }
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        for t in 0..8 {
            assert_eq!(ledger.count(t), Some(500));
        }
    }
}
