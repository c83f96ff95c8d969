use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ble_orchestrator_domain::{Address, AdvertisementRecord};
use serde::Serialize;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Snapshot of cache occupancy, surfaced through `get_status` (spec §4.1's
/// `stats()`).
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total: usize,
    pub valid: usize,
}

struct Inner {
    records: HashMap<Address, AdvertisementRecord>,
    last_cleanup: Instant,
}

/// TTL-bounded store of the last-seen advertisement per address (C1).
/// `upsert` overwrites unconditionally; `get` only returns records still
/// within `ttl`. A single `Mutex` guards the map — contention is bounded by
/// the time to swap one entry, never by a full scan, except during the
/// periodic lazy cleanup sweep.
pub struct ScanCache {
    ttl: Duration,
    inner: Mutex<Inner>,
}

impl ScanCache {
    pub fn new(ttl: Duration) -> Self {
        ScanCache {
            ttl,
            inner: Mutex::new(Inner {
                records: HashMap::new(),
                last_cleanup: Instant::now(),
            }),
        }
    }

    pub fn upsert(&self, record: AdvertisementRecord) {
        let mut inner = self.inner.lock().unwrap();
        inner.records.insert(record.address.clone(), record);
        if inner.last_cleanup.elapsed() >= CLEANUP_INTERVAL {
            let ttl = self.ttl;
            let now = Instant::now();
            inner.records.retain(|_, r| r.is_valid(now, ttl));
            inner.last_cleanup = now;
        }
    }

    pub fn get(&self, address: &Address) -> Option<AdvertisementRecord> {
        let inner = self.inner.lock().unwrap();
        let record = inner.records.get(address)?;
        if record.is_valid(Instant::now(), self.ttl) {
            Some(record.clone())
        } else {
            None
        }
    }

    pub fn active_addresses(&self) -> Vec<Address> {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        inner
            .records
            .values()
            .filter(|r| r.is_valid(now, self.ttl))
            .map(|r| r.address.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let valid = inner
            .records
            .values()
            .filter(|r| r.is_valid(now, self.ttl))
            .count();
        CacheStats {
            total: inner.records.len(),
            valid,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::collections::HashMap as Map;

    fn record(address: &str, observed_at: Instant) -> AdvertisementRecord {
        AdvertisementRecord {
            address: address.parse().unwrap(),
            local_name: Some("widget".into()),
            rssi: -60,
            manufacturer_data: Map::new(),
            service_data: Map::new(),
            service_uuids: Vec::new(),
            observed_at,
        }
    }

    #[test]
    fn get_returns_fresh_record() {
        let cache = ScanCache::new(Duration::from_secs(300));
        cache.upsert(record("AA:BB:CC:DD:EE:FF", Instant::now()));
        let found = cache.get(&"AA:BB:CC:DD:EE:FF".parse().unwrap());
        assert!(found.is_some());
    }

    #[test]
    fn get_returns_none_past_ttl() {
        let cache = ScanCache::new(Duration::from_millis(1));
        cache.upsert(record("AA:BB:CC:DD:EE:FF", Instant::now()));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&"AA:BB:CC:DD:EE:FF".parse().unwrap()).is_none());
    }

    #[test]
    fn upsert_overwrites_existing_address() {
        let cache = ScanCache::new(Duration::from_secs(300));
        let addr: Address = "AA:BB:CC:DD:EE:FF".parse().unwrap();
        let mut first = record("AA:BB:CC:DD:EE:FF", Instant::now());
        first.rssi = -80;
        cache.upsert(first);
        let mut second = record("AA:BB:CC:DD:EE:FF", Instant::now());
        second.rssi = -40;
        cache.upsert(second);
        assert_eq!(cache.get(&addr).unwrap().rssi, -40);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn active_addresses_excludes_expired() {
        let cache = ScanCache::new(Duration::from_millis(1));
        cache.upsert(record("AA:BB:CC:DD:EE:FF", Instant::now()));
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.active_addresses().is_empty());
    }
}
