use std::collections::HashMap;
use std::time::{Duration, Instant};

use uuid::Uuid;

use crate::address::Address;

/// The most recently observed advertisement for a single address.
///
/// `observed_at` is a monotonic timestamp (`Instant`), never wall-clock —
/// TTL comparisons must not be perturbed by a system clock step.
#[derive(Debug, Clone)]
pub struct AdvertisementRecord {
    pub address: Address,
    pub local_name: Option<String>,
    pub rssi: i16,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub service_uuids: Vec<Uuid>,
    pub observed_at: Instant,
}

impl AdvertisementRecord {
    pub fn is_valid(&self, now: Instant, ttl: Duration) -> bool {
        now.saturating_duration_since(self.observed_at) <= ttl
    }
}
