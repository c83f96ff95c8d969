use serde::Serialize;

/// Queue counters. `total`/`completed`/`failed`/`timeout`/`skipped` are
/// monotonically increasing; `processing` tracks the current in-flight
/// count and can go up or down.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
    pub timeout: u64,
    pub skipped: u64,
    pub processing: u64,
    pub scan_total: u64,
    pub scan_completed: u64,
    pub scan_failed: u64,
    pub scan_timeout: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueConfig {
    pub skip_old_requests: bool,
    pub max_age_sec: f64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            skip_old_requests: true,
            max_age_sec: 30.0,
        }
    }
}
