use std::time::Instant;

/// A point-in-time snapshot of the exclusion coordinator's flags, used for
/// status introspection and for the deadlock-watchdog check. The live
/// coordinator (events, waiters) is a runtime concern of the `ble-orchestrator`
/// crate; this type is the data shape spec's ExclusionState entity
/// describes.
#[derive(Debug, Clone)]
pub struct ExclusionSnapshot {
    pub scanner_stop_requested: bool,
    pub client_active: bool,
    pub exclusive_since: Option<Instant>,
}

impl ExclusionSnapshot {
    pub fn held_for(&self, now: Instant) -> Option<std::time::Duration> {
        self.exclusive_since
            .map(|since| now.saturating_duration_since(since))
    }
}
