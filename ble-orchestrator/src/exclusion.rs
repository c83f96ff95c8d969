use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ble_orchestrator_domain::ExclusionSnapshot;
use tokio::sync::watch;
use tracing::error;

/// Process-wide arbitration between the scanner (C2) and connection-oriented
/// operations (C4/C5), implementing the handshake in spec §4.6. Flags are
/// atomics; the three named events are level-triggered `watch` channels so a
/// waiter that arrives after the edge still observes the current value
/// instead of missing a `Notify` permit.
pub struct ExclusionCoordinator {
    scanner_stop_requested: AtomicBool,
    client_active: AtomicBool,
    exclusive_since: Mutex<Option<Instant>>,
    scan_ready_tx: watch::Sender<bool>,
    scan_stopped_tx: watch::Sender<bool>,
    client_done_tx: watch::Sender<bool>,
}

impl ExclusionCoordinator {
    pub fn new() -> Self {
        let (scan_ready_tx, _) = watch::channel(false);
        let (scan_stopped_tx, _) = watch::channel(false);
        let (client_done_tx, _) = watch::channel(false);
        ExclusionCoordinator {
            scanner_stop_requested: AtomicBool::new(false),
            client_active: AtomicBool::new(false),
            exclusive_since: Mutex::new(None),
            scan_ready_tx,
            scan_stopped_tx,
            client_done_tx,
        }
    }

    /// Client-side step 1: request the scanner yield the adapter.
    pub fn request_stop_for_client(&self) {
        self.scanner_stop_requested.store(true, Ordering::SeqCst);
        self.client_active.store(true, Ordering::SeqCst);
        *self.exclusive_since.lock().unwrap() = Some(Instant::now());
        let _ = self.scan_stopped_tx.send(false);
        let _ = self.client_done_tx.send(false);
    }

    pub fn stop_requested(&self) -> bool {
        self.scanner_stop_requested.load(Ordering::SeqCst)
    }

    /// Client-side step 2.
    pub async fn wait_scan_stopped(&self, timeout: Duration) -> bool {
        wait_for_true(self.scan_stopped_tx.subscribe(), timeout).await
    }

    /// Scanner-side: mark the scan loop halted.
    pub fn mark_scan_stopped(&self) {
        let _ = self.scan_stopped_tx.send(true);
    }

    /// Scanner-side: wait for the client to finish, per spec's 60 s bound.
    pub async fn wait_client_done(&self, timeout: Duration) -> bool {
        wait_for_true(self.client_done_tx.subscribe(), timeout).await
    }

    pub fn mark_scan_ready(&self) {
        let _ = self.scan_ready_tx.send(true);
    }

    pub fn reset_scan_ready(&self) {
        let _ = self.scan_ready_tx.send(false);
    }

    /// Exposed for C4/C5 (spec §4.6): lets a client-side operation confirm
    /// the scanner actually resumed before reporting its own result, rather
    /// than racing the next request against a still-restarting adapter.
    pub async fn wait_scan_ready(&self, timeout: Duration) -> bool {
        wait_for_true(self.scan_ready_tx.subscribe(), timeout).await
    }

    /// Client-side step 4 (always run in a `finally`-equivalent).
    pub fn notify_client_done(&self) {
        self.client_active.store(false, Ordering::SeqCst);
        self.scanner_stop_requested.store(false, Ordering::SeqCst);
        *self.exclusive_since.lock().unwrap() = None;
        let _ = self.client_done_tx.send(true);
    }

    /// Scanner's deadlock watchdog: forcibly clear exclusion if held past
    /// `deadlock_threshold`, logging at critical severity (spec §4.2/§4.6).
    pub fn check_deadlock(&self, deadlock_threshold: Duration) -> bool {
        let held = self.exclusive_since.lock().unwrap().map(|since| since.elapsed());
        match held {
            Some(duration) if duration > deadlock_threshold => {
                error!(
                    critical = true,
                    held_secs = duration.as_secs_f64(),
                    "exclusion held past deadlock threshold, forcing reset"
                );
                self.scanner_stop_requested.store(false, Ordering::SeqCst);
                self.client_active.store(false, Ordering::SeqCst);
                *self.exclusive_since.lock().unwrap() = None;
                let _ = self.client_done_tx.send(true);
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> ExclusionSnapshot {
        ExclusionSnapshot {
            scanner_stop_requested: self.scanner_stop_requested.load(Ordering::SeqCst),
            client_active: self.client_active.load(Ordering::SeqCst),
            exclusive_since: *self.exclusive_since.lock().unwrap(),
        }
    }
}

impl Default for ExclusionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_true(mut rx: watch::Receiver<bool>, timeout: Duration) -> bool {
    if *rx.borrow() {
        return true;
    }
    let wait = async {
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return true;
            }
        }
        false
    };
    tokio::time::timeout(timeout, wait).await.unwrap_or(false)
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn handshake_round_trip() {
        let coordinator = ExclusionCoordinator::new();
        coordinator.request_stop_for_client();
        assert!(coordinator.stop_requested());

        coordinator.mark_scan_stopped();
        assert!(coordinator.wait_scan_stopped(Duration::from_millis(100)).await);

        coordinator.notify_client_done();
        assert!(coordinator.wait_client_done(Duration::from_millis(100)).await);
        assert!(!coordinator.stop_requested());
        assert!(coordinator.snapshot().exclusive_since.is_none());
    }

    #[tokio::test]
    async fn wait_scan_stopped_times_out() {
        let coordinator = ExclusionCoordinator::new();
        coordinator.request_stop_for_client();
        let stopped = coordinator.wait_scan_stopped(Duration::from_millis(20)).await;
        assert!(!stopped);
    }

    #[test]
    fn deadlock_forces_reset() {
        let coordinator = ExclusionCoordinator::new();
        coordinator.request_stop_for_client();
        std::thread::sleep(Duration::from_millis(5));
        assert!(coordinator.check_deadlock(Duration::from_millis(1)));
        assert!(!coordinator.snapshot().client_active);
    }

    #[test]
    fn deadlock_not_triggered_within_threshold() {
        let coordinator = ExclusionCoordinator::new();
        coordinator.request_stop_for_client();
        assert!(!coordinator.check_deadlock(Duration::from_secs(90)));
    }
}
