use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ble_orchestrator_driver::{BleDriver, DriverError};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{error, info, warn};

use crate::cache::ScanCache;
use crate::config::Config;
use crate::exclusion::ExclusionCoordinator;
use crate::watchdog::ComponentIssue;

const NO_DEVICE_RECREATE_THRESHOLD: Duration = Duration::from_secs(60);
const NO_CALLBACK_CRITICAL_THRESHOLD: Duration = Duration::from_secs(300);
const RECREATE_MIN_INTERVAL: Duration = Duration::from_secs(180);
const RECREATE_STOP_BOUND: Duration = Duration::from_secs(5);
const MAX_RECREATES_PER_WINDOW: u32 = 3;
const RECREATE_COOLDOWN: Duration = Duration::from_secs(60);

/// Scanner (C2): keeps the scan adapter producing advertisements, writes
/// them into the cache, yields to client operations via the exclusion
/// handshake, and recovers from stalls with a serialized recreate
/// procedure.
pub struct Scanner {
    config: Arc<Config>,
    driver: Arc<dyn BleDriver>,
    cache: Arc<ScanCache>,
    exclusion: Arc<ExclusionCoordinator>,
    issue_tx: mpsc::UnboundedSender<ComponentIssue>,
    recreate_lock: AsyncMutex<()>,
    last_advertisement_at: Mutex<Instant>,
    last_device_seen_at: Mutex<Instant>,
    last_recreate_at: Mutex<Option<Instant>>,
    recreating: AtomicBool,
    recreate_count: AtomicU32,
}

impl Scanner {
    pub fn new(
        config: Arc<Config>,
        driver: Arc<dyn BleDriver>,
        cache: Arc<ScanCache>,
        exclusion: Arc<ExclusionCoordinator>,
        issue_tx: mpsc::UnboundedSender<ComponentIssue>,
    ) -> Self {
        Scanner {
            config,
            driver,
            cache,
            exclusion,
            issue_tx,
            recreate_lock: AsyncMutex::new(()),
            last_advertisement_at: Mutex::new(Instant::now()),
            last_device_seen_at: Mutex::new(Instant::now()),
            last_recreate_at: Mutex::new(None),
            recreating: AtomicBool::new(false),
            recreate_count: AtomicU32::new(0),
        }
    }

    /// Fatal startup step: brings the scan adapter up before any steady-state
    /// task is spawned. On failure the caller (`Service::new`) must not spawn
    /// `run` and must abort startup entirely (spec.md: "Fatal startup
    /// failure: any component's start() failure causes stop() of
    /// already-started components and exit").
    pub async fn start(&self) -> Result<(), DriverError> {
        self.driver.scan_start().await?;
        self.exclusion.mark_scan_ready();
        let now = Instant::now();
        *self.last_advertisement_at.lock().unwrap() = now;
        *self.last_device_seen_at.lock().unwrap() = now;
        Ok(())
    }

    /// Steady-state loop; `start()` must have already succeeded.
    pub async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.scan_interval);
        loop {
            tokio::select! {
                _ = stop.changed() => { if *stop.borrow() { break; } }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        let _ = self.driver.scan_stop().await;
    }

    async fn tick(self: &Arc<Self>) {
        if self.exclusion.check_deadlock(self.config.deadlock_threshold) {
            return;
        }

        if self.exclusion.stop_requested() {
            self.yield_to_client().await;
            return;
        }

        match self.driver.peripherals().await {
            Ok(records) => {
                let now = Instant::now();
                if !records.is_empty() {
                    *self.last_advertisement_at.lock().unwrap() = now;
                }
                for record in records {
                    self.cache.upsert(record);
                }
            }
            Err(e) => {
                warn!(error = %e, "scanner failed to poll peripherals");
            }
        }

        self.evaluate_health().await;
    }

    async fn yield_to_client(self: &Arc<Self>) {
        self.exclusion.reset_scan_ready();
        if let Err(e) = self.driver.scan_stop().await {
            warn!(error = %e, "scanner stop during handshake reported an error");
        }
        self.exclusion.mark_scan_stopped();
        self.exclusion.wait_client_done(Duration::from_secs(60)).await;
        if let Err(e) = self.driver.scan_start().await {
            warn!(error = %e, "scanner restart after handshake failed, recreating");
            self.recreate(true).await;
        }
        self.exclusion.mark_scan_ready();
    }

    /// Spec §4.2's health check: a "no callback" timer (any advertisement at
    /// all) and a separate "no device" timer driven by the cache's
    /// currently-valid address set, since a driver that keeps firing empty
    /// polls looks alive on the first signal but stalled on the second.
    async fn evaluate_health(self: &Arc<Self>) {
        if !self.cache.active_addresses().is_empty() {
            *self.last_device_seen_at.lock().unwrap() = Instant::now();
        }
        let since_advertisement = self.last_advertisement_at.lock().unwrap().elapsed();
        let since_device = self.last_device_seen_at.lock().unwrap().elapsed();

        if since_advertisement >= NO_CALLBACK_CRITICAL_THRESHOLD {
            error!(critical = true, "no advertisement observed for 300s, notifying watchdog");
            let _ = self.issue_tx.send(ComponentIssue {
                component: "scanner".to_string(),
                description: "no advertisement callback for 300s".to_string(),
            });
            self.recreate(true).await;
        } else if since_advertisement >= NO_DEVICE_RECREATE_THRESHOLD
            || since_device >= NO_DEVICE_RECREATE_THRESHOLD
        {
            self.recreate(false).await;
        }
    }

    /// Serialized by `recreate_lock`; gated by a minimum interval unless
    /// `force` (the 300 s no-callback case bypasses the gate).
    async fn recreate(self: &Arc<Self>, force: bool) {
        if self.recreating.load(Ordering::SeqCst) {
            return;
        }
        if !force {
            let last = *self.last_recreate_at.lock().unwrap();
            if let Some(last) = last {
                if last.elapsed() < RECREATE_MIN_INTERVAL {
                    return;
                }
            }
        }

        let _guard = self.recreate_lock.lock().await;
        self.recreating.store(true, Ordering::SeqCst);
        info!("recreating scan adapter after suspected stall");

        let _ = tokio::time::timeout(RECREATE_STOP_BOUND, self.driver.scan_stop()).await;
        tokio::time::sleep(Duration::from_secs(1)).await;

        let count = self.recreate_count.fetch_add(1, Ordering::SeqCst) + 1;
        let _ = self.driver.recreate().await;
        if let Err(e) = self.driver.scan_start().await {
            warn!(error = %e, "scan adapter failed to restart after recreate");
        }
        let now = Instant::now();
        *self.last_recreate_at.lock().unwrap() = Some(now);
        *self.last_advertisement_at.lock().unwrap() = now;
        *self.last_device_seen_at.lock().unwrap() = now;
        self.recreating.store(false, Ordering::SeqCst);

        if count >= MAX_RECREATES_PER_WINDOW {
            warn!("recreate limit reached within window, yielding to watchdog recovery");
            let _ = self.issue_tx.send(ComponentIssue {
                component: "scanner".to_string(),
                description: "recreate limit reached".to_string(),
            });
            tokio::time::sleep(RECREATE_COOLDOWN).await;
            self.recreate_count.store(0, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ble_orchestrator_driver::mock::MockDriver;

    fn test_config() -> Config {
        Config {
            scan_interval: Duration::from_millis(5),
            ..Config::from_env()
        }
    }

    #[tokio::test]
    async fn scan_loop_populates_cache() {
        let driver = MockDriver::new("hci0");
        driver.push_advertisement(ble_orchestrator_domain::AdvertisementRecord {
            address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            local_name: Some("widget".into()),
            rssi: -55,
            manufacturer_data: Default::default(),
            service_data: Default::default(),
            service_uuids: Vec::new(),
            observed_at: Instant::now(),
        });
        let cache = Arc::new(ScanCache::new(Duration::from_secs(300)));
        let (issue_tx, _issue_rx) = mpsc::unbounded_channel();
        let scanner = Arc::new(Scanner::new(
            Arc::new(test_config()),
            Arc::new(driver),
            cache.clone(),
            Arc::new(ExclusionCoordinator::new()),
            issue_tx,
        ));
        scanner.start().await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(scanner.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let _ = stop_tx.send(true);
        let _ = handle.await;

        assert!(cache.get(&"AA:BB:CC:DD:EE:FF".parse().unwrap()).is_some());
    }

    #[tokio::test]
    async fn start_propagates_driver_failure() {
        struct FailingDriver;
        #[async_trait::async_trait]
        impl BleDriver for FailingDriver {
            fn adapter_name(&self) -> &str {
                "hci0"
            }
            async fn scan_start(&self) -> Result<(), DriverError> {
                Err(DriverError::AdapterNotFound)
            }
            async fn scan_stop(&self) -> Result<(), DriverError> {
                Ok(())
            }
            async fn peripherals(&self) -> Result<Vec<ble_orchestrator_domain::AdvertisementRecord>, DriverError> {
                Ok(Vec::new())
            }
            async fn recreate(&self) -> Result<(), DriverError> {
                Ok(())
            }
            async fn connect(
                &self,
                _address: &ble_orchestrator_domain::Address,
                _timeout: Duration,
            ) -> Result<Box<dyn ble_orchestrator_driver::PeripheralConnection>, DriverError> {
                Err(DriverError::AdapterNotFound)
            }
        }

        let cache = Arc::new(ScanCache::new(Duration::from_secs(300)));
        let (issue_tx, _issue_rx) = mpsc::unbounded_channel();
        let scanner = Scanner::new(
            Arc::new(test_config()),
            Arc::new(FailingDriver),
            cache,
            Arc::new(ExclusionCoordinator::new()),
            issue_tx,
        );
        assert!(matches!(scanner.start().await, Err(DriverError::AdapterNotFound)));
    }

    #[tokio::test]
    async fn yields_scan_adapter_when_client_requests_stop() {
        let driver = Arc::new(MockDriver::new("hci0"));
        let cache = Arc::new(ScanCache::new(Duration::from_secs(300)));
        let exclusion = Arc::new(ExclusionCoordinator::new());
        let (issue_tx, _issue_rx) = mpsc::unbounded_channel();
        let scanner = Arc::new(Scanner::new(
            Arc::new(test_config()),
            driver.clone(),
            cache,
            exclusion.clone(),
            issue_tx,
        ));
        scanner.start().await.unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(scanner.clone().run(stop_rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        exclusion.request_stop_for_client();
        assert!(exclusion.wait_scan_stopped(Duration::from_secs(1)).await);
        exclusion.notify_client_done();

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = stop_tx.send(true);
        let _ = handle.await;

        let calls = driver.calls();
        let stop_index = calls.iter().position(|c| c == "scan_stop").unwrap();
        let first_start_after_stop = calls[stop_index..].iter().position(|c| c == "scan_start");
        assert!(first_start_after_stop.is_some());
    }
}
