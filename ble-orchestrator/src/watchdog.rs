use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use ble_orchestrator_domain::{AdapterState, AdapterStatus};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::Config;

/// Subprocess-driven recovery isolated behind a narrow interface (spec §9)
/// so tests substitute a fake instead of shelling out.
#[async_trait]
pub trait AdapterControl: Send + Sync {
    async fn reset(&self, adapter: &str) -> bool;
    async fn restart_service(&self) -> bool;
    async fn adapter_status(&self, adapter: &str) -> AdapterStatus;
    async fn service_active(&self) -> bool;
}

/// Real recovery backend: shells out to `hciconfig`/`systemctl`, matching
/// the commands spec §6 names exactly.
pub struct SystemAdapterControl;

#[async_trait]
impl AdapterControl for SystemAdapterControl {
    async fn reset(&self, adapter: &str) -> bool {
        run_command("hciconfig", &[adapter, "reset"]).await
    }

    async fn restart_service(&self) -> bool {
        run_command("systemctl", &["restart", "bluetooth"]).await
    }

    async fn adapter_status(&self, adapter: &str) -> AdapterStatus {
        match tokio::process::Command::new("hciconfig")
            .arg(adapter)
            .output()
            .await
        {
            Ok(output) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                if text.contains("UP RUNNING") {
                    AdapterStatus::Up
                } else {
                    AdapterStatus::Down
                }
            }
            Ok(_) => AdapterStatus::Down,
            Err(_) => AdapterStatus::Missing,
        }
    }

    async fn service_active(&self) -> bool {
        run_command("systemctl", &["is-active", "bluetooth"]).await
    }
}

async fn run_command(program: &str, args: &[&str]) -> bool {
    match tokio::process::Command::new(program).args(args).output().await {
        Ok(output) => output.status.success(),
        Err(e) => {
            warn!(program, ?args, error = %e, "failed to spawn adapter control subprocess");
            false
        }
    }
}

/// A component-reported issue (spec §4.7): `"bleakclient_failure"` triggers
/// a lightweight reset only; any other component name triggers full
/// recovery, matching the source watchdog's handling.
#[derive(Debug, Clone)]
pub struct ComponentIssue {
    pub component: String,
    pub description: String,
}

/// Watchdog (C7): periodic health check plus reactive recovery driven by
/// C4's `consecutive_failures` counter and out-of-band component issues from
/// C2/C5.
pub struct Watchdog {
    control: Box<dyn AdapterControl>,
    adapters: Vec<String>,
    failure_threshold: u32,
    interval: Duration,
    consecutive_failures: std::sync::Arc<AtomicU32>,
    recovering: AtomicBool,
    states: Mutex<HashMap<String, AdapterState>>,
    recovery_completed_tx: watch::Sender<u64>,
    service_ready_tx: watch::Sender<bool>,
    issue_rx: Mutex<Option<mpsc::UnboundedReceiver<ComponentIssue>>>,
}

impl Watchdog {
    pub fn new(
        config: &Config,
        control: Box<dyn AdapterControl>,
        consecutive_failures: std::sync::Arc<AtomicU32>,
    ) -> (std::sync::Arc<Self>, mpsc::UnboundedSender<ComponentIssue>) {
        let adapters = vec![config.scan_adapter.clone(), config.connect_adapter.clone()];
        let mut states = HashMap::new();
        for name in &adapters {
            states.insert(name.clone(), AdapterState::new(name.clone()));
        }
        let (recovery_completed_tx, _) = watch::channel(0u64);
        let (service_ready_tx, _) = watch::channel(false);
        let (issue_tx, issue_rx) = mpsc::unbounded_channel();
        let watchdog = std::sync::Arc::new(Watchdog {
            control,
            adapters,
            failure_threshold: config.watchdog_failure_threshold,
            interval: config.watchdog_interval,
            consecutive_failures,
            recovering: AtomicBool::new(false),
            states: Mutex::new(states),
            recovery_completed_tx,
            service_ready_tx,
            issue_rx: Mutex::new(Some(issue_rx)),
        });
        (watchdog, issue_tx)
    }

    pub fn adapter_states(&self) -> Vec<AdapterState> {
        self.states.lock().unwrap().values().cloned().collect()
    }

    pub async fn wait_for_recovery_completion(&self, timeout: Duration) -> bool {
        let mut rx = self.recovery_completed_tx.subscribe();
        let start = *rx.borrow();
        let wait = async {
            while rx.changed().await.is_ok() {
                if *rx.borrow() != start {
                    return true;
                }
            }
            false
        };
        tokio::time::timeout(timeout, wait).await.unwrap_or(false)
    }

    pub async fn wait_for_service_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.service_ready_tx.subscribe();
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

    /// Drives the periodic check (30 s) plus the reactive issue queue until
    /// `stop` fires. Spawned as its own task by `service`.
    pub async fn run(self: std::sync::Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut issue_rx = self
            .issue_rx
            .lock()
            .unwrap()
            .take()
            .expect("Watchdog::run invoked more than once");
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.periodic_check().await;
                }
                issue = issue_rx.recv() => {
                    match issue {
                        Some(issue) => self.handle_issue(issue).await,
                        None => break,
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn handle_issue(&self, issue: ComponentIssue) {
        warn!(component = %issue.component, description = %issue.description, "watchdog received component issue");
        if issue.component == "bleakclient_failure" {
            self.lightweight_reset().await;
        } else {
            self.full_recovery().await;
        }
    }

    async fn periodic_check(&self) {
        let failures = self.consecutive_failures.load(Ordering::SeqCst);
        if failures >= self.failure_threshold {
            self.full_recovery().await;
            return;
        }
        let mut any_down = false;
        for name in self.adapters.clone() {
            let status = self.control.adapter_status(&name).await;
            self.record_status(&name, status);
            if status != AdapterStatus::Up {
                any_down = true;
            }
        }
        if any_down {
            self.full_recovery().await;
        }
    }

    fn record_status(&self, name: &str, status: AdapterStatus) {
        let mut states = self.states.lock().unwrap();
        let entry = states
            .entry(name.to_string())
            .or_insert_with(|| AdapterState::new(name.to_string()));
        entry.status = status;
        entry.last_check = std::time::Instant::now();
    }

    async fn lightweight_reset(&self) {
        if self.recovering.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("running lightweight adapter reset");
        for name in self.adapters.clone() {
            let status = self.control.adapter_status(&name).await;
            if status != AdapterStatus::Up {
                self.control.reset(&name).await;
            }
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
        for name in self.adapters.clone() {
            let status = self.control.adapter_status(&name).await;
            self.record_status(&name, status);
        }
        self.consecutive_failures.store(0, Ordering::SeqCst);
        self.recovering.store(false, Ordering::SeqCst);
    }

    async fn full_recovery(&self) {
        if self.recovering.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("running full watchdog recovery");
        for name in self.adapters.clone() {
            let status = self.control.adapter_status(&name).await;
            if status != AdapterStatus::Up {
                self.control.reset(&name).await;
            }
        }
        tokio::time::sleep(Duration::from_secs(3)).await;
        for name in self.adapters.clone() {
            self.record_status(&name, self.control.adapter_status(&name).await);
        }

        self.control.restart_service().await;

        tokio::time::sleep(Duration::from_secs(10)).await;
        let mut all_up = true;
        for name in self.adapters.clone() {
            let status = self.control.adapter_status(&name).await;
            self.record_status(&name, status);
            if status != AdapterStatus::Up {
                all_up = false;
            }
        }
        if all_up {
            self.consecutive_failures.store(0, Ordering::SeqCst);
        }

        self.poll_service_ready().await;

        self.recovering.store(false, Ordering::SeqCst);
        self.recovery_completed_tx.send_modify(|n| *n += 1);
    }

    async fn poll_service_ready(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
        let mut ready = false;
        while tokio::time::Instant::now() < deadline {
            if self.control.service_active().await {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
        let _ = self.service_ready_tx.send(ready);
        if !ready {
            error!(critical = true, "bluetooth service did not become active after recovery");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeControl {
        up_after_reset: bool,
        resets: AsyncMutex<Vec<String>>,
        service_restarts: AsyncMutex<u32>,
    }

    #[async_trait]
    impl AdapterControl for FakeControl {
        async fn reset(&self, adapter: &str) -> bool {
            self.resets.lock().await.push(adapter.to_string());
            true
        }

        async fn restart_service(&self) -> bool {
            *self.service_restarts.lock().await += 1;
            true
        }

        async fn adapter_status(&self, _adapter: &str) -> AdapterStatus {
            if self.up_after_reset {
                AdapterStatus::Up
            } else {
                AdapterStatus::Down
            }
        }

        async fn service_active(&self) -> bool {
            true
        }
    }

    fn test_config() -> Config {
        Config {
            watchdog_interval: Duration::from_millis(10),
            ..Config::from_env()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn lightweight_reset_clears_failure_counter() {
        let failures = Arc::new(AtomicU32::new(5));
        let control = Box::new(FakeControl {
            up_after_reset: true,
            resets: AsyncMutex::new(Vec::new()),
            service_restarts: AsyncMutex::new(0),
        });
        let (watchdog, _issue_tx) = Watchdog::new(&test_config(), control, failures.clone());
        watchdog.lightweight_reset().await;
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_recovery_restarts_service_and_signals_completion() {
        let failures = Arc::new(AtomicU32::new(3));
        let control = Box::new(FakeControl {
            up_after_reset: true,
            resets: AsyncMutex::new(Vec::new()),
            service_restarts: AsyncMutex::new(0),
        });
        let (watchdog, _issue_tx) = Watchdog::new(&test_config(), control, failures.clone());
        let recovery_wait = watchdog.wait_for_recovery_completion(Duration::from_secs(30));
        watchdog.full_recovery().await;
        assert!(recovery_wait.await);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
    }
}
