use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicU32;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ble_orchestrator_domain::{AdvertisementRecord, NotificationEvent, Request, RequestOutcome, RequestStatusEntry};
use ble_orchestrator_driver::{BleDriver, DriverError};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::ScanCache;
use crate::config::Config;
use crate::exclusion::ExclusionCoordinator;
use crate::handler::RequestHandler;
use crate::notify::NotificationManager;
use crate::queue::RequestQueue;
use crate::scanner::Scanner;
use crate::watchdog::{AdapterControl, Watchdog};

type DispatchFn =
    Arc<dyn Fn(Request) -> Pin<Box<dyn Future<Output = Result<RequestOutcome, String>> + Send>> + Send + Sync>;

/// Wires C1-C8 together and drives startup/shutdown ordering. Holds no
/// business logic of its own beyond that wiring and the thin read-through
/// accessors the IPC layer needs.
pub struct Service {
    config: Arc<Config>,
    cache: Arc<ScanCache>,
    exclusion: Arc<ExclusionCoordinator>,
    queue: Arc<RequestQueue>,
    notify: Arc<NotificationManager>,
    scanner: Arc<Scanner>,
    watchdog: Arc<Watchdog>,
    start_time: Instant,
    last_error: Mutex<Option<String>>,
    tasks: AsyncMutex<Vec<(String, watch::Sender<bool>, tokio::task::JoinHandle<()>)>>,
}

impl Service {
    /// Fails if the scanner's initial `scan_start()` fails (spec.md: "Fatal
    /// startup failure... causes stop() of already-started components and
    /// exit"); nothing is spawned yet at that point, so there is nothing to
    /// stop beyond returning the error for `main` to exit on.
    pub async fn new(
        config: Arc<Config>,
        scan_driver: Arc<dyn BleDriver>,
        connect_driver: Arc<dyn BleDriver>,
        adapter_control: Box<dyn AdapterControl>,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<NotificationEvent>), DriverError> {
        let cache = Arc::new(ScanCache::new(config.cache_ttl));
        let exclusion = Arc::new(ExclusionCoordinator::new());
        let ble_mutex = Arc::new(AsyncMutex::new(()));
        let consecutive_failures = Arc::new(AtomicU32::new(0));

        let queue_config = ble_orchestrator_domain::QueueConfig {
            skip_old_requests: config.skip_old_requests,
            max_age_sec: config.request_max_age.as_secs_f64(),
        };
        let queue = Arc::new(RequestQueue::new(queue_config));

        let (watchdog, issue_tx) = Watchdog::new(config.as_ref(), adapter_control, consecutive_failures.clone());

        let handler = Arc::new(RequestHandler::new(
            config.clone(),
            cache.clone(),
            connect_driver,
            exclusion.clone(),
            ble_mutex.clone(),
            consecutive_failures,
            issue_tx.clone(),
        ));

        let (notify, notification_events) = NotificationManager::new(
            config.clone(),
            handler.driver_handle(),
            exclusion.clone(),
            ble_mutex.clone(),
            issue_tx.clone(),
        );

        let scanner = Arc::new(Scanner::new(
            config.clone(),
            scan_driver,
            cache.clone(),
            exclusion.clone(),
            issue_tx,
        ));
        scanner.start().await?;

        let service = Arc::new(Service {
            config,
            cache,
            exclusion,
            queue,
            notify,
            scanner,
            watchdog,
            start_time: Instant::now(),
            last_error: Mutex::new(None),
            tasks: AsyncMutex::new(Vec::new()),
        });
        service.spawn_dispatch_workers(handler);
        Ok((service, notification_events))
    }

    fn spawn_dispatch_workers(self: &Arc<Self>, handler: Arc<RequestHandler>) {
        let notify = self.notify.clone();
        let dispatch: DispatchFn = Arc::new(move |request: Request| {
            let handler = handler.clone();
            let notify = notify.clone();
            Box::pin(async move {
                use ble_orchestrator_domain::RequestKind;
                match &request.kind {
                    RequestKind::NotifySubscribe { .. } | RequestKind::NotifyUnsubscribe { .. } => {
                        notify.handle(request).await
                    }
                    _ => handler.dispatch(request).await,
                }
            })
        });

        let main_dispatch = dispatch.clone();
        self.spawn_task("queue-main-worker", {
            let queue = self.queue.clone();
            move |stop| {
                let dispatch = main_dispatch.clone();
                queue.run_main_worker(move |req| dispatch(req), stop)
            }
        });

        for i in 0..self.config.scan_lookup_workers {
            let scan_dispatch = dispatch.clone();
            self.spawn_task(format!("scan-lookup-worker-{i}"), {
                let queue = self.queue.clone();
                move |stop| {
                    let dispatch = scan_dispatch.clone();
                    queue.run_scan_worker(move |req| dispatch(req), stop)
                }
            });
        }

        self.spawn_task("queue-sweeper", {
            let queue = self.queue.clone();
            move |stop| queue.run_sweeper(stop)
        });

        self.spawn_task("watchdog", {
            let watchdog = self.watchdog.clone();
            move |stop| watchdog.clone().run(stop)
        });

        self.spawn_task("scanner", {
            let scanner = self.scanner.clone();
            move |stop| scanner.clone().run(stop)
        });
    }

    fn spawn_task<F, Fut>(self: &Arc<Self>, name: impl Into<String>, make_future: F)
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(make_future(stop_rx));
        // spawn_task is called synchronously during construction, before
        // any other task could contend for this lock.
        if let Ok(mut tasks) = self.tasks.try_lock() {
            tasks.push((name.into(), stop_tx, handle));
        }
    }

    pub fn cache_get(&self, address: &ble_orchestrator_domain::Address) -> Option<AdvertisementRecord> {
        self.cache.get(address)
    }

    pub async fn enqueue_and_await(&self, request: Request, timeout: Duration) -> Result<RequestStatusEntry, String> {
        let rx = self.queue.enqueue(request);
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(entry)) => Ok(entry),
            Ok(Err(_)) => Err("connection closed".to_string()),
            Err(_) => Err("request timed out awaiting completion".to_string()),
        }
    }

    /// Enqueues and returns immediately with the request id, leaving the
    /// caller to poll `request_status` for completion (spec.md §4.8's
    /// `read_sensor`, distinct from `send_command`'s await-completion
    /// contract).
    pub fn enqueue(&self, request: Request) -> Uuid {
        let id = request.id;
        let _ = self.queue.enqueue(request);
        id
    }

    pub fn request_status(&self, id: &Uuid) -> Option<RequestStatusEntry> {
        self.queue.status(id)
    }

    pub fn queue_stats_json(&self) -> Value {
        json!({"status": "success", "stats": self.queue.stats()})
    }

    pub fn queue_config_json(&self) -> Value {
        json!({"status": "success", "config": self.queue.config()})
    }

    pub fn update_queue_config(&self, skip_old_requests: Option<bool>, max_age_sec: Option<f64>) {
        self.queue.update_config(skip_old_requests, max_age_sec);
    }

    pub async fn status_snapshot(&self) -> Value {
        let adapters: Vec<Value> = self
            .watchdog
            .adapter_states()
            .into_iter()
            .map(|a| {
                json!({
                    "name": a.name,
                    "status": a.status,
                    "last_check_age_sec": a.last_check.elapsed().as_secs_f64(),
                })
            })
            .collect();
        let exclusion = self.exclusion.snapshot();
        let now = Instant::now();
        json!({
            "status": "success",
            "is_running": true,
            "adapter_status": adapters,
            "queue_size": self.queue.pending_count(),
            "scan_cache": self.cache.stats(),
            "active_subscriptions": self.notify.subscription_count().await,
            "exclusion": {
                "scanner_stop_requested": exclusion.scanner_stop_requested,
                "client_active": exclusion.client_active,
                "held_for_sec": exclusion.held_for(now).map(|d| d.as_secs_f64()),
            },
            "last_error": *self.last_error.lock().unwrap(),
            "uptime_sec": self.start_time.elapsed().as_secs_f64(),
        })
    }

    /// Ordered shutdown: IPC is stopped by the caller before this runs;
    /// notification connectors, then queue workers/scanner/watchdog follow
    /// in the reverse of their start order, each bounded at 2-5s.
    pub async fn shutdown(&self) {
        self.notify.shutdown_all().await;
        let mut tasks = self.tasks.lock().await;
        for (name, stop_tx, handle) in tasks.drain(..).rev() {
            let _ = stop_tx.send(true);
            if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
                warn!(task = name, "task did not stop within bound, already detached");
            } else {
                info!(task = name, "task stopped");
            }
        }
    }
}

