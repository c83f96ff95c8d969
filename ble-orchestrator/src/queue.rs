use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use ble_orchestrator_domain::{
    Priority, QueueConfig, QueueStats, Request, RequestOutcome, RequestStatus, RequestStatusEntry,
};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{error, warn};
use uuid::Uuid;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const PENDING_WARN_THRESHOLD: usize = 20;
const PENDING_CRITICAL_THRESHOLD: usize = 50;

/// A queued request plus the one-shot the enqueuing IPC task awaits for its
/// result (spec §9: "per-request completion futures... owned by the
/// enqueueing task").
pub struct QueuedRequest {
    pub request: Request,
    pub completion: oneshot::Sender<RequestStatusEntry>,
}

/// Ordering key for the main priority queue: lower `Priority` dispatches
/// first, ties broken by insertion sequence (spec §4.3/§5).
struct PriorityItem {
    priority: Priority,
    sequence: u64,
    item: QueuedRequest,
}

impl PartialEq for PriorityItem {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for PriorityItem {}
impl PartialOrd for PriorityItem {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for PriorityItem {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap is a max-heap; we want HIGH(0) dispatched first and
        // earlier sequence first, so compare the reverse of both fields.
        (Reverse(self.priority), Reverse(self.sequence))
            .cmp(&(Reverse(other.priority), Reverse(other.sequence)))
    }
}

struct Inner {
    main: BinaryHeap<PriorityItem>,
    scan: VecDeque<QueuedRequest>,
    sequence: u64,
    active: HashMap<Uuid, RequestStatusEntry>,
    stats: QueueStats,
    last_sweep: Instant,
    config: QueueConfig,
}

/// Request Queue (C3): a main priority queue serviced by one worker plus a
/// plain FIFO for scan lookups serviced by N parallel workers, sharing a
/// status table keyed by request id.
pub struct RequestQueue {
    inner: Mutex<Inner>,
    main_notify: mpsc::UnboundedSender<()>,
    main_recv: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
    scan_notify: mpsc::UnboundedSender<()>,
    scan_recv: Mutex<Option<mpsc::UnboundedReceiver<()>>>,
}

impl RequestQueue {
    pub fn new(config: QueueConfig) -> Self {
        let (main_notify, main_recv) = mpsc::unbounded_channel();
        let (scan_notify, scan_recv) = mpsc::unbounded_channel();
        RequestQueue {
            inner: Mutex::new(Inner {
                main: BinaryHeap::new(),
                scan: VecDeque::new(),
                sequence: 0,
                active: HashMap::new(),
                stats: QueueStats::default(),
                last_sweep: Instant::now(),
                config,
            }),
            main_notify,
            main_recv: Mutex::new(Some(main_recv)),
            scan_notify,
            scan_recv: Mutex::new(Some(scan_recv)),
        }
    }

    /// `enqueue(req)`: routes by kind, stamps bookkeeping, returns
    /// immediately; the caller awaits `completion` for the terminal status.
    pub fn enqueue(&self, request: Request) -> oneshot::Receiver<RequestStatusEntry> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().unwrap();
        inner.active.insert(request.id, RequestStatusEntry::pending());
        inner.stats.total += 1;
        let is_scan = request.kind.is_scan_lookup();
        if is_scan {
            inner.stats.scan_total += 1;
        }
        let item = QueuedRequest {
            request,
            completion: tx,
        };
        if is_scan {
            inner.scan.push_back(item);
            let _ = self.scan_notify.send(());
        } else {
            let sequence = inner.sequence;
            inner.sequence += 1;
            inner.main.push(PriorityItem {
                priority: item.request.priority,
                sequence,
                item,
            });
            let _ = self.main_notify.send(());
        }
        let pending = inner.main.len() + inner.scan.len();
        if pending > PENDING_CRITICAL_THRESHOLD {
            error!(critical = true, pending, "queue depth critical");
        } else if pending > PENDING_WARN_THRESHOLD {
            warn!(pending, "queue depth high");
        }
        rx
    }

    fn take_main_receiver(&self) -> mpsc::UnboundedReceiver<()> {
        self.main_recv
            .lock()
            .unwrap()
            .take()
            .expect("main queue worker already started")
    }

    fn take_scan_receiver(&self) -> mpsc::UnboundedReceiver<()> {
        self.scan_recv
            .lock()
            .unwrap()
            .take()
            .expect("scan queue worker already started")
    }

    fn pop_main(&self) -> Option<QueuedRequest> {
        self.inner.lock().unwrap().main.pop().map(|p| p.item)
    }

    fn pop_scan(&self) -> Option<QueuedRequest> {
        self.inner.lock().unwrap().scan.pop_front()
    }

    fn skip_if_too_old(&self, queued: &QueuedRequest) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.config.skip_old_requests {
            return false;
        }
        let max_age = Duration::from_secs_f64(inner.config.max_age_sec);
        if queued.request.age(Instant::now()) <= max_age {
            return false;
        }
        inner.stats.skipped += 1;
        if let Some(entry) = inner.active.get_mut(&queued.request.id) {
            entry.status = RequestStatus::Skipped;
            entry.error = Some("age exceeded".to_string());
            entry.finished_at = Some(Instant::now());
        }
        true
    }

    fn mark_processing(&self, id: Uuid) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.active.get_mut(&id) {
            entry.status = RequestStatus::Processing;
        }
        inner.stats.processing += 1;
    }

    fn finish(&self, id: Uuid, is_scan: bool, result: DispatchResult) {
        let mut inner = self.inner.lock().unwrap();
        inner.stats.processing = inner.stats.processing.saturating_sub(1);
        let status = match &result {
            DispatchResult::Completed(_) => RequestStatus::Completed,
            DispatchResult::Failed(_) => RequestStatus::Failed,
            DispatchResult::TimedOut => RequestStatus::Timeout,
        };
        match status {
            RequestStatus::Completed => inner.stats.completed += 1,
            RequestStatus::Failed => inner.stats.failed += 1,
            RequestStatus::Timeout => inner.stats.timeout += 1,
            _ => {}
        }
        if is_scan {
            match status {
                RequestStatus::Completed => inner.stats.scan_completed += 1,
                RequestStatus::Failed => inner.stats.scan_failed += 1,
                RequestStatus::Timeout => inner.stats.scan_timeout += 1,
                _ => {}
            }
        }
        if let Some(entry) = inner.active.get_mut(&id) {
            entry.status = status;
            entry.finished_at = Some(Instant::now());
            match result {
                DispatchResult::Completed(outcome) => entry.outcome = Some(outcome),
                DispatchResult::Failed(error) => entry.error = Some(error),
                DispatchResult::TimedOut => entry.error = Some("request timed out".to_string()),
            }
        }
        maybe_sweep(&mut inner);
    }

    pub fn status(&self, id: &Uuid) -> Option<RequestStatusEntry> {
        self.inner.lock().unwrap().active.get(id).cloned()
    }

    pub fn stats(&self) -> QueueStats {
        self.inner.lock().unwrap().stats.clone()
    }

    pub fn config(&self) -> QueueConfig {
        self.inner.lock().unwrap().config.clone()
    }

    pub fn update_config(&self, skip_old_requests: Option<bool>, max_age_sec: Option<f64>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(v) = skip_old_requests {
            inner.config.skip_old_requests = v;
        }
        if let Some(v) = max_age_sec {
            inner.config.max_age_sec = v;
        }
    }

    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.main.len() + inner.scan.len()
    }

    pub fn sweep(&self) {
        let mut inner = self.inner.lock().unwrap();
        sweep_now(&mut inner);
    }

    /// Main priority-queue worker: one task, bounded per-request deadline
    /// taken from the request's own `timeout` field.
    pub async fn run_main_worker<D>(self: std::sync::Arc<Self>, dispatch: D, mut stop: watch::Receiver<bool>)
    where
        D: Fn(Request) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<RequestOutcome, String>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        let mut ready = self.take_main_receiver();
        loop {
            tokio::select! {
                _ = stop.changed() => { if *stop.borrow() { break; } }
                got = ready.recv() => { if got.is_none() { break; } }
            }
            while let Some(queued) = self.pop_main() {
                self.process_one(queued, false, &dispatch).await;
            }
        }
    }

    /// Scan-lookup workers: N parallel tasks sharing the same FIFO, each
    /// bounded at a hard 5 s cap regardless of the request's own timeout.
    pub async fn run_scan_worker<D>(self: std::sync::Arc<Self>, dispatch: D, mut stop: watch::Receiver<bool>)
    where
        D: Fn(Request) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<RequestOutcome, String>> + Send>>
            + Send
            + Sync
            + 'static,
    {
        let mut ready = self.take_scan_receiver();
        loop {
            tokio::select! {
                _ = stop.changed() => { if *stop.borrow() { break; } }
                got = ready.recv() => { if got.is_none() { break; } }
            }
            while let Some(queued) = self.pop_scan() {
                self.process_one(queued, true, &dispatch).await;
            }
        }
    }

    async fn process_one<D>(&self, queued: QueuedRequest, is_scan: bool, dispatch: &D)
    where
        D: Fn(Request) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<RequestOutcome, String>> + Send>>,
    {
        if self.skip_if_too_old(&queued) {
            let entry = self.status(&queued.request.id).unwrap_or_else(RequestStatusEntry::pending);
            let _ = queued.completion.send(entry);
            return;
        }
        let id = queued.request.id;
        self.mark_processing(id);

        let deadline = if is_scan {
            Duration::from_secs(5)
        } else {
            queued.request.timeout
        };

        let result = match tokio::time::timeout(deadline, dispatch(queued.request)).await {
            Ok(Ok(outcome)) => DispatchResult::Completed(outcome),
            Ok(Err(error)) => DispatchResult::Failed(error),
            Err(_) => DispatchResult::TimedOut,
        };
        self.finish(id, is_scan, result);
        let entry = self.status(&id).unwrap_or_else(RequestStatusEntry::pending);
        let _ = queued.completion.send(entry);
    }

    /// Periodic sweep task: evicts finished/stale entries every 60 s.
    pub async fn run_sweeper(self: std::sync::Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(),
                _ = stop.changed() => { if *stop.borrow() { break; } }
            }
        }
    }
}

enum DispatchResult {
    Completed(RequestOutcome),
    Failed(String),
    TimedOut,
}

fn maybe_sweep(inner: &mut Inner) {
    if inner.last_sweep.elapsed() >= SWEEP_INTERVAL {
        sweep_now(inner);
    }
}

fn sweep_now(inner: &mut Inner) {
    let max_age = Duration::from_secs_f64(inner.config.max_age_sec * 1.5);
    let now = Instant::now();
    inner.active.retain(|_, entry| match entry.finished_at {
        Some(finished_at) => now.saturating_duration_since(finished_at) < max_age,
        None => true,
    });
    inner.last_sweep = now;
}
