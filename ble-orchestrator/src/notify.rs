use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use ble_orchestrator_domain::{Address, NotificationEvent, Request, RequestKind, RequestOutcome};
use ble_orchestrator_driver::{BleDriver, PeripheralConnection};
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::exclusion::ExclusionCoordinator;
use crate::watchdog::ComponentIssue;

const MAX_CONNECT_RETRIES: u32 = 5;
const RETRY_BACKOFF: Duration = Duration::from_secs(2);

struct AddressState {
    connection: Option<Arc<dyn PeripheralConnection>>,
    subscribed_chars: HashSet<Uuid>,
    callback_of: HashMap<Uuid, HashSet<String>>,
    connector: Option<tokio::task::JoinHandle<()>>,
}

impl AddressState {
    fn new() -> Self {
        AddressState {
            connection: None,
            subscribed_chars: HashSet::new(),
            callback_of: HashMap::new(),
            connector: None,
        }
    }
}

/// Notification Manager (C5): one long-lived peripheral connection per
/// address, fanned out to every `callback_id` subscribed to a
/// characteristic on that address. Ordering of delivered bytes follows the
/// driver's own emission order; the manager never buffers beyond that.
pub struct NotificationManager {
    config: Arc<Config>,
    driver: Arc<dyn BleDriver>,
    exclusion: Arc<ExclusionCoordinator>,
    ble_mutex: Arc<Mutex<()>>,
    issue_tx: mpsc::UnboundedSender<ComponentIssue>,
    events_tx: mpsc::UnboundedSender<NotificationEvent>,
    states: Mutex<HashMap<Address, AddressState>>,
}

impl NotificationManager {
    pub fn new(
        config: Arc<Config>,
        driver: Arc<dyn BleDriver>,
        exclusion: Arc<ExclusionCoordinator>,
        ble_mutex: Arc<Mutex<()>>,
        issue_tx: mpsc::UnboundedSender<ComponentIssue>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<NotificationEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let manager = Arc::new(NotificationManager {
            config,
            driver,
            exclusion,
            ble_mutex,
            issue_tx,
            events_tx,
            states: Mutex::new(HashMap::new()),
        });
        (manager, events_rx)
    }

    pub async fn handle(self: &Arc<Self>, request: Request) -> Result<RequestOutcome, String> {
        let address = request.address.clone();
        match request.kind {
            RequestKind::NotifySubscribe {
                characteristic_uuid,
                callback_id,
                ..
            } => {
                self.subscribe(address, characteristic_uuid, callback_id).await;
                Ok(RequestOutcome::None)
            }
            RequestKind::NotifyUnsubscribe {
                characteristic_uuid,
                callback_id,
                ..
            } => {
                self.unsubscribe(address, characteristic_uuid, callback_id).await;
                Ok(RequestOutcome::None)
            }
            _ => Err("notification manager received a non-subscription request".to_string()),
        }
    }

    async fn subscribe(self: &Arc<Self>, address: Address, characteristic_uuid: Uuid, callback_id: String) {
        let mut states = self.states.lock().await;
        let state = states.entry(address.clone()).or_insert_with(AddressState::new);
        state
            .callback_of
            .entry(characteristic_uuid)
            .or_default()
            .insert(callback_id);
        state.subscribed_chars.insert(characteristic_uuid);
        if state.connector.is_none() {
            let manager = self.clone();
            state.connector = Some(tokio::spawn(async move {
                manager.connector_loop(address).await;
            }));
        }
    }

    async fn unsubscribe(self: &Arc<Self>, address: Address, characteristic_uuid: Uuid, callback_id: String) {
        let (should_unsub_char, should_close, connection) = {
            let mut states = self.states.lock().await;
            let Some(state) = states.get_mut(&address) else {
                return;
            };
            if let Some(set) = state.callback_of.get_mut(&characteristic_uuid) {
                set.remove(&callback_id);
                if set.is_empty() {
                    state.callback_of.remove(&characteristic_uuid);
                    state.subscribed_chars.remove(&characteristic_uuid);
                }
            }
            let should_unsub_char = !state.subscribed_chars.contains(&characteristic_uuid);
            let should_close = state.subscribed_chars.is_empty();
            let connection = state.connection.clone();
            if should_close {
                if let Some(task) = state.connector.take() {
                    task.abort();
                }
                states.remove(&address);
            }
            (should_unsub_char, should_close, connection)
        };

        if let Some(connection) = connection {
            if should_unsub_char {
                let _ = connection.unsubscribe(Uuid::nil(), characteristic_uuid).await;
            }
            if should_close {
                let _ = connection.disconnect().await;
            }
        }
    }

    /// One task per subscribed address: engages exclusion, opens a
    /// connection under the global BLE mutex, subscribes every currently
    /// wanted characteristic, then waits for the connection to drop. On an
    /// unexpected drop it loops back and reconnects through the same
    /// retry/backoff path as an initial connect failure (spec §4.5 step 4),
    /// until the address is unsubscribed or retries are exhausted.
    async fn connector_loop(self: Arc<Self>, address: Address) {
        let mut retries = 0;
        loop {
            self.exclusion.request_stop_for_client();
            self.exclusion
                .wait_scan_stopped(self.config.exclusion_handshake_timeout)
                .await;

            let connect_result = {
                let _guard = self.ble_mutex.lock().await;
                self.driver.connect(&address, self.config.connect_timeout).await
            };

            self.exclusion.notify_client_done();
            self.exclusion
                .wait_scan_ready(self.config.exclusion_handshake_timeout)
                .await;

            let connection: Arc<dyn PeripheralConnection> = match connect_result {
                Ok(connection) => Arc::from(connection),
                Err(e) => {
                    warn!(%address, error = %e, "notification connector failed to connect");
                    retries += 1;
                    if retries >= MAX_CONNECT_RETRIES {
                        let _ = self.issue_tx.send(ComponentIssue {
                            component: "notification_manager".to_string(),
                            description: format!("giving up connecting to {address}"),
                        });
                        self.states.lock().await.remove(&address);
                        return;
                    }
                    tokio::time::sleep(RETRY_BACKOFF).await;
                    continue;
                }
            };

            let chars: Vec<Uuid> = {
                let mut states = self.states.lock().await;
                let Some(state) = states.get_mut(&address) else {
                    let _ = connection.disconnect().await;
                    return;
                };
                state.connection = Some(connection.clone());
                state.subscribed_chars.iter().copied().collect()
            };

            {
                let _guard = self.ble_mutex.lock().await;
                for characteristic_uuid in chars {
                    let (sink, source) = mpsc::unbounded_channel::<Vec<u8>>();
                    if connection
                        .subscribe(Uuid::nil(), characteristic_uuid, sink)
                        .await
                        .is_err()
                    {
                        continue;
                    }
                    self.spawn_forwarder(address.clone(), characteristic_uuid, source);
                }
            }
            retries = 0;
            info!(%address, "notification connection established");

            connection.disconnected().await;

            let still_wanted = {
                let mut states = self.states.lock().await;
                match states.get_mut(&address) {
                    Some(state) if !state.subscribed_chars.is_empty() => {
                        state.connection = None;
                        true
                    }
                    _ => false,
                }
            };
            if !still_wanted {
                return;
            }
            warn!(%address, "notification connection dropped, reconnecting");
        }
    }

    /// Count of distinct `callback_id`s currently subscribed to any
    /// characteristic on any address, surfaced through `get_status`.
    pub async fn subscription_count(&self) -> usize {
        let states = self.states.lock().await;
        states
            .values()
            .flat_map(|state| state.callback_of.values())
            .flat_map(|callbacks| callbacks.iter())
            .collect::<HashSet<_>>()
            .len()
    }

    /// Ordered shutdown: aborts every connector task and disconnects every
    /// live connection. Called once, before the queue workers are stopped.
    pub async fn shutdown_all(&self) {
        let mut states = self.states.lock().await;
        for (address, mut state) in states.drain() {
            if let Some(task) = state.connector.take() {
                task.abort();
            }
            if let Some(connection) = state.connection.take() {
                if let Err(e) = connection.disconnect().await {
                    warn!(%address, error = %e, "failed to disconnect during shutdown");
                }
            }
        }
    }

    /// Demultiplexes one characteristic's raw-byte stream to every
    /// currently registered `callback_id`, looked up fresh on each value so
    /// subscribe/unsubscribe churn during delivery is reflected immediately.
    fn spawn_forwarder(self: &Arc<Self>, address: Address, characteristic_uuid: Uuid, mut source: mpsc::UnboundedReceiver<Vec<u8>>) {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(value) = source.recv().await {
                let callback_ids: Vec<String> = {
                    let states = manager.states.lock().await;
                    states
                        .get(&address)
                        .and_then(|state| state.callback_of.get(&characteristic_uuid))
                        .map(|set| set.iter().cloned().collect())
                        .unwrap_or_default()
                };
                for callback_id in callback_ids {
                    let _ = manager.events_tx.send(NotificationEvent {
                        callback_id,
                        address: address.clone(),
                        characteristic_uuid,
                        value: value.clone(),
                        timestamp: now_epoch_secs(),
                    });
                }
            }
        });
    }
}

fn now_epoch_secs() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

#[cfg(test)]
mod test {
    use super::*;
    use ble_orchestrator_driver::mock::MockDriver;

    fn addr() -> Address {
        "AA:BB:CC:DD:EE:FF".parse().unwrap()
    }

    /// No `Scanner` runs in these tests, so the exclusion handshake's
    /// `scan_stopped`/`scan_ready` events never fire on their own; keep the
    /// wait bounds short so `connector_loop` falls through on timeout
    /// instead of the tests hanging on the default 10 s config value.
    fn test_config() -> Config {
        Config {
            exclusion_handshake_timeout: Duration::from_millis(5),
            ..Config::from_env()
        }
    }

    #[tokio::test]
    async fn subscribe_then_unsubscribe_leaves_no_state() {
        let driver = Arc::new(MockDriver::new("hci1"));
        let (manager, _events_rx) = NotificationManager::new(
            Arc::new(test_config()),
            driver,
            Arc::new(ExclusionCoordinator::new()),
            Arc::new(Mutex::new(())),
            mpsc::unbounded_channel().0,
        );
        let characteristic_uuid = Uuid::new_v4();

        manager
            .handle(Request {
                id: Uuid::new_v4(),
                address: addr(),
                priority: ble_orchestrator_domain::Priority::Normal,
                created_at: std::time::Instant::now(),
                timeout: Duration::from_secs(5),
                kind: RequestKind::NotifySubscribe {
                    service_uuid: Uuid::new_v4(),
                    characteristic_uuid,
                    callback_id: "cb-1".to_string(),
                },
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;

        manager
            .handle(Request {
                id: Uuid::new_v4(),
                address: addr(),
                priority: ble_orchestrator_domain::Priority::Normal,
                created_at: std::time::Instant::now(),
                timeout: Duration::from_secs(5),
                kind: RequestKind::NotifyUnsubscribe {
                    service_uuid: Uuid::new_v4(),
                    characteristic_uuid,
                    callback_id: "cb-1".to_string(),
                },
            })
            .await
            .unwrap();

        assert!(manager.states.lock().await.is_empty());
    }

    #[tokio::test]
    async fn notifications_are_delivered_in_order() {
        let driver = MockDriver::new("hci1");
        let emitter = driver.clone();
        let (manager, mut events_rx) = NotificationManager::new(
            Arc::new(test_config()),
            Arc::new(driver),
            Arc::new(ExclusionCoordinator::new()),
            Arc::new(Mutex::new(())),
            mpsc::unbounded_channel().0,
        );
        let characteristic_uuid = Uuid::new_v4();
        manager
            .handle(Request {
                id: Uuid::new_v4(),
                address: addr(),
                priority: ble_orchestrator_domain::Priority::Normal,
                created_at: std::time::Instant::now(),
                timeout: Duration::from_secs(5),
                kind: RequestKind::NotifySubscribe {
                    service_uuid: Uuid::new_v4(),
                    characteristic_uuid,
                    callback_id: "cb-1".to_string(),
                },
            })
            .await
            .unwrap();

        // Give the connector task time to connect and subscribe before the
        // driver starts emitting.
        tokio::time::sleep(Duration::from_millis(50)).await;

        emitter.emit_notification(characteristic_uuid, vec![0x01]);
        emitter.emit_notification(characteristic_uuid, vec![0x02]);
        emitter.emit_notification(characteristic_uuid, vec![0x03]);

        let mut received = Vec::new();
        for _ in 0..3 {
            let event = tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
                .await
                .expect("timed out waiting for notification")
                .expect("event channel closed");
            received.push(event.value);
        }
        assert_eq!(received, vec![vec![0x01], vec![0x02], vec![0x03]]);
    }

    #[tokio::test]
    async fn reconnects_and_resubscribes_after_unexpected_disconnect() {
        let driver = MockDriver::new("hci1");
        let emitter = driver.clone();
        let (manager, mut events_rx) = NotificationManager::new(
            Arc::new(test_config()),
            Arc::new(driver),
            Arc::new(ExclusionCoordinator::new()),
            Arc::new(Mutex::new(())),
            mpsc::unbounded_channel().0,
        );
        let characteristic_uuid = Uuid::new_v4();
        manager
            .handle(Request {
                id: Uuid::new_v4(),
                address: addr(),
                priority: ble_orchestrator_domain::Priority::Normal,
                created_at: std::time::Instant::now(),
                timeout: Duration::from_secs(5),
                kind: RequestKind::NotifySubscribe {
                    service_uuid: Uuid::new_v4(),
                    characteristic_uuid,
                    callback_id: "cb-1".to_string(),
                },
            })
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        emitter.emit_notification(characteristic_uuid, vec![0x01]);
        let first = tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("event channel closed");
        assert_eq!(first.value, vec![0x01]);

        emitter.simulate_disconnect(&addr());

        // Give the connector loop time to notice the drop and reconnect.
        tokio::time::sleep(Duration::from_millis(100)).await;
        emitter.emit_notification(characteristic_uuid, vec![0x02]);
        let second = tokio::time::timeout(Duration::from_secs(1), events_rx.recv())
            .await
            .expect("timed out waiting for notification after reconnect")
            .expect("event channel closed");
        assert_eq!(second.value, vec![0x02]);
    }
}
