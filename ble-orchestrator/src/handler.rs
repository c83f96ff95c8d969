use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use ble_orchestrator_domain::{Request, RequestKind, RequestOutcome, ScanLookupResponse};
use ble_orchestrator_driver::BleDriver;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::warn;
use uuid::Uuid;

use crate::cache::ScanCache;
use crate::config::Config;
use crate::exclusion::ExclusionCoordinator;
use crate::watchdog::ComponentIssue;

/// Request Handler (C4): executes READ/WRITE against a peripheral with
/// retry and exclusion, and serves SCAN_LOOKUP straight from the cache.
pub struct RequestHandler {
    config: Arc<Config>,
    cache: Arc<ScanCache>,
    driver: Arc<dyn BleDriver>,
    exclusion: Arc<ExclusionCoordinator>,
    ble_mutex: Arc<AsyncMutex<()>>,
    connection_mutex: AsyncMutex<()>,
    consecutive_failures: Arc<AtomicU32>,
    issue_tx: mpsc::UnboundedSender<ComponentIssue>,
}

impl RequestHandler {
    pub fn new(
        config: Arc<Config>,
        cache: Arc<ScanCache>,
        driver: Arc<dyn BleDriver>,
        exclusion: Arc<ExclusionCoordinator>,
        ble_mutex: Arc<AsyncMutex<()>>,
        consecutive_failures: Arc<AtomicU32>,
        issue_tx: mpsc::UnboundedSender<ComponentIssue>,
    ) -> Self {
        RequestHandler {
            config,
            cache,
            driver,
            exclusion,
            ble_mutex,
            connection_mutex: AsyncMutex::new(()),
            consecutive_failures,
            issue_tx,
        }
    }

    /// Lets `NotificationManager` share this handler's connect-adapter
    /// driver instance rather than opening a second adapter binding.
    pub fn driver_handle(&self) -> Arc<dyn BleDriver> {
        self.driver.clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    pub fn reset_failures(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
    }

    pub async fn dispatch(&self, request: Request) -> Result<RequestOutcome, String> {
        match &request.kind {
            RequestKind::ScanLookup { service_uuid } => {
                Ok(self.scan_lookup(&request, *service_uuid))
            }
            RequestKind::Read {
                service_uuid,
                characteristic_uuid,
            } => self.read(&request, *service_uuid, *characteristic_uuid).await,
            RequestKind::Write {
                service_uuid,
                characteristic_uuid,
                data,
                ack_required,
            } => {
                self.write(
                    &request,
                    *service_uuid,
                    *characteristic_uuid,
                    data,
                    *ack_required,
                )
                .await
            }
            RequestKind::NotifySubscribe { .. } | RequestKind::NotifyUnsubscribe { .. } => {
                Err("subscription requests are not dispatched through the handler".to_string())
            }
        }
    }

    fn scan_lookup(&self, request: &Request, filter: Option<Uuid>) -> RequestOutcome {
        let Some(record) = self.cache.get(&request.address) else {
            return RequestOutcome::ScanLookup(ScanLookupResponse::not_found(request.address.clone()));
        };
        let manufacturer_data = record
            .manufacturer_data
            .iter()
            .map(|(id, bytes)| (id.to_string(), bytes.clone()))
            .collect::<HashMap<_, _>>();
        let service_data = match filter {
            Some(uuid) => record
                .service_data
                .get(&uuid)
                .map(|bytes| HashMap::from([(uuid, bytes.clone())]))
                .unwrap_or_default(),
            None => record.service_data.clone(),
        };
        RequestOutcome::ScanLookup(ScanLookupResponse {
            address: record.address,
            name: record.local_name,
            rssi: Some(record.rssi),
            service_uuids: record.service_uuids,
            manufacturer_data,
            service_data,
            error: None,
        })
    }

    async fn read(
        &self,
        request: &Request,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<RequestOutcome, String> {
        self.with_connection(request, |conn| {
            Box::pin(async move {
                conn.read_char(service_uuid, characteristic_uuid)
                    .await
                    .map(RequestOutcome::Bytes)
                    .map_err(|e| e.to_string())
            })
        })
        .await
    }

    async fn write(
        &self,
        request: &Request,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        data: &[u8],
        ack_required: bool,
    ) -> Result<RequestOutcome, String> {
        let data = data.to_vec();
        self.with_connection(request, move |conn| {
            let data = data.clone();
            Box::pin(async move {
                conn.write_char(service_uuid, characteristic_uuid, &data, ack_required)
                    .await
                    .map_err(|e| e.to_string())?;
                if ack_required {
                    conn.read_char(service_uuid, characteristic_uuid)
                        .await
                        .map(RequestOutcome::Bytes)
                        .map_err(|e| e.to_string())
                } else {
                    Ok(RequestOutcome::None)
                }
            })
        })
        .await
    }

    /// Shared READ/WRITE path (spec §4.4 steps 1-6): resolve address via the
    /// cache, engage exclusion, serialize on the global BLE mutex, retry the
    /// connection-scoped operation, and always release exclusion on exit.
    async fn with_connection<F>(&self, request: &Request, op: F) -> Result<RequestOutcome, String>
    where
        F: for<'a> Fn(
                &'a dyn ble_orchestrator_driver::PeripheralConnection,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = Result<RequestOutcome, String>> + Send + 'a>,
            > + Send,
    {
        let _connection_guard = self.connection_mutex.lock().await;

        if self.cache.get(&request.address).is_none() {
            return Err("device not found".to_string());
        }

        self.exclusion.request_stop_for_client();
        self.exclusion
            .wait_scan_stopped(self.config.exclusion_handshake_timeout)
            .await;

        let result = self.run_with_retry(request, &op).await;

        self.exclusion.notify_client_done();
        self.exclusion
            .wait_scan_ready(self.config.exclusion_handshake_timeout)
            .await;

        match result {
            Ok(outcome) => {
                self.reset_failures();
                Ok(outcome)
            }
            Err(error) => {
                self.consecutive_failures.fetch_add(1, Ordering::SeqCst);
                let _ = self.issue_tx.send(ComponentIssue {
                    component: "bleakclient_failure".to_string(),
                    description: error.clone(),
                });
                tokio::time::sleep(self.config.adapter_reset_wait).await;
                Err(error)
            }
        }
    }

    async fn run_with_retry<F>(&self, request: &Request, op: &F) -> Result<RequestOutcome, String>
    where
        F: for<'a> Fn(
                &'a dyn ble_orchestrator_driver::PeripheralConnection,
            ) -> std::pin::Pin<
                Box<dyn std::future::Future<Output = Result<RequestOutcome, String>> + Send + 'a>,
            > + Send,
    {
        let attempts = self.config.retry_count.max(1);
        let mut last_error = "no attempts made".to_string();
        for attempt in 0..attempts {
            let _ble_guard = self.ble_mutex.lock().await;
            let connect_result = tokio::time::timeout(
                self.config.connect_timeout,
                self.driver.connect(&request.address, self.config.connect_timeout),
            )
            .await;
            let connection = match connect_result {
                Ok(Ok(connection)) => connection,
                Ok(Err(e)) => {
                    last_error = e.to_string();
                    drop(_ble_guard);
                    self.backoff(attempt, attempts).await;
                    continue;
                }
                Err(_) => {
                    last_error = "connect timed out".to_string();
                    drop(_ble_guard);
                    self.backoff(attempt, attempts).await;
                    continue;
                }
            };

            let outcome = op(connection.as_ref()).await;
            let _ = connection.disconnect().await;
            drop(_ble_guard);

            match outcome {
                Ok(outcome) => return Ok(outcome),
                Err(e) => {
                    last_error = e;
                    self.backoff(attempt, attempts).await;
                }
            }
        }
        warn!(address = %request.address, error = %last_error, "request failed after retries");
        Err(last_error)
    }

    async fn backoff(&self, attempt: u32, attempts: u32) {
        if attempt + 1 < attempts {
            tokio::time::sleep(self.config.retry_interval).await;
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ble_orchestrator_domain::{AdvertisementRecord, Priority};
    use ble_orchestrator_driver::mock::MockDriver;
    use std::collections::HashMap as Map;
    use std::time::{Duration, Instant};

    fn test_config() -> Config {
        Config {
            retry_count: 2,
            retry_interval: Duration::from_millis(1),
            connect_timeout: Duration::from_millis(200),
            exclusion_handshake_timeout: Duration::from_millis(50),
            adapter_reset_wait: Duration::from_millis(1),
            ..Config::from_env()
        }
    }

    fn seed_cache(cache: &ScanCache, address: &str) {
        cache.upsert(AdvertisementRecord {
            address: address.parse().unwrap(),
            local_name: Some("widget".into()),
            rssi: -50,
            manufacturer_data: Map::new(),
            service_data: Map::new(),
            service_uuids: Vec::new(),
            observed_at: Instant::now(),
        });
    }

    fn make_handler(driver: MockDriver) -> (RequestHandler, Arc<ScanCache>) {
        let cache = Arc::new(ScanCache::new(Duration::from_secs(300)));
        seed_cache(&cache, "AA:BB:CC:DD:EE:FF");
        let (issue_tx, _issue_rx) = mpsc::unbounded_channel();
        let handler = RequestHandler::new(
            Arc::new(test_config()),
            cache.clone(),
            Arc::new(driver),
            Arc::new(ExclusionCoordinator::new()),
            Arc::new(AsyncMutex::new(())),
            Arc::new(AtomicU32::new(0)),
            issue_tx,
        );
        (handler, cache)
    }

    fn read_request(characteristic_uuid: Uuid) -> Request {
        Request {
            id: Uuid::new_v4(),
            address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            priority: Priority::Normal,
            created_at: Instant::now(),
            timeout: Duration::from_secs(5),
            kind: RequestKind::Read {
                service_uuid: Uuid::new_v4(),
                characteristic_uuid,
            },
        }
    }

    #[tokio::test]
    async fn read_succeeds_against_mock_driver() {
        let driver = MockDriver::new("hci1");
        let characteristic = Uuid::new_v4();
        driver.set_char_value(characteristic, vec![1, 2, 3]);
        let (handler, _cache) = make_handler(driver);
        let outcome = handler.dispatch(read_request(characteristic)).await.unwrap();
        match outcome {
            RequestOutcome::Bytes(bytes) => assert_eq!(bytes, vec![1, 2, 3]),
            _ => panic!("expected bytes outcome"),
        }
        assert_eq!(handler.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn read_retries_then_fails_notifies_watchdog() {
        let driver = MockDriver::new("hci1");
        let characteristic = Uuid::new_v4();
        driver.fail_read_times(characteristic, 10);
        let cache = Arc::new(ScanCache::new(Duration::from_secs(300)));
        seed_cache(&cache, "AA:BB:CC:DD:EE:FF");
        let (issue_tx, mut issue_rx) = mpsc::unbounded_channel();
        let handler = RequestHandler::new(
            Arc::new(test_config()),
            cache,
            Arc::new(driver),
            Arc::new(ExclusionCoordinator::new()),
            Arc::new(AsyncMutex::new(())),
            Arc::new(AtomicU32::new(0)),
            issue_tx,
        );
        let result = handler.dispatch(read_request(characteristic)).await;
        assert!(result.is_err());
        assert!(handler.consecutive_failures() >= 1);
        let issue = issue_rx.try_recv().unwrap();
        assert_eq!(issue.component, "bleakclient_failure");
    }

    #[tokio::test]
    async fn scan_lookup_filters_to_requested_service() {
        let driver = MockDriver::new("hci0");
        let cache = Arc::new(ScanCache::new(Duration::from_secs(300)));
        let wanted = Uuid::new_v4();
        let other = Uuid::new_v4();
        cache.upsert(AdvertisementRecord {
            address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            local_name: Some("S".into()),
            rssi: -60,
            manufacturer_data: Map::new(),
            service_data: Map::from([(wanted, vec![9]), (other, vec![8])]),
            service_uuids: vec![wanted, other],
            observed_at: Instant::now(),
        });
        let (issue_tx, _issue_rx) = mpsc::unbounded_channel();
        let handler = RequestHandler::new(
            Arc::new(test_config()),
            cache,
            Arc::new(driver),
            Arc::new(ExclusionCoordinator::new()),
            Arc::new(AsyncMutex::new(())),
            Arc::new(AtomicU32::new(0)),
            issue_tx,
        );
        let request = Request {
            id: Uuid::new_v4(),
            address: "AA:BB:CC:DD:EE:FF".parse().unwrap(),
            priority: Priority::Normal,
            created_at: Instant::now(),
            timeout: Duration::from_secs(5),
            kind: RequestKind::ScanLookup {
                service_uuid: Some(wanted),
            },
        };
        let outcome = handler.dispatch(request).await.unwrap();
        match outcome {
            RequestOutcome::ScanLookup(response) => {
                assert_eq!(response.service_data.len(), 1);
                assert!(response.service_data.contains_key(&wanted));
            }
            _ => panic!("expected scan lookup outcome"),
        }
    }
}
