//! An in-memory `BleDriver` double. Mirrors the way
//! `examples/original_source`'s test suite stubs the BLE backend: a
//! scriptable set of failure counters plus a call log, so queue/handler/
//! exclusion tests can assert both outcome and operation ordering without a
//! real adapter.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use ble_orchestrator_domain::{Address, AdvertisementRecord};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::{BleDriver, DriverError, PeripheralConnection};

#[derive(Default)]
struct MockState {
    calls: Vec<String>,
    advertisements: HashMap<Address, AdvertisementRecord>,
    connect_failures: u32,
    read_failures: HashMap<Uuid, u32>,
    write_failures: HashMap<Uuid, u32>,
    char_values: HashMap<Uuid, Vec<u8>>,
    notify_sinks: HashMap<Uuid, mpsc::UnboundedSender<Vec<u8>>>,
    disconnect_txs: HashMap<Address, watch::Sender<bool>>,
}

/// Mock adapter. Cloning shares state, so a test can hold the driver handed
/// to the orchestrator and a second handle to seed/inspect it concurrently.
pub struct MockDriver {
    adapter_name: String,
    state: std::sync::Arc<StdMutex<MockState>>,
}

impl Clone for MockDriver {
    fn clone(&self) -> Self {
        MockDriver {
            adapter_name: self.adapter_name.clone(),
            state: self.state.clone(),
        }
    }
}

impl MockDriver {
    pub fn new(adapter_name: impl Into<String>) -> Self {
        MockDriver {
            adapter_name: adapter_name.into(),
            state: std::sync::Arc::new(StdMutex::new(MockState::default())),
        }
    }

    pub fn push_advertisement(&self, record: AdvertisementRecord) {
        self.state
            .lock()
            .unwrap()
            .advertisements
            .insert(record.address.clone(), record);
    }

    pub fn set_char_value(&self, characteristic_uuid: Uuid, value: Vec<u8>) {
        self.state
            .lock()
            .unwrap()
            .char_values
            .insert(characteristic_uuid, value);
    }

    /// The connect call fails this many times before succeeding.
    pub fn fail_connect_times(&self, count: u32) {
        self.state.lock().unwrap().connect_failures = count;
    }

    pub fn fail_read_times(&self, characteristic_uuid: Uuid, count: u32) {
        self.state
            .lock()
            .unwrap()
            .read_failures
            .insert(characteristic_uuid, count);
    }

    pub fn fail_write_times(&self, characteristic_uuid: Uuid, count: u32) {
        self.state
            .lock()
            .unwrap()
            .write_failures
            .insert(characteristic_uuid, count);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Pushes a notification value through the sink registered by the most
    /// recent `subscribe()` for `characteristic_uuid`, simulating the
    /// driver emitting a notification. No-op if nothing is subscribed.
    pub fn emit_notification(&self, characteristic_uuid: Uuid, value: Vec<u8>) {
        let sink = self
            .state
            .lock()
            .unwrap()
            .notify_sinks
            .get(&characteristic_uuid)
            .cloned();
        if let Some(sink) = sink {
            let _ = sink.send(value);
        }
    }

    /// Simulates the peripheral going away on its own, for exercising a
    /// consumer's reconnect-on-drop handling. No-op if nothing is
    /// currently connected to `address`.
    pub fn simulate_disconnect(&self, address: &Address) {
        if let Some(tx) = self.state.lock().unwrap().disconnect_txs.get(address) {
            let _ = tx.send(true);
        }
    }

    fn log(&self, call: impl Into<String>) {
        self.state.lock().unwrap().calls.push(call.into());
    }
}

#[async_trait]
impl BleDriver for MockDriver {
    fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    async fn scan_start(&self) -> Result<(), DriverError> {
        self.log("scan_start");
        Ok(())
    }

    async fn scan_stop(&self) -> Result<(), DriverError> {
        self.log("scan_stop");
        Ok(())
    }

    async fn peripherals(&self) -> Result<Vec<AdvertisementRecord>, DriverError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .advertisements
            .values()
            .cloned()
            .collect())
    }

    async fn recreate(&self) -> Result<(), DriverError> {
        self.log("recreate");
        Ok(())
    }

    async fn connect(
        &self,
        address: &Address,
        _timeout: Duration,
    ) -> Result<Box<dyn PeripheralConnection>, DriverError> {
        self.log(format!("connect({address})"));
        let mut state = self.state.lock().unwrap();
        if state.connect_failures > 0 {
            state.connect_failures -= 1;
            return Err(DriverError::OperationFailed("mock connect failure".into()));
        }
        let (disconnect_tx, disconnect_rx) = watch::channel(false);
        state.disconnect_txs.insert(address.clone(), disconnect_tx);
        drop(state);
        self.log("disconnect-on-drop-armed");
        Ok(Box::new(MockConnection {
            address: address.clone(),
            state: self.state.clone(),
            disconnect_rx,
        }))
    }
}

struct MockConnection {
    address: Address,
    state: std::sync::Arc<StdMutex<MockState>>,
    disconnect_rx: watch::Receiver<bool>,
}

#[async_trait]
impl PeripheralConnection for MockConnection {
    async fn read_char(
        &self,
        _service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<Vec<u8>, DriverError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("read({},{characteristic_uuid})", self.address));
        if let Some(remaining) = state.read_failures.get_mut(&characteristic_uuid) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DriverError::OperationFailed("mock read failure".into()));
            }
        }
        Ok(state
            .char_values
            .get(&characteristic_uuid)
            .cloned()
            .unwrap_or_default())
    }

    async fn write_char(
        &self,
        _service_uuid: Uuid,
        characteristic_uuid: Uuid,
        data: &[u8],
        _ack: bool,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("write({},{characteristic_uuid})", self.address));
        if let Some(remaining) = state.write_failures.get_mut(&characteristic_uuid) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(DriverError::OperationFailed("mock write failure".into()));
            }
        }
        state
            .char_values
            .insert(characteristic_uuid, data.to_vec());
        Ok(())
    }

    async fn subscribe(
        &self,
        _service_uuid: Uuid,
        characteristic_uuid: Uuid,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("subscribe({},{characteristic_uuid})", self.address));
        state.notify_sinks.insert(characteristic_uuid, sink);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        _service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state
            .calls
            .push(format!("unsubscribe({},{characteristic_uuid})", self.address));
        state.notify_sinks.remove(&characteristic_uuid);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        self.state
            .lock()
            .unwrap()
            .calls
            .push(format!("disconnect({})", self.address));
        Ok(())
    }

    async fn disconnected(&self) {
        let mut rx = self.disconnect_rx.clone();
        if *rx.borrow() {
            return;
        }
        while rx.changed().await.is_ok() {
            if *rx.borrow() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Instant;

    fn addr(s: &str) -> Address {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn records_call_order() {
        let driver = MockDriver::new("hci0");
        driver.scan_start().await.unwrap();
        let conn = driver
            .connect(&addr("AA:BB:CC:DD:EE:FF"), Duration::from_secs(1))
            .await
            .unwrap();
        conn.disconnect().await.unwrap();
        driver.scan_start().await.unwrap();
        assert_eq!(
            driver.calls(),
            vec![
                "scan_start".to_string(),
                "connect(AA:BB:CC:DD:EE:FF)".to_string(),
                "disconnect-on-drop-armed".to_string(),
                "disconnect(AA:BB:CC:DD:EE:FF)".to_string(),
                "scan_start".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn connect_failures_then_success() {
        let driver = MockDriver::new("hci0");
        driver.fail_connect_times(2);
        let a = addr("AA:BB:CC:DD:EE:FF");
        assert!(driver.connect(&a, Duration::from_secs(1)).await.is_err());
        assert!(driver.connect(&a, Duration::from_secs(1)).await.is_err());
        assert!(driver.connect(&a, Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn seeded_advertisement_is_returned() {
        let driver = MockDriver::new("hci0");
        let record = AdvertisementRecord {
            address: addr("AA:BB:CC:DD:EE:FF"),
            local_name: Some("widget".into()),
            rssi: -40,
            manufacturer_data: HashMap::new(),
            service_data: HashMap::new(),
            service_uuids: Vec::new(),
            observed_at: Instant::now(),
        };
        driver.push_advertisement(record);
        let found = driver.peripherals().await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].local_name.as_deref(), Some("widget"));
    }
}
