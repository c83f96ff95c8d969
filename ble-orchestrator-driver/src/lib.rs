//! The BLE radio backend is treated as an opaque driver: this crate defines
//! the narrow interface the core orchestration layer depends on
//! (`BleDriver` / `PeripheralConnection`) plus two implementations — a real
//! one backed by `btleplug`, and an in-memory mock for tests.

pub mod btleplug_driver;
pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use ble_orchestrator_domain::{Address, AdvertisementRecord};
use tokio::sync::mpsc;
use uuid::Uuid;

#[derive(Debug, thiserror::Error, Clone)]
pub enum DriverError {
    #[error("no BLE adapters found")]
    AdapterNotFound,
    #[error("adapter operation timed out")]
    Timeout,
    #[error("driver operation failed: {0}")]
    OperationFailed(String),
    #[error("peripheral not connected")]
    NotConnected,
    #[error("characteristic {0} not found")]
    CharacteristicNotFound(Uuid),
}

/// One radio adapter, driving either scanning or connection-oriented
/// operations. The orchestrator binds one `BleDriver` instance per
/// adapter (scan adapter, connect adapter) at startup.
#[async_trait]
pub trait BleDriver: Send + Sync {
    fn adapter_name(&self) -> &str;

    async fn scan_start(&self) -> Result<(), DriverError>;

    async fn scan_stop(&self) -> Result<(), DriverError>;

    /// Advertisements currently visible to the adapter. The scanner (C2)
    /// polls this on every tick; it does not consume/clear state here —
    /// that bookkeeping is the scan cache's job.
    async fn peripherals(&self) -> Result<Vec<AdvertisementRecord>, DriverError>;

    /// Tear down and rebuild the underlying adapter handle in place, used
    /// by the scanner's recreate procedure after a suspected stall.
    async fn recreate(&self) -> Result<(), DriverError>;

    async fn connect(
        &self,
        address: &Address,
        timeout: Duration,
    ) -> Result<Box<dyn PeripheralConnection>, DriverError>;
}

/// A live connection to one peripheral, scope-acquired by the caller and
/// guaranteed to disconnect on drop in the real implementation.
#[async_trait]
pub trait PeripheralConnection: Send + Sync {
    async fn read_char(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<Vec<u8>, DriverError>;

    async fn write_char(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        data: &[u8],
        ack: bool,
    ) -> Result<(), DriverError>;

    /// Starts forwarding notifications for `characteristic_uuid` to `sink`
    /// as raw bytes, in driver-emitted order.
    async fn subscribe(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<(), DriverError>;

    async fn unsubscribe(
        &self,
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<(), DriverError>;

    async fn disconnect(&self) -> Result<(), DriverError>;

    /// Resolves once the connection has dropped, whether through an
    /// explicit `disconnect()` or the peripheral going away on its own.
    /// Lets callers (C5's connector loop) detect an unexpected drop and
    /// decide whether to retry (spec §4.5 step 4).
    async fn disconnected(&self);
}
