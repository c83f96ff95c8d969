use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use ble_orchestrator_domain::{Address, AdvertisementRecord};
use btleplug::api::{
    Central, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{BleDriver, DriverError, PeripheralConnection};

/// `BleDriver` backed by a real local adapter via `btleplug`. One instance
/// is bound to one adapter name for its whole lifetime; `recreate` tears
/// down and re-acquires the `btleplug` handle for that same adapter.
pub struct BtleplugDriver {
    adapter_name: String,
    adapter: Mutex<Adapter>,
}

impl BtleplugDriver {
    pub async fn new(adapter_name: impl Into<String>) -> Result<Self, DriverError> {
        let adapter_name = adapter_name.into();
        let adapter = find_adapter(&adapter_name).await?;
        Ok(BtleplugDriver {
            adapter_name,
            adapter: Mutex::new(adapter),
        })
    }
}

async fn find_adapter(name: &str) -> Result<Adapter, DriverError> {
    let manager = Manager::new()
        .await
        .map_err(|e| DriverError::OperationFailed(e.to_string()))?;
    let adapters = manager
        .adapters()
        .await
        .map_err(|e| DriverError::OperationFailed(e.to_string()))?;
    if adapters.is_empty() {
        return Err(DriverError::AdapterNotFound);
    }
    for adapter in &adapters {
        if let Ok(info) = adapter.adapter_info().await {
            if info.contains(name) {
                return Ok(adapter.clone());
            }
        }
    }
    // Fall back to the first adapter if none match by name — consistent
    // with the teacher's own `adapter_list[0]`/`.pop()` behaviour when a
    // host only exposes one radio.
    warn!(adapter = name, "no adapter matched by name, using first available");
    Ok(adapters[0].clone())
}

#[async_trait]
impl BleDriver for BtleplugDriver {
    fn adapter_name(&self) -> &str {
        &self.adapter_name
    }

    async fn scan_start(&self) -> Result<(), DriverError> {
        let adapter = self.adapter.lock().await;
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| DriverError::OperationFailed(e.to_string()))
    }

    async fn scan_stop(&self) -> Result<(), DriverError> {
        let adapter = self.adapter.lock().await;
        adapter
            .stop_scan()
            .await
            .map_err(|e| DriverError::OperationFailed(e.to_string()))
    }

    async fn peripherals(&self) -> Result<Vec<AdvertisementRecord>, DriverError> {
        let adapter = self.adapter.lock().await;
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| DriverError::OperationFailed(e.to_string()))?;
        let mut records = Vec::with_capacity(peripherals.len());
        let now = std::time::Instant::now();
        for peripheral in &peripherals {
            let Ok(Some(properties)) = peripheral.properties().await else {
                continue;
            };
            let Ok(address) = properties.address.to_string().parse::<Address>() else {
                continue;
            };
            records.push(AdvertisementRecord {
                address,
                local_name: properties.local_name,
                rssi: properties.rssi.unwrap_or(i16::MIN),
                manufacturer_data: properties.manufacturer_data,
                service_data: properties.service_data,
                service_uuids: properties.services,
                observed_at: now,
            });
        }
        Ok(records)
    }

    async fn recreate(&self) -> Result<(), DriverError> {
        let mut adapter = self.adapter.lock().await;
        let _ = adapter.stop_scan().await;
        let fresh = find_adapter(&self.adapter_name).await?;
        *adapter = fresh;
        Ok(())
    }

    async fn connect(
        &self,
        address: &Address,
        timeout: Duration,
    ) -> Result<Box<dyn PeripheralConnection>, DriverError> {
        let adapter = self.adapter.lock().await;
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|e| DriverError::OperationFailed(e.to_string()))?;
        let mut target = None;
        for peripheral in peripherals {
            if let Ok(Some(props)) = peripheral.properties().await {
                if let Ok(addr) = props.address.to_string().parse::<Address>() {
                    if &addr == address {
                        target = Some(peripheral);
                        break;
                    }
                }
            }
        }
        let peripheral = target.ok_or(DriverError::NotConnected)?;
        tokio::time::timeout(timeout, peripheral.connect())
            .await
            .map_err(|_| DriverError::Timeout)?
            .map_err(|e| DriverError::OperationFailed(e.to_string()))?;
        peripheral
            .discover_services()
            .await
            .map_err(|e| DriverError::OperationFailed(e.to_string()))?;
        Ok(Box::new(BtleplugConnection {
            peripheral,
            notify_tasks: Mutex::new(HashMap::new()),
        }))
    }
}

struct BtleplugConnection {
    peripheral: Peripheral,
    notify_tasks: Mutex<HashMap<Uuid, tokio::task::JoinHandle<()>>>,
}

fn find_characteristic(
    peripheral: &Peripheral,
    characteristic_uuid: Uuid,
) -> Result<Characteristic, DriverError> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == characteristic_uuid)
        .ok_or(DriverError::CharacteristicNotFound(characteristic_uuid))
}

#[async_trait]
impl PeripheralConnection for BtleplugConnection {
    async fn read_char(
        &self,
        _service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<Vec<u8>, DriverError> {
        let characteristic = find_characteristic(&self.peripheral, characteristic_uuid)?;
        self.peripheral
            .read(&characteristic)
            .await
            .map_err(|e| DriverError::OperationFailed(e.to_string()))
    }

    async fn write_char(
        &self,
        _service_uuid: Uuid,
        characteristic_uuid: Uuid,
        data: &[u8],
        ack: bool,
    ) -> Result<(), DriverError> {
        let characteristic = find_characteristic(&self.peripheral, characteristic_uuid)?;
        let write_type = if ack {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral
            .write(&characteristic, data, write_type)
            .await
            .map_err(|e| DriverError::OperationFailed(e.to_string()))
    }

    async fn subscribe(
        &self,
        _service_uuid: Uuid,
        characteristic_uuid: Uuid,
        sink: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Result<(), DriverError> {
        let characteristic = find_characteristic(&self.peripheral, characteristic_uuid)?;
        self.peripheral
            .subscribe(&characteristic)
            .await
            .map_err(|e| DriverError::OperationFailed(e.to_string()))?;

        let mut notifications = self
            .peripheral
            .notifications()
            .await
            .map_err(|e| DriverError::OperationFailed(e.to_string()))?;
        let task = tokio::spawn(async move {
            while let Some(event) = notifications.next().await {
                if event.uuid == characteristic_uuid {
                    if sink.send(event.value).is_err() {
                        debug!(%characteristic_uuid, "notification sink dropped, stopping forward task");
                        break;
                    }
                }
            }
        });
        self.notify_tasks
            .lock()
            .await
            .insert(characteristic_uuid, task);
        Ok(())
    }

    async fn unsubscribe(
        &self,
        _service_uuid: Uuid,
        characteristic_uuid: Uuid,
    ) -> Result<(), DriverError> {
        let characteristic = find_characteristic(&self.peripheral, characteristic_uuid)?;
        self.peripheral
            .unsubscribe(&characteristic)
            .await
            .map_err(|e| DriverError::OperationFailed(e.to_string()))?;
        if let Some(task) = self.notify_tasks.lock().await.remove(&characteristic_uuid) {
            task.abort();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), DriverError> {
        for (_, task) in self.notify_tasks.lock().await.drain() {
            task.abort();
        }
        self.peripheral
            .disconnect()
            .await
            .map_err(|e| DriverError::OperationFailed(e.to_string()))
    }

    /// `btleplug` has no disconnect-notification channel on `Peripheral`
    /// itself, so this polls `is_connected()` the same way
    /// `Watchdog::poll_service_ready` polls subprocess state.
    async fn disconnected(&self) {
        loop {
            match self.peripheral.is_connected().await {
                Ok(true) => tokio::time::sleep(Duration::from_secs(2)).await,
                _ => return,
            }
        }
    }
}

impl Drop for BtleplugConnection {
    fn drop(&mut self) {
        let peripheral = self.peripheral.clone();
        tokio::spawn(async move {
            let _ = peripheral.disconnect().await;
        });
    }
}
