use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use ble_orchestrator_domain::{Priority, Request, RequestKind, RequestOutcome, RequestStatus};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::service::Service;

const SUBSCRIBE_COMPLETION_TIMEOUT: Duration = Duration::from_secs(10);

/// One outbound line — either a direct response or a pushed notification —
/// destined for a single connection's writer half.
type OutboundSender = mpsc::UnboundedSender<String>;

#[derive(Default)]
struct Subscribers {
    by_callback: HashMap<String, Vec<(u64, OutboundSender)>>,
}

/// IPC Server (C8): accepts local connections, frames newline-delimited
/// JSON, dispatches by `command`, and fans pushed notifications out to every
/// connection subscribed to a `callback_id`.
pub struct IpcServer {
    config: Arc<Config>,
    service: Arc<Service>,
    subscribers: Mutex<Subscribers>,
    next_connection_id: std::sync::atomic::AtomicU64,
}

impl IpcServer {
    pub fn new(config: Arc<Config>, service: Arc<Service>) -> Arc<Self> {
        Arc::new(IpcServer {
            config,
            service,
            subscribers: Mutex::new(Subscribers::default()),
            next_connection_id: std::sync::atomic::AtomicU64::new(0),
        })
    }

    pub async fn run(
        self: Arc<Self>,
        mut notifications: mpsc::UnboundedReceiver<ble_orchestrator_domain::NotificationEvent>,
        mut stop: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        let push_server = self.clone();
        let push_task = tokio::spawn(async move {
            while let Some(event) = notifications.recv().await {
                push_server.push_notification(event).await;
            }
        });

        if self.config.use_tcp {
            let addr = format!("{}:{}", self.config.tcp_host, self.config.tcp_port);
            let listener = TcpListener::bind(&addr).await?;
            info!(%addr, "IPC server listening over TCP");
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, _peer) = accepted?;
                        self.clone().spawn_connection(stream);
                    }
                    _ = stop.changed() => { if *stop.borrow() { break; } }
                }
            }
        } else {
            let _ = std::fs::remove_file(&self.config.socket_path);
            let listener = UnixListener::bind(&self.config.socket_path)?;
            info!(path = %self.config.socket_path, "IPC server listening on unix socket");
            loop {
                tokio::select! {
                    accepted = listener.accept() => {
                        let (stream, _peer) = accepted?;
                        self.clone().spawn_connection(stream);
                    }
                    _ = stop.changed() => { if *stop.borrow() { break; } }
                }
            }
            let _ = std::fs::remove_file(&self.config.socket_path);
        }

        push_task.abort();
        Ok(())
    }

    fn spawn_connection<S>(self: Arc<Self>, stream: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let connection_id = self
            .next_connection_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        tokio::spawn(async move {
            self.handle_connection(connection_id, stream).await;
        });
    }

    async fn handle_connection<S>(self: Arc<Self>, connection_id: u64, stream: S)
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
    {
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut lines = BufReader::new(read_half).lines();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();

        let writer_task = tokio::spawn(async move {
            while let Some(line) = outbound_rx.recv().await {
                if write_half.write_all(line.as_bytes()).await.is_err() {
                    break;
                }
                if write_half.write_all(b"\n").await.is_err() {
                    break;
                }
            }
        });

        loop {
            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "error reading IPC connection");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            let response = self.dispatch_line(connection_id, &line, &outbound_tx).await;
            if let Some(response) = response {
                let _ = outbound_tx.send(response.to_string());
            }
        }

        self.drop_connection(connection_id).await;
        drop(outbound_tx);
        let _ = writer_task.await;
    }

    async fn drop_connection(&self, connection_id: u64) {
        let mut subscribers = self.subscribers.lock().await;
        for subs in subscribers.by_callback.values_mut() {
            subs.retain(|(id, _)| *id != connection_id);
        }
        subscribers.by_callback.retain(|_, v| !v.is_empty());
    }

    async fn dispatch_line(&self, connection_id: u64, line: &str, outbound: &OutboundSender) -> Option<Value> {
        let parsed: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(_) => return Some(json!({"status": "error", "error": "Invalid JSON"})),
        };
        let request_id = parsed.get("request_id").and_then(|v| v.as_str()).map(str::to_string);
        let command = parsed.get("command").and_then(|v| v.as_str()).unwrap_or("");

        let mut response = match self.run_command(connection_id, command, &parsed, outbound).await {
            Ok(value) => value,
            Err(error) => json!({"status": "error", "error": error}),
        };
        if let (Some(id), Some(map)) = (request_id, response.as_object_mut()) {
            map.insert("request_id".to_string(), Value::String(id));
        }
        Some(response)
    }

    async fn run_command(
        &self,
        connection_id: u64,
        command: &str,
        body: &Value,
        outbound: &OutboundSender,
    ) -> Result<Value, String> {
        match command {
            "get_status" => Ok(self.service.status_snapshot().await),
            "get_scan_result" => {
                let address = required_address(body)?;
                match self.service.cache_get(&address) {
                    Some(record) => Ok(json!({"status": "success", "data": record_to_json(&record)})),
                    None => Ok(json!({"status": "success", "data": Value::Null})),
                }
            }
            "get_scan_data" => {
                let address = required_address(body)?;
                let service_uuid = optional_uuid(body, "service_uuid")?;
                let request = Request {
                    id: Uuid::new_v4(),
                    address,
                    priority: Priority::Normal,
                    created_at: std::time::Instant::now(),
                    timeout: Duration::from_secs(10),
                    kind: RequestKind::ScanLookup { service_uuid },
                };
                let entry = self.service.enqueue_and_await(request, Duration::from_secs(10)).await?;
                Ok(outcome_to_response(entry))
            }
            "read_sensor" => {
                let request = build_rw_request(body, true)?;
                let request_id = self.service.enqueue(request);
                Ok(json!({"status": "success", "request_id": request_id.to_string()}))
            }
            "send_command" => {
                let request = build_rw_request(body, false)?;
                let timeout = request.timeout;
                let entry = self.service.enqueue_and_await(request, timeout).await?;
                Ok(outcome_to_response(entry))
            }
            "subscribe_notifications" => {
                self.handle_subscribe(connection_id, body, outbound).await
            }
            "get_request_status" => {
                let id = body
                    .get("request_id")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| "missing field: request_id".to_string())?;
                let uuid = Uuid::parse_str(id).map_err(|_| "invalid request_id".to_string())?;
                match self.service.request_status(&uuid) {
                    Some(entry) => Ok(outcome_to_response(entry)),
                    None => Err("unknown request_id".to_string()),
                }
            }
            "get_queue_status" | "get_queue_stats" => Ok(self.service.queue_stats_json()),
            "get_queue_config" => Ok(self.service.queue_config_json()),
            "update_queue_config" => {
                let skip_old = body.get("skip_old_requests").and_then(|v| v.as_bool());
                let max_age = body.get("max_age_sec").and_then(|v| v.as_f64());
                self.service.update_queue_config(skip_old, max_age);
                Ok(json!({"status": "success"}))
            }
            "" => Err("missing field: command".to_string()),
            other => Err(format!("unknown command: {other}")),
        }
    }

    async fn handle_subscribe(&self, connection_id: u64, body: &Value, outbound: &OutboundSender) -> Result<Value, String> {
        let address = required_address(body)?;
        let service_uuid = required_uuid(body, "service_uuid")?;
        let characteristic_uuid = required_uuid(body, "characteristic_uuid")?;
        let callback_id = body
            .get("callback_id")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let unsubscribe = body.get("unsubscribe").and_then(|v| v.as_bool()).unwrap_or(false);

        let kind = if unsubscribe {
            RequestKind::NotifyUnsubscribe {
                service_uuid,
                characteristic_uuid,
                callback_id: callback_id.clone(),
            }
        } else {
            RequestKind::NotifySubscribe {
                service_uuid,
                characteristic_uuid,
                callback_id: callback_id.clone(),
            }
        };
        let request = Request {
            id: Uuid::new_v4(),
            address,
            priority: Priority::Normal,
            created_at: std::time::Instant::now(),
            timeout: Duration::from_secs(10),
            kind,
        };

        self.service
            .enqueue_and_await(request, SUBSCRIBE_COMPLETION_TIMEOUT)
            .await?;

        let mut subscribers = self.subscribers.lock().await;
        let entry = subscribers.by_callback.entry(callback_id.clone()).or_default();
        if unsubscribe {
            entry.retain(|(id, _)| *id != connection_id);
        } else {
            entry.push((connection_id, outbound.clone()));
        }
        Ok(json!({"status": "success", "callback_id": callback_id}))
    }

    async fn push_notification(&self, event: ble_orchestrator_domain::NotificationEvent) {
        let line = json!({
            "type": "notification",
            "callback_id": event.callback_id,
            "mac_address": event.address.to_string(),
            "characteristic_uuid": event.characteristic_uuid.to_string(),
            "value": hex_encode(&event.value),
            "timestamp": event.timestamp,
        })
        .to_string();

        let mut subscribers = self.subscribers.lock().await;
        if let Some(subs) = subscribers.by_callback.get_mut(&event.callback_id) {
            subs.retain(|(_, sender)| sender.send(line.clone()).is_ok());
        }
    }
}

fn required_address(body: &Value) -> Result<ble_orchestrator_domain::Address, String> {
    body.get("mac_address")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "missing field: mac_address".to_string())?
        .parse()
        .map_err(|e: ble_orchestrator_domain::AddressParseError| e.to_string())
}

fn required_uuid(body: &Value, field: &str) -> Result<Uuid, String> {
    let text = body
        .get(field)
        .and_then(|v| v.as_str())
        .ok_or_else(|| format!("missing field: {field}"))?;
    Uuid::parse_str(text).map_err(|_| format!("invalid uuid for field: {field}"))
}

fn optional_uuid(body: &Value, field: &str) -> Result<Option<Uuid>, String> {
    match body.get(field).and_then(|v| v.as_str()) {
        Some(text) => Uuid::parse_str(text)
            .map(Some)
            .map_err(|_| format!("invalid uuid for field: {field}")),
        None => Ok(None),
    }
}

fn parse_write_data(body: &Value) -> Result<Vec<u8>, String> {
    match body.get("data") {
        Some(Value::String(hex_str)) => {
            hex_decode(hex_str).ok_or_else(|| "data must be valid hex".to_string())
        }
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_u64().and_then(|n| u8::try_from(n).ok()))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| "data array must contain bytes 0-255".to_string()),
        _ => Err("missing field: data".to_string()),
    }
}

fn build_rw_request(body: &Value, is_read: bool) -> Result<Request, String> {
    let address = required_address(body)?;
    let service_uuid = required_uuid(body, "service_uuid")?;
    let characteristic_uuid = required_uuid(body, "characteristic_uuid")?;
    let priority = body
        .get("priority")
        .and_then(|v| v.as_str())
        .map(Priority::from_name)
        .unwrap_or(Priority::Normal);
    let timeout = body
        .get("timeout")
        .and_then(|v| v.as_f64())
        .map(Duration::from_secs_f64)
        .unwrap_or(Duration::from_secs(10));

    let kind = if is_read {
        RequestKind::Read {
            service_uuid,
            characteristic_uuid,
        }
    } else {
        RequestKind::Write {
            service_uuid,
            characteristic_uuid,
            data: parse_write_data(body)?,
            ack_required: body
                .get("response_required")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        }
    };

    Ok(Request {
        id: Uuid::new_v4(),
        address,
        priority,
        created_at: std::time::Instant::now(),
        timeout,
        kind,
    })
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<Vec<u8>> {
    if s.len() % 2 != 0 {
        return None;
    }
    (0..s.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&s[i..i + 2], 16).ok())
        .collect()
}

fn record_to_json(record: &ble_orchestrator_domain::AdvertisementRecord) -> Value {
    json!({
        "address": record.address.to_string(),
        "name": record.local_name,
        "rssi": record.rssi,
        "service_uuids": record.service_uuids.iter().map(Uuid::to_string).collect::<Vec<_>>(),
    })
}

/// Maps a finished request's status entry to the IPC success/error envelope
/// (spec §6, §4.8). TIMEOUT/SKIPPED surface as their own status strings so
/// clients can tell "gave up" from "given up on".
fn outcome_to_response(entry: ble_orchestrator_domain::RequestStatusEntry) -> Value {
    match entry.status {
        RequestStatus::Completed => match entry.outcome {
            Some(RequestOutcome::ScanLookup(lookup)) => {
                json!({"status": "success", "data": serde_json::to_value(lookup).unwrap_or(Value::Null)})
            }
            Some(RequestOutcome::Bytes(bytes)) => {
                json!({"status": "success", "data": hex_encode(&bytes)})
            }
            Some(RequestOutcome::None) | None => json!({"status": "success"}),
        },
        RequestStatus::Failed => json!({"status": "error", "error": entry.error.unwrap_or_else(|| "request failed".into())}),
        RequestStatus::Timeout => json!({"status": "error", "error": "request timed out", "request_status": "TIMEOUT"}),
        RequestStatus::Skipped => json!({"status": "error", "error": entry.error.unwrap_or_else(|| "request skipped".into()), "request_status": "SKIPPED"}),
        RequestStatus::Pending | RequestStatus::Processing => {
            json!({"status": "success", "request_status": match entry.status {
                RequestStatus::Pending => "PENDING",
                _ => "PROCESSING",
            }})
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use async_trait::async_trait;
    use ble_orchestrator_domain::{AdapterStatus, RequestOutcome, RequestStatusEntry};
    use ble_orchestrator_driver::mock::MockDriver;
    use ble_orchestrator_driver::BleDriver;

    struct AlwaysUpControl;

    #[async_trait]
    impl crate::watchdog::AdapterControl for AlwaysUpControl {
        async fn reset(&self, _adapter: &str) -> bool {
            true
        }
        async fn restart_service(&self) -> bool {
            true
        }
        async fn adapter_status(&self, _adapter: &str) -> AdapterStatus {
            AdapterStatus::Up
        }
        async fn service_active(&self) -> bool {
            true
        }
    }

    #[test]
    fn hex_round_trips() {
        let bytes = vec![0x00, 0x42, 0xff];
        assert_eq!(hex_decode(&hex_encode(&bytes)).unwrap(), bytes);
    }

    #[test]
    fn hex_decode_rejects_odd_length() {
        assert!(hex_decode("abc").is_none());
    }

    #[test]
    fn parse_write_data_accepts_hex_string_or_byte_array() {
        let from_hex = json!({"data": "0a0b"});
        assert_eq!(parse_write_data(&from_hex).unwrap(), vec![0x0a, 0x0b]);

        let from_array = json!({"data": [1, 2, 3]});
        assert_eq!(parse_write_data(&from_array).unwrap(), vec![1, 2, 3]);

        let missing = json!({});
        assert!(parse_write_data(&missing).is_err());
    }

    #[test]
    fn build_rw_request_defaults_priority_and_timeout() {
        let body = json!({
            "mac_address": "AA:BB:CC:DD:EE:FF",
            "service_uuid": Uuid::new_v4().to_string(),
            "characteristic_uuid": Uuid::new_v4().to_string(),
        });
        let request = build_rw_request(&body, true).unwrap();
        assert_eq!(request.priority, Priority::Normal);
        assert_eq!(request.timeout, Duration::from_secs(10));
        assert!(matches!(request.kind, RequestKind::Read { .. }));
    }

    #[test]
    fn outcome_to_response_maps_completed_bytes_to_hex() {
        let mut entry = RequestStatusEntry::pending();
        entry.status = RequestStatus::Completed;
        entry.outcome = Some(RequestOutcome::Bytes(vec![0x42]));
        let response = outcome_to_response(entry);
        assert_eq!(response["status"], "success");
        assert_eq!(response["data"], "42");
    }

    #[test]
    fn outcome_to_response_surfaces_timeout_as_error() {
        let mut entry = RequestStatusEntry::pending();
        entry.status = RequestStatus::Timeout;
        let response = outcome_to_response(entry);
        assert_eq!(response["status"], "error");
        assert_eq!(response["request_status"], "TIMEOUT");
    }

    #[test]
    fn required_address_rejects_malformed_mac() {
        let body = json!({"mac_address": "not-a-mac"});
        assert!(required_address(&body).is_err());
    }

    /// Regression test for spec.md's `read_sensor` contract: it enqueues and
    /// replies immediately with a pollable `request_id`, unlike
    /// `send_command`, which awaits completion before replying.
    #[tokio::test]
    async fn read_sensor_replies_immediately_with_a_pollable_request_id() {
        let driver: Arc<dyn BleDriver> = Arc::new(MockDriver::new("hci0"));
        let config = Arc::new(Config {
            scan_interval: Duration::from_millis(5),
            ..Config::from_env()
        });
        let (service, _events) = Service::new(
            config.clone(),
            driver.clone(),
            driver,
            Box::new(AlwaysUpControl),
        )
        .await
        .expect("scanner should start against the mock driver");
        let ipc = IpcServer::new(config, service.clone());
        let (outbound_tx, _outbound_rx) = mpsc::unbounded_channel();

        let body = json!({
            "mac_address": "AA:BB:CC:DD:EE:FF",
            "service_uuid": Uuid::new_v4().to_string(),
            "characteristic_uuid": Uuid::new_v4().to_string(),
        });
        let response = ipc
            .run_command(0, "read_sensor", &body, &outbound_tx)
            .await
            .unwrap();

        assert_eq!(response["status"], "success");
        let request_id = response["request_id"].as_str().expect("request_id should be present");
        let uuid = Uuid::parse_str(request_id).expect("request_id should be a uuid");
        assert!(service.request_status(&uuid).is_some());

        service.shutdown().await;
    }
}
