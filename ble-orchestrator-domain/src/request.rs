use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde::Serialize;
use uuid::Uuid;

use crate::address::Address;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High = 0,
    Normal = 1,
    Low = 2,
}

impl Priority {
    pub fn from_name(name: &str) -> Priority {
        match name.to_ascii_uppercase().as_str() {
            "HIGH" => Priority::High,
            "LOW" => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
    Skipped,
}

/// Kind-specific fields of a request. Header fields (`id`, `address`,
/// `priority`, `created_at`, `timeout`) are common to every variant and
/// live on [`Request`] itself, matching spec's tagged-variant-with-common-
/// header shape rather than one flat struct per command.
#[derive(Debug, Clone)]
pub enum RequestKind {
    ScanLookup {
        service_uuid: Option<Uuid>,
    },
    Read {
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
    },
    Write {
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        data: Vec<u8>,
        ack_required: bool,
    },
    NotifySubscribe {
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        callback_id: String,
    },
    NotifyUnsubscribe {
        service_uuid: Uuid,
        characteristic_uuid: Uuid,
        callback_id: String,
    },
}

impl RequestKind {
    pub fn is_scan_lookup(&self) -> bool {
        matches!(self, RequestKind::ScanLookup { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestKind::ScanLookup { .. } => "SCAN_LOOKUP",
            RequestKind::Read { .. } => "READ",
            RequestKind::Write { .. } => "WRITE",
            RequestKind::NotifySubscribe { .. } => "NOTIFY_SUBSCRIBE",
            RequestKind::NotifyUnsubscribe { .. } => "NOTIFY_UNSUBSCRIBE",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    pub id: Uuid,
    pub address: Address,
    pub priority: Priority,
    pub created_at: Instant,
    pub timeout: Duration,
    pub kind: RequestKind,
}

impl Request {
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }
}

/// Scan-lookup result serialised back to a client. `error` carries the
/// cache-miss case as a successful-but-empty lookup (spec §4.4): absence
/// of a cached advertisement is a normal outcome, not a request failure.
#[derive(Debug, Clone, Serialize)]
pub struct ScanLookupResponse {
    pub address: Address,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rssi: Option<i16>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub service_uuids: Vec<Uuid>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub manufacturer_data: HashMap<String, Vec<u8>>,
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub service_data: HashMap<Uuid, Vec<u8>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ScanLookupResponse {
    pub fn not_found(address: Address) -> Self {
        ScanLookupResponse {
            error: Some(format!(
                "Device {address} not found or scan data expired"
            )),
            address,
            name: None,
            rssi: None,
            service_uuids: Vec::new(),
            manufacturer_data: HashMap::new(),
            service_data: HashMap::new(),
        }
    }
}

/// The payload a completed/failed request carries back to its caller.
/// Kept as a small closed enum rather than a raw JSON value so the
/// dispatch code in the handler stays type-checked past the IPC parse
/// boundary; only the IPC layer converts this to wire JSON.
#[derive(Debug, Clone)]
pub enum RequestOutcome {
    ScanLookup(ScanLookupResponse),
    Bytes(Vec<u8>),
    None,
}

/// Mutable status of an in-flight or recently finished request, tracked
/// by [`crate::Priority`]-independent id in the queue's active table.
#[derive(Debug, Clone)]
pub struct RequestStatusEntry {
    pub status: RequestStatus,
    pub error: Option<String>,
    pub outcome: Option<RequestOutcome>,
    pub finished_at: Option<Instant>,
}

impl RequestStatusEntry {
    pub fn pending() -> Self {
        RequestStatusEntry {
            status: RequestStatus::Pending,
            error: None,
            outcome: None,
            finished_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            RequestStatus::Completed
                | RequestStatus::Failed
                | RequestStatus::Timeout
                | RequestStatus::Skipped
        )
    }
}
