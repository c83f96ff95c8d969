use std::time::Instant;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AdapterStatus {
    Up,
    Down,
    Missing,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct AdapterState {
    pub name: String,
    pub status: AdapterStatus,
    pub last_check: Instant,
}

impl AdapterState {
    pub fn new(name: impl Into<String>) -> Self {
        AdapterState {
            name: name.into(),
            status: AdapterStatus::Unknown,
            last_check: Instant::now(),
        }
    }
}
