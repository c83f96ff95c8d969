use std::collections::HashSet;

use uuid::Uuid;

use crate::address::Address;

/// A standing notification subscription. One `Subscription` exists per
/// `(address, characteristic)`; `subscribers` holds every callback_id
/// currently interested so a single peripheral connection can serve many
/// IPC clients subscribed to the same characteristic.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub address: Address,
    pub characteristic_uuid: Uuid,
    pub subscribers: HashSet<String>,
}

/// A notification emitted by the radio driver, forwarded to the IPC layer
/// for delivery to every subscriber of `callback_id`.
#[derive(Debug, Clone)]
pub struct NotificationEvent {
    pub callback_id: String,
    pub address: Address,
    pub characteristic_uuid: Uuid,
    pub value: Vec<u8>,
    pub timestamp: f64,
}
