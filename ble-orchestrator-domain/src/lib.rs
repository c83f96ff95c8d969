pub mod adapter;
pub mod address;
pub mod exclusion;
pub mod record;
pub mod request;
pub mod stats;
pub mod subscription;

pub use adapter::{AdapterState, AdapterStatus};
pub use address::{Address, AddressParseError};
pub use exclusion::ExclusionSnapshot;
pub use record::AdvertisementRecord;
pub use request::{
    Priority, Request, RequestKind, RequestOutcome, RequestStatus, RequestStatusEntry,
    ScanLookupResponse,
};
pub use stats::{QueueConfig, QueueStats};
pub use subscription::{NotificationEvent, Subscription};
