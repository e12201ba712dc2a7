pub mod backend_sync;
pub mod credential;
#[cfg(feature = "modbus")]
pub mod hal_modbus;
pub mod metrics;
pub mod protocol;
pub mod resolver;
pub mod retry;
pub mod store;

pub use backend_sync::{
    BackendSync, DropReason, PublishError, SyncConfig, SyncHandle, SyncObserver, SyncOutcome,
    SyncStats, SyncStatsSnapshot,
};
pub use credential::{BearerToken, CredentialError, DEFAULT_TOKEN_ENV};
#[cfg(feature = "modbus")]
pub use hal_modbus::{ModbusAdapter, RegisterAddress};
pub use metrics::{init_metrics, serve_metrics, StatusEndpoint};
pub use protocol::{idempotency_key, CatalogEntry, IngestAck, IngestRecord};
pub use resolver::{TagResolutionError, TagResolver};
pub use retry::{RetryFailure, RetryPolicy};
pub use store::{FailurePoint, HttpRemoteStore, MemoryStore, RemoteStore, StoreError};
