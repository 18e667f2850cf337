//! ==============================================================================
//! persistence - the storage gateway sessions flush into
//! ==============================================================================
//!
//! purpose:
//!     storage is an external collaborator. the core only needs:
//!     - the registered device list at startup
//!     - append a batch of readings
//!     - upsert a device's address binding
//!     - range-query readings for one device
//!
//! implementations:
//!     - memory.rs: in-process store, seeded from [[devices]] in host.toml
//!     - mysql.rs:  sqlx-backed store used when [storage] database_url is set
//!
//! concurrent append calls from different sessions are the gateway's problem;
//! both implementations serialize them internally.
//!
//! ==============================================================================

mod memory;
mod mysql;

pub use memory::MemoryGateway;
pub use mysql::MySqlGateway;

use crate::domain::{DeviceId, Reading, RegisteredDevice};
use crate::error::Result;
use async_trait::async_trait;

#[async_trait]
pub trait PersistenceGateway: Send + Sync {
    /// Every registered device (registry bootstrap)
    async fn load_devices(&self) -> Result<Vec<RegisteredDevice>>;

    /// Store one batch, in order
    async fn append_readings(&self, batch: &[Reading]) -> Result<()>;

    /// Record the device's current network address
    async fn upsert_address_binding(&self, device: &RegisteredDevice) -> Result<()>;

    /// Readings for one device with `from <= epoch <= to`, oldest first
    async fn query_readings(&self, device: DeviceId, from: i64, to: i64) -> Result<Vec<Reading>>;
}
