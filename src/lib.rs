//! ==============================================================================
//! sensor_host - network sensor telemetry host
//! ==============================================================================
//!
//! purpose:
//!     finds sensors announcing themselves over udp, keeps one tcp telemetry
//!     session per sensor, batches readings into storage and lets an operator
//!     connect, disconnect and retune sensors.
//!
//! layout:
//!     - domain.rs       identities, readings, wire records
//!     - registry.rs     known devices + discovery scan permit
//!     - discovery.rs    udp announcement scan
//!     - session/        per-device streaming task (framing, batching)
//!     - manager.rs      bootstrap, manual control, refresh, shutdown
//!     - notify.rs       disconnect / status notifications
//!     - persistence/    storage gateway (mysql or in-memory)
//!     - api.rs          operator http api
//!     - config.rs       host.toml
//!
//! ==============================================================================

pub mod api;
pub mod config;
pub mod discovery;
pub mod domain;
pub mod error;
pub mod manager;
pub mod notify;
pub mod persistence;
pub mod registry;
pub mod session;

pub use error::{Error, Result};
