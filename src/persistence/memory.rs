//! In-memory gateway

use super::PersistenceGateway;
use crate::domain::{DeviceId, Reading, RegisteredDevice};
use crate::error::{Error, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct MemoryGateway {
    devices: RwLock<Vec<RegisteredDevice>>,
    readings: RwLock<Vec<Reading>>,
    /// size of every append call, in call order
    batch_sizes: RwLock<Vec<usize>>,
}

impl MemoryGateway {
    pub fn with_devices(devices: Vec<RegisteredDevice>) -> Self {
        Self {
            devices: RwLock::new(devices),
            ..Default::default()
        }
    }

    pub async fn devices(&self) -> Vec<RegisteredDevice> {
        self.devices.read().await.clone()
    }

    pub async fn readings(&self) -> Vec<Reading> {
        self.readings.read().await.clone()
    }

    pub async fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.read().await.clone()
    }
}

#[async_trait]
impl PersistenceGateway for MemoryGateway {
    async fn load_devices(&self) -> Result<Vec<RegisteredDevice>> {
        Ok(self.devices.read().await.clone())
    }

    async fn append_readings(&self, batch: &[Reading]) -> Result<()> {
        // one lock order for both so concurrent sessions interleave per batch
        let mut readings = self.readings.write().await;
        let mut sizes = self.batch_sizes.write().await;
        readings.extend_from_slice(batch);
        sizes.push(batch.len());
        Ok(())
    }

    async fn upsert_address_binding(&self, device: &RegisteredDevice) -> Result<()> {
        let mut devices = self.devices.write().await;
        let stored = devices
            .iter_mut()
            .find(|d| d.id == device.id)
            .ok_or_else(|| Error::NotFound(format!("device {}", device.id)))?;
        stored.identity.ip = device.identity.ip;
        Ok(())
    }

    async fn query_readings(&self, device: DeviceId, from: i64, to: i64) -> Result<Vec<Reading>> {
        let mut found: Vec<Reading> = self
            .readings
            .read()
            .await
            .iter()
            .filter(|r| r.device_id == device && r.epoch >= from && r.epoch <= to)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.epoch);
        Ok(found)
    }
}
