//! ==============================================================================
//! registry.rs - known devices and the discovery scan permit
//! ==============================================================================
//!
//! purpose:
//!     single owner of the coordination state shared by bootstrap, the refresh
//!     loop and manual connects:
//!     - the authoritative list of registered devices
//!     - the "one discovery scan at a time" permit
//!
//! scan policy:
//!     callers WAIT for an in-flight scan to finish (`acquire_scan`). the permit
//!     is released when the `ScanPermit` is dropped, so an early return or a
//!     cancelled scan cannot leave it held. `try_acquire_scan` exists for callers
//!     that only want to probe.
//!
//! locking:
//!     both primitives live here and nowhere else. the order is always scan
//!     permit, then device list: a scan holds the permit and takes short read
//!     locks (`contains`), the merge after it takes the write lock once the
//!     permit is gone. no path takes the permit while holding the device list,
//!     so the two cannot deadlock, and a scan in flight never stalls lookups.
//!
//! session read loops never touch either lock.
//!
//! ==============================================================================

use crate::domain::{DeviceId, DeviceIdentity, RegisteredDevice};
use serde::Serialize;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Held for the duration of one discovery scan
#[derive(Debug)]
pub struct ScanPermit {
    _guard: OwnedMutexGuard<()>,
}

impl ScanPermit {
    /// Explicit release; dropping the permit does the same
    pub fn release(self) {}
}

/// A registered device whose network address moved
#[derive(Debug, Clone, Serialize)]
pub struct AddressChange {
    pub device_id: DeviceId,
    pub old: Option<IpAddr>,
    pub new: IpAddr,
}

pub struct Registry {
    devices: RwLock<Vec<RegisteredDevice>>,
    scan_gate: Arc<Mutex<()>>,
}

impl Registry {
    pub fn new(devices: Vec<RegisteredDevice>) -> Self {
        Self {
            devices: RwLock::new(devices),
            scan_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Replace the device list (bootstrap reload)
    pub async fn replace(&self, devices: Vec<RegisteredDevice>) {
        *self.devices.write().await = devices;
    }

    pub async fn all(&self) -> Vec<RegisteredDevice> {
        self.devices.read().await.clone()
    }

    pub async fn get(&self, id: DeviceId) -> Option<RegisteredDevice> {
        self.devices.read().await.iter().find(|d| d.id == id).cloned()
    }

    /// Whether an identity is already registered (structural equality)
    pub async fn contains(&self, identity: &DeviceIdentity) -> bool {
        self.devices
            .read()
            .await
            .iter()
            .any(|d| d.identity.same_device(identity))
    }

    /// Find a registered device by physical address, then by network address
    pub async fn lookup(&self, query: &DeviceIdentity) -> Option<RegisteredDevice> {
        let devices = self.devices.read().await;
        if let Some(mac) = &query.mac {
            if let Some(found) = devices.iter().find(|d| d.identity.mac.as_ref() == Some(mac)) {
                return Some(found.clone());
            }
        }
        let ip = query.ip?;
        devices.iter().find(|d| d.identity.ip == Some(ip)).cloned()
    }

    /// Fold discovered addresses into the registry.
    ///
    /// Matches on physical address; identities without one cannot be matched.
    pub async fn merge_addresses(&self, found: &[DeviceIdentity]) -> Vec<AddressChange> {
        let mut devices = self.devices.write().await;
        let mut changes = Vec::new();

        for discovered in found {
            let (Some(mac), Some(new_ip)) = (&discovered.mac, discovered.ip) else {
                continue;
            };
            for device in devices.iter_mut().filter(|d| d.identity.mac.as_ref() == Some(mac)) {
                if device.identity.ip == Some(new_ip) {
                    continue;
                }
                changes.push(AddressChange {
                    device_id: device.id,
                    old: device.identity.ip,
                    new: new_ip,
                });
                device.identity.ip = Some(new_ip);
            }
        }

        changes
    }

    /// Wait until no scan is in flight, then take the permit
    pub async fn acquire_scan(&self) -> ScanPermit {
        ScanPermit {
            _guard: self.scan_gate.clone().lock_owned().await,
        }
    }

    /// Take the permit only if no scan is in flight
    pub fn try_acquire_scan(&self) -> Option<ScanPermit> {
        self.scan_gate
            .clone()
            .try_lock_owned()
            .ok()
            .map(|guard| ScanPermit { _guard: guard })
    }

    pub fn is_scanning(&self) -> bool {
        self.scan_gate.try_lock().is_err()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::AddressingMode;
    use std::time::Duration;

    fn device(id: u64, ip: Option<&str>, mac: Option<&str>) -> RegisteredDevice {
        RegisteredDevice {
            id: DeviceId(id),
            identity: DeviceIdentity {
                mac: mac.map(String::from),
                ip: ip.map(|s| s.parse().unwrap()),
                addressing: AddressingMode::Dynamic,
                manual_start: false,
            },
        }
    }

    #[tokio::test]
    async fn test_lookup_by_either_address() {
        let registry = Registry::new(vec![
            device(1, Some("10.0.0.1"), Some("AA")),
            device(2, Some("10.0.0.2"), None),
        ]);

        let by_mac = DeviceIdentity::new(None, Some("AA".into()));
        assert_eq!(registry.lookup(&by_mac).await.unwrap().id, DeviceId(1));

        let by_ip = DeviceIdentity::new(Some("10.0.0.2".parse().unwrap()), None);
        assert_eq!(registry.lookup(&by_ip).await.unwrap().id, DeviceId(2));

        let unknown = DeviceIdentity::new(None, Some("ZZ".into()));
        assert!(registry.lookup(&unknown).await.is_none());
    }

    #[tokio::test]
    async fn test_contains_uses_structural_equality() {
        let registry = Registry::new(vec![device(1, None, Some("AA"))]);

        assert!(registry.contains(&DeviceIdentity::new(None, Some("AA".into()))).await);
        // same mac but an address now known: a different identity
        let resolved = DeviceIdentity::new(Some("10.0.0.1".parse().unwrap()), Some("AA".into()));
        assert!(!registry.contains(&resolved).await);
    }

    #[tokio::test]
    async fn test_merge_addresses_reports_changes() {
        let registry = Registry::new(vec![
            device(1, None, Some("AA")),
            device(2, Some("10.0.0.2"), Some("BB")),
        ]);
        let found = vec![
            DeviceIdentity::new(Some("10.0.0.1".parse().unwrap()), Some("AA".into())),
            DeviceIdentity::new(Some("10.0.0.2".parse().unwrap()), Some("BB".into())),
            DeviceIdentity::new(Some("10.0.0.3".parse().unwrap()), None),
        ];

        let changes = registry.merge_addresses(&found).await;
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].device_id, DeviceId(1));
        assert_eq!(changes[0].old, None);
        assert_eq!(
            registry.get(DeviceId(1)).await.unwrap().identity.ip,
            Some("10.0.0.1".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_device_list_usable_while_scan_in_flight() {
        let registry = Registry::new(vec![device(1, None, Some("AA"))]);
        let permit = registry.acquire_scan().await;

        let found = vec![DeviceIdentity::new(
            Some("10.0.0.1".parse().unwrap()),
            Some("AA".into()),
        )];
        let within = Duration::from_millis(200);
        let changes = tokio::time::timeout(within, registry.merge_addresses(&found))
            .await
            .unwrap();
        assert_eq!(changes.len(), 1);

        let by_mac = DeviceIdentity::new(None, Some("AA".into()));
        let looked_up = tokio::time::timeout(within, registry.lookup(&by_mac))
            .await
            .unwrap();
        assert_eq!(looked_up.unwrap().id, DeviceId(1));
        assert!(registry.is_scanning());
        permit.release();
    }

    #[tokio::test]
    async fn test_scan_permit_is_exclusive() {
        let registry = Arc::new(Registry::default());

        let permit = registry.acquire_scan().await;
        assert!(registry.is_scanning());
        assert!(registry.try_acquire_scan().is_none());

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move {
                let _permit = registry.acquire_scan().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        permit.release();
        waiter.await.unwrap();
        assert!(!registry.is_scanning());
        assert!(registry.try_acquire_scan().is_some());
    }
}
