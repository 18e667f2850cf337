//! ==============================================================================
//! discovery.rs - udp broadcast discovery
//! ==============================================================================
//!
//! purpose:
//!     sensors broadcast {"ip", "mac"} on udp port 5506 every few seconds.
//!     a scan binds that port for a bounded time and collects announcements.
//!
//! rules:
//!     - one scan at a time (registry scan permit; second caller waits)
//!     - a malformed datagram fails the scan, not the service
//!     - include_known = false drops identities already registered
//!       (first discovery); true returns everything (dhcp refresh)
//!
//! ==============================================================================

use crate::domain::{Announcement, DeviceIdentity};
use crate::error::Result;
use crate::registry::Registry;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Well-known discovery port of the sensor firmware
pub const DISCOVERY_PORT: u16 = 5506;

const MAX_DATAGRAM_SIZE: usize = 1500;

pub struct DiscoveryListener {
    registry: Arc<Registry>,
    bind_addr: SocketAddr,
}

impl DiscoveryListener {
    pub fn new(registry: Arc<Registry>, bind_addr: SocketAddr) -> Self {
        Self { registry, bind_addr }
    }

    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    /// Listen for announcements until `timeout` elapses or `cancel` fires.
    pub async fn scan(
        &self,
        include_known: bool,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Vec<DeviceIdentity>> {
        let permit = self.registry.acquire_scan().await;
        tracing::debug!(bind = %self.bind_addr, include_known, ?timeout, "Discovery scan started");

        let socket = UdpSocket::bind(self.bind_addr).await?;
        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        let mut found: Vec<DeviceIdentity> = Vec::new();
        let mut seen = HashSet::new();

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                r = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)) => r,
            };
            let (len, from) = match received {
                Err(_elapsed) => break,
                Ok(r) => r?,
            };

            let identity = Announcement::decode(&buf[..len]).map_err(|e| {
                tracing::warn!(from = %from, error = %e, "Malformed discovery datagram");
                e
            })?;

            if !seen.insert(identity.key()) {
                continue;
            }
            if !include_known && self.registry.contains(&identity).await {
                continue;
            }
            tracing::debug!(from = %from, address = %identity.address(), "Sensor announced");
            found.push(identity);
        }

        drop(socket);
        permit.release();
        tracing::info!(count = found.len(), include_known, "Discovery scan finished");
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DeviceId, RegisteredDevice};
    use crate::error::Error;

    /// Reserve a free loopback port for the listener to bind
    fn free_port() -> SocketAddr {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.local_addr().unwrap()
    }

    async fn announce_after(addr: SocketAddr, delay: Duration, payloads: Vec<&'static str>) {
        tokio::time::sleep(delay).await;
        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for payload in payloads {
            sender.send_to(payload.as_bytes(), addr).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_scan_collects_and_dedups() {
        let addr = free_port();
        let listener = DiscoveryListener::new(Arc::new(Registry::default()), addr);

        let sender = tokio::spawn(announce_after(
            addr,
            Duration::from_millis(100),
            vec![
                r#"{"ip":"10.0.0.7","mac":"AA"}"#,
                r#"{"ip":"10.0.0.7","mac":"AA"}"#,
                r#"{"ip":"10.0.0.8","mac":"BB"}"#,
            ],
        ));

        let found = listener
            .scan(true, Duration::from_millis(500), &CancellationToken::new())
            .await
            .unwrap();
        sender.await.unwrap();

        assert_eq!(found.len(), 2);
        assert_eq!(found[0].mac.as_deref(), Some("AA"));
    }

    #[tokio::test]
    async fn test_known_devices_dropped_unless_refreshing() {
        let addr = free_port();
        let known = DeviceIdentity::new(Some("10.0.0.7".parse().unwrap()), Some("AA".into()));
        let registry = Arc::new(Registry::new(vec![RegisteredDevice {
            id: DeviceId(1),
            identity: known,
        }]));
        let listener = DiscoveryListener::new(registry, addr);
        let payload: &'static str = r#"{"ip":"10.0.0.7","mac":"AA"}"#;

        let sender = tokio::spawn(announce_after(addr, Duration::from_millis(100), vec![payload]));
        let first = listener
            .scan(false, Duration::from_millis(400), &CancellationToken::new())
            .await
            .unwrap();
        sender.await.unwrap();
        assert!(first.is_empty());

        let sender = tokio::spawn(announce_after(addr, Duration::from_millis(100), vec![payload]));
        let refresh = listener
            .scan(true, Duration::from_millis(400), &CancellationToken::new())
            .await
            .unwrap();
        sender.await.unwrap();
        assert_eq!(refresh.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_datagram_fails_the_scan() {
        let addr = free_port();
        let registry = Arc::new(Registry::default());
        let listener = DiscoveryListener::new(registry.clone(), addr);

        let sender = tokio::spawn(announce_after(addr, Duration::from_millis(100), vec!["not json"]));
        let result = listener
            .scan(true, Duration::from_secs(2), &CancellationToken::new())
            .await;
        sender.await.unwrap();

        assert!(matches!(result, Err(Error::ProtocolDecode(_))));
        // the permit was released on the error path
        assert!(!registry.is_scanning());
    }

    #[tokio::test]
    async fn test_overlapping_scans_run_one_after_another() {
        let addr = free_port();
        let listener = Arc::new(DiscoveryListener::new(Arc::new(Registry::default()), addr));
        let window = Duration::from_millis(300);
        let started = Instant::now();

        let first = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.scan(true, window, &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        let second = {
            let listener = listener.clone();
            tokio::spawn(async move { listener.scan(true, window, &CancellationToken::new()).await })
        };
        announce_after(addr, Duration::from_millis(80), vec![r#"{"ip":"10.0.0.9","mac":"CC"}"#]).await;

        // a second bind on the same port would have failed with AddrInUse
        let first = first.await.unwrap().unwrap();
        let second = second.await.unwrap().unwrap();

        assert_eq!(first.len(), 1);
        assert!(second.is_empty());
        assert!(started.elapsed() >= window * 2);
    }

    #[tokio::test]
    async fn test_cancel_ends_scan_early() {
        let addr = free_port();
        let listener = DiscoveryListener::new(Arc::new(Registry::default()), addr);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let found = listener.scan(true, Duration::from_secs(10), &cancel).await.unwrap();
        assert!(found.is_empty());
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
