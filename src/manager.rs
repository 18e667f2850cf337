//! ==============================================================================
//! manager.rs - owns every device session
//! ==============================================================================
//!
//! purpose:
//!     - bootstrap: load the registry, resolve missing addresses, start the
//!       automatic sessions
//!     - manual connect / disconnect / interval change for operators
//!     - periodic discovery refresh to follow dhcp reassignments
//!     - orderly shutdown (refresh task joined, every session flushed)
//!
//! no automatic reconnect: a session that fails stays failed until someone
//! calls `connect_manual` again.
//!
//! ==============================================================================

use crate::config::HostConfig;
use crate::discovery::DiscoveryListener;
use crate::domain::{
    AddressingMode, DeviceId, DeviceIdentity, Reading, RegisteredDevice, SessionState,
};
use crate::error::{Error, Result};
use crate::notify::{NotificationSink, Severity};
use crate::persistence::PersistenceGateway;
use crate::registry::{AddressChange, Registry};
use crate::session::{SessionHandle, SessionStatus, StatusSnapshot, StreamingSession};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Registry row plus its session status, for the api
#[derive(Debug, Clone, Serialize)]
pub struct DeviceView {
    #[serde(flatten)]
    pub device: RegisteredDevice,
    pub session: Option<StatusSnapshot>,
}

pub struct SessionManager {
    config: HostConfig,
    registry: Arc<Registry>,
    discovery: DiscoveryListener,
    gateway: Arc<dyn PersistenceGateway>,
    sink: Arc<dyn NotificationSink>,
    sessions: Mutex<HashMap<DeviceId, SessionHandle>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl SessionManager {
    pub fn new(
        config: HostConfig,
        gateway: Arc<dyn PersistenceGateway>,
        sink: Arc<dyn NotificationSink>,
    ) -> Self {
        let registry = Arc::new(Registry::default());
        let discovery = DiscoveryListener::new(registry.clone(), config.discovery.bind_addr());
        Self {
            config,
            registry,
            discovery,
            gateway,
            sink,
            sessions: Mutex::new(HashMap::new()),
            refresh_task: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn gateway(&self) -> &Arc<dyn PersistenceGateway> {
        &self.gateway
    }

    // ==========================================================================
    // boot
    // ==========================================================================

    /// Load devices, resolve missing addresses once, start automatic sessions.
    pub async fn bootstrap(&self) -> Result<()> {
        let devices = self.gateway.load_devices().await?;
        tracing::info!(count = devices.len(), "Loaded registered sensors");
        self.registry.replace(devices).await;

        let automatic: Vec<RegisteredDevice> = self
            .registry
            .all()
            .await
            .into_iter()
            .filter(|d| !d.identity.manual_start)
            .collect();

        if automatic.iter().any(|d| d.identity.ip.is_none()) {
            match self.resolve_addresses(false).await {
                Ok(changes) => {
                    tracing::info!(resolved = changes.len(), "Resolved sensor addresses at startup")
                }
                Err(e) => tracing::warn!(error = %e, "Startup discovery failed"),
            }
        }

        for device in self.registry.all().await {
            if device.identity.manual_start {
                continue;
            }
            if device.identity.ip.is_none() {
                self.sink.on_status_message(
                    &format!("No address found for sensor {}", device.identity.address()),
                    Severity::Warning,
                );
                continue;
            }
            self.start_session(device, self.config.stream.bootstrap_batch).await;
        }
        Ok(())
    }

    /// One discovery scan folded into the registry
    pub async fn resolve_addresses(&self, include_known: bool) -> Result<Vec<AddressChange>> {
        let found = self.discover(include_known).await?;
        Ok(self.registry.merge_addresses(&found).await)
    }

    /// Raw scan, as operators see it
    pub async fn discover(&self, include_known: bool) -> Result<Vec<DeviceIdentity>> {
        self.discovery
            .scan(include_known, self.config.discovery.scan_timeout(), &self.shutdown)
            .await
    }

    // ==========================================================================
    // operator actions
    // ==========================================================================

    /// Start (or attach to) a device's session on operator request.
    pub async fn connect_manual(&self, identity: &DeviceIdentity) -> Result<DeviceId> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let known = self.registry.lookup(identity).await;
        let needs_resolution = match &known {
            Some(device) => device.identity.ip.is_none(),
            None => identity.ip.is_none(),
        };

        let mut changes = Vec::new();
        if needs_resolution {
            changes = self.resolve_addresses(true).await?;
        }

        let device = self
            .registry
            .lookup(identity)
            .await
            .ok_or_else(|| Error::NotFound(format!("sensor {}", identity.address())))?;
        if device.identity.ip.is_none() {
            return Err(Error::AddressUnresolved(device.identity.address()));
        }

        let learned = changes.iter().any(|c| c.device_id == device.id);
        if learned && device.identity.addressing == AddressingMode::Static {
            self.gateway.upsert_address_binding(&device).await?;
            tracing::info!(device_id = %device.id, address = %device.identity.address(), "Persisted static address");
        }

        let id = device.id;
        self.start_session(device, self.config.stream.manual_batch).await;
        Ok(id)
    }

    /// Stop a device's session and wait for its final flush. Idempotent.
    pub async fn disconnect_manual(&self, identity: &DeviceIdentity) -> Result<()> {
        let device = self
            .registry
            .lookup(identity)
            .await
            .ok_or_else(|| Error::NotFound(format!("sensor {}", identity.address())))?;

        let handle = self.sessions.lock().await.remove(&device.id);
        if let Some(handle) = handle {
            handle.shutdown().await;
            tracing::info!(device_id = %device.id, "Sensor disconnected by operator");
        }
        Ok(())
    }

    /// Ask a streaming device for a new sampling interval.
    ///
    /// Without a streaming session this is a warning, not a fault, and
    /// nothing is sent.
    pub async fn change_interval(&self, identity: &DeviceIdentity, interval: u32) -> Result<()> {
        let device = self
            .registry
            .lookup(identity)
            .await
            .ok_or_else(|| Error::NotFound(format!("sensor {}", identity.address())))?;

        // the reply waits on the session task; never hold the map across it
        let control = self
            .sessions
            .lock()
            .await
            .get(&device.id)
            .map(SessionHandle::control);
        let result = match control {
            Some(control) => control.change_interval(interval).await,
            None => Err(Error::IntervalChangeRejected(device.identity.address())),
        };

        match &result {
            Ok(()) => self.sink.on_status_message(
                &format!("Interval change to {}s sent to {}", interval, device.identity.address()),
                Severity::Info,
            ),
            Err(e @ Error::IntervalChangeRejected(_)) => {
                self.sink.on_status_message(
                    &format!("Sensor {} is not connected", device.identity.address()),
                    e.severity(),
                );
            }
            Err(_) => {}
        }
        result
    }

    // ==========================================================================
    // sessions
    // ==========================================================================

    async fn start_session(&self, device: RegisteredDevice, batch_capacity: usize) {
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&device.id) {
            if !existing.is_finished() {
                tracing::debug!(device_id = %device.id, "Session already running");
                return;
            }
        }
        // a finished handle has nothing left to flush
        sessions.remove(&device.id);

        let settings = self.config.session_settings(batch_capacity);
        let status = Arc::new(SessionStatus::new(settings.initial_interval));
        if device.identity.ip.is_some() {
            status.set_state(SessionState::Connecting).await;
        }

        let id = device.id;
        let handle = StreamingSession::spawn(
            device,
            settings,
            status,
            self.gateway.clone(),
            self.sink.clone(),
            self.shutdown.child_token(),
        );
        sessions.insert(id, handle);
    }

    pub async fn session_state(&self, id: DeviceId) -> Option<SessionState> {
        let status = self.sessions.lock().await.get(&id).map(|h| h.status().clone())?;
        Some(status.state().await)
    }

    /// Every registered device with its session status
    pub async fn snapshot(&self) -> Vec<DeviceView> {
        let statuses: HashMap<DeviceId, Arc<SessionStatus>> = self
            .sessions
            .lock()
            .await
            .iter()
            .map(|(id, h)| (*id, h.status().clone()))
            .collect();

        let mut views = Vec::new();
        for device in self.registry.all().await {
            let session = match statuses.get(&device.id) {
                Some(status) => Some(status.snapshot().await),
                None => None,
            };
            views.push(DeviceView { device, session });
        }
        views
    }

    /// Stored readings for one device, `from..=to` epoch seconds
    pub async fn query_readings(&self, id: DeviceId, from: i64, to: i64) -> Result<Vec<Reading>> {
        if self.registry.get(id).await.is_none() {
            return Err(Error::NotFound(format!("device {}", id)));
        }
        self.gateway.query_readings(id, from, to).await
    }

    // ==========================================================================
    // refresh + shutdown
    // ==========================================================================

    /// Re-run discovery every `refresh_interval` to follow dhcp changes.
    ///
    /// Runs on its own task and only touches the registry, never a session.
    pub async fn spawn_refresh(self: &Arc<Self>) {
        let period = self.config.discovery.refresh_interval();
        let shutdown = self.shutdown.clone();
        let manager: Weak<Self> = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // first tick fires immediately; bootstrap already scanned
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(manager) = manager.upgrade() else { break };
                match manager.resolve_addresses(true).await {
                    Ok(changes) => {
                        for change in &changes {
                            tracing::info!(
                                device_id = %change.device_id,
                                old = ?change.old,
                                new = %change.new,
                                "Sensor address changed"
                            );
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Discovery refresh failed"),
                }
            }
            tracing::debug!("Discovery refresh stopped");
        });

        *self.refresh_task.lock().await = Some(task);
    }

    /// Stop refreshing, cancel every session and wait for their flushes.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();

        if let Some(task) = self.refresh_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Refresh task panicked");
            }
        }

        let handles: Vec<SessionHandle> = self.sessions.lock().await.drain().map(|(_, h)| h).collect();
        let count = handles.len();
        futures::future::join_all(handles.into_iter().map(SessionHandle::shutdown)).await;
        tracing::info!(sessions = count, "Session manager stopped");
    }
}
