//! ==============================================================================
//! session - one long-lived telemetry stream per device
//! ==============================================================================
//!
//! purpose:
//!     connect to a sensor on tcp 5505, read its json records, keep the latest
//!     reading, batch readings and hand full batches to the persistence gateway.
//!
//! lifecycle:
//!
//! ```text
//!     Idle ──(address known)──> Connecting ──> Streaming ──┬──> Error        (fault / idle timeout)
//!       │                                                  └──> Disconnected (peer close / cancel)
//!       └──(no address)──> stays Idle
//!
//!     whatever the exit path, `finish()` runs exactly once: flush the partial
//!     batch, drop the socket, clear `fetching`.
//! ```
//!
//! relationships:
//!     - spawned by: manager.rs (one tokio task per device)
//!     - uses: codec.rs (framing), batch.rs, persistence (flush), notify (status)
//!
//! ==============================================================================

mod batch;
mod codec;

pub use batch::Batch;
pub use codec::{RecordCodec, MAX_FRAME};

use crate::domain::{
    ControlMessage, DeviceId, Reading, RegisteredDevice, SessionState, TelemetryRecord,
};
use crate::error::{Error, Result};
use crate::notify::{NotificationSink, Severity};
use crate::persistence::PersistenceGateway;
use bytes::BytesMut;
use futures::StreamExt;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{error::Elapsed, Instant};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

/// Telemetry port of the sensor firmware
pub const STREAM_PORT: u16 = 5505;

/// Per-session tuning, derived from [stream] in host.toml
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub port: u16,
    pub batch_capacity: usize,
    pub connect_timeout: Duration,
    /// added to the sampling interval to get the read deadline
    pub idle_margin: Duration,
    /// sampling interval assumed until the device reports one (seconds)
    pub initial_interval: u32,
    pub show_sensor_data: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            port: STREAM_PORT,
            batch_capacity: 10,
            connect_timeout: Duration::from_secs(5),
            idle_margin: Duration::from_secs(15),
            initial_interval: 2,
            show_sensor_data: false,
        }
    }
}

/// How a session ended
#[derive(Debug)]
pub enum SessionEnd {
    /// no network address; never connected
    Unresolved,
    Cancelled,
    /// zero-length read
    PeerClosed,
    Fault(Error),
}

// ==============================================================================
// shared status
// ==============================================================================
// written by the session task, read by the manager and the api.

#[derive(Debug)]
pub struct SessionStatus {
    state: RwLock<SessionState>,
    last_reading: RwLock<Option<Reading>>,
    interval: AtomicU32,
    fetching: AtomicBool,
    errored: AtomicBool,
}

impl SessionStatus {
    pub fn new(initial_interval: u32) -> Self {
        Self {
            state: RwLock::new(SessionState::Idle),
            last_reading: RwLock::new(None),
            interval: AtomicU32::new(initial_interval),
            fetching: AtomicBool::new(false),
            errored: AtomicBool::new(false),
        }
    }

    pub async fn state(&self) -> SessionState {
        *self.state.read().await
    }

    pub(crate) async fn set_state(&self, state: SessionState) {
        *self.state.write().await = state;
    }

    pub async fn last_reading(&self) -> Option<Reading> {
        self.last_reading.read().await.clone()
    }

    /// Current sampling interval in seconds
    pub fn interval(&self) -> u32 {
        self.interval.load(Ordering::Relaxed)
    }

    pub fn is_fetching(&self) -> bool {
        self.fetching.load(Ordering::Relaxed)
    }

    pub fn has_error(&self) -> bool {
        self.errored.load(Ordering::Relaxed)
    }

    pub async fn snapshot(&self) -> StatusSnapshot {
        StatusSnapshot {
            state: self.state().await,
            fetching: self.is_fetching(),
            error: self.has_error(),
            interval: self.interval(),
            last_reading: self.last_reading().await,
        }
    }
}

/// Serializable copy of a session's status
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub state: SessionState,
    pub fetching: bool,
    pub error: bool,
    pub interval: u32,
    pub last_reading: Option<Reading>,
}

// ==============================================================================
// handle - what the manager keeps
// ==============================================================================

struct ControlRequest {
    interval: u32,
    reply: oneshot::Sender<Result<()>>,
}

/// Cloneable control path into a running session
#[derive(Clone)]
pub struct SessionControl {
    device_id: DeviceId,
    status: Arc<SessionStatus>,
    control_tx: mpsc::Sender<ControlRequest>,
}

impl SessionControl {
    /// Ask the device to change its sampling interval.
    ///
    /// Rejected without any network I/O unless the session is streaming.
    /// The reply comes from the session task, so this waits out a flush in
    /// progress.
    pub async fn change_interval(&self, interval: u32) -> Result<()> {
        if self.status.state().await != SessionState::Streaming {
            return Err(Error::IntervalChangeRejected(self.device_id.to_string()));
        }
        let (reply, rx) = oneshot::channel();
        let closed = || Error::IntervalChangeRejected(self.device_id.to_string());
        self.control_tx
            .send(ControlRequest { interval, reply })
            .await
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }
}

pub struct SessionHandle {
    device_id: DeviceId,
    control: SessionControl,
    cancel: CancellationToken,
    task: JoinHandle<SessionEnd>,
}

impl SessionHandle {
    pub fn status(&self) -> &Arc<SessionStatus> {
        &self.control.status
    }

    pub fn control(&self) -> SessionControl {
        self.control.clone()
    }

    /// The task has returned (any end state)
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn change_interval(&self, interval: u32) -> Result<()> {
        self.control.change_interval(interval).await
    }

    /// Cancel and wait for the final flush
    pub async fn shutdown(self) -> Option<SessionEnd> {
        self.cancel.cancel();
        match self.task.await {
            Ok(end) => Some(end),
            Err(e) => {
                tracing::error!(device_id = %self.device_id, error = %e, "Session task panicked");
                None
            }
        }
    }
}

// ==============================================================================
// session task
// ==============================================================================

enum Event {
    Cancelled,
    Control(ControlRequest),
    Read(std::result::Result<Option<std::io::Result<BytesMut>>, Elapsed>),
}

pub struct StreamingSession {
    device: RegisteredDevice,
    settings: SessionSettings,
    status: Arc<SessionStatus>,
    gateway: Arc<dyn PersistenceGateway>,
    sink: Arc<dyn NotificationSink>,
    cancel: CancellationToken,
    control_rx: mpsc::Receiver<ControlRequest>,
    batch: Batch,
}

impl StreamingSession {
    /// Spawn the session on the runtime and return its handle.
    ///
    /// `cancel` is usually a child of the manager's shutdown token.
    pub fn spawn(
        device: RegisteredDevice,
        settings: SessionSettings,
        status: Arc<SessionStatus>,
        gateway: Arc<dyn PersistenceGateway>,
        sink: Arc<dyn NotificationSink>,
        cancel: CancellationToken,
    ) -> SessionHandle {
        let (control_tx, control_rx) = mpsc::channel(4);
        let device_id = device.id;
        let session = Self {
            batch: Batch::new(settings.batch_capacity),
            device,
            settings,
            status: status.clone(),
            gateway,
            sink,
            cancel: cancel.clone(),
            control_rx,
        };
        let task = tokio::spawn(session.run());

        SessionHandle {
            device_id,
            control: SessionControl {
                device_id,
                status,
                control_tx,
            },
            cancel,
            task,
        }
    }

    pub async fn run(mut self) -> SessionEnd {
        let Some(ip) = self.device.identity.ip else {
            tracing::debug!(device_id = %self.device.id, "No network address, session stays idle");
            self.status.set_state(SessionState::Idle).await;
            return SessionEnd::Unresolved;
        };
        let addr = SocketAddr::new(ip, self.settings.port);

        let end = match self.connect(addr).await {
            Ok(stream) => self.stream(stream, addr).await,
            Err(end) => end,
        };
        self.finish(&end, addr).await;
        end
    }

    async fn connect(&mut self, addr: SocketAddr) -> std::result::Result<TcpStream, SessionEnd> {
        tracing::info!(device_id = %self.device.id, address = %addr, "Connecting to sensor");

        let attempt = tokio::time::timeout(self.settings.connect_timeout, TcpStream::connect(addr));
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SessionEnd::Cancelled),
            r = attempt => match r {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(e)) => Err(SessionEnd::Fault(Error::ConnectFailure {
                    address: addr.to_string(),
                    reason: e.to_string(),
                })),
                Err(_) => Err(SessionEnd::Fault(Error::ConnectFailure {
                    address: addr.to_string(),
                    reason: format!("connect timed out after {:?}", self.settings.connect_timeout),
                })),
            },
        }
    }

    /// Read loop. Owns the socket; it is released when this returns.
    async fn stream(&mut self, stream: TcpStream, addr: SocketAddr) -> SessionEnd {
        let (reader, mut writer) = stream.into_split();
        let mut frames = FramedRead::new(reader, RecordCodec::default());

        self.status.set_state(SessionState::Streaming).await;
        self.status.fetching.store(true, Ordering::Relaxed);
        self.status.errored.store(false, Ordering::Relaxed);
        self.sink
            .on_status_message(&format!("Connected to sensor {}", addr), Severity::Success);

        let mut deadline = Instant::now() + self.idle_timeout();
        loop {
            let event = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => Event::Cancelled,
                Some(request) = self.control_rx.recv() => Event::Control(request),
                read = tokio::time::timeout_at(deadline, frames.next()) => Event::Read(read),
            };

            match event {
                Event::Cancelled => return SessionEnd::Cancelled,
                Event::Control(request) => {
                    if let Err(e) = self.send_interval(&mut writer, addr, request.interval).await {
                        let reason = e.to_string();
                        let _ = request.reply.send(Err(e));
                        return SessionEnd::Fault(Error::ConnectFailure {
                            address: addr.to_string(),
                            reason,
                        });
                    }
                    let _ = request.reply.send(Ok(()));
                }
                Event::Read(Err(_elapsed)) => {
                    return SessionEnd::Fault(Error::IdleTimeout {
                        address: addr.to_string(),
                        timeout: self.idle_timeout(),
                    });
                }
                Event::Read(Ok(None)) => return SessionEnd::PeerClosed,
                Event::Read(Ok(Some(Err(e)))) => {
                    return SessionEnd::Fault(Error::ConnectFailure {
                        address: addr.to_string(),
                        reason: e.to_string(),
                    });
                }
                Event::Read(Ok(Some(Ok(frame)))) => {
                    self.ingest(&frame).await;
                    deadline = Instant::now() + self.idle_timeout();
                }
            }
        }
    }

    /// sampling interval + safety margin
    fn idle_timeout(&self) -> Duration {
        Duration::from_secs(u64::from(self.status.interval())) + self.settings.idle_margin
    }

    async fn send_interval(
        &self,
        writer: &mut OwnedWriteHalf,
        addr: SocketAddr,
        interval: u32,
    ) -> Result<()> {
        let payload = ControlMessage { interval }.encode()?;
        let write = async {
            writer.write_all(&payload).await?;
            writer.flush().await
        };
        write.await.map_err(|e| Error::ConnectFailure {
            address: addr.to_string(),
            reason: e.to_string(),
        })?;
        tracing::info!(device_id = %self.device.id, interval, "Requested sampling interval change");
        Ok(())
    }

    /// One frame in, exactly one reading out
    async fn ingest(&mut self, frame: &[u8]) {
        let epoch = chrono::Utc::now().timestamp();
        let current = self.status.interval();

        let reading = match TelemetryRecord::decode(frame) {
            Ok(record) => {
                let interval = match record.interval {
                    Some(reported) if reported != 0 && reported != current => {
                        tracing::info!(
                            device_id = %self.device.id,
                            from = current,
                            to = reported,
                            "Sampling interval changed"
                        );
                        self.status.interval.store(reported, Ordering::Relaxed);
                        reported
                    }
                    _ => current,
                };
                Reading {
                    device_id: self.device.id,
                    humidity: record.humidity,
                    temperature: record.temperature,
                    rssi: record.rssi,
                    interval,
                    epoch,
                    placeholder: false,
                }
            }
            Err(e) => {
                // keep the slot so the batch follows arrival order
                tracing::warn!(
                    device_id = %self.device.id,
                    error = %e,
                    payload = %String::from_utf8_lossy(frame),
                    "Malformed telemetry record, storing zero reading"
                );
                Reading::placeholder(self.device.id, current, epoch)
            }
        };

        if self.settings.show_sensor_data {
            tracing::debug!(
                device_id = %self.device.id,
                temperature = reading.temperature,
                humidity = reading.humidity,
                rssi = reading.rssi,
                "Reading"
            );
        }

        *self.status.last_reading.write().await = Some(reading.clone());
        if let Some(full) = self.batch.push(reading) {
            self.flush(full).await;
        }
    }

    async fn flush(&self, readings: Vec<Reading>) {
        let count = readings.len();
        match self.gateway.append_readings(&readings).await {
            Ok(()) => tracing::debug!(device_id = %self.device.id, count, "Batch persisted"),
            Err(e) => tracing::error!(
                device_id = %self.device.id,
                count,
                error = %e,
                "Failed to persist batch, readings dropped"
            ),
        }
    }

    /// Runs once per session, on every exit path
    async fn finish(&mut self, end: &SessionEnd, addr: SocketAddr) {
        if let Some(remaining) = self.batch.take_remaining() {
            self.flush(remaining).await;
        }
        self.status.fetching.store(false, Ordering::Relaxed);

        match end {
            SessionEnd::Fault(e) => {
                tracing::error!(device_id = %self.device.id, address = %addr, error = %e, "Sensor connection lost");
                self.status.errored.store(true, Ordering::Relaxed);
                self.status.set_state(SessionState::Error).await;
                self.sink.on_disconnected(&addr.ip().to_string());
            }
            SessionEnd::PeerClosed => {
                tracing::info!(device_id = %self.device.id, address = %addr, "Sensor closed the stream");
                self.status.set_state(SessionState::Disconnected).await;
            }
            SessionEnd::Cancelled => {
                tracing::info!(device_id = %self.device.id, address = %addr, "Session stopped");
                self.status.set_state(SessionState::Disconnected).await;
            }
            SessionEnd::Unresolved => {}
        }
    }
}
