//! ==============================================================================
//! domain.rs - device identities, readings and wire records
//! ==============================================================================
//!
//! purpose:
//!     the shared vocabulary of the host. everything that crosses a module
//!     boundary (registry, discovery, sessions, persistence, api) is defined here.
//!
//! wire formats (device firmware contract):
//!     - udp announcement:   {"ip": "192.168.1.40", "mac": "24:6F:28:AA:BB:CC"}
//!     - tcp telemetry:      {"humidity": 41.5, "temperature": 22.1, "rssi": -61, "interval": 2}
//!     - tcp control (out):  {"interval": 30}
//!
//! ==============================================================================

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;

/// Stable identifier of a registered device (storage primary key)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(pub u64);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the device obtains its network address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AddressingMode {
    /// fixed address; learned bindings are persisted
    Static,
    /// dhcp-assigned; bindings live in memory and are refreshed periodically
    #[default]
    Dynamic,
}

/// The (network address, physical address) pair used for de-duplication.
///
/// Two keys are equal iff both fields are pairwise equal, including both being
/// absent. A mac-only key never equals an ip-only key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceKey {
    pub ip: Option<IpAddr>,
    pub mac: Option<String>,
}

/// A sensor as known to the host
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// stable hardware identifier
    #[serde(default)]
    pub mac: Option<String>,
    /// mutable network address
    #[serde(default)]
    pub ip: Option<IpAddr>,
    #[serde(default)]
    pub addressing: AddressingMode,
    /// only streamed when an operator asks for it
    #[serde(default)]
    pub manual_start: bool,
}

impl DeviceIdentity {
    pub fn new(ip: Option<IpAddr>, mac: Option<String>) -> Self {
        Self {
            mac,
            ip,
            addressing: AddressingMode::Dynamic,
            manual_start: false,
        }
    }

    /// The de-duplication key (network address, physical address)
    pub fn key(&self) -> DeviceKey {
        DeviceKey {
            ip: self.ip,
            mac: self.mac.clone(),
        }
    }

    /// Structural identity comparison used everywhere devices are de-duplicated.
    ///
    /// Compares both address fields; an identity carrying only a mac and one
    /// carrying only an ip are different devices as far as this is concerned.
    pub fn same_device(&self, other: &DeviceIdentity) -> bool {
        self.ip == other.ip && self.mac == other.mac
    }

    /// Best human-readable address: ip, then mac
    pub fn address(&self) -> String {
        match (&self.ip, &self.mac) {
            (Some(ip), _) => ip.to_string(),
            (None, Some(mac)) => mac.clone(),
            (None, None) => "<unknown>".to_string(),
        }
    }
}

/// A device row from the registry: identity plus its storage id
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredDevice {
    pub id: DeviceId,
    #[serde(flatten)]
    pub identity: DeviceIdentity,
}

/// Per-device session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    #[default]
    Idle,
    Connecting,
    Streaming,
    Error,
    Disconnected,
}

/// One telemetry sample as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub device_id: DeviceId,
    pub humidity: f32,
    pub temperature: f32,
    pub rssi: i32,
    /// sampling interval (seconds) in effect when the sample arrived
    pub interval: u32,
    /// arrival time, unix seconds
    pub epoch: i64,
    /// set on the zero reading stored for a record that failed to decode
    #[serde(default)]
    pub placeholder: bool,
}

impl Reading {
    /// Zero-valued stand-in for a record that failed to decode
    pub fn placeholder(device_id: DeviceId, interval: u32, epoch: i64) -> Self {
        Self {
            device_id,
            humidity: 0.0,
            temperature: 0.0,
            rssi: 0,
            interval,
            epoch,
            placeholder: true,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.placeholder
    }
}

// ==============================================================================
// wire records
// ==============================================================================

/// UDP discovery broadcast payload
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Announcement {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub mac: Option<String>,
}

impl Announcement {
    pub fn decode(bytes: &[u8]) -> Result<DeviceIdentity> {
        let announcement: Announcement = serde_json::from_slice(bytes)?;
        announcement.into_identity()
    }

    fn into_identity(self) -> Result<DeviceIdentity> {
        let ip = match self.ip.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(raw) => Some(
                raw.parse::<IpAddr>()
                    .map_err(|e| Error::ProtocolDecode(format!("bad ip {:?}: {}", raw, e)))?,
            ),
        };
        let mac = self.mac.filter(|m| !m.trim().is_empty());
        Ok(DeviceIdentity::new(ip, mac))
    }
}

/// Inbound telemetry record
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryRecord {
    pub humidity: f32,
    pub temperature: f32,
    pub rssi: i32,
    /// absent on older firmware; 0 means unchanged
    #[serde(default)]
    pub interval: Option<u32>,
}

impl TelemetryRecord {
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Outbound sampling-rate request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlMessage {
    pub interval: u32,
}

impl ControlMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Option<IpAddr> {
        Some(s.parse().unwrap())
    }

    #[test]
    fn test_same_device_requires_both_fields() {
        let full = DeviceIdentity::new(ip("10.0.0.5"), Some("AA:BB".into()));
        let same = DeviceIdentity::new(ip("10.0.0.5"), Some("AA:BB".into()));
        let other_ip = DeviceIdentity::new(ip("10.0.0.6"), Some("AA:BB".into()));

        assert!(full.same_device(&same));
        assert!(!full.same_device(&other_ip));
        assert_eq!(full.key(), same.key());
    }

    #[test]
    fn test_mac_only_and_ip_only_are_different() {
        let mac_only = DeviceIdentity::new(None, Some("AA:BB".into()));
        let ip_only = DeviceIdentity::new(ip("10.0.0.5"), None);
        assert!(!mac_only.same_device(&ip_only));

        let empty_a = DeviceIdentity::new(None, None);
        let empty_b = DeviceIdentity::new(None, None);
        assert!(empty_a.same_device(&empty_b));
    }

    #[test]
    fn test_announcement_decode() {
        let id = Announcement::decode(br#"{"ip":"192.168.1.40","mac":"24:6F:28:AA:BB:CC"}"#).unwrap();
        assert_eq!(id.ip, ip("192.168.1.40"));
        assert_eq!(id.mac.as_deref(), Some("24:6F:28:AA:BB:CC"));
        assert_eq!(id.addressing, AddressingMode::Dynamic);
        assert!(!id.manual_start);

        let mac_only = Announcement::decode(br#"{"mac":"24:6F"}"#).unwrap();
        assert!(mac_only.ip.is_none());

        assert!(Announcement::decode(br#"{"ip":"not-an-ip"}"#).is_err());
        assert!(Announcement::decode(b"garbage").is_err());
    }

    #[test]
    fn test_telemetry_record_interval_optional() {
        let rec = TelemetryRecord::decode(br#"{"humidity":40.0,"temperature":21.5,"rssi":-60}"#).unwrap();
        assert_eq!(rec.interval, None);
        assert!(TelemetryRecord::decode(br#"{"humidity":"wet"}"#).is_err());
    }

    #[test]
    fn test_genuine_zero_reading_is_not_a_placeholder() {
        let stand_in = Reading::placeholder(DeviceId(1), 2, 100);
        let genuine = Reading {
            placeholder: false,
            ..stand_in.clone()
        };
        assert!(stand_in.is_placeholder());
        assert!(!genuine.is_placeholder());

        // rows stored before the flag existed read back as genuine
        let old: Reading = serde_json::from_str(
            r#"{"device_id":1,"humidity":0.0,"temperature":0.0,"rssi":0,"interval":2,"epoch":100}"#,
        )
        .unwrap();
        assert!(!old.is_placeholder());
    }

    #[test]
    fn test_control_message_encoding() {
        let bytes = ControlMessage { interval: 30 }.encode().unwrap();
        assert_eq!(bytes, br#"{"interval":30}"#);
    }
}
