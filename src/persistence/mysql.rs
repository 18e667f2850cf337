//! MySQL gateway
//!
//! Tables are created on connect if missing:
//! - `sensors`: one row per registered device
//! - `sensor_readings`: appended batches, indexed by (sensor_id, epoch)

use super::PersistenceGateway;
use crate::domain::{AddressingMode, DeviceId, DeviceIdentity, Reading, RegisteredDevice};
use crate::error::Result;
use async_trait::async_trait;
use sqlx::mysql::{MySqlPoolOptions, MySqlRow};
use sqlx::{MySql, MySqlPool, QueryBuilder, Row};
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, info, warn};

const CREATE_SENSORS: &str = r#"
    CREATE TABLE IF NOT EXISTS sensors (
        id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
        ip_address VARCHAR(45) NULL,
        mac_address VARCHAR(17) NULL,
        static_ip BOOLEAN NOT NULL DEFAULT FALSE,
        manual_start BOOLEAN NOT NULL DEFAULT FALSE
    )
"#;

const CREATE_READINGS: &str = r#"
    CREATE TABLE IF NOT EXISTS sensor_readings (
        id BIGINT UNSIGNED NOT NULL AUTO_INCREMENT PRIMARY KEY,
        sensor_id BIGINT UNSIGNED NOT NULL,
        humidity FLOAT NOT NULL,
        temperature FLOAT NOT NULL,
        rssi INT NOT NULL,
        sampling_interval INT UNSIGNED NOT NULL,
        epoch BIGINT NOT NULL,
        placeholder BOOLEAN NOT NULL DEFAULT FALSE,
        INDEX idx_sensor_epoch (sensor_id, epoch),
        FOREIGN KEY (sensor_id) REFERENCES sensors(id) ON DELETE CASCADE
    )
"#;

pub struct MySqlGateway {
    pool: MySqlPool,
}

impl MySqlGateway {
    /// Connect and make sure the schema exists
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = MySqlPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;

        let gateway = Self { pool };
        gateway.ensure_schema().await?;
        info!("Connected to MySQL");
        Ok(gateway)
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(CREATE_SENSORS).execute(&self.pool).await?;
        sqlx::query(CREATE_READINGS).execute(&self.pool).await?;
        Ok(())
    }

    fn device_from_row(row: &MySqlRow) -> Result<RegisteredDevice> {
        let id: u64 = row.try_get("id")?;
        let ip: Option<String> = row.try_get("ip_address")?;
        let mac: Option<String> = row.try_get("mac_address")?;
        let static_ip: bool = row.try_get("static_ip")?;
        let manual_start: bool = row.try_get("manual_start")?;

        let ip = ip.as_deref().and_then(|raw| match raw.parse::<IpAddr>() {
            Ok(ip) => Some(ip),
            Err(e) => {
                warn!(device_id = id, ip = raw, error = %e, "Ignoring unparsable stored address");
                None
            }
        });

        Ok(RegisteredDevice {
            id: DeviceId(id),
            identity: DeviceIdentity {
                mac,
                ip,
                addressing: if static_ip {
                    AddressingMode::Static
                } else {
                    AddressingMode::Dynamic
                },
                manual_start,
            },
        })
    }
}

#[async_trait]
impl PersistenceGateway for MySqlGateway {
    async fn load_devices(&self) -> Result<Vec<RegisteredDevice>> {
        let rows = sqlx::query(
            "SELECT id, ip_address, mac_address, static_ip, manual_start FROM sensors ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::device_from_row).collect()
    }

    async fn append_readings(&self, batch: &[Reading]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut query: QueryBuilder<MySql> = QueryBuilder::new(
            "INSERT INTO sensor_readings (sensor_id, humidity, temperature, rssi, sampling_interval, epoch, placeholder) ",
        );
        query.push_values(batch, |mut row, r| {
            row.push_bind(r.device_id.0)
                .push_bind(r.humidity)
                .push_bind(r.temperature)
                .push_bind(r.rssi)
                .push_bind(r.interval)
                .push_bind(r.epoch)
                .push_bind(r.placeholder);
        });
        query.build().execute(&self.pool).await?;

        debug!(count = batch.len(), "Inserted readings");
        Ok(())
    }

    async fn upsert_address_binding(&self, device: &RegisteredDevice) -> Result<()> {
        let identity = &device.identity;
        sqlx::query(
            r#"
            INSERT INTO sensors (id, ip_address, mac_address, static_ip, manual_start)
            VALUES (?, ?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                ip_address = VALUES(ip_address)
            "#,
        )
        .bind(device.id.0)
        .bind(identity.ip.map(|ip| ip.to_string()))
        .bind(&identity.mac)
        .bind(identity.addressing == AddressingMode::Static)
        .bind(identity.manual_start)
        .execute(&self.pool)
        .await?;

        debug!(device_id = %device.id, address = %identity.address(), "Upserted address binding");
        Ok(())
    }

    async fn query_readings(&self, device: DeviceId, from: i64, to: i64) -> Result<Vec<Reading>> {
        let rows = sqlx::query(
            r#"
            SELECT sensor_id, humidity, temperature, rssi, sampling_interval, epoch, placeholder
            FROM sensor_readings
            WHERE sensor_id = ? AND epoch BETWEEN ? AND ?
            ORDER BY epoch, id
            "#,
        )
        .bind(device.0)
        .bind(from)
        .bind(to)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| -> Result<Reading> {
                Ok(Reading {
                    device_id: DeviceId(row.try_get("sensor_id")?),
                    humidity: row.try_get("humidity")?,
                    temperature: row.try_get("temperature")?,
                    rssi: row.try_get("rssi")?,
                    interval: row.try_get("sampling_interval")?,
                    epoch: row.try_get("epoch")?,
                    placeholder: row.try_get("placeholder")?,
                })
            })
            .collect()
    }
}
