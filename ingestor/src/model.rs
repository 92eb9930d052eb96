use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Last reported connectivity of a device.
///
/// Devices publish `online`/`offline`; anything else is kept verbatim so the
/// API shows exactly what the device sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DeviceStatus {
    #[default]
    Unknown,
    Online,
    Offline,
    Other(String),
}

impl DeviceStatus {
    pub fn from_reported(status: &str) -> Self {
        match status {
            "online" => DeviceStatus::Online,
            "offline" => DeviceStatus::Offline,
            other => DeviceStatus::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            DeviceStatus::Unknown => "unknown",
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Other(s) => s,
        }
    }

    pub fn is_online(&self) -> bool {
        matches!(self, DeviceStatus::Online)
    }
}

impl Serialize for DeviceStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// One timestamped snapshot of a device's sensors and pump.
///
/// Every field is optional: whatever the device left out stays absent instead
/// of being zeroed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryReading {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soil_mv: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soil_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_mv: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub light_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temp_c: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub humidity_pct: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump_running: Option<bool>,
    pub timestamp: DateTime<Utc>,
}

/// In-memory device record as served by the API.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    pub id: String,
    pub status: DeviceStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status_update: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_telemetry: Option<TelemetryReading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub firmware_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_claim_update: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: DeviceStatus::Unknown,
            last_status_update: None,
            latest_telemetry: None,
            claim_code: None,
            firmware_version: None,
            last_claim_update: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpAction {
    Start,
    Stop,
}

impl PumpAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PumpAction::Start => "start",
            PumpAction::Stop => "stop",
        }
    }
}

impl fmt::Display for PumpAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PumpAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "start" => Ok(PumpAction::Start),
            "stop" => Ok(PumpAction::Stop),
            other => Err(format!("unknown pump action '{}'", other)),
        }
    }
}

/// Payload published on `irrig/<id>/cmd`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PumpCommand {
    pub water_ms: u64,
}

/// Stored telemetry row read back from the database.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TelemetryRecord {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub soil_mv: Option<f64>,
    pub soil_pct: Option<f64>,
    pub light_mv: Option<f64>,
    pub light_pct: Option<f64>,
    pub temp_c: Option<f64>,
    pub humidity_pct: Option<f64>,
    pub pump_running: Option<bool>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct StatusRecord {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PumpEventRecord {
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub duration_ms: Option<i64>,
}

/// REST API response wrapper for stored records
#[derive(Debug, Serialize)]
pub struct RecordsResponse<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub hours: u32,
    pub limit: usize,
}
