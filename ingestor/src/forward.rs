use crate::errors::{Error, Result};
use crate::metrics::FORWARD_FAILURES_TOTAL;
use crate::model::{PumpAction, TelemetryReading};
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// An accepted event on its way to the time-series store.
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Telemetry {
        device_id: String,
        reading: TelemetryReading,
    },
    Status {
        device_id: String,
        status: String,
        timestamp: DateTime<Utc>,
    },
    PumpEvent {
        device_id: String,
        action: PumpAction,
        duration_ms: Option<u64>,
        timestamp: DateTime<Utc>,
    },
}

/// Hands records to the background writer without ever waiting on it.
///
/// A full or closed queue is reported to the caller, logged and counted; the
/// caller's in-memory state is left as it is.
#[derive(Debug, Clone)]
pub struct Forwarder {
    tx: mpsc::Sender<Record>,
}

impl Forwarder {
    pub fn new(tx: mpsc::Sender<Record>) -> Self {
        Self { tx }
    }

    pub fn write_telemetry(&self, device_id: &str, reading: &TelemetryReading) -> Result<()> {
        self.forward(Record::Telemetry {
            device_id: device_id.to_string(),
            reading: reading.clone(),
        })
    }

    pub fn write_status(
        &self,
        device_id: &str,
        status: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.forward(Record::Status {
            device_id: device_id.to_string(),
            status: status.to_string(),
            timestamp,
        })
    }

    pub fn write_pump_event(
        &self,
        device_id: &str,
        action: PumpAction,
        duration_ms: Option<u64>,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        self.forward(Record::PumpEvent {
            device_id: device_id.to_string(),
            action,
            duration_ms,
            timestamp,
        })
    }

    fn forward(&self, record: Record) -> Result<()> {
        match self.tx.try_send(record) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(record)) => {
                FORWARD_FAILURES_TOTAL.inc();
                warn!("Persistence queue full, dropping {}", record.describe());
                Err(Error::ChannelSend)
            }
            Err(mpsc::error::TrySendError::Closed(record)) => {
                FORWARD_FAILURES_TOTAL.inc();
                debug!("Persistence writer gone, dropping {}", record.describe());
                Err(Error::ChannelSend)
            }
        }
    }
}

impl Record {
    pub fn device_id(&self) -> &str {
        match self {
            Record::Telemetry { device_id, .. }
            | Record::Status { device_id, .. }
            | Record::PumpEvent { device_id, .. } => device_id,
        }
    }

    fn describe(&self) -> String {
        let kind = match self {
            Record::Telemetry { .. } => "telemetry",
            Record::Status { .. } => "status",
            Record::PumpEvent { .. } => "pump event",
        };
        format!("{} for {}", kind, self.device_id())
    }
}
