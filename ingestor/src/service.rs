use crate::commands::{CommandPublisher, SentCommand};
use crate::errors::{Error, Result};
use crate::model::{Device, PumpAction, TelemetryReading};
use crate::mqtt::{BrokerSession, Delivery, SessionStatus};
use crate::store::DeviceStore;
use rumqttc::QoS;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Everything the HTTP layer may ask of the hub.
///
/// Owned by `main` and shared with the router; the ingestion side holds the
/// same [`DeviceStore`].
#[derive(Clone)]
pub struct IrrigationHub {
    store: Arc<DeviceStore>,
    session: Arc<dyn BrokerSession>,
    commands: CommandPublisher,
}

impl IrrigationHub {
    pub fn new(
        store: Arc<DeviceStore>,
        session: Arc<dyn BrokerSession>,
        commands: CommandPublisher,
    ) -> Self {
        Self {
            store,
            session,
            commands,
        }
    }

    pub fn list_devices(&self) -> Vec<Device> {
        self.store.list()
    }

    pub fn get_device(&self, id: &str) -> Option<Device> {
        self.store.get(id)
    }

    pub fn latest_telemetry_all(&self) -> BTreeMap<String, TelemetryReading> {
        self.store.latest_telemetry()
    }

    pub fn history_of(&self, id: &str) -> Vec<TelemetryReading> {
        self.store.history_of(id)
    }

    pub fn send_pump_command(
        &self,
        device_id: &str,
        action: PumpAction,
        duration_ms: Option<u64>,
    ) -> Result<SentCommand> {
        self.commands.send_pump_command(device_id, action, duration_ms)
    }

    pub fn connection_status(&self) -> SessionStatus {
        self.session.status()
    }

    /// Publish an arbitrary payload. JSON values are sent compact, strings as-is.
    pub fn publish(
        &self,
        topic: &str,
        message: &serde_json::Value,
        delivery: Delivery,
    ) -> Result<()> {
        let payload = match message {
            serde_json::Value::String(s) => s.clone().into_bytes(),
            other => serde_json::to_vec(other).map_err(Error::Json)?,
        };
        self.session.publish(topic, payload, delivery)
    }

    pub fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        self.session.subscribe(topic, qos)
    }

    pub fn unsubscribe(&self, topic: &str) -> Result<()> {
        self.session.unsubscribe(topic)
    }
}
