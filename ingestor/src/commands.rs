use crate::errors::{Error, Result};
use crate::forward::Forwarder;
use crate::metrics::COMMANDS_PUBLISHED_TOTAL;
use crate::model::{PumpAction, PumpCommand};
use crate::mqtt::{BrokerSession, Delivery};
use crate::topics::command_topic;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

pub const DEFAULT_WATER_MS: u64 = 5000;

/// A pump command that was accepted for sending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SentCommand {
    pub device_id: String,
    pub action: PumpAction,
    pub duration: u64,
    pub topic: String,
    pub payload: String,
}

/// Turns pump intents into `irrig/<id>/cmd` publishes.
#[derive(Clone)]
pub struct CommandPublisher {
    session: Arc<dyn BrokerSession>,
    forwarder: Forwarder,
}

impl CommandPublisher {
    pub fn new(session: Arc<dyn BrokerSession>, forwarder: Forwarder) -> Self {
        Self { session, forwarder }
    }

    /// Fire-and-forget: success only means the MQTT client queued the publish.
    ///
    /// `duration_ms` applies to `start` (default 5000 ms) and is ignored for
    /// `stop`. Callers are expected to have rejected non-positive durations.
    pub fn send_pump_command(
        &self,
        device_id: &str,
        action: PumpAction,
        duration_ms: Option<u64>,
    ) -> Result<SentCommand> {
        if !self.session.state().is_connected() {
            warn!("Pump {} for {} rejected: MQTT client not connected", action, device_id);
            return Err(Error::NotConnected);
        }

        let water_ms = match action {
            PumpAction::Start => duration_ms.unwrap_or(DEFAULT_WATER_MS),
            PumpAction::Stop => 0,
        };
        let topic = command_topic(device_id);
        let payload = serde_json::to_string(&PumpCommand { water_ms })?;

        self.session
            .publish(&topic, payload.clone().into_bytes(), Delivery::default())?;

        COMMANDS_PUBLISHED_TOTAL
            .with_label_values(&[action.as_str()])
            .inc();
        info!("Pump {} command sent to {}: {}", action, device_id, payload);

        let recorded_duration = (action == PumpAction::Start).then_some(water_ms);
        if let Err(e) =
            self.forwarder
                .write_pump_event(device_id, action, recorded_duration, Utc::now())
        {
            warn!("Pump event for {} not persisted: {}", device_id, e);
        }

        Ok(SentCommand {
            device_id: device_id.to_string(),
            action,
            duration: water_ms,
            topic,
            payload,
        })
    }
}
