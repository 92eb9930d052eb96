use crate::decode::{decode, Payload};
use crate::forward::Forwarder;
use crate::metrics::{
    ACCEPTED_MESSAGES_TOTAL, DEVICES_TRACKED, DROPPED_MESSAGES_TOTAL, MESSAGES_TOTAL,
};
use crate::model::{DeviceStatus, TelemetryReading};
use crate::store::DeviceStore;
use crate::topics::{classify, TopicKind};
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What happened to one inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied(TopicKind),
    UnknownTopic,
    ShapeMismatch(TopicKind),
}

/// Decode → classify → handle, one message at a time.
///
/// Nothing in here can fail the caller: bad input is logged and dropped so the
/// MQTT event loop keeps running.
#[derive(Debug, Clone)]
pub struct Ingestor {
    store: Arc<DeviceStore>,
    forwarder: Forwarder,
}

impl Ingestor {
    pub fn new(store: Arc<DeviceStore>, forwarder: Forwarder) -> Self {
        Self { store, forwarder }
    }

    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> Outcome {
        self.dispatch(topic, payload, Utc::now())
    }

    pub fn dispatch(&self, topic: &str, payload: &[u8], ts: DateTime<Utc>) -> Outcome {
        MESSAGES_TOTAL.inc();
        debug!(
            "Received message on topic {}, size: {} bytes",
            topic,
            payload.len()
        );

        let payload = decode(payload);
        let payload_kind = payload.kind();

        let Some(route) = classify(topic) else {
            info!(topic = %topic, kind = payload_kind, "Ignoring message on unknown topic");
            DROPPED_MESSAGES_TOTAL.with_label_values(&["unknown_topic"]).inc();
            return Outcome::UnknownTopic;
        };

        let applied = match route.kind {
            TopicKind::Status => {
                handle_status(&self.store, &self.forwarder, route.device_id, payload, ts);
                true
            }
            TopicKind::Telemetry => {
                handle_telemetry(&self.store, &self.forwarder, route.device_id, &payload, ts)
            }
            TopicKind::Claim => handle_claim(&self.store, route.device_id, &payload, ts),
        };

        if applied {
            ACCEPTED_MESSAGES_TOTAL
                .with_label_values(&[route.kind.as_str()])
                .inc();
            DEVICES_TRACKED.set(self.store.len() as f64);
            Outcome::Applied(route.kind)
        } else {
            warn!(
                topic = %topic,
                kind = payload_kind,
                "Dropping {} message without a JSON object payload",
                route.kind.as_str()
            );
            DROPPED_MESSAGES_TOTAL.with_label_values(&["shape_mismatch"]).inc();
            Outcome::ShapeMismatch(route.kind)
        }
    }
}

/// Status payloads are stored verbatim. An object payload is kept as its JSON text.
pub fn handle_status(
    store: &DeviceStore,
    forwarder: &Forwarder,
    device_id: &str,
    payload: Payload,
    ts: DateTime<Utc>,
) {
    let status = match payload {
        Payload::Text(text) => text,
        Payload::Object(map) => Value::Object(map).to_string(),
    };

    info!("Device {}: {}", device_id, status);
    store.record_status(device_id, DeviceStatus::from_reported(&status), ts);

    if let Err(e) = forwarder.write_status(device_id, &status, ts) {
        warn!("Status for {} not persisted: {}", device_id, e);
    }
}

/// Returns `false` when the payload is not an object.
pub fn handle_telemetry(
    store: &DeviceStore,
    forwarder: &Forwarder,
    device_id: &str,
    payload: &Payload,
    ts: DateTime<Utc>,
) -> bool {
    let Some(fields) = payload.as_object() else {
        return false;
    };

    let reading = reading_from_fields(fields, ts);
    info!(
        device = %device_id,
        soil_pct = ?reading.soil_pct,
        temp_c = ?reading.temp_c,
        humidity_pct = ?reading.humidity_pct,
        pump_running = ?reading.pump_running,
        "Telemetry received"
    );

    store.record_telemetry(device_id, reading.clone());

    if let Err(e) = forwarder.write_telemetry(device_id, &reading) {
        warn!("Telemetry for {} not persisted: {}", device_id, e);
    }
    true
}

/// Returns `false` when the payload is not an object carrying `claimCode` and `fw`.
pub fn handle_claim(
    store: &DeviceStore,
    device_id: &str,
    payload: &Payload,
    ts: DateTime<Utc>,
) -> bool {
    let Some(fields) = payload.as_object() else {
        return false;
    };

    let code = string_field(fields, "claimCode");
    let fw = string_field(fields, "fw");
    let (Some(code), Some(fw)) = (code, fw) else {
        return false;
    };

    info!("Device claim from {}: {} (FW: {})", device_id, code, fw);
    store.record_claim(device_id, code, fw, ts);
    true
}

fn reading_from_fields(fields: &Map<String, Value>, ts: DateTime<Utc>) -> TelemetryReading {
    let number = |key: &str| fields.get(key).and_then(Value::as_f64);

    TelemetryReading {
        soil_mv: number("soil_mv"),
        soil_pct: number("soil_pct"),
        light_mv: number("light_mv"),
        light_pct: number("light_pct"),
        temp_c: number("temp_c"),
        humidity_pct: number("humidity_pct"),
        pump_running: fields.get("pump_running").and_then(Value::as_bool),
        timestamp: ts,
    }
}

fn string_field(fields: &Map<String, Value>, key: &str) -> Option<String> {
    fields.get(key).and_then(Value::as_str).map(str::to_string)
}
