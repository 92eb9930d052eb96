use crate::model::{Device, DeviceStatus, TelemetryReading};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Readings kept per device, newest first.
pub const HISTORY_CAPACITY: usize = 10;

#[derive(Debug)]
struct Entry {
    device: Device,
    history: VecDeque<TelemetryReading>,
}

#[derive(Debug, Default)]
struct Registry {
    entries: HashMap<String, Entry>,
    // first-seen order, ids are never removed
    order: Vec<String>,
}

impl Registry {
    fn entry_mut(&mut self, id: &str) -> &mut Entry {
        if !self.entries.contains_key(id) {
            self.order.push(id.to_string());
        }
        self.entries.entry(id.to_string()).or_insert_with(|| Entry {
            device: Device::new(id),
            history: VecDeque::with_capacity(HISTORY_CAPACITY),
        })
    }
}

/// Registry of every device seen since startup.
///
/// Each mutation takes the write lock once and touches a single device, so
/// readers always see either the old or the new record, never a mix.
#[derive(Debug, Default)]
pub struct DeviceStore {
    inner: RwLock<Registry>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<Device> {
        self.inner.read().entries.get(id).map(|e| e.device.clone())
    }

    /// All devices in first-seen order.
    pub fn list(&self) -> Vec<Device> {
        let registry = self.inner.read();
        registry
            .order
            .iter()
            .filter_map(|id| registry.entries.get(id))
            .map(|e| e.device.clone())
            .collect()
    }

    /// Latest reading per device, for devices that have reported telemetry.
    pub fn latest_telemetry(&self) -> BTreeMap<String, TelemetryReading> {
        let registry = self.inner.read();
        registry
            .entries
            .iter()
            .filter_map(|(id, e)| {
                e.device
                    .latest_telemetry
                    .as_ref()
                    .map(|t| (id.clone(), t.clone()))
            })
            .collect()
    }

    /// Up to [`HISTORY_CAPACITY`] readings, newest first.
    pub fn history_of(&self, id: &str) -> Vec<TelemetryReading> {
        self.inner
            .read()
            .entries
            .get(id)
            .map(|e| e.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn record_status(&self, id: &str, status: DeviceStatus, ts: DateTime<Utc>) {
        let mut registry = self.inner.write();
        let entry = registry.entry_mut(id);
        entry.device.status = status;
        entry.device.last_status_update = Some(ts);
    }

    pub fn record_telemetry(&self, id: &str, reading: TelemetryReading) {
        let mut registry = self.inner.write();
        let entry = registry.entry_mut(id);
        entry.history.push_front(reading.clone());
        entry.history.truncate(HISTORY_CAPACITY);
        entry.device.latest_telemetry = Some(reading);
    }

    pub fn record_claim(&self, id: &str, claim_code: String, firmware: String, ts: DateTime<Utc>) {
        let mut registry = self.inner.write();
        let entry = registry.entry_mut(id);
        entry.device.claim_code = Some(claim_code);
        entry.device.firmware_version = Some(firmware);
        entry.device.last_claim_update = Some(ts);
    }
}
