/**
 * STATE STORE - État partagé en mémoire du bridge
 *
 * RÔLE :
 * Trois collections alimentées par le worker MQTT et lues/vidées par l'API :
 * - devices : appareils vus sur n'importe quel topic (ordre d'arrivée)
 * - readings : dernier payload SENSOR par appareil
 * - energy : ENERGY.Current par appareil et par seconde (HH:MM:SS)
 *
 * Les payloads sont conservés tels que reçus (ordre des clés, nombres).
 *
 * CONCURRENCE :
 * Un mutex par collection, jamais tenu à travers un `.await`.
 * Pas d'atomicité entre readings et energy.
 */

use crate::error::{BridgeError, Result};
use chrono::{Local, NaiveTime};
use indexmap::{IndexMap, IndexSet};
use parking_lot::Mutex;
use serde_json::{Number, Value};
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

pub type KnownDevices = IndexSet<String>;
pub type LatestReadings = IndexMap<String, Value>;
/// device -> (HH:MM:SS -> courant en A, nombre JSON d'origine)
pub type EnergySeries = IndexMap<String, Number>;
pub type EnergyLog = IndexMap<String, EnergySeries>;

const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct StoreCounts {
    pub devices: usize,
    pub readings: usize,
    pub energy_series: usize,
}

#[derive(Clone)]
pub struct StateStore {
    devices: Shared<KnownDevices>,
    readings: Shared<LatestReadings>,
    energy: Shared<EnergyLog>,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StateStore {
    pub fn new() -> Self {
        Self {
            devices: new_state(KnownDevices::new()),
            readings: new_state(LatestReadings::new()),
            energy: new_state(EnergyLog::new()),
        }
    }

    // ============ OBSERVATIONS (worker MQTT) ============

    /// Ajoute l'appareil s'il n'est pas déjà connu
    pub fn observe_device(&self, device_id: &str) {
        let mut devices = self.devices.lock();
        if !devices.contains(device_id) {
            devices.insert(device_id.to_string());
        }
    }

    /// Enregistre une lecture SENSOR horodatée à la seconde locale courante
    pub fn observe_reading(&self, device_id: &str, payload: &str) -> Result<Number> {
        self.observe_reading_at(device_id, payload, Local::now().time())
    }

    pub fn observe_reading_at(&self, device_id: &str, payload: &str, at: NaiveTime) -> Result<Number> {
        let value: Value = serde_json::from_str(payload).map_err(|e| BridgeError::PayloadShape {
            device: device_id.to_string(),
            reason: format!("invalid JSON: {e}"),
        })?;

        let current = match value.pointer("/ENERGY/Current") {
            Some(Value::Number(n)) => n.clone(),
            _ => {
                return Err(BridgeError::PayloadShape {
                    device: device_id.to_string(),
                    reason: "missing numeric ENERGY.Current".into(),
                })
            }
        };

        let stamp = at.format(TIME_FORMAT).to_string();

        self.readings.lock().insert(device_id.to_string(), value);
        self.energy
            .lock()
            .entry(device_id.to_string())
            .or_default()
            .insert(stamp, current.clone());

        Ok(current)
    }

    // ============ LECTURES ============

    pub fn devices(&self) -> Vec<String> {
        self.devices.lock().iter().cloned().collect()
    }

    pub fn readings(&self) -> LatestReadings {
        self.readings.lock().clone()
    }

    pub fn reading(&self, device_id: &str) -> Result<Value> {
        self.readings
            .lock()
            .get(device_id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound {
                kind: "statistics",
                device: device_id.to_string(),
            })
    }

    pub fn energy(&self) -> EnergyLog {
        self.energy.lock().clone()
    }

    pub fn energy_for(&self, device_id: &str) -> Result<EnergySeries> {
        self.energy
            .lock()
            .get(device_id)
            .cloned()
            .ok_or_else(|| BridgeError::NotFound {
                kind: "energy consumption",
                device: device_id.to_string(),
            })
    }

    pub fn counts(&self) -> StoreCounts {
        StoreCounts {
            devices: self.devices.lock().len(),
            readings: self.readings.lock().len(),
            energy_series: self.energy.lock().len(),
        }
    }

    // ============ SUPPRESSIONS (absent = no-op) ============

    pub fn clear_devices(&self) {
        self.devices.lock().clear();
    }

    pub fn remove_device(&self, device_id: &str) {
        self.devices.lock().shift_remove(device_id);
    }

    pub fn clear_readings(&self) {
        self.readings.lock().clear();
    }

    pub fn remove_reading(&self, device_id: &str) {
        self.readings.lock().shift_remove(device_id);
    }

    pub fn clear_energy(&self) {
        self.energy.lock().clear();
    }

    pub fn remove_energy(&self, device_id: &str) {
        self.energy.lock().shift_remove(device_id);
    }
}
