//! Sensor records and the registry (C2), plus the synthetic time sensor (C5).

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Local;
use serde::Serialize;

use crate::codec::{self, RawPayload, ReturnType, ScalarValue};
use crate::config::RawSensorDescriptor;
use crate::error::{ConfigError, EplumberError, UnknownSensor};

pub const DEFAULT_WINDOW: usize = 5;

/// The three concrete sensor variants. A tagged union rather than a trait
/// object: the method set is identical across variants, only `mean`/`last`
/// and whether `append` does anything differ, and all three share the same
/// ring-buffer storage except `Time`, which has none.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorVariant {
    Mqtt,
    Http,
    Time,
}

struct SensorInner {
    values: VecDeque<ScalarValue>,
    connected: bool,
    ready: bool,
}

/// A single sensor's full record: its static descriptor plus its mutable
/// rolling window, guarded by one mutex. Readers see either the pre- or
/// post-append window, never a torn one.
pub struct SensorRecord {
    pub name: String,
    pub route: String,
    pub variant: SensorVariant,
    pub return_type: ReturnType,
    pub json_path: Option<String>,
    pub value_list_length: usize,
    inner: Mutex<SensorInner>,
}

/// A point-in-time view of a sensor, as returned to the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct SensorSnapshot {
    pub name: String,
    pub route: String,
    #[serde(rename = "type")]
    pub variant: SensorVariant,
    pub return_type: ReturnType,
    pub connected: bool,
    pub ready: bool,
    pub mean: Option<ScalarValue>,
    pub last: Option<ScalarValue>,
    pub values: Vec<ScalarValue>,
    pub value_count: usize,
}

impl SensorRecord {
    fn new(
        name: String,
        route: String,
        variant: SensorVariant,
        return_type: ReturnType,
        json_path: Option<String>,
        value_list_length: usize,
    ) -> Self {
        let connected = variant == SensorVariant::Time;
        let ready = match variant {
            SensorVariant::Time | SensorVariant::Mqtt => true,
            SensorVariant::Http => false,
        };
        Self {
            name,
            route,
            variant,
            return_type,
            json_path,
            value_list_length: value_list_length.max(1),
            inner: Mutex::new(SensorInner {
                values: VecDeque::with_capacity(value_list_length.max(1)),
                connected,
                ready,
            }),
        }
    }

    fn time() -> Self {
        Self::new(
            "time".to_string(),
            String::new(),
            SensorVariant::Time,
            ReturnType::Str,
            None,
            1,
        )
    }

    /// Route an inbound payload through the codec and, on success, push it
    /// into the ring buffer, evicting the oldest entry if full.
    pub fn append(&self, raw: RawPayload) -> Result<(), EplumberError> {
        if self.variant == SensorVariant::Time {
            // Time has no ingress path; nothing ever appends to it.
            return Ok(());
        }
        match codec::decode(raw, self.return_type, self.json_path.as_deref(), &self.name)? {
            Some(value) => {
                let mut inner = self.inner.lock().unwrap();
                if inner.values.len() >= self.value_list_length {
                    inner.values.pop_front();
                }
                inner.values.push_back(value);
                inner.connected = true;
                inner.ready = true;
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Mark a poll failure. Only meaningful for HTTP sensors.
    pub fn mark_disconnected(&self) {
        self.inner.lock().unwrap().connected = false;
    }

    fn time_now() -> ScalarValue {
        ScalarValue::Str(Local::now().format("%H:%M").to_string())
    }

    /// For bool/str sensors this equals `last`; for numeric sensors it is
    /// the arithmetic mean of the window as a real number. The time sensor
    /// computes its value live at call time.
    pub fn mean(&self) -> Option<ScalarValue> {
        if self.variant == SensorVariant::Time {
            return Some(Self::time_now());
        }
        let inner = self.inner.lock().unwrap();
        if inner.values.is_empty() {
            return None;
        }
        match self.return_type {
            ReturnType::Bool | ReturnType::Str => inner.values.back().cloned(),
            ReturnType::Int | ReturnType::Float => {
                let sum: f64 = inner.values.iter().filter_map(ScalarValue::as_f64).sum();
                Some(ScalarValue::Float(sum / inner.values.len() as f64))
            }
        }
    }

    pub fn last(&self) -> Option<ScalarValue> {
        if self.variant == SensorVariant::Time {
            return Some(Self::time_now());
        }
        self.inner.lock().unwrap().values.back().cloned()
    }

    pub fn connected(&self) -> bool {
        if self.variant == SensorVariant::Time {
            return true;
        }
        self.inner.lock().unwrap().connected
    }

    pub fn snapshot(&self) -> SensorSnapshot {
        let (values, connected, ready) = if self.variant == SensorVariant::Time {
            (vec![Self::time_now()], true, true)
        } else {
            let inner = self.inner.lock().unwrap();
            (inner.values.iter().cloned().collect(), inner.connected, inner.ready)
        };
        SensorSnapshot {
            name: self.name.clone(),
            route: self.route.clone(),
            variant: self.variant,
            return_type: self.return_type,
            connected,
            ready,
            mean: self.mean(),
            last: self.last(),
            value_count: values.len(),
            values,
        }
    }
}

/// Name- and route-indexed registry. Sensors live in a flat `Vec`; the two
/// maps hold indices into it, so `name` and `route` aliasing the same
/// record is structural rather than something callers must remember to
/// deduplicate by hand (see design note on name/route aliasing).
pub struct Registry {
    sensors: Vec<Arc<SensorRecord>>,
    by_name: HashMap<String, usize>,
    by_route: HashMap<String, usize>,
}

impl Registry {
    /// A fresh registry, pre-seeded with the `"time"` pseudo-sensor.
    pub fn new() -> Self {
        let mut reg = Self {
            sensors: Vec::new(),
            by_name: HashMap::new(),
            by_route: HashMap::new(),
        };
        reg.insert(Arc::new(SensorRecord::time()));
        reg
    }

    fn insert(&mut self, sensor: Arc<SensorRecord>) {
        let idx = self.sensors.len();
        self.by_name.insert(sensor.name.clone(), idx);
        if !sensor.route.is_empty() {
            // Duplicate route inserts replace silently (config reload semantics):
            // the last sensor to claim a route wins the route key, but both
            // sensors remain independently addressable by name.
            self.by_route.insert(sensor.route.clone(), idx);
        }
        self.sensors.push(sensor);
    }

    /// Construct and insert a sensor from its configuration descriptor.
    pub fn add(&mut self, desc: &RawSensorDescriptor) -> Result<(), ConfigError> {
        if self.by_name.contains_key(&desc.name) {
            return Err(ConfigError::DuplicateSensor(desc.name.clone()));
        }
        let variant = match desc.r#type.as_str() {
            "mqtt" => SensorVariant::Mqtt,
            "http" => SensorVariant::Http,
            "time" => SensorVariant::Time,
            other => {
                return Err(ConfigError::UnknownSensorType {
                    name: desc.name.clone(),
                    kind: other.to_string(),
                })
            }
        };
        let record = SensorRecord::new(
            desc.name.clone(),
            desc.route.clone(),
            variant,
            desc.return_type,
            desc.json_path.clone(),
            desc.value_list_length,
        );
        self.insert(Arc::new(record));
        Ok(())
    }

    pub fn lookup(&self, key: &str) -> Result<Arc<SensorRecord>, UnknownSensor> {
        self.by_name
            .get(key)
            .or_else(|| self.by_route.get(key))
            .map(|&idx| self.sensors[idx].clone())
            .ok_or_else(|| UnknownSensor(key.to_string()))
    }

    pub fn lookup_by_name(&self, name: &str) -> Option<Arc<SensorRecord>> {
        self.by_name.get(name).map(|&idx| self.sensors[idx].clone())
    }

    /// Route a raw payload to the sensor identified by `key` (name or route).
    pub fn append(&self, key: &str, raw: RawPayload) -> Result<(), EplumberError> {
        let sensor = self.lookup(key)?;
        sensor.append(raw)
    }

    pub fn sensors_of(&self, variant: SensorVariant) -> Vec<Arc<SensorRecord>> {
        self.sensors
            .iter()
            .filter(|s| s.variant == variant)
            .cloned()
            .collect()
    }

    /// Every distinct sensor (the flat list is already deduplicated: `name`
    /// and `route` are just two keys pointing into the same `Vec`).
    pub fn snapshot(&self) -> Vec<SensorSnapshot> {
        self.sensors.iter().map(|s| s.snapshot()).collect()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RawSensorDescriptor;

    fn desc(name: &str, route: &str, kind: &str) -> RawSensorDescriptor {
        RawSensorDescriptor {
            r#type: kind.to_string(),
            name: name.to_string(),
            route: route.to_string(),
            return_type: ReturnType::Float,
            json_path: None,
            value_list_length: 3,
        }
    }

    #[test]
    fn time_sensor_is_preseeded() {
        let reg = Registry::new();
        let time = reg.lookup("time").unwrap();
        assert_eq!(time.variant, SensorVariant::Time);
        assert!(time.connected());
        assert!(matches!(time.mean(), Some(ScalarValue::Str(_))));
    }

    #[test]
    fn ring_buffer_evicts_oldest() {
        let mut reg = Registry::new();
        reg.add(&desc("temp", "temp/topic", "mqtt")).unwrap();
        let sensor = reg.lookup("temp").unwrap();
        for v in ["24", "26", "28", "30"] {
            sensor.append(RawPayload::Text(v.into())).unwrap();
        }
        let snap = sensor.snapshot();
        assert_eq!(snap.value_count, 3);
        assert_eq!(snap.values[0], ScalarValue::Float(26.0));
        assert_eq!(snap.last, Some(ScalarValue::Float(30.0)));
    }

    #[test]
    fn mean_of_three_numeric_readings() {
        let mut reg = Registry::new();
        reg.add(&desc("temp", "temp/topic", "mqtt")).unwrap();
        let sensor = reg.lookup("temp").unwrap();
        for v in ["24", "26", "28"] {
            sensor.append(RawPayload::Text(v.into())).unwrap();
        }
        assert_eq!(sensor.mean(), Some(ScalarValue::Float(26.0)));
    }

    #[test]
    fn name_and_route_alias_same_record() {
        let mut reg = Registry::new();
        reg.add(&desc("temp", "sensors/temp", "mqtt")).unwrap();
        reg.append("sensors/temp", RawPayload::Text("21".into())).unwrap();
        let by_name = reg.lookup("temp").unwrap();
        assert_eq!(by_name.last(), Some(ScalarValue::Float(21.0)));
        // Only one distinct sensor should show up in a snapshot despite two keys.
        assert_eq!(reg.snapshot().len(), 2); // time + temp
    }

    #[test]
    fn unknown_sensor_type_is_rejected() {
        let mut reg = Registry::new();
        let err = reg.add(&desc("x", "x", "carrier-pigeon")).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSensorType { .. }));
    }

    #[test]
    fn empty_window_has_no_mean() {
        let mut reg = Registry::new();
        reg.add(&desc("temp", "temp/topic", "mqtt")).unwrap();
        let sensor = reg.lookup("temp").unwrap();
        assert_eq!(sensor.mean(), None);
    }
}
