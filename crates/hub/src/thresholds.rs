//! Per-sensor limits and the alerts they raise against the latest reading.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::feed::SensorReading;

/// Inclusive acceptable range.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub min: f64,
    pub max: f64,
}

pub type Thresholds = BTreeMap<String, Threshold>;

pub fn default_thresholds() -> Thresholds {
    [
        ("temperature", 18.0, 30.0),
        ("humidity", 40.0, 80.0),
        ("lightIntensity", 200.0, 2000.0),
        ("soilMoisture", 30.0, 70.0),
    ]
    .into_iter()
    .map(|(key, min, max)| (key.to_string(), Threshold { min, max }))
    .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    BelowMin,
    AboveMax,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdAlert {
    pub sensor: String,
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub kind: AlertKind,
}

/// Missing or non-finite values raise nothing.
pub fn evaluate(reading: &SensorReading, thresholds: &Thresholds) -> Vec<ThresholdAlert> {
    thresholds
        .iter()
        .filter_map(|(sensor, t)| {
            let value = reading.value(sensor)?;
            let kind = if value < t.min {
                AlertKind::BelowMin
            } else if value > t.max {
                AlertKind::AboveMax
            } else {
                return None;
            };
            Some(ThresholdAlert {
                sensor: sensor.clone(),
                value,
                min: t.min,
                max: t.max,
                kind,
            })
        })
        .collect()
}
