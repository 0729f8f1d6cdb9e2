//! The JSON state file
//!
//! ```json
//! {"kegs":[{"keg":{"type":"corny","volume":18.93},
//!           "sensor":{"model":"gr-301","flow_constant":21.0},
//!           "contents":"stout","pin":17,"poured":1.25}],
//!  "dhts":[{"model":"dht22","pin":4,"temperature":3.5,"humidity":41.0}]}
//! ```
//!
//! Models travel as strings so that an unknown name is reported verbatim.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{
    validate_flow_constant, DhtModel, FlowMeter, FlowMeterModel, Keg, KegType, SensorReading,
};

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateFile {
    #[serde(default)]
    pub kegs: Vec<KegEntry>,
    #[serde(default)]
    pub dhts: Vec<DhtEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KegEntry {
    pub keg: KegSpec,
    pub sensor: SensorSpec,
    pub contents: String,
    pub pin: u8,
    /// Liters dispensed since the last refill
    #[serde(default)]
    pub poured: f64,
    /// Pulses lost to a full ingestion queue
    #[serde(default, skip_serializing_if = "is_zero")]
    pub dropped: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KegSpec {
    #[serde(rename = "type")]
    pub kind: String,
    pub volume: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSpec {
    pub model: String,
    pub flow_constant: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DhtEntry {
    pub model: String,
    pub pin: u8,
    #[serde(default, skip_serializing_if = "is_zero_f32")]
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "is_zero_f32")]
    pub humidity: f32,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

fn is_zero_f32(n: &f32) -> bool {
    *n == 0.0
}

/// A keg entry with every field checked
#[derive(Debug, Clone, PartialEq)]
pub struct KegConfig {
    pub pin: u8,
    pub keg: Keg,
    pub sensor: FlowMeter,
    pub contents: String,
    pub poured: f64,
    pub dropped: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DhtConfig {
    pub pin: u8,
    pub model: DhtModel,
    pub previous: SensorReading,
}

/// A state file that passed validation and is ready to attach
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidatedState {
    pub kegs: Vec<KegConfig>,
    pub dhts: Vec<DhtConfig>,
}

impl StateFile {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        serde_json::from_slice(&bytes).map_err(Error::Decode)
    }

    /// Write pretty JSON to a sibling temporary file, then rename it over `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut json = serde_json::to_vec_pretty(self).map_err(Error::Encode)?;
        json.push(b'\n');

        let tmp = temp_path(path);
        std::fs::write(&tmp, &json)?;
        if let Err(e) = std::fs::rename(&tmp, path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<ValidatedState> {
        let mut pins = HashSet::new();
        let mut claim = |pin: u8| {
            if pins.insert(pin) {
                Ok(())
            } else {
                Err(Error::Validation(format!("pin {} is used more than once", pin)))
            }
        };

        let mut kegs = Vec::with_capacity(self.kegs.len());
        for entry in &self.kegs {
            claim(entry.pin)?;
            kegs.push(entry.validate()?);
        }

        let mut dhts = Vec::with_capacity(self.dhts.len());
        for entry in &self.dhts {
            claim(entry.pin)?;
            dhts.push(DhtConfig {
                pin: entry.pin,
                model: entry.model.parse()?,
                previous: SensorReading {
                    temperature: entry.temperature,
                    humidity: entry.humidity,
                    retries: 0,
                },
            });
        }

        Ok(ValidatedState { kegs, dhts })
    }
}

impl KegEntry {
    fn validate(&self) -> Result<KegConfig> {
        let kind: KegType = self.keg.kind.parse()?;
        let model: FlowMeterModel = self.sensor.model.parse()?;
        let flow_constant = validate_flow_constant(self.sensor.flow_constant).map_err(|_| {
            Error::Validation(format!(
                "pin {}: flow constant must be positive, got {}",
                self.pin, self.sensor.flow_constant
            ))
        })?;
        if !(self.keg.volume.is_finite() && self.keg.volume > 0.0) {
            return Err(Error::Validation(format!(
                "pin {}: keg volume must be positive, got {}",
                self.pin, self.keg.volume
            )));
        }
        if !(self.poured.is_finite() && self.poured >= 0.0) {
            return Err(Error::Validation(format!(
                "pin {}: poured volume must not be negative, got {}",
                self.pin, self.poured
            )));
        }

        Ok(KegConfig {
            pin: self.pin,
            keg: Keg {
                kind,
                volume: self.keg.volume,
            },
            sensor: FlowMeter {
                model,
                flow_constant,
            },
            contents: self.contents.clone(),
            poured: self.poured,
            dropped: self.dropped,
        })
    }
}

/// Parse and validate a state file without touching hardware
pub fn check(path: &Path) -> Result<ValidatedState> {
    StateFile::read(path)?.validate()
}

fn temp_path(path: &Path) -> std::path::PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "state.json".to_string());
    path.with_file_name(format!(".{}.tmp", name))
}
