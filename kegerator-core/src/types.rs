//! Core domain types for kegerator
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Pulse** | One rising edge from a flow meter; each represents a fixed volume |
//! | **Pour** | A run of pulses whose inter-arrival gaps stay below the gap threshold |
//! | **Flow constant** | Meter calibration in pulses per liter per minute |
//! | **Retirement** | Discarding a pour that never reached the commit threshold |
//! | **Keg** | A container with a nominal volume, used to compute what remains |
//!
//! Model names (keg types, flow meters, DHT sensors) only exist as strings in
//! the state file. They are parsed into the enums below when the file is
//! loaded, so nothing past the loader dispatches on strings.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;

// ============================================
// Kegs
// ============================================

/// Supported keg sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KegType {
    /// Cornelius keg
    Corny,
    /// Sixth barrel
    Sixtel,
    /// Quarter barrel (pony)
    Quarter,
    /// Full-size half barrel
    HalfBarrel,
}

impl KegType {
    pub fn as_str(&self) -> &'static str {
        match self {
            KegType::Corny => "corny",
            KegType::Sixtel => "sixtel",
            KegType::Quarter => "quarter",
            KegType::HalfBarrel => "half-barrel",
        }
    }

    /// Reference volume in liters. The state file's volume is authoritative.
    pub fn nominal_volume(&self) -> f64 {
        match self {
            KegType::Corny => 18.93,
            KegType::Sixtel => 19.55,
            KegType::Quarter => 29.34,
            KegType::HalfBarrel => 58.67,
        }
    }
}

impl FromStr for KegType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "corny" => Ok(KegType::Corny),
            "sixtel" => Ok(KegType::Sixtel),
            "quarter" => Ok(KegType::Quarter),
            "half-barrel" => Ok(KegType::HalfBarrel),
            _ => Err(Error::Validation(format!("unknown keg type {:?}", s))),
        }
    }
}

impl fmt::Display for KegType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A keg attached to a flow meter
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keg {
    pub kind: KegType,
    /// Full volume in liters
    pub volume: f64,
}

impl Keg {
    pub fn new(kind: KegType) -> Self {
        Self {
            kind,
            volume: kind.nominal_volume(),
        }
    }
}

// ============================================
// Sensors
// ============================================

/// Supported flow meter models
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowMeterModel {
    /// Digiten FL-S401A
    FlS401a,
    /// Gredia GR-R401
    GrR401,
    /// Gredia GR-301
    Gr301,
    /// uxcell a18041200ux0151
    Ux0151,
}

impl FlowMeterModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlowMeterModel::FlS401a => "fl-s401a",
            FlowMeterModel::GrR401 => "gr-r401",
            FlowMeterModel::Gr301 => "gr-301",
            FlowMeterModel::Ux0151 => "ux0151",
        }
    }

    /// Manufacturer flow constant. Calibrated values come from the state file.
    pub fn reference_constant(&self) -> f64 {
        match self {
            FlowMeterModel::FlS401a => 98.0,
            FlowMeterModel::GrR401 => 98.0,
            FlowMeterModel::Gr301 => 21.0,
            FlowMeterModel::Ux0151 => 76.0,
        }
    }
}

impl FromStr for FlowMeterModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fl-s401a" => Ok(FlowMeterModel::FlS401a),
            "gr-r401" => Ok(FlowMeterModel::GrR401),
            "gr-301" => Ok(FlowMeterModel::Gr301),
            "ux0151" => Ok(FlowMeterModel::Ux0151),
            _ => Err(Error::Validation(format!(
                "unknown flow meter model {:?}",
                s
            ))),
        }
    }
}

impl fmt::Display for FlowMeterModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A flow meter model together with its calibration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlowMeter {
    pub model: FlowMeterModel,
    /// Pulses per liter per minute
    pub flow_constant: f64,
}

impl FlowMeter {
    pub fn new(model: FlowMeterModel) -> Self {
        Self {
            model,
            flow_constant: model.reference_constant(),
        }
    }
}

/// Validate a flow constant supplied by a file or request.
pub fn validate_flow_constant(constant: f64) -> crate::Result<f64> {
    if constant.is_finite() && constant > 0.0 {
        Ok(constant)
    } else {
        Err(Error::Validation(format!(
            "flow constant must be positive, got {}",
            constant
        )))
    }
}

/// Liters represented by one pulse: 1 / (constant * 60 seconds)
pub fn flow_per_event(flow_constant: f64) -> f64 {
    1.0 / (flow_constant * 60.0)
}

/// Supported humidity/temperature sensors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DhtModel {
    Dht11,
    Dht22,
}

impl DhtModel {
    pub fn as_str(&self) -> &'static str {
        match self {
            DhtModel::Dht11 => "dht11",
            DhtModel::Dht22 => "dht22",
        }
    }
}

impl FromStr for DhtModel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dht11" => Ok(DhtModel::Dht11),
            "dht22" => Ok(DhtModel::Dht22),
            _ => Err(Error::Validation(format!("invalid dht model {:?}", s))),
        }
    }
}

impl fmt::Display for DhtModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================
// Pulses and Pours
// ============================================

/// A single flow meter edge, in microseconds since the Unix epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct PulseEvent {
    pub micros: i64,
}

impl PulseEvent {
    pub fn at_micros(micros: i64) -> Self {
        Self { micros }
    }
}

/// One continuous dispense
#[derive(Debug, Clone, PartialEq)]
pub struct Pour {
    /// Per-aggregator sequence number
    pub id: u64,
    /// `<pin>_<contents>` at the time the pour started
    pub keg: String,
    /// Microseconds since the Unix epoch
    pub start_micros: i64,
    pub duration: Duration,
    pub events: u32,
    /// Liters
    pub volume: f64,
}

impl Pour {
    pub fn start_time(&self) -> DateTime<Utc> {
        Utc.timestamp_micros(self.start_micros)
            .single()
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Microsecond timestamp of the last pulse in this pour
    pub fn end_micros(&self) -> i64 {
        self.start_micros + self.duration.as_micros() as i64
    }
}

impl Serialize for Pour {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        struct Wire<'a> {
            time: String,
            keg: &'a str,
            duration: f64,
            volume: f64,
        }

        Wire {
            time: self
                .start_time()
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            keg: &self.keg,
            duration: self.duration.as_secs_f64(),
            volume: self.volume,
        }
        .serialize(serializer)
    }
}

// ============================================
// Humidity / temperature
// ============================================

/// Latest accepted humidity/temperature sample
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    pub temperature: f32,
    pub humidity: f32,
    pub retries: u32,
}
