//! Hardware boundary
//!
//! ```text
//!   GPIO edge ──▶ PulseSource ──▶ PulseSender ──▶ FlowHandle
//!   DHT bus   ──▶ HumiditySensor ──────────────▶ DhtMonitor
//! ```
//!
//! The daemon never touches pins directly; it asks a [`Hardware`] for pulse
//! sources and humidity sensors. [`SimulatedHardware`] backs tests and runs
//! without a board.

mod simulated;

pub use simulated::SimulatedHardware;

use crate::error::Result;
use crate::flow::PulseSender;
use crate::types::{DhtModel, SensorReading};

/// Delivers flow meter edges for one pin.
pub trait PulseSource: Send {
    /// Start delivering edges from `pin` to `sender`.
    ///
    /// Edge delivery must not block; [`PulseSender::send`] never does.
    fn attach(&mut self, pin: u8, sender: PulseSender) -> Result<()>;

    /// Stop delivering edges. Detaching twice is not an error.
    fn detach(&mut self) -> Result<()>;
}

/// A humidity/temperature sensor already attached to its pin.
pub trait HumiditySensor: Send {
    /// Blocking read, retrying up to `retries` times on checksum or timing
    /// failures. The returned reading reports the retries it used.
    fn read(&mut self, retries: u32) -> Result<SensorReading>;

    /// Release the pin.
    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Factory for the sensors a state file describes
pub trait Hardware: Send + Sync {
    fn pulse_source(&self) -> Box<dyn PulseSource>;

    /// Attach a humidity sensor of `model` on `pin`.
    fn humidity_sensor(&self, model: DhtModel, pin: u8) -> Result<Box<dyn HumiditySensor>>;
}
