//! Flow meter pulse aggregation
//!
//! Each keg tap has a hall-effect flow meter that emits one pulse per fixed
//! volume of liquid. [`FlowAggregator`] turns that pulse stream into pours:
//!
//! - pulses separated by less than the gap threshold belong to one pour
//! - a pour with fewer pulses than the event threshold is noise and is
//!   retired one gap after its last pulse
//! - once a pour reaches the threshold it is committed and its volume is
//!   reported, then every later pulse reports one pulse's worth
//!
//! [`FlowHandle`] runs the aggregator on a single consumer task so pulses,
//! retirement deadlines, refills and calibration never race.

mod aggregator;
mod handle;

pub use aggregator::{Deadline, FlowAggregator, Ingested};
pub use handle::{Calibration, FlowHandle, PulseSender, StopMode};
