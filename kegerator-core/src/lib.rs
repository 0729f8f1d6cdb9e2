//! # kegerator-core
//!
//! Core library for kegerator - a keg fridge monitor.
//!
//! This library provides:
//! - Domain types for kegs, flow meters, pours and sensor readings
//! - Pour segmentation over raw flow meter pulses
//! - Humidity/temperature polling
//! - The JSON state file, runtime state and hot reload
//! - Metric sinks, configuration and logging
//!
//! ## Architecture
//!
//! Pulses flow through three stages:
//! - **Source:** a [`hardware::PulseSource`] pushes edge timestamps into a
//!   bounded queue without blocking
//! - **Consumer:** one task per keg applies pulses, retirement deadlines and
//!   commands to its [`FlowAggregator`]
//! - **Readers:** status endpoints and the persistence loop take snapshots
//!   through the shared [`StateHandle`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use kegerator_core::hardware::SimulatedHardware;
//! use kegerator_core::{Config, NoopSink, ReloadCoordinator, RuntimeState, StateContext, StateHandle};
//!
//! # async fn run() -> kegerator_core::Result<()> {
//! let config = Config::load()?;
//! let ctx = StateContext::new(Arc::new(SimulatedHardware::new()), Arc::new(NoopSink), &config);
//!
//! let state = RuntimeState::restore(&config.state.file, &ctx)?;
//! state.start();
//!
//! let coordinator = ReloadCoordinator::new(StateHandle::new(state), ctx, &config.state.file);
//! coordinator.reload().await?;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use config::Config;
pub use error::{Error, Result};
pub use flow::{Calibration, FlowAggregator, FlowHandle, PulseSender, StopMode};
pub use metrics::{MetricSink, NoopSink, PrometheusSink};
pub use reload::{ReloadCoordinator, ReloadPhase, ReloadStatus};
pub use state::{RuntimeState, StateContext, StateFile, StateHandle};
pub use types::*;

// Public modules
pub mod config;
pub mod dht;
pub mod error;
pub mod flow;
pub mod hardware;
pub mod logging;
pub mod metrics;
pub mod reload;
pub mod state;
pub mod types;
