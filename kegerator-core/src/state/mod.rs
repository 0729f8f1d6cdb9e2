//! Runtime state: every attached keg and sensor
//!
//! A [`RuntimeState`] is built from a state file, started, served through a
//! [`StateHandle`], and eventually shut down either at process exit or when
//! a reload swaps in its replacement. States are never mutated in place;
//! a reload always builds a new one.

mod file;

pub use file::{
    check, DhtConfig, DhtEntry, KegConfig, KegEntry, KegSpec, SensorSpec, StateFile,
    ValidatedState,
};

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::{Config, DhtSettings, FlowSettings};
use crate::dht::DhtMonitor;
use crate::error::Result;
use crate::flow::{FlowAggregator, FlowHandle, StopMode};
use crate::hardware::Hardware;
use crate::metrics::{DhtLabels, FlowLabels, MetricSink};

/// Everything a state needs besides its file
#[derive(Clone)]
pub struct StateContext {
    pub hardware: Arc<dyn Hardware>,
    pub sink: Arc<dyn MetricSink>,
    pub flow: FlowSettings,
    pub dht: DhtSettings,
}

impl StateContext {
    pub fn new(hardware: Arc<dyn Hardware>, sink: Arc<dyn MetricSink>, config: &Config) -> Self {
        Self {
            hardware,
            sink,
            flow: config.flow,
            dht: config.dht,
        }
    }
}

/// The live set of flow aggregators and humidity monitors
pub struct RuntimeState {
    flows: Vec<FlowHandle>,
    dhts: Vec<DhtMonitor>,
    sink: Arc<dyn MetricSink>,
}

impl RuntimeState {
    /// A state with nothing attached
    pub fn empty(sink: Arc<dyn MetricSink>) -> Self {
        Self {
            flows: Vec::new(),
            dhts: Vec::new(),
            sink,
        }
    }

    /// Load `path` and attach every entry. Blocks on hardware.
    ///
    /// Any failure detaches whatever was already attached.
    pub fn restore(path: &Path, ctx: &StateContext) -> Result<Self> {
        let validated = StateFile::read(path)?.validate()?;
        Self::attach(validated, ctx)
    }

    /// Attach a validated state. Blocks on hardware.
    pub fn attach(validated: ValidatedState, ctx: &StateContext) -> Result<Self> {
        let mut state = Self::empty(ctx.sink.clone());

        for keg in validated.kegs {
            let flow = match Self::attach_keg(keg, ctx) {
                Ok(flow) => flow,
                Err(e) => {
                    state.abort();
                    return Err(e);
                }
            };
            state.flows.push(flow);
        }

        for dht in validated.dhts {
            let monitor = DhtMonitor::attach(
                ctx.hardware.as_ref(),
                dht.model,
                dht.pin,
                dht.previous,
                ctx.dht,
                ctx.sink.clone(),
            );
            match monitor {
                Ok(monitor) => state.dhts.push(monitor),
                Err(e) => {
                    state.abort();
                    return Err(e);
                }
            }
        }

        state.refresh_gauges();
        tracing::info!(
            kegs = state.flows.len(),
            dhts = state.dhts.len(),
            "state attached"
        );
        Ok(state)
    }

    fn attach_keg(keg: KegConfig, ctx: &StateContext) -> Result<FlowHandle> {
        let mut aggregator =
            FlowAggregator::with_settings(keg.pin, keg.keg, keg.sensor, keg.contents, &ctx.flow)?;
        aggregator.restore_poured(keg.poured);

        let mut flow = FlowHandle::new(aggregator, ctx.flow.queue_capacity, ctx.sink.clone());
        flow.restore_dropped(keg.dropped);
        flow.attach(ctx.hardware.pulse_source())?;
        Ok(flow)
    }

    /// Release hardware from a state that never started
    fn abort(&self) {
        for flow in &self.flows {
            if let Err(e) = flow.detach() {
                tracing::warn!(pin = flow.pin(), error = %e, "failed to detach flow meter");
            }
        }
        for dht in &self.dhts {
            dht.release();
        }
    }

    /// Start every consumer and poller. Idempotent.
    pub fn start(&self) {
        for flow in &self.flows {
            flow.start();
        }
        for dht in &self.dhts {
            dht.start();
        }
    }

    /// Detach sources, stop consumers with `mode`, stop pollers. Idempotent.
    pub async fn shutdown(&self, mode: StopMode) {
        for flow in &self.flows {
            if let Err(e) = flow.detach() {
                tracing::warn!(pin = flow.pin(), error = %e, "failed to detach flow meter");
            }
        }
        for flow in &self.flows {
            flow.stop(mode).await;
        }
        for dht in &self.dhts {
            dht.stop().await;
        }
    }

    /// Remove the metric series this state owns that `successor` does not
    pub fn forget_metrics(&self, successor: Option<&RuntimeState>) {
        let kept_flows: HashSet<FlowLabels> = successor
            .map(|next| next.flows.iter().map(FlowHandle::labels).collect())
            .unwrap_or_default();
        let kept_dhts: HashSet<DhtLabels> = successor
            .map(|next| next.dhts.iter().map(DhtMonitor::labels).collect())
            .unwrap_or_default();

        for labels in self.flows.iter().map(FlowHandle::labels) {
            if !kept_flows.contains(&labels) {
                self.sink.forget_flow(&labels);
            }
        }
        for labels in self.dhts.iter().map(DhtMonitor::labels) {
            if !kept_dhts.contains(&labels) {
                self.sink.forget_dht(&labels);
            }
        }
    }

    /// Push the current remaining volume of every keg to the sink
    pub fn refresh_gauges(&self) {
        for flow in &self.flows {
            let (labels, remaining) = flow.with(|agg| (agg.labels(), agg.remaining_volume()));
            self.sink.remaining_volume_set(&labels, remaining);
        }
    }

    pub fn flows(&self) -> &[FlowHandle] {
        &self.flows
    }

    pub fn flow(&self, pin: u8) -> Option<&FlowHandle> {
        self.flows.iter().find(|flow| flow.pin() == pin)
    }

    pub fn dhts(&self) -> &[DhtMonitor] {
        &self.dhts
    }

    /// The state in its file form
    pub fn snapshot(&self) -> StateFile {
        let kegs = self
            .flows
            .iter()
            .map(|flow| {
                let dropped = flow.dropped();
                flow.with(|agg| KegEntry {
                    keg: KegSpec {
                        kind: agg.keg().kind.to_string(),
                        volume: agg.keg().volume,
                    },
                    sensor: SensorSpec {
                        model: agg.sensor().model.to_string(),
                        flow_constant: agg.sensor().flow_constant,
                    },
                    contents: agg.contents().to_string(),
                    pin: agg.pin(),
                    poured: agg.total_flow(),
                    dropped,
                })
            })
            .collect();

        let dhts = self
            .dhts
            .iter()
            .map(|dht| {
                let reading = dht.reading();
                DhtEntry {
                    model: dht.model().to_string(),
                    pin: dht.pin(),
                    temperature: reading.temperature,
                    humidity: reading.humidity,
                }
            })
            .collect();

        StateFile { kegs, dhts }
    }
}

/// Shared pointer to the current [`RuntimeState`]
///
/// Readers clone the inner `Arc` and keep using it even if a reload swaps
/// in a new state meanwhile.
#[derive(Clone)]
pub struct StateHandle {
    current: Arc<RwLock<Arc<RuntimeState>>>,
}

impl StateHandle {
    pub fn new(state: RuntimeState) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(state))),
        }
    }

    pub fn current(&self) -> Arc<RuntimeState> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install `next` and return the state it replaced
    pub(crate) fn swap(&self, next: Arc<RuntimeState>) -> Arc<RuntimeState> {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *current, next)
    }
}
