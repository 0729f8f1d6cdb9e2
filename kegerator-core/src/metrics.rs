//! Metric sinks
//!
//! Aggregators and sensor monitors push their measurements into a
//! [`MetricSink`]. The daemon uses [`PrometheusSink`], which owns a private
//! registry rendered by `GET /metrics`. Tests use [`RecordingSink`].

use std::collections::HashMap;
use std::sync::Mutex;

use prometheus::{CounterVec, Encoder, GaugeVec, Opts, Registry, TextEncoder};

use crate::error::{Error, Result};
use crate::types::{DhtModel, KegType, SensorReading};

const NAMESPACE: &str = "kegerator";

/// Label set for per-keg series
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FlowLabels {
    pub pin: u8,
    pub keg_type: KegType,
    pub contents: String,
}

impl FlowLabels {
    fn values(&self) -> [String; 3] {
        [
            self.pin.to_string(),
            self.keg_type.as_str().to_string(),
            self.contents.clone(),
        ]
    }
}

/// Label set for per-sensor series
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DhtLabels {
    pub pin: u8,
    pub model: DhtModel,
}

impl DhtLabels {
    fn values(&self) -> [String; 2] {
        [self.pin.to_string(), self.model.as_str().to_string()]
    }
}

/// Destination for flow and sensor measurements
pub trait MetricSink: Send + Sync {
    /// Add committed pour volume, in liters
    fn pour_volume_add(&self, labels: &FlowLabels, liters: f64);

    /// Set the volume left in a keg, in liters
    fn remaining_volume_set(&self, labels: &FlowLabels, liters: f64);

    /// Count pulses dropped because the ingestion queue was full
    fn pulses_dropped_add(&self, labels: &FlowLabels, count: u64);

    /// Record an accepted humidity/temperature sample
    fn dht_reading(&self, labels: &DhtLabels, reading: &SensorReading);

    /// Remove every series carrying these flow labels
    fn forget_flow(&self, labels: &FlowLabels);

    /// Remove every series carrying these sensor labels
    fn forget_dht(&self, labels: &DhtLabels);
}

/// Sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn pour_volume_add(&self, _: &FlowLabels, _: f64) {}
    fn remaining_volume_set(&self, _: &FlowLabels, _: f64) {}
    fn pulses_dropped_add(&self, _: &FlowLabels, _: u64) {}
    fn dht_reading(&self, _: &DhtLabels, _: &SensorReading) {}
    fn forget_flow(&self, _: &FlowLabels) {}
    fn forget_dht(&self, _: &DhtLabels) {}
}

/// Prometheus-backed sink
pub struct PrometheusSink {
    registry: Registry,
    pour_volume: CounterVec,
    remaining_volume: GaugeVec,
    pulses_dropped: CounterVec,
    temperature: GaugeVec,
    humidity: GaugeVec,
    dht_retries: CounterVec,
    http_request_duration: CounterVec,
}

impl PrometheusSink {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let flow = &["pin", "type", "contents"];
        let dht = &["pin", "sensor"];

        let pour_volume = CounterVec::new(
            opts("pour_volume_liters", "Volume of liquid poured from a given keg"),
            flow,
        )
        .map_err(register_error)?;
        let remaining_volume = GaugeVec::new(
            opts(
                "remaining_volume_liters",
                "Volume of liquid remaining in a given keg",
            ),
            flow,
        )
        .map_err(register_error)?;
        let pulses_dropped = CounterVec::new(
            opts(
                "pulses_dropped_total",
                "Flow meter pulses dropped because the ingestion queue was full",
            ),
            flow,
        )
        .map_err(register_error)?;
        let temperature = GaugeVec::new(
            opts(
                "temperature_celsius",
                "Temperature of the fridge with sensor label",
            ),
            dht,
        )
        .map_err(register_error)?;
        let humidity = GaugeVec::new(
            opts("humidity_ratio", "Humidity of the fridge with sensor label"),
            dht,
        )
        .map_err(register_error)?;
        let dht_retries = CounterVec::new(
            opts(
                "dht_retries_total",
                "Number of sensor reading retries with sensor label",
            ),
            dht,
        )
        .map_err(register_error)?;
        let http_request_duration = CounterVec::new(
            opts(
                "http_request_duration_seconds",
                "How long this exporter takes to respond when scraped by prometheus",
            ),
            &["handler"],
        )
        .map_err(register_error)?;

        registry
            .register(Box::new(pour_volume.clone()))
            .map_err(register_error)?;
        registry
            .register(Box::new(remaining_volume.clone()))
            .map_err(register_error)?;
        registry
            .register(Box::new(pulses_dropped.clone()))
            .map_err(register_error)?;
        registry
            .register(Box::new(temperature.clone()))
            .map_err(register_error)?;
        registry
            .register(Box::new(humidity.clone()))
            .map_err(register_error)?;
        registry
            .register(Box::new(dht_retries.clone()))
            .map_err(register_error)?;
        registry
            .register(Box::new(http_request_duration.clone()))
            .map_err(register_error)?;

        Ok(Self {
            registry,
            pour_volume,
            remaining_volume,
            pulses_dropped,
            temperature,
            humidity,
            dht_retries,
            http_request_duration,
        })
    }

    /// Add time spent serving a request
    pub fn http_request_duration_add(&self, handler: &str, seconds: f64) {
        self.http_request_duration
            .with_label_values(&[handler])
            .inc_by(seconds);
    }

    /// Render every registered series in the Prometheus text format
    pub fn encode(&self) -> Result<String> {
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&families, &mut buffer)
            .map_err(|e| Error::Config(format!("encode metrics: {}", e)))?;
        String::from_utf8(buffer).map_err(|e| Error::Config(format!("encode metrics: {}", e)))
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }
}

fn opts(name: &str, help: &str) -> Opts {
    Opts::new(name, help).namespace(NAMESPACE)
}

fn register_error(e: prometheus::Error) -> Error {
    Error::Config(format!("register metric: {}", e))
}

fn as_refs<const N: usize>(values: &[String; N]) -> [&str; N] {
    std::array::from_fn(|i| values[i].as_str())
}

impl MetricSink for PrometheusSink {
    fn pour_volume_add(&self, labels: &FlowLabels, liters: f64) {
        let values = labels.values();
        self.pour_volume
            .with_label_values(&as_refs(&values))
            .inc_by(liters);
    }

    fn remaining_volume_set(&self, labels: &FlowLabels, liters: f64) {
        let values = labels.values();
        self.remaining_volume
            .with_label_values(&as_refs(&values))
            .set(liters);
    }

    fn pulses_dropped_add(&self, labels: &FlowLabels, count: u64) {
        let values = labels.values();
        self.pulses_dropped
            .with_label_values(&as_refs(&values))
            .inc_by(count as f64);
    }

    fn dht_reading(&self, labels: &DhtLabels, reading: &SensorReading) {
        let values = labels.values();
        let values = as_refs(&values);
        self.temperature
            .with_label_values(&values)
            .set(f64::from(reading.temperature));
        self.humidity
            .with_label_values(&values)
            .set(f64::from(reading.humidity) / 100.0);
        self.dht_retries
            .with_label_values(&values)
            .inc_by(f64::from(reading.retries));
    }

    fn forget_flow(&self, labels: &FlowLabels) {
        let values = labels.values();
        let values = as_refs(&values);
        // Missing series are fine: a keg that never poured has no counter yet
        let _ = self.pour_volume.remove_label_values(&values);
        let _ = self.remaining_volume.remove_label_values(&values);
        let _ = self.pulses_dropped.remove_label_values(&values);
    }

    fn forget_dht(&self, labels: &DhtLabels) {
        let values = labels.values();
        let values = as_refs(&values);
        let _ = self.temperature.remove_label_values(&values);
        let _ = self.humidity.remove_label_values(&values);
        let _ = self.dht_retries.remove_label_values(&values);
    }
}

/// Sink that keeps everything in memory, for tests and diagnostics
#[derive(Debug, Default)]
pub struct RecordingSink {
    inner: Mutex<Recorded>,
}

#[derive(Debug, Default, Clone)]
pub struct Recorded {
    /// Every `pour_volume_add` call, in order
    pub pour_additions: Vec<(FlowLabels, f64)>,
    pub remaining: HashMap<FlowLabels, f64>,
    pub dropped: HashMap<FlowLabels, u64>,
    pub readings: Vec<(DhtLabels, SensorReading)>,
    pub forgotten_flows: Vec<FlowLabels>,
    pub forgotten_dhts: Vec<DhtLabels>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Recorded {
        self.lock().clone()
    }

    /// Sum of committed pour volume for one label set
    pub fn poured(&self, labels: &FlowLabels) -> f64 {
        self.lock()
            .pour_additions
            .iter()
            .filter(|(l, _)| l == labels)
            .map(|(_, v)| v)
            .sum()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl MetricSink for RecordingSink {
    fn pour_volume_add(&self, labels: &FlowLabels, liters: f64) {
        self.lock().pour_additions.push((labels.clone(), liters));
    }

    fn remaining_volume_set(&self, labels: &FlowLabels, liters: f64) {
        self.lock().remaining.insert(labels.clone(), liters);
    }

    fn pulses_dropped_add(&self, labels: &FlowLabels, count: u64) {
        *self.lock().dropped.entry(labels.clone()).or_default() += count;
    }

    fn dht_reading(&self, labels: &DhtLabels, reading: &SensorReading) {
        self.lock().readings.push((*labels, *reading));
    }

    fn forget_flow(&self, labels: &FlowLabels) {
        let mut recorded = self.lock();
        recorded.pour_additions.retain(|(l, _)| l != labels);
        recorded.remaining.remove(labels);
        recorded.dropped.remove(labels);
        recorded.forgotten_flows.push(labels.clone());
    }

    fn forget_dht(&self, labels: &DhtLabels) {
        let mut recorded = self.lock();
        recorded.readings.retain(|(l, _)| l != labels);
        recorded.forgotten_dhts.push(*labels);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stout() -> FlowLabels {
        FlowLabels {
            pin: 17,
            keg_type: KegType::Corny,
            contents: "stout".to_string(),
        }
    }

    #[test]
    fn test_prometheus_sink_renders_series() {
        let sink = PrometheusSink::new().unwrap();
        sink.pour_volume_add(&stout(), 0.25);
        sink.remaining_volume_set(&stout(), 18.68);
        sink.dht_reading(
            &DhtLabels {
                pin: 4,
                model: DhtModel::Dht22,
            },
            &SensorReading {
                temperature: 3.5,
                humidity: 40.0,
                retries: 2,
            },
        );

        let text = sink.encode().unwrap();
        let series = |name: &str| {
            text.lines()
                .find(|l| l.starts_with(name) && l.contains('{'))
                .unwrap_or_else(|| panic!("missing series {name}"))
                .to_string()
        };

        let poured = series("kegerator_pour_volume_liters");
        assert!(poured.contains(r#"contents="stout""#));
        assert!(poured.contains(r#"pin="17""#));
        assert!(poured.contains(r#"type="corny""#));
        assert!(poured.ends_with(" 0.25"));

        assert!(series("kegerator_remaining_volume_liters").ends_with(" 18.68"));
        assert!(series("kegerator_humidity_ratio").ends_with(" 0.4"));
        assert!(series("kegerator_dht_retries_total").ends_with(" 2"));
    }

    #[test]
    fn test_prometheus_sink_forgets_stale_labels() {
        let sink = PrometheusSink::new().unwrap();
        sink.pour_volume_add(&stout(), 1.0);
        sink.forget_flow(&stout());
        // Forgetting twice is harmless
        sink.forget_flow(&stout());

        let text = sink.encode().unwrap();
        assert!(!text.contains(r#"contents="stout""#));
    }

    #[test]
    fn test_recording_sink_sums_by_label() {
        let sink = RecordingSink::new();
        sink.pour_volume_add(&stout(), 0.5);
        sink.pour_volume_add(&stout(), 0.25);
        assert!((sink.poured(&stout()) - 0.75).abs() < 1e-12);

        sink.forget_flow(&stout());
        assert_eq!(sink.poured(&stout()), 0.0);
        assert_eq!(sink.snapshot().forgotten_flows.len(), 1);
    }
}
