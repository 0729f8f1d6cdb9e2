//! Humidity/temperature polling
//!
//! A [`DhtMonitor`] owns one attached sensor. Reads are blocking bus
//! transactions, so each one runs on the blocking pool while the polling task
//! stays responsive to stop requests.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::config::DhtSettings;
use crate::error::{Error, Result};
use crate::hardware::{Hardware, HumiditySensor};
use crate::metrics::{DhtLabels, MetricSink};
use crate::types::{DhtModel, SensorReading};

type SharedSensor = Arc<Mutex<Box<dyn HumiditySensor>>>;

enum Run {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

/// Periodic reader for one humidity/temperature sensor
pub struct DhtMonitor {
    labels: DhtLabels,
    settings: DhtSettings,
    sensor: SharedSensor,
    latest: Arc<RwLock<SensorReading>>,
    sink: Arc<dyn MetricSink>,
    stop_tx: watch::Sender<bool>,
    run: Mutex<Run>,
}

impl DhtMonitor {
    /// Attach the sensor and take an initial reading.
    ///
    /// `previous` seeds the stored values, e.g. from a state file. A failed
    /// initial read fails the attach. Blocks on the sensor.
    pub fn attach(
        hardware: &dyn Hardware,
        model: DhtModel,
        pin: u8,
        previous: SensorReading,
        settings: DhtSettings,
        sink: Arc<dyn MetricSink>,
    ) -> Result<Self> {
        let mut sensor = hardware.humidity_sensor(model, pin)?;
        let initial = match sensor.read(settings.attach_retries) {
            Ok(reading) => reading,
            Err(e) => {
                let _ = sensor.close();
                return Err(match e {
                    Error::Hardware { message, .. } => {
                        Error::hardware(pin, format!("initial {model} read failed: {message}"))
                    }
                    other => other,
                });
            }
        };

        let mut latest = SensorReading {
            humidity: initial.humidity,
            retries: initial.retries,
            ..previous
        };
        if initial.temperature < settings.temperature_limit {
            latest.temperature = initial.temperature;
        } else {
            tracing::warn!(
                pin,
                temperature = initial.temperature,
                limit = settings.temperature_limit,
                "initial temperature exceeds limit, keeping previous value"
            );
        }

        let labels = DhtLabels { pin, model };
        sink.dht_reading(&labels, &latest);
        tracing::info!(pin, %model, temperature = latest.temperature, humidity = latest.humidity, "dht attached");

        let (stop_tx, _) = watch::channel(false);
        Ok(Self {
            labels,
            settings,
            sensor: Arc::new(Mutex::new(sensor)),
            latest: Arc::new(RwLock::new(latest)),
            sink,
            stop_tx,
            run: Mutex::new(Run::Idle),
        })
    }

    pub fn labels(&self) -> DhtLabels {
        self.labels
    }

    pub fn pin(&self) -> u8 {
        self.labels.pin
    }

    pub fn model(&self) -> DhtModel {
        self.labels.model
    }

    /// The most recent accepted reading
    pub fn reading(&self) -> SensorReading {
        *self.latest.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin polling. Does nothing if already started or stopped.
    pub fn start(&self) {
        let mut run = lock(&self.run);
        if !matches!(*run, Run::Idle) {
            return;
        }
        let poller = Poller {
            labels: self.labels,
            settings: self.settings,
            sensor: self.sensor.clone(),
            latest: self.latest.clone(),
            sink: self.sink.clone(),
        };
        *run = Run::Running(tokio::spawn(poller.run(self.stop_tx.subscribe())));
    }

    pub fn is_running(&self) -> bool {
        matches!(*lock(&self.run), Run::Running(_))
    }

    /// Close the sensor of a monitor that was never started. Blocks.
    pub(crate) fn release(&self) {
        *lock(&self.run) = Run::Stopped;
        if let Err(e) = lock(&self.sensor).close() {
            tracing::warn!(pin = self.labels.pin, error = %e, "failed to release dht");
        }
    }

    /// Stop polling and release the sensor. Idempotent.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let previous = std::mem::replace(&mut *lock(&self.run), Run::Stopped);
        match previous {
            Run::Stopped => return,
            Run::Running(handle) => {
                if let Err(e) = handle.await {
                    tracing::warn!(pin = self.labels.pin, error = %e, "dht poller ended abnormally");
                }
            }
            Run::Idle => {}
        }

        // May wait for an in-flight read to finish
        let sensor = self.sensor.clone();
        let pin = self.labels.pin;
        let closed = tokio::task::spawn_blocking(move || lock(&sensor).close()).await;
        match closed {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!(pin, error = %e, "failed to release dht"),
            Err(e) => tracing::warn!(pin, error = %e, "failed to release dht"),
        }
    }
}

struct Poller {
    labels: DhtLabels,
    settings: DhtSettings,
    sensor: SharedSensor,
    latest: Arc<RwLock<SensorReading>>,
    sink: Arc<dyn MetricSink>,
}

impl Poller {
    async fn run(self, mut stop_rx: watch::Receiver<bool>) {
        let period = self.settings.read_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop_rx.wait_for(|stop| *stop) => return,
                _ = ticker.tick() => {}
            }

            let sensor = self.sensor.clone();
            let retries = self.settings.read_retries;
            let read = tokio::task::spawn_blocking(move || lock(&sensor).read(retries));
            let result = tokio::select! {
                biased;
                _ = stop_rx.wait_for(|stop| *stop) => return,
                joined = read => joined,
            };

            match result {
                Ok(Ok(reading)) => self.record(reading),
                Ok(Err(e)) => {
                    tracing::warn!(pin = self.labels.pin, error = %e, "dht read failed");
                }
                Err(e) => {
                    tracing::warn!(pin = self.labels.pin, error = %e, "dht read task failed");
                }
            }
        }
    }

    fn record(&self, reading: SensorReading) {
        let limit = self.settings.temperature_limit;
        if reading.temperature > limit {
            tracing::warn!(
                pin = self.labels.pin,
                temperature = reading.temperature,
                limit,
                "recorded temperature exceeds limit"
            );
            return;
        }
        *self.latest.write().unwrap_or_else(PoisonError::into_inner) = reading;
        self.sink.dht_reading(&self.labels, &reading);
        tracing::debug!(
            pin = self.labels.pin,
            temperature = reading.temperature,
            humidity = reading.humidity,
            retries = reading.retries,
            "dht reading"
        );
    }
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
