//! In-process stand-in for GPIO pins
//!
//! Pulses are injected with [`SimulatedHardware::pulse`], humidity readings
//! are scripted per pin, and attach failures are injected with
//! [`SimulatedHardware::fail_pin`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Hardware, HumiditySensor, PulseSource};
use crate::error::{Error, Result};
use crate::flow::PulseSender;
use crate::types::{DhtModel, PulseEvent, SensorReading};

#[derive(Default)]
struct Pins {
    next_id: u64,
    /// Several sources may watch one pin while a reload overlaps
    subscribers: HashMap<u8, Vec<(u64, PulseSender)>>,
    failing: HashSet<u8>,
    scripted: HashMap<u8, VecDeque<std::result::Result<SensorReading, String>>>,
    steady: HashMap<u8, SensorReading>,
    open_sensors: HashMap<u8, usize>,
}

/// Shared simulated board; clones see the same pins
#[derive(Clone, Default)]
pub struct SimulatedHardware {
    pins: Arc<Mutex<Pins>>,
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later attach on `pin` fail
    pub fn fail_pin(&self, pin: u8) {
        self.lock().failing.insert(pin);
    }

    pub fn heal_pin(&self, pin: u8) {
        self.lock().failing.remove(&pin);
    }

    /// Deliver one edge on `pin` to every attached source.
    ///
    /// Returns how many subscribers accepted it.
    pub fn pulse(&self, pin: u8, event: PulseEvent) -> usize {
        let senders: Vec<PulseSender> = self
            .lock()
            .subscribers
            .get(&pin)
            .map(|subs| subs.iter().map(|(_, tx)| tx.clone()).collect())
            .unwrap_or_default();
        senders.iter().filter(|tx| tx.send(event)).count()
    }

    pub fn is_attached(&self, pin: u8) -> bool {
        self.attached_count(pin) > 0
    }

    pub fn attached_count(&self, pin: u8) -> usize {
        self.lock().subscribers.get(&pin).map_or(0, Vec::len)
    }

    /// Queue a one-shot reading for the sensor on `pin`
    pub fn push_reading(&self, pin: u8, reading: SensorReading) {
        self.lock()
            .scripted
            .entry(pin)
            .or_default()
            .push_back(Ok(reading));
    }

    /// Queue a one-shot read failure for the sensor on `pin`
    pub fn push_read_error(&self, pin: u8, message: impl Into<String>) {
        self.lock()
            .scripted
            .entry(pin)
            .or_default()
            .push_back(Err(message.into()));
    }

    /// Reading returned once the scripted queue is empty
    pub fn set_reading(&self, pin: u8, reading: SensorReading) {
        self.lock().steady.insert(pin, reading);
    }

    /// Humidity sensors currently open on `pin`
    pub fn open_sensors(&self, pin: u8) -> usize {
        self.lock().open_sensors.get(&pin).copied().unwrap_or(0)
    }

    fn lock(&self) -> MutexGuard<'_, Pins> {
        self.pins.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Hardware for SimulatedHardware {
    fn pulse_source(&self) -> Box<dyn PulseSource> {
        Box::new(SimulatedPulseSource {
            hardware: self.clone(),
            attached: None,
        })
    }

    fn humidity_sensor(&self, model: DhtModel, pin: u8) -> Result<Box<dyn HumiditySensor>> {
        let mut pins = self.lock();
        if pins.failing.contains(&pin) {
            return Err(Error::hardware(pin, format!("failed to attach {model}")));
        }
        *pins.open_sensors.entry(pin).or_default() += 1;
        Ok(Box::new(SimulatedSensor {
            hardware: self.clone(),
            pin,
            open: true,
        }))
    }
}

struct SimulatedPulseSource {
    hardware: SimulatedHardware,
    attached: Option<(u8, u64)>,
}

impl PulseSource for SimulatedPulseSource {
    fn attach(&mut self, pin: u8, sender: PulseSender) -> Result<()> {
        self.detach()?;
        let mut pins = self.hardware.lock();
        if pins.failing.contains(&pin) {
            return Err(Error::hardware(pin, "failed to watch for edges"));
        }
        let id = pins.next_id;
        pins.next_id += 1;
        pins.subscribers.entry(pin).or_default().push((id, sender));
        self.attached = Some((pin, id));
        Ok(())
    }

    fn detach(&mut self) -> Result<()> {
        if let Some((pin, id)) = self.attached.take() {
            let mut pins = self.hardware.lock();
            if let Some(subs) = pins.subscribers.get_mut(&pin) {
                subs.retain(|(sub, _)| *sub != id);
                if subs.is_empty() {
                    pins.subscribers.remove(&pin);
                }
            }
        }
        Ok(())
    }
}

impl Drop for SimulatedPulseSource {
    fn drop(&mut self) {
        let _ = self.detach();
    }
}

struct SimulatedSensor {
    hardware: SimulatedHardware,
    pin: u8,
    open: bool,
}

impl HumiditySensor for SimulatedSensor {
    fn read(&mut self, _retries: u32) -> Result<SensorReading> {
        if !self.open {
            return Err(Error::hardware(self.pin, "sensor is closed"));
        }
        let mut pins = self.hardware.lock();
        let scripted = pins.scripted.get_mut(&self.pin).and_then(VecDeque::pop_front);
        match scripted {
            Some(Ok(reading)) => Ok(reading),
            Some(Err(message)) => Err(Error::hardware(self.pin, message)),
            None => pins
                .steady
                .get(&self.pin)
                .copied()
                .ok_or_else(|| Error::hardware(self.pin, "no response from sensor")),
        }
    }

    fn close(&mut self) -> Result<()> {
        if std::mem::take(&mut self.open) {
            let mut pins = self.hardware.lock();
            if let Some(open) = pins.open_sensors.get_mut(&self.pin) {
                *open = open.saturating_sub(1);
            }
        }
        Ok(())
    }
}

impl Drop for SimulatedSensor {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{FlowAggregator, FlowHandle, StopMode};
    use crate::metrics::NoopSink;
    use crate::types::{FlowMeter, FlowMeterModel, Keg, KegType};

    fn flow(pin: u8) -> FlowHandle {
        let aggregator = FlowAggregator::new(
            pin,
            Keg::new(KegType::Sixtel),
            FlowMeter::new(FlowMeterModel::Gr301),
            "ipa",
        )
        .unwrap();
        FlowHandle::new(aggregator, 16, Arc::new(NoopSink))
    }

    #[tokio::test]
    async fn test_pulses_reach_attached_sources_only() {
        let hw = SimulatedHardware::new();
        let flow = flow(5);
        flow.attach(hw.pulse_source()).unwrap();
        assert!(hw.is_attached(5));

        assert_eq!(hw.pulse(5, PulseEvent::at_micros(1)), 1);
        assert_eq!(hw.pulse(6, PulseEvent::at_micros(2)), 0);

        flow.detach().unwrap();
        flow.detach().unwrap();
        assert!(!hw.is_attached(5));
        assert_eq!(hw.pulse(5, PulseEvent::at_micros(3)), 0);

        flow.stop(StopMode::Drain).await;
        assert_eq!(flow.with(|a| a.pulse_total()), 1);
    }

    #[test]
    fn test_failing_pin_rejects_attach() {
        let hw = SimulatedHardware::new();
        hw.fail_pin(9);
        let flow = flow(9);
        let err = flow.attach(hw.pulse_source()).unwrap_err();
        assert!(matches!(err, Error::Hardware { pin: 9, .. }));
        assert!(hw.humidity_sensor(DhtModel::Dht22, 9).is_err());

        hw.heal_pin(9);
        assert!(flow.attach(hw.pulse_source()).is_ok());
    }

    #[test]
    fn test_scripted_readings_then_steady() {
        let hw = SimulatedHardware::new();
        let reading = SensorReading {
            temperature: 4.0,
            humidity: 40.0,
            retries: 1,
        };
        hw.push_read_error(4, "checksum mismatch");
        hw.push_reading(4, reading);

        let mut sensor = hw.humidity_sensor(DhtModel::Dht11, 4).unwrap();
        assert_eq!(hw.open_sensors(4), 1);
        assert!(sensor.read(3).is_err());
        assert_eq!(sensor.read(3).unwrap(), reading);
        assert!(sensor.read(3).is_err());

        hw.set_reading(4, reading);
        assert_eq!(sensor.read(3).unwrap(), reading);

        drop(sensor);
        assert_eq!(hw.open_sensors(4), 0);
    }
}
