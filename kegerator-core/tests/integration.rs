//! Integration tests for kegerator state persistence and hot reload
//!
//! These tests drive a full [`RuntimeState`] against simulated hardware and a
//! real state file in a temporary directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use kegerator_core::config::{DhtSettings, FlowSettings};
use kegerator_core::hardware::SimulatedHardware;
use kegerator_core::metrics::RecordingSink;
use kegerator_core::{
    Error, PulseEvent, ReloadCoordinator, ReloadPhase, RuntimeState, SensorReading, StateContext,
    StateFile, StateHandle, StopMode,
};
use tempfile::TempDir;

const STATE: &str = r#"{
  "kegs": [
    {
      "keg": {"type": "corny", "volume": 18.93},
      "sensor": {"model": "gr-301", "flow_constant": 21.0},
      "contents": "stout",
      "pin": 17,
      "poured": 1.25
    }
  ],
  "dhts": [{"model": "dht22", "pin": 4, "temperature": 3.5, "humidity": 41.0}]
}"#;

const T0: i64 = 1_700_000_000_000_000;

struct Fixture {
    _dir: TempDir,
    path: PathBuf,
    hw: SimulatedHardware,
    sink: Arc<RecordingSink>,
    ctx: StateContext,
}

fn fixture(contents: &str) -> Fixture {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("state.json");
    std::fs::write(&path, contents).unwrap();

    let hw = SimulatedHardware::new();
    hw.set_reading(
        4,
        SensorReading {
            temperature: 3.0,
            humidity: 40.0,
            retries: 1,
        },
    );
    let sink = Arc::new(RecordingSink::new());
    let ctx = StateContext {
        hardware: Arc::new(hw.clone()),
        sink: sink.clone(),
        flow: FlowSettings::default(),
        dht: DhtSettings::default(),
    };

    Fixture {
        _dir: dir,
        path,
        hw,
        sink,
        ctx,
    }
}

fn start(fx: &Fixture) -> ReloadCoordinator {
    let state = RuntimeState::restore(&fx.path, &fx.ctx).expect("restore should succeed");
    state.start();
    ReloadCoordinator::new(StateHandle::new(state), fx.ctx.clone(), &fx.path)
}

/// Pour `count` pulses 50 ms apart on `pin`, in step with the paused clock
async fn pour(hw: &SimulatedHardware, pin: u8, start: i64, count: i64) {
    for i in 0..count {
        hw.pulse(pin, PulseEvent::at_micros(start + i * 50_000));
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

fn write(path: &Path, contents: &str) {
    std::fs::write(path, contents).unwrap();
}

// ============================================
// Persistence
// ============================================

#[tokio::test(start_paused = true)]
async fn test_save_then_restore_never_loses_volume() {
    let fx = fixture(STATE);
    let coordinator = start(&fx);

    pour(&fx.hw, 17, T0, 25).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    coordinator.save().await.unwrap();

    let current = coordinator.handle().current();
    let total = current.flow(17).unwrap().total_flow();
    let saved = StateFile::read(&fx.path).unwrap();
    assert!((saved.kegs[0].poured - total).abs() < 1e-12);
    assert_eq!(saved.dhts[0].temperature, 3.0);

    let restored = RuntimeState::restore(&fx.path, &fx.ctx).unwrap();
    let restored_total = restored.flow(17).unwrap().total_flow();
    let fpe = 1.0 / (21.0 * 60.0);
    assert!(restored_total + 1e-12 >= total);
    assert!(restored_total - total <= fpe + 1e-12);

    restored.shutdown(StopMode::Discard).await;
    current.shutdown(StopMode::Drain).await;
}

#[tokio::test]
async fn test_unknown_model_is_rejected_with_its_name() {
    let fx = fixture(&STATE.replace("dht22", "dht33"));
    let err = RuntimeState::restore(&fx.path, &fx.ctx).err().unwrap();

    assert!(matches!(err, Error::Validation(_)));
    assert!(err.to_string().contains("dht33"));
    assert!(!fx.hw.is_attached(17));
}

#[tokio::test]
async fn test_hardware_failure_aborts_restore() {
    let fx = fixture(STATE);
    fx.hw.fail_pin(4);

    let err = RuntimeState::restore(&fx.path, &fx.ctx).err().unwrap();
    assert!(matches!(err, Error::Hardware { pin: 4, .. }));
    // The keg attached before the sensor failed is released again
    assert!(!fx.hw.is_attached(17));
}

// ============================================
// Reload
// ============================================

#[tokio::test(start_paused = true)]
async fn test_reload_with_malformed_file_keeps_current_state() {
    let fx = fixture(STATE);
    let coordinator = start(&fx);

    pour(&fx.hw, 17, T0, 12).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let before = coordinator.handle().current();
    let total = before.flow(17).unwrap().total_flow();
    let pours = before.flow(17).unwrap().pours();
    assert_eq!(pours.len(), 1);

    write(&fx.path, "{\"kegs\": [");
    let err = coordinator.reload().await.unwrap_err();
    assert!(matches!(err, Error::Decode(_)));
    assert_eq!(coordinator.phase(), ReloadPhase::Idle);
    assert!(coordinator.last_error().is_some());

    let after = coordinator.handle().current();
    assert!(Arc::ptr_eq(&before, &after));
    assert_eq!(after.flow(17).unwrap().total_flow(), total);
    assert_eq!(after.flow(17).unwrap().pours(), pours);

    // Still ingesting
    pour(&fx.hw, 17, T0 + 10_000_000, 10).await;
    assert_eq!(after.flow(17).unwrap().pours().len(), 2);

    after.shutdown(StopMode::Drain).await;
}

#[tokio::test(start_paused = true)]
async fn test_reload_swaps_in_new_state_and_retires_old() {
    let fx = fixture(STATE);
    let coordinator = start(&fx);
    let old = coordinator.handle().current();
    assert_eq!(coordinator.path(), fx.path.as_path());

    write(
        &fx.path,
        &STATE
            .replace("\"stout\"", "\"porter\"")
            .replace("1.25", "0"),
    );
    coordinator.reload().await.unwrap();

    let status = coordinator.status();
    assert_eq!(status.phase, ReloadPhase::Idle);
    assert_eq!(status.reloads, 1);
    assert!(status.last_error.is_none());

    let new = coordinator.handle().current();
    assert!(!Arc::ptr_eq(&old, &new));
    let flow = new.flow(17).unwrap();
    assert_eq!(flow.labels().contents, "porter");
    assert_eq!(flow.total_flow(), 0.0);

    // Only the new state still hears the pin, and the old series are gone
    assert_eq!(fx.hw.attached_count(17), 1);
    assert!(!old.flow(17).unwrap().is_running());
    let forgotten = fx.sink.snapshot().forgotten_flows;
    assert_eq!(forgotten.len(), 1);
    assert_eq!(forgotten[0].contents, "stout");

    pour(&fx.hw, 17, T0, 12).await;
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(flow.pours().len(), 1);
    assert_eq!(old.flow(17).unwrap().pours().len(), 0);

    new.shutdown(StopMode::Drain).await;
}

#[tokio::test(start_paused = true)]
async fn test_persisted_drops_survive_reload_and_reset_on_refill() {
    let fx = fixture(&STATE.replace("\"poured\": 1.25", "\"poured\": 1.25, \"dropped\": 3"));
    let coordinator = start(&fx);
    let first = coordinator.handle().current();
    let labels = first.flow(17).unwrap().labels();

    fx.hw.pulse(17, PulseEvent::at_micros(T0));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fx.sink.snapshot().dropped.get(&labels), None);

    coordinator.reload().await.unwrap();
    let current = coordinator.handle().current();
    fx.hw.pulse(17, PulseEvent::at_micros(T0 + 5_000_000));
    tokio::time::sleep(Duration::from_millis(10)).await;

    let flow = current.flow(17).unwrap();
    assert_eq!(flow.dropped(), 3);
    assert_eq!(fx.sink.snapshot().dropped.get(&labels), None);
    assert_eq!(current.snapshot().kegs[0].dropped, 3);

    flow.refill("porter").await.unwrap();
    assert_eq!(flow.dropped(), 0);
    assert_eq!(fx.sink.snapshot().dropped.get(&flow.labels()), None);
    assert_eq!(current.snapshot().kegs[0].dropped, 0);

    current.shutdown(StopMode::Drain).await;
}

#[tokio::test(start_paused = true)]
async fn test_reload_with_failing_hardware_keeps_current_state() {
    let fx = fixture(STATE);
    let coordinator = start(&fx);
    let before = coordinator.handle().current();

    write(&fx.path, &STATE.replace("\"pin\": 4", "\"pin\": 5"));
    fx.hw.fail_pin(5);
    let err = coordinator.reload().await.unwrap_err();
    assert!(matches!(err, Error::Hardware { pin: 5, .. }));

    assert!(Arc::ptr_eq(&before, &coordinator.handle().current()));
    assert_eq!(fx.hw.attached_count(17), 1);
    assert!(before.flow(17).unwrap().is_running());

    before.shutdown(StopMode::Drain).await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reload_and_save_are_serialized() {
    let fx = fixture(STATE);
    let coordinator = Arc::new(start(&fx));

    let mut tasks = Vec::new();
    for i in 0..4 {
        let coordinator = coordinator.clone();
        tasks.push(tokio::spawn(async move {
            if i % 2 == 0 {
                coordinator.reload().await
            } else {
                coordinator.save().await
            }
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(coordinator.status().reloads, 2);
    assert_eq!(fx.hw.attached_count(17), 1);
    assert!(StateFile::read(&fx.path).unwrap().validate().is_ok());

    coordinator
        .handle()
        .current()
        .shutdown(StopMode::Drain)
        .await;
}
