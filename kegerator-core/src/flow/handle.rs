//! The single consumer that owns a [`FlowAggregator`]'s write path
//!
//! Every mutation (pulses, retirement deadlines, refills, calibration)
//! happens inside one task per aggregator:
//!
//! ```text
//!  PulseSource ──try_send──┐
//!                          ▼
//!  HTTP refill/calibrate ─► bounded queue ─► consumer ─► RwLock<FlowAggregator>
//!                                              ▲   │
//!                          retirement deadline ┘   └─► MetricSink
//! ```
//!
//! Readers only ever take the read lock. A full queue drops the pulse and
//! counts it rather than blocking the edge callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use super::aggregator::{Deadline, FlowAggregator};
use crate::error::{Error, Result};
use crate::hardware::PulseSource;
use crate::metrics::{FlowLabels, MetricSink};
use crate::types::{Pour, PulseEvent};

/// How a consumer treats commands still queued when it is stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Apply everything already queued, then exit
    Drain,
    /// Exit immediately; queued commands are dropped unapplied
    Discard,
}

/// A calibration request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Calibration {
    /// Replace the flow constant
    Constant(f64),
    /// Multiply the flow constant, rounding down to two decimals
    Coefficient(f64),
}

pub(crate) enum FlowCommand {
    Pulse(PulseEvent),
    Refill {
        contents: String,
        reply: oneshot::Sender<()>,
    },
    Calibrate {
        change: Calibration,
        reply: oneshot::Sender<Result<Option<f64>>>,
    },
}

/// Producer side of an aggregator's queue, handed to a [`PulseSource`]
#[derive(Clone)]
pub struct PulseSender {
    pin: u8,
    tx: mpsc::Sender<FlowCommand>,
    dropped: Arc<AtomicU64>,
}

impl PulseSender {
    /// Queue a pulse without blocking.
    ///
    /// Returns false when the pulse was dropped, either because the queue is
    /// full (counted) or because the consumer has stopped.
    pub fn send(&self, event: PulseEvent) -> bool {
        match self.tx.try_send(FlowCommand::Pulse(event)) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    tracing::warn!(pin = self.pin, dropped, "pulse queue full, dropping pulses");
                }
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }
}

/// Owner of one aggregator, its consumer task and its pulse source
pub struct FlowHandle {
    pin: u8,
    aggregator: Arc<RwLock<FlowAggregator>>,
    commands: mpsc::Sender<FlowCommand>,
    dropped: Arc<AtomicU64>,
    /// Drops carried over from a state file; already exported by a predecessor
    restored_dropped: u64,
    sink: Arc<dyn MetricSink>,

    lifecycle: Mutex<Lifecycle>,
    stop_tx: watch::Sender<Option<StopMode>>,
    stopping: tokio::sync::Mutex<()>,
    source: Mutex<Option<Box<dyn PulseSource>>>,
}

/// Receiver before the consumer starts, join handle after
#[derive(Default)]
struct Lifecycle {
    pending: Option<mpsc::Receiver<FlowCommand>>,
    task: Option<JoinHandle<()>>,
}

impl FlowHandle {
    pub fn new(aggregator: FlowAggregator, capacity: usize, sink: Arc<dyn MetricSink>) -> Self {
        let (commands, rx) = mpsc::channel(capacity.max(1));
        let (stop_tx, _) = watch::channel(None);
        Self {
            pin: aggregator.pin(),
            aggregator: Arc::new(RwLock::new(aggregator)),
            commands,
            dropped: Arc::new(AtomicU64::new(0)),
            restored_dropped: 0,
            sink,
            lifecycle: Mutex::new(Lifecycle {
                pending: Some(rx),
                task: None,
            }),
            stop_tx,
            stopping: tokio::sync::Mutex::new(()),
            source: Mutex::new(None),
        }
    }

    pub fn pin(&self) -> u8 {
        self.pin
    }

    pub fn pulse_sender(&self) -> PulseSender {
        PulseSender {
            pin: self.pin,
            tx: self.commands.clone(),
            dropped: self.dropped.clone(),
        }
    }

    /// Connect a pulse source to this aggregator's queue.
    pub fn attach(&self, mut source: Box<dyn PulseSource>) -> Result<()> {
        source.attach(self.pin, self.pulse_sender())?;
        *lock(&self.source) = Some(source);
        Ok(())
    }

    /// Disconnect the pulse source, if any. Safe to call repeatedly.
    pub fn detach(&self) -> Result<()> {
        let source = lock(&self.source).take();
        match source {
            Some(mut source) => source.detach(),
            None => Ok(()),
        }
    }

    pub fn is_attached(&self) -> bool {
        lock(&self.source).is_some()
    }

    /// Spawn the consumer. Does nothing if it was already started or stopped.
    pub fn start(&self) {
        let mut lifecycle = lock(&self.lifecycle);
        let Some(rx) = lifecycle.pending.take() else {
            return;
        };
        let consumer = self.consumer(rx);
        lifecycle.task = Some(tokio::spawn(consumer.run(self.stop_tx.subscribe())));
        tracing::debug!(pin = self.pin, "flow consumer started");
    }

    /// Stop the consumer. Once this returns the aggregator is never mutated
    /// again. Idempotent; later calls return immediately.
    pub async fn stop(&self, mode: StopMode) {
        self.stop_tx.send_if_modified(|current| match current {
            Some(_) => false,
            None => {
                *current = Some(mode);
                true
            }
        });

        let mode = (*self.stop_tx.borrow()).unwrap_or(mode);

        let _stopping = self.stopping.lock().await;
        let (pending, task) = {
            let mut lifecycle = lock(&self.lifecycle);
            (lifecycle.pending.take(), lifecycle.task.take())
        };
        if let Some(handle) = task {
            if let Err(e) = handle.await {
                tracing::warn!(pin = self.pin, error = %e, "flow consumer ended abnormally");
            }
        }
        // Never started: settle the queue here
        if let Some(rx) = pending {
            self.consumer(rx).finish(mode).await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.stop_tx.borrow().is_none() && lock(&self.lifecycle).task.is_some()
    }

    /// Reset the total for a new keg, serialized with pulse ingestion.
    pub async fn refill(&self, contents: impl Into<String>) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(FlowCommand::Refill {
                contents: contents.into(),
                reply,
            })
            .await
            .map_err(|_| Error::Stopped(self.pin))?;
        done.await.map_err(|_| Error::Stopped(self.pin))
    }

    /// Change calibration, serialized with pulse ingestion.
    ///
    /// Returns the new constant, or `None` when it did not change.
    pub async fn calibrate(&self, change: Calibration) -> Result<Option<f64>> {
        let (reply, done) = oneshot::channel();
        self.commands
            .send(FlowCommand::Calibrate { change, reply })
            .await
            .map_err(|_| Error::Stopped(self.pin))?;
        done.await.map_err(|_| Error::Stopped(self.pin))?
    }

    /// Run `f` against the aggregator under the read lock
    pub fn with<T>(&self, f: impl FnOnce(&FlowAggregator) -> T) -> T {
        f(&read(&self.aggregator))
    }

    pub fn total_flow(&self) -> f64 {
        self.with(FlowAggregator::total_flow)
    }

    pub fn pours(&self) -> Vec<Pour> {
        self.with(|agg| agg.pours().to_vec())
    }

    pub fn labels(&self) -> FlowLabels {
        self.with(FlowAggregator::labels)
    }

    /// Seed the dropped-pulse count carried over from a state file.
    ///
    /// Restored drops are persisted but not reported to the sink again.
    /// Call before [`start`](Self::start).
    pub fn restore_dropped(&mut self, count: u64) {
        self.dropped.store(count, Ordering::Relaxed);
        self.restored_dropped = count;
    }

    /// Pulses dropped because the queue was full, since the last refill
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    fn consumer(&self, rx: mpsc::Receiver<FlowCommand>) -> Consumer {
        Consumer {
            pin: self.pin,
            rx,
            aggregator: self.aggregator.clone(),
            sink: self.sink.clone(),
            dropped: self.dropped.clone(),
            reported_dropped: self.restored_dropped,
            deadline: None,
        }
    }
}

struct Consumer {
    pin: u8,
    rx: mpsc::Receiver<FlowCommand>,
    aggregator: Arc<RwLock<FlowAggregator>>,
    sink: Arc<dyn MetricSink>,
    dropped: Arc<AtomicU64>,
    reported_dropped: u64,
    /// The single retirement deadline: pour id and when it elapses
    deadline: Option<(u64, Instant)>,
}

impl Consumer {
    async fn run(mut self, mut stop_rx: watch::Receiver<Option<StopMode>>) {
        // Stop may have been requested before this task was first polled
        let requested = *stop_rx.borrow_and_update();
        if let Some(mode) = requested {
            self.finish(mode).await;
            return;
        }
        loop {
            let armed = self.deadline.is_some();
            let at = self.deadline.map_or_else(Instant::now, |(_, at)| at);

            tokio::select! {
                biased;

                changed = stop_rx.changed() => {
                    let requested = *stop_rx.borrow_and_update();
                    match (changed, requested) {
                        (_, Some(mode)) => {
                            self.finish(mode).await;
                            return;
                        }
                        (Err(_), None) => {
                            self.finish(StopMode::Discard).await;
                            return;
                        }
                        (Ok(()), None) => {}
                    }
                }

                _ = sleep_until(at), if armed => {
                    // Pulses already queued when the deadline fired take precedence
                    while let Ok(command) = self.rx.try_recv() {
                        self.apply(command);
                    }
                    if let Some((pour_id, at)) = self.deadline {
                        if at <= Instant::now() {
                            self.deadline = None;
                            write(&self.aggregator).retire(pour_id);
                        }
                    }
                }

                command = self.rx.recv() => match command {
                    Some(command) => self.apply(command),
                    None => return,
                },
            }
        }
    }

    async fn finish(mut self, mode: StopMode) {
        self.rx.close();
        let mut remaining = 0usize;
        while let Some(command) = self.rx.recv().await {
            match mode {
                StopMode::Drain => self.apply(command),
                StopMode::Discard => remaining += 1,
            }
        }
        self.deadline = None;
        tracing::debug!(pin = self.pin, ?mode, discarded = remaining, "flow consumer stopped");
    }

    fn apply(&mut self, command: FlowCommand) {
        match command {
            FlowCommand::Pulse(event) => self.ingest(event),
            FlowCommand::Refill { contents, reply } => {
                // Drops so far belong to the old keg
                self.report_dropped();
                let (before, after, remaining, dropped_open) = {
                    let mut aggregator = write(&self.aggregator);
                    let before = aggregator.labels();
                    let dropped_open = aggregator.refill(contents.clone());
                    (before, aggregator.labels(), aggregator.remaining_volume(), dropped_open)
                };
                if dropped_open {
                    self.deadline = None;
                }
                if before != after {
                    self.sink.forget_flow(&before);
                }
                // Drops racing the refill land on the new keg
                self.dropped
                    .fetch_sub(self.reported_dropped, Ordering::Relaxed);
                self.reported_dropped = 0;
                self.sink.remaining_volume_set(&after, remaining);
                tracing::info!(pin = self.pin, contents = %contents, "keg refilled");
                let _ = reply.send(());
            }
            FlowCommand::Calibrate { change, reply } => {
                let result = {
                    let mut aggregator = write(&self.aggregator);
                    match change {
                        Calibration::Constant(constant) => {
                            aggregator.calibrate(constant).map(|_| Some(constant))
                        }
                        Calibration::Coefficient(coefficient) => {
                            aggregator.calibrate_by(coefficient)
                        }
                    }
                };
                if let Ok(Some(constant)) = result {
                    tracing::info!(pin = self.pin, constant, "flow meter calibrated");
                }
                let _ = reply.send(result);
            }
        }
        self.report_dropped();
    }

    fn ingest(&mut self, event: PulseEvent) {
        let (outcome, labels, gap) = {
            let mut aggregator = write(&self.aggregator);
            let outcome = aggregator.ingest(event);
            (outcome, aggregator.labels(), aggregator.gap_threshold())
        };

        self.deadline = match outcome.deadline {
            Deadline::Arm { pour_id } => Some((pour_id, Instant::now() + gap)),
            Deadline::Disarm => None,
        };
        if let Some(liters) = outcome.committed {
            self.sink.pour_volume_add(&labels, liters);
        }
    }

    fn report_dropped(&mut self) {
        let dropped = self.dropped.load(Ordering::Relaxed);
        if dropped > self.reported_dropped {
            let labels = read(&self.aggregator).labels();
            self.sink
                .pulses_dropped_add(&labels, dropped - self.reported_dropped);
            self.reported_dropped = dropped;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read(lock: &RwLock<FlowAggregator>) -> RwLockReadGuard<'_, FlowAggregator> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write(lock: &RwLock<FlowAggregator>) -> RwLockWriteGuard<'_, FlowAggregator> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
