//! kegerator - keg fridge monitor and Prometheus exporter
//!
//! Loads keg and sensor state from a JSON file, aggregates flow meter pulses
//! into pours, and serves state, pours and metrics over HTTP.
//!
//! Signals:
//! - SIGHUP reloads the state file
//! - SIGINT/SIGTERM drain pending pulses, save state and exit
//!
//! Uses XDG Base Directory specification for file locations:
//! - Config: $XDG_CONFIG_HOME/kegerator/config.toml (~/.config/kegerator/config.toml)
//! - Logs: $XDG_STATE_HOME/kegerator/kegerator.log (~/.local/state/kegerator/kegerator.log)

mod http;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use kegerator_core::hardware::{Hardware, SimulatedHardware};
use kegerator_core::{
    Config, PrometheusSink, ReloadCoordinator, RuntimeState, StateContext, StateHandle, StopMode,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

#[derive(Parser)]
#[command(name = "kegerator")]
#[command(about = "Keg fridge monitor and Prometheus exporter")]
#[command(version)]
struct Args {
    /// File to load initial state from
    #[arg(long)]
    file: Option<PathBuf>,

    /// Do not automatically save state
    #[arg(long)]
    no_autosave: bool,

    /// Address to listen on
    #[arg(long)]
    addr: Option<String>,

    /// Config file (default: $XDG_CONFIG_HOME/kegerator/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Validate the state file and exit
    #[arg(long)]
    check: bool,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(file) = &self.file {
            config.state.file = file.clone();
        }
        if self.no_autosave {
            config.state.autosave = false;
        }
        if let Some(addr) = &self.addr {
            config.server.addr = addr.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("failed to load configuration")?;
    args.apply(&mut config);

    if args.check {
        return check(&config.state.file);
    }

    let _log_guard =
        kegerator_core::logging::init(&config.logging).context("failed to initialize logging")?;

    run(config).await
}

fn check(path: &Path) -> Result<()> {
    let state = kegerator_core::state::check(path)
        .with_context(|| format!("invalid state file {}", path.display()))?;
    println!(
        "{}: {} kegs, {} dhts",
        path.display(),
        state.kegs.len(),
        state.dhts.len()
    );
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    let metrics = Arc::new(PrometheusSink::new().context("failed to build metrics registry")?);
    // No GPIO backend is linked in; pulses come from the simulated board
    let hardware: Arc<dyn Hardware> = Arc::new(SimulatedHardware::new());
    tracing::warn!("using simulated hardware");

    let ctx = StateContext::new(hardware, metrics.clone(), &config);
    let file = config.state.file.clone();
    let state = {
        let ctx = ctx.clone();
        let path = file.clone();
        tokio::task::spawn_blocking(move || RuntimeState::restore(&path, &ctx))
            .await
            .context("state loader panicked")?
            .with_context(|| format!("failed to load state from {}", file.display()))?
    };
    state.start();
    let coordinator = Arc::new(ReloadCoordinator::new(StateHandle::new(state), ctx, &file));
    tracing::info!(
        path = %coordinator.path().display(),
        autosave = config.state.autosave,
        "state loaded"
    );

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    let autosave = config
        .state
        .autosave
        .then(|| config.state.save_interval());
    let supervisor = tokio::spawn(supervise(coordinator.clone(), autosave, shutdown_tx));

    let app = http::router(http::AppState::new(
        coordinator.clone(),
        metrics,
        Duration::from_secs(config.server.timeout_secs),
    ));
    let listener = TcpListener::bind(&config.server.addr)
        .await
        .with_context(|| format!("failed to listen on {}", config.server.addr))?;
    tracing::info!(addr = %config.server.addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.wait_for(|stop| *stop).await;
        })
        .await
        .context("http server failed")?;

    if let Err(e) = supervisor.await {
        tracing::warn!(error = %e, "supervisor ended abnormally");
    }

    tracing::info!("draining pulse queues");
    coordinator
        .handle()
        .current()
        .shutdown(StopMode::Drain)
        .await;
    if autosave.is_some() {
        coordinator
            .save()
            .await
            .context("failed to save state on exit")?;
    }
    tracing::info!("shutdown complete");
    Ok(())
}

/// Handle signals and periodic saves until asked to stop
async fn supervise(
    coordinator: Arc<ReloadCoordinator>,
    autosave: Option<Duration>,
    shutdown: watch::Sender<bool>,
) {
    let period = autosave.unwrap_or(Duration::from_secs(300));
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut signals = match Signals::new() {
        Ok(signals) => signals,
        Err(e) => {
            tracing::error!(error = %e, "failed to install signal handlers");
            shutdown.send_replace(true);
            return;
        }
    };

    loop {
        tokio::select! {
            signal = signals.recv() => match signal {
                Signal::Reload => {
                    if let Err(e) = coordinator.reload().await {
                        tracing::error!(error = %e, "reload failed");
                    }
                }
                Signal::Shutdown => break,
            },
            _ = ticker.tick(), if autosave.is_some() => {
                if let Err(e) = coordinator.save().await {
                    tracing::error!(error = %e, "failed to save state");
                }
            }
        }
    }

    tracing::info!("shutting down");
    shutdown.send_replace(true);
}

enum Signal {
    Reload,
    Shutdown,
}

#[cfg(unix)]
struct Signals {
    hangup: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            hangup: signal(SignalKind::hangup())?,
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> Signal {
        tokio::select! {
            _ = self.hangup.recv() => Signal::Reload,
            _ = self.interrupt.recv() => Signal::Shutdown,
            _ = self.terminate.recv() => Signal::Shutdown,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn new() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Signal {
        let _ = tokio::signal::ctrl_c().await;
        Signal::Shutdown
    }
}
