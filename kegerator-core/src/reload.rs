//! Hot reload of the state file
//!
//! The replacement state is loaded and attached while the current one keeps
//! serving. Only a fully attached replacement is swapped in; on any failure
//! the current state stays authoritative. Reloads and saves share one lock,
//! so neither ever sees the file half written by the other.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::{Error, Result};
use crate::flow::StopMode;
use crate::state::{RuntimeState, StateContext, StateHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReloadPhase {
    Idle,
    /// Reading the file and attaching hardware
    Loading,
    /// Replacing the current state and stopping the old one
    Swapping,
}

/// Observable outcome of reloads so far
#[derive(Debug, Clone, Serialize)]
pub struct ReloadStatus {
    pub phase: ReloadPhase,
    pub last_error: Option<String>,
    pub last_reload: Option<DateTime<Utc>>,
    pub reloads: u64,
}

pub struct ReloadCoordinator {
    handle: StateHandle,
    ctx: StateContext,
    path: PathBuf,
    file_lock: tokio::sync::Mutex<()>,
    status: Mutex<ReloadStatus>,
}

impl ReloadCoordinator {
    pub fn new(handle: StateHandle, ctx: StateContext, path: impl Into<PathBuf>) -> Self {
        Self {
            handle,
            ctx,
            path: path.into(),
            file_lock: tokio::sync::Mutex::new(()),
            status: Mutex::new(ReloadStatus {
                phase: ReloadPhase::Idle,
                last_error: None,
                last_reload: None,
                reloads: 0,
            }),
        }
    }

    pub fn handle(&self) -> &StateHandle {
        &self.handle
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn status(&self) -> ReloadStatus {
        self.lock_status().clone()
    }

    pub fn phase(&self) -> ReloadPhase {
        self.lock_status().phase
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock_status().last_error.clone()
    }

    /// Replace the current state with one freshly loaded from the file.
    pub async fn reload(&self) -> Result<()> {
        let _file = self.file_lock.lock().await;
        self.lock_status().phase = ReloadPhase::Loading;
        tracing::info!(path = %self.path.display(), "reloading state");

        let path = self.path.clone();
        let ctx = self.ctx.clone();
        let loaded = tokio::task::spawn_blocking(move || RuntimeState::restore(&path, &ctx))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))
            .and_then(|restored| restored);

        let next = match loaded {
            Ok(next) => Arc::new(next),
            Err(e) => {
                tracing::error!(error = %e, "reload failed, keeping current state");
                let mut status = self.lock_status();
                status.phase = ReloadPhase::Idle;
                status.last_error = Some(e.to_string());
                return Err(e);
            }
        };

        self.lock_status().phase = ReloadPhase::Swapping;
        next.start();
        let old = self.handle.swap(next.clone());
        old.shutdown(StopMode::Discard).await;
        old.forget_metrics(Some(&next));
        next.refresh_gauges();

        let mut status = self.lock_status();
        status.phase = ReloadPhase::Idle;
        status.last_error = None;
        status.last_reload = Some(Utc::now());
        status.reloads += 1;
        tracing::info!(
            kegs = next.flows().len(),
            dhts = next.dhts().len(),
            "state reloaded"
        );
        Ok(())
    }

    /// Write the current state to the file.
    pub async fn save(&self) -> Result<()> {
        let _file = self.file_lock.lock().await;
        let snapshot = self.handle.current().snapshot();
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || snapshot.write(&path))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(e)))??;
        tracing::debug!(path = %self.path.display(), "state saved");
        Ok(())
    }

    fn lock_status(&self) -> MutexGuard<'_, ReloadStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
