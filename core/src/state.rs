//! Persist batch snapshots so interrupted runs can resume.
//!
//! A cloneable [`StateRecorder`] handle feeds a background task that owns the
//! [`BatchState`], merges row commits into it, ticks the optional save
//! interval, and answers snapshot reads. Because the orchestrator updates the
//! recorder only after a row's commit sequence has completed, a saved
//! snapshot never references a row whose export was not acknowledged.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::Sender;
use tokio::sync::oneshot;
use tracing::warn;
use verdict_protocol::items::RowResult;
use verdict_protocol::progress::ProgressEvent;
use verdict_protocol::state::BatchState;

use crate::config::StateSaveHook;
use crate::error::Result;
use crate::error::VerdictErr;

pub struct StateRecorderParams {
    pub initial: BatchState,
    pub path: Option<PathBuf>,
    pub save_interval: Option<Duration>,
    pub hook: Option<Arc<dyn StateSaveHook>>,
}

enum StateCmd {
    Commit {
        result: RowResult,
        progress: Option<ProgressEvent>,
    },
    Save {
        ack: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        ack: oneshot::Sender<BatchState>,
    },
    Shutdown {
        ack: oneshot::Sender<()>,
    },
}

#[derive(Clone)]
pub struct StateRecorder {
    tx: Sender<StateCmd>,
}

impl StateRecorder {
    pub fn new(params: StateRecorderParams) -> Self {
        let (tx, rx) = mpsc::channel(256);
        let StateRecorderParams {
            initial,
            path,
            save_interval,
            hook,
        } = params;
        tokio::spawn(run_recorder(rx, initial, path, save_interval, hook));
        Self { tx }
    }

    /// Folds one committed row into the snapshot and stamps `last_update`.
    pub async fn commit_row(&self, result: RowResult, progress: Option<ProgressEvent>) {
        if self
            .tx
            .send(StateCmd::Commit { result, progress })
            .await
            .is_err()
        {
            warn!("state recorder is gone; dropping row commit");
        }
    }

    /// Saves immediately, surfacing the error to the caller.
    pub async fn save(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.tx.send(StateCmd::Save { ack: ack_tx }).await.is_err() {
            return Ok(());
        }
        ack_rx.await.unwrap_or(Ok(()))
    }

    pub async fn snapshot(&self) -> Option<BatchState> {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .tx
            .send(StateCmd::Snapshot { ack: ack_tx })
            .await
            .is_err()
        {
            return None;
        }
        ack_rx.await.ok()
    }

    /// Stops the save timer and performs one final save.
    pub async fn shutdown(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self
            .tx
            .send(StateCmd::Shutdown { ack: ack_tx })
            .await
            .is_err()
        {
            return;
        }
        let _ = ack_rx.await;
    }
}

async fn run_recorder(
    mut rx: mpsc::Receiver<StateCmd>,
    mut state: BatchState,
    path: Option<PathBuf>,
    save_interval: Option<Duration>,
    hook: Option<Arc<dyn StateSaveHook>>,
) {
    let mut ticker = save_interval.map(|interval| {
        let mut ticker = tokio::time::interval(interval);
        // The first tick of a tokio interval fires immediately; skip it so
        // the first periodic save happens one interval in.
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.reset();
        ticker
    });

    loop {
        tokio::select! {
            cmd = rx.recv() => {
                match cmd {
                    Some(StateCmd::Commit { result, progress }) => {
                        state.processed_rows.insert(result.index);
                        state.results.push(result);
                        if let Some(progress) = progress {
                            state.progress = Some(progress);
                        }
                        state.last_update = Utc::now();
                    }
                    Some(StateCmd::Save { ack }) => {
                        let _ = ack.send(save_state(&state, path.as_deref(), hook.as_deref()).await);
                    }
                    Some(StateCmd::Snapshot { ack }) => {
                        let _ = ack.send(state.clone());
                    }
                    Some(StateCmd::Shutdown { ack }) => {
                        if let Err(err) = save_state(&state, path.as_deref(), hook.as_deref()).await {
                            warn!("final state save failed: {err}");
                        }
                        let _ = ack.send(());
                        break;
                    }
                    None => break,
                }
            }
            _ = tick(&mut ticker) => {
                if let Err(err) = save_state(&state, path.as_deref(), hook.as_deref()).await {
                    warn!("periodic state save failed: {err}");
                }
            }
        }
    }
}

async fn tick(ticker: &mut Option<tokio::time::Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn save_state(
    state: &BatchState,
    path: Option<&Path>,
    hook: Option<&dyn StateSaveHook>,
) -> Result<()> {
    if let Some(path) = path {
        let mut content = serde_json::to_vec_pretty(state)?;
        content.push(b'\n');
        tokio::fs::write(path, content)
            .await
            .map_err(|err| VerdictErr::io(format!("writing {}", path.display()), err))?;
    }
    if let Some(hook) = hook {
        hook.on_state_save(state)
            .await
            .map_err(|err| VerdictErr::StateHook {
                detail: err.to_string(),
            })?;
    }
    Ok(())
}

/// Reads a previously saved snapshot for `resume_from`.
pub async fn load_state(path: &Path) -> Result<BatchState> {
    let content = tokio::fs::read(path)
        .await
        .map_err(|err| VerdictErr::io(format!("reading {}", path.display()), err))?;
    Ok(serde_json::from_slice(&content)?)
}
