//! State persistence and the single-writer state actor
//!
//! `StateStore` reads and writes the JSON document. `StateHandle` is the
//! only way to touch `RuntimeState`: every read-modify-write is a closure
//! run by one task, followed by the wholesale write, before the caller
//! gets its answer.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::error::{Result, RuntimeError};
use crate::runtime::now_ms;
use crate::state::RuntimeState;

/// What the actor does after a job ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persist {
    /// Nothing changed
    Skip,
    /// Bookkeeping change: normalize and write, keep `updated_at`
    Quiet,
    /// Substantive change: bump `updated_at`, normalize and write
    Touch,
}

type Reply = Box<dyn FnOnce() + Send>;
type Job = Box<dyn FnOnce(&mut RuntimeState) -> (Persist, Reply) + Send>;

/// JSON document on disk
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document; a missing or unparseable file yields defaults
    pub async fn load(&self, now: i64) -> RuntimeState {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No state at {:?}, starting fresh", self.path);
                return RuntimeState::new(now);
            }
            Err(e) => {
                warn!("Could not read state at {:?}: {}; starting fresh", self.path, e);
                return RuntimeState::new(now);
            }
        };
        match serde_json::from_str::<RuntimeState>(&raw) {
            Ok(mut state) => {
                state.wallet.seed_default_watchlist();
                state.normalize(now);
                debug!("Loaded state from {:?} (updatedAt {})", self.path, state.updated_at);
                state
            }
            Err(e) => {
                warn!("State at {:?} is unparseable: {}; starting fresh", self.path, e);
                RuntimeState::new(now)
            }
        }
    }

    /// Overwrite the document in full
    pub async fn save(&self, state: &RuntimeState) -> anyhow::Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).await?;
        }
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, json).await?;
        debug!("Wrote {:?}", self.path);
        Ok(())
    }
}

/// Cloneable handle to the state actor
#[derive(Clone)]
pub struct StateHandle {
    tx: mpsc::Sender<Job>,
}

impl StateHandle {
    /// Spawn the actor owning `initial`; `store` of `None` keeps state in memory only
    pub fn spawn(initial: RuntimeState, store: Option<StateStore>) -> Self {
        let (tx, mut rx) = mpsc::channel::<Job>(64);
        tokio::spawn(async move {
            let mut state = initial;
            while let Some(job) = rx.recv().await {
                let (persist, reply) = job(&mut state);
                if persist != Persist::Skip {
                    let now = now_ms();
                    if persist == Persist::Touch {
                        state.touch(now);
                    }
                    state.normalize(now);
                    if let Some(store) = &store {
                        // Memory stays authoritative; the next write retries
                        if let Err(e) = store.save(&state).await {
                            error!("Failed to persist runtime state: {}", e);
                        }
                    }
                }
                reply();
            }
            debug!("State actor stopped");
        });
        Self { tx }
    }

    /// Run `f` atomically against the state
    pub async fn apply<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut RuntimeState) -> (R, Persist) + Send + 'static,
        R: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let job: Job = Box::new(move |state| {
            let (value, persist) = f(state);
            let reply: Reply = Box::new(move || {
                let _ = reply_tx.send(value);
            });
            (persist, reply)
        });
        self.tx.send(job).await.map_err(|_| RuntimeError::StateClosed)?;
        reply_rx.await.map_err(|_| RuntimeError::StateClosed)
    }

    /// Substantive mutation: always bumps `updated_at` and persists
    pub async fn mutate<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut RuntimeState) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.apply(move |state| (f(state), Persist::Touch)).await
    }

    pub async fn read<R, F>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&RuntimeState) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.apply(move |state| (f(state), Persist::Skip)).await
    }

    pub async fn snapshot(&self) -> Result<RuntimeState> {
        self.read(|state| state.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("nope.json"));
        let state = store.load(1_000).await;
        assert_eq!(state.wallet.watchlist.len(), 8);
    }

    #[tokio::test]
    async fn test_garbage_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let state = StateStore::new(&path).load(1_000).await;
        assert_eq!(state.autobot.last_status, "Disabled");
    }

    #[tokio::test]
    async fn test_mutation_bumps_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");
        let handle = StateHandle::spawn(RuntimeState::new(1), Some(StateStore::new(&path)));

        let before = handle.read(|s| s.updated_at).await.unwrap();
        handle.mutate(|s| s.autobot.enabled = true).await.unwrap();
        let after = handle.read(|s| s.updated_at).await.unwrap();
        assert!(after > before);

        let reloaded = StateStore::new(&path).load(now_ms()).await;
        assert!(reloaded.autobot.enabled);
        assert_eq!(reloaded.updated_at, after);
    }

    #[tokio::test]
    async fn test_quiet_write_keeps_updated_at() {
        let handle = StateHandle::spawn(RuntimeState::new(1), None);
        handle.mutate(|_| ()).await.unwrap();
        let before = handle.read(|s| s.updated_at).await.unwrap();
        handle
            .apply(|s| {
                s.last_client_heartbeat_at = 42;
                ((), Persist::Quiet)
            })
            .await
            .unwrap();
        let state = handle.snapshot().await.unwrap();
        assert_eq!(state.updated_at, before);
        assert_eq!(state.last_client_heartbeat_at, 42);
    }
}
