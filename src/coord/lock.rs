use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::time::{Duration, Instant};

use super::{CoordClient, CONTENTION_POLL};
use crate::error::{PipelineError, Result};

/// Exclusive lock backed by an ephemeral node holding the owner identity
pub struct Lock {
    coord: Arc<CoordClient>,
    path: String,
    identity: String,
    held: bool,
}

impl Lock {
    pub(crate) fn new(coord: Arc<CoordClient>, path: String, identity: &str) -> Self {
        Self {
            coord,
            path,
            identity: identity.to_string(),
            held: false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Single attempt. Re-acquiring a lock this identity already owns succeeds.
    pub async fn try_acquire(&mut self) -> Result<bool> {
        match self
            .coord
            .create_ephemeral(&self.path, self.identity.as_bytes())
            .await
        {
            Ok(()) => {
                self.held = true;
                Ok(true)
            }
            Err(PipelineError::NodeExists(_)) => {
                let holder = self.holder().await?;
                self.held = holder.as_deref() == Some(self.identity.as_str());
                Ok(self.held)
            }
            Err(e) => Err(e),
        }
    }

    /// Wait until acquired, or until `timeout` elapses
    pub async fn acquire(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.try_acquire().await? {
                return Ok(true);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(false);
            }
            tokio::time::sleep(CONTENTION_POLL).await;
        }
    }

    pub async fn release(&mut self) -> Result<()> {
        if self.held {
            self.coord.delete(&self.path, false).await?;
            self.held = false;
        }
        Ok(())
    }

    /// Identity of the current owner
    pub async fn holder(&self) -> Result<Option<String>> {
        self.coord.read_string(&self.path).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Read,
    Write,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RwState {
    #[serde(default)]
    readers: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    writer: Option<String>,
}

impl RwState {
    fn admits(&self, identity: &str, mode: LockMode) -> bool {
        let writer_ok = self.writer.as_deref().map_or(true, |w| w == identity);
        match mode {
            LockMode::Read => writer_ok,
            LockMode::Write => {
                writer_ok && self.readers.iter().all(|r| r == identity)
            }
        }
    }
}

/// Shared/exclusive lock for rare fabric-wide quiesce operations.
///
/// State is one JSON node updated by compare-and-swap, so readers and the
/// writer never observe a torn update.
pub struct ReadWriteLock {
    coord: Arc<CoordClient>,
    path: String,
    identity: String,
    mode: LockMode,
    held: bool,
}

impl ReadWriteLock {
    pub(crate) fn new(coord: Arc<CoordClient>, path: String, identity: &str, mode: LockMode) -> Self {
        Self {
            coord,
            path,
            identity: identity.to_string(),
            mode,
            held: false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub async fn try_acquire(&mut self) -> Result<bool> {
        loop {
            let (mut state, version) = self.load().await?;
            if !state.admits(&self.identity, self.mode) {
                return Ok(false);
            }
            match self.mode {
                LockMode::Read => {
                    state.readers.insert(self.identity.clone());
                }
                LockMode::Write => state.writer = Some(self.identity.clone()),
            }
            match self.store(&state, version).await {
                Ok(()) => {
                    self.held = true;
                    return Ok(true);
                }
                Err(PipelineError::BadVersion(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub async fn acquire(&mut self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if self.try_acquire().await? {
                return Ok(true);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(false);
            }
            tokio::time::sleep(CONTENTION_POLL).await;
        }
    }

    pub async fn release(&mut self) -> Result<()> {
        if !self.held {
            return Ok(());
        }
        loop {
            let (mut state, version) = self.load().await?;
            match self.mode {
                LockMode::Read => {
                    state.readers.remove(&self.identity);
                }
                LockMode::Write => {
                    if state.writer.as_deref() == Some(self.identity.as_str()) {
                        state.writer = None;
                    }
                }
            }
            match self.store(&state, version).await {
                Ok(()) => break,
                Err(PipelineError::BadVersion(_)) => continue,
                Err(e) => return Err(e),
            }
        }
        self.held = false;
        Ok(())
    }

    async fn load(&self) -> Result<(RwState, Option<i64>)> {
        match self.coord.read(&self.path).await? {
            Some(node) if !node.value.is_empty() => {
                Ok((serde_json::from_slice(&node.value)?, Some(node.version)))
            }
            Some(node) => Ok((RwState::default(), Some(node.version))),
            None => Ok((RwState::default(), None)),
        }
    }

    async fn store(&self, state: &RwState, version: Option<i64>) -> Result<()> {
        let data = serde_json::to_vec(state)?;
        match version {
            Some(v) => self.coord.update(&self.path, &data, Some(v)).await.map(|_| ()),
            // Lost a create race: let the caller reload and retry as a CAS miss
            None => match self.coord.create(&self.path, &data).await {
                Err(PipelineError::NodeExists(p)) => Err(PipelineError::BadVersion(p)),
                other => other,
            },
        }
    }
}
