//! Coordination client: connection lifecycle, retry, locks, elections and
//! counters over a pluggable node-tree backend.

pub mod instrument;
pub mod lock;
pub mod memory;
pub mod retry;
pub mod session;
pub mod sqlite;

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Duration;

use crate::alloc::QuotaCounter;
use crate::error::{PipelineError, Result};
use instrument::{InstrumentedBackend, OpTimes, ResponseTimes};
use lock::{Lock, LockMode, ReadWriteLock};
use retry::RetryPolicy;
use session::{Session, SessionCallback, SessionState};

/// Poll interval while waiting on a contended lock or election
const CONTENTION_POLL: Duration = Duration::from_millis(200);

/// One node of the coordination tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub value: Vec<u8>,
    pub version: i64,
    pub ephemeral_owner: Option<u64>,
}

/// Storage seam for the coordination service.
///
/// `create` fails with `NodeExists` when the path is taken and creates
/// missing parents. `update` with a version is a compare-and-swap and
/// fails with `BadVersion` on mismatch. `delete` is idempotent.
#[async_trait]
pub trait CoordBackend: Send + Sync {
    async fn ping(&self) -> Result<()>;
    async fn create(&self, path: &str, value: &[u8], owner: Option<u64>) -> Result<()>;
    async fn read(&self, path: &str) -> Result<Option<Node>>;
    async fn update(&self, path: &str, value: &[u8], version: Option<i64>) -> Result<i64>;
    async fn delete(&self, path: &str, recursive: bool) -> Result<()>;
    async fn children(&self, path: &str) -> Result<Vec<String>>;
    async fn exists(&self, path: &str) -> Result<bool>;
    /// Drop every ephemeral node owned by a session
    async fn release_owner(&self, owner: u64) -> Result<usize>;
}

/// `"/a/b"` -> `"/a/b/"`, root stays `"/"`
pub(crate) fn child_prefix(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}

/// Ancestors of `path`, outermost first, excluding the root
pub(crate) fn parent_paths(path: &str) -> Vec<String> {
    let mut parents = Vec::new();
    if path.len() <= 1 {
        return parents;
    }
    let mut end = 0;
    while let Some(pos) = path[end + 1..].find('/') {
        end += pos + 1;
        parents.push(path[..end].to_string());
    }
    parents
}

/// Join path segments under a base, skipping empty segments
pub fn join_path(base: &str, parts: &[&str]) -> String {
    let mut path = base.trim_end_matches('/').to_string();
    for part in parts {
        let part = part.trim_matches('/');
        if !part.is_empty() {
            path.push('/');
            path.push_str(part);
        }
    }
    if path.is_empty() {
        path.push('/');
    }
    path
}

/// Client handle shared by allocators, the job worker and the fabric
/// coordinator. All calls go through the response-time middleware and the
/// retry policy.
pub struct CoordClient {
    backend: Arc<dyn CoordBackend>,
    times: Arc<ResponseTimes>,
    session: Session,
    session_id: u64,
    base: String,
    retry: RetryPolicy,
}

impl CoordClient {
    /// Build a client without connecting
    pub fn new(backend: Arc<dyn CoordBackend>, base: &str, retry: RetryPolicy) -> Arc<Self> {
        let times = Arc::new(ResponseTimes::new());
        let backend: Arc<dyn CoordBackend> =
            Arc::new(InstrumentedBackend::new(backend, times.clone()));
        Arc::new(Self {
            backend,
            times,
            session: Session::new(),
            session_id: rand::random::<u64>() >> 1,
            base: join_path(base, &[]),
            retry,
        })
    }

    /// Build a client and perform the initial handshake
    pub async fn connect(
        backend: Arc<dyn CoordBackend>,
        base: &str,
        retry: RetryPolicy,
    ) -> Result<Arc<Self>> {
        let client = Self::new(backend, base, retry);
        client.start().await?;
        Ok(client)
    }

    /// Handshake: INIT -> CONNECTED
    pub async fn start(&self) -> Result<()> {
        let mut attempt = 0;
        loop {
            match self.backend.ping().await {
                Ok(()) => {
                    self.session.transition(SessionState::Connected);
                    return Ok(());
                }
                Err(e) if e.is_retryable() => {
                    tracing::warn!("Coordination handshake failed (attempt {}): {}", attempt + 1, e);
                    tokio::time::sleep(self.retry.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub fn base_path(&self) -> &str {
        &self.base
    }

    /// Absolute path under the client's base
    pub fn path(&self, parts: &[&str]) -> String {
        join_path(&self.base, parts)
    }

    pub fn session_id(&self) -> u64 {
        self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn on_suspend(&self, cb: SessionCallback) {
        self.session.set_suspend_callback(cb);
    }

    pub fn on_lost(&self, cb: SessionCallback) {
        self.session.set_lost_callback(cb);
    }

    pub fn response_times(&self) -> BTreeMap<String, OpTimes> {
        self.times.snapshot()
    }

    /// Force the session to LOST, as a server-side session expiry would
    pub fn expire_session(&self) {
        self.session.transition(SessionState::Lost);
    }

    pub async fn create(&self, path: &str, value: &[u8]) -> Result<()> {
        self.call(|| self.backend.create(path, value, None)).await
    }

    /// Node removed when this client's session closes
    pub async fn create_ephemeral(&self, path: &str, value: &[u8]) -> Result<()> {
        self.call(|| self.backend.create(path, value, Some(self.session_id)))
            .await
    }

    pub async fn read(&self, path: &str) -> Result<Option<Node>> {
        self.call(|| self.backend.read(path)).await
    }

    /// Read a node's value as UTF-8
    pub async fn read_string(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .read(path)
            .await?
            .map(|n| String::from_utf8_lossy(&n.value).into_owned()))
    }

    pub async fn update(&self, path: &str, value: &[u8], version: Option<i64>) -> Result<i64> {
        self.call(|| self.backend.update(path, value, version)).await
    }

    pub async fn delete(&self, path: &str, recursive: bool) -> Result<()> {
        self.call(|| self.backend.delete(path, recursive)).await
    }

    pub async fn children(&self, path: &str) -> Result<Vec<String>> {
        self.call(|| self.backend.children(path)).await
    }

    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.call(|| self.backend.exists(path)).await
    }

    /// Exclusive lock at `<base>/locks/<name>`
    pub fn lock(self: &Arc<Self>, name: &str, identity: &str) -> Lock {
        Lock::new(self.clone(), self.path(&["locks", name]), identity)
    }

    pub fn read_lock(self: &Arc<Self>, name: &str, identity: &str) -> ReadWriteLock {
        ReadWriteLock::new(self.clone(), self.path(&["locks", name]), identity, LockMode::Read)
    }

    pub fn write_lock(self: &Arc<Self>, name: &str, identity: &str) -> ReadWriteLock {
        ReadWriteLock::new(self.clone(), self.path(&["locks", name]), identity, LockMode::Write)
    }

    /// Bounded counter at `<base>/counters/<name>`
    pub async fn counter(self: &Arc<Self>, name: &str, max: i64) -> Result<QuotaCounter> {
        QuotaCounter::new(self.clone(), &self.path(&["counters", name]), max).await
    }

    /// Contend for leadership of `path` and run `f` once elected.
    ///
    /// Returns `None` when the attempt was cancelled because a suspended
    /// session reconnected before this client won.
    pub async fn election<F, Fut, T>(&self, path: &str, identity: &str, f: F) -> Result<Option<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let leader = join_path(path, &["leader"]);
        let token = self.session.election_token();

        loop {
            if token.is_cancelled() {
                tracing::info!("Election at {} cancelled for {}", path, identity);
                return Ok(None);
            }
            match self.create_ephemeral(&leader, identity.as_bytes()).await {
                Ok(()) => break,
                Err(PipelineError::NodeExists(_)) => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = tokio::time::sleep(CONTENTION_POLL) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!("{} elected leader at {}", identity, path);
        let out = f().await;
        self.delete(&leader, false).await?;
        Ok(Some(out))
    }

    /// Close the session, dropping its ephemeral nodes
    pub async fn close(&self) -> Result<()> {
        let released = self.backend.release_owner(self.session_id).await?;
        tracing::info!("Coordination session closed ({} ephemeral nodes released)", released);
        Ok(())
    }

    /// Retry wrapper around every CRUD call
    async fn call<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt: u32 = 0;
        loop {
            if self.session.state() == SessionState::Lost {
                return Err(PipelineError::CoordUnavailable("session lost".into()));
            }

            match op().await {
                Ok(v) => {
                    if self.session.state() == SessionState::Suspended {
                        self.session.transition(SessionState::Connected);
                    }
                    return Ok(v);
                }
                Err(e) if e.is_retryable() => {
                    if self.session.state() == SessionState::Connected {
                        self.session.transition(SessionState::Suspended);
                    }
                    if self.session.suspended_for() >= self.retry.session_timeout {
                        self.session.transition(SessionState::Lost);
                        return Err(e);
                    }
                    let delay = self.retry.delay(attempt);
                    tracing::warn!(
                        "Coordination call failed (attempt {}), retrying in {:?}: {}",
                        attempt + 1,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
                Err(e) => {
                    if self.session.state() == SessionState::Suspended {
                        self.session.transition(SessionState::Connected);
                    }
                    return Err(e);
                }
            }
        }
    }
}
