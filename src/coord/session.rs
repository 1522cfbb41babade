use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Coordination session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Init,
    Connected,
    Suspended,
    Lost,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Init => "INIT",
            SessionState::Connected => "CONNECTED",
            SessionState::Suspended => "SUSPENDED",
            SessionState::Lost => "LOST",
        };
        f.write_str(s)
    }
}

pub type SessionCallback = Arc<dyn Fn() + Send + Sync>;

struct SessionInner {
    suspended_since: Option<Instant>,
    connection_up_emitted: bool,
    on_suspend: Option<SessionCallback>,
    on_lost: Option<SessionCallback>,
    election: CancellationToken,
}

/// Session state machine shared by every call made through one client.
///
/// `LOST` is terminal. Without a lost callback the process exits with a
/// non-zero status, so allocators never keep running against a session
/// whose ephemeral nodes are gone.
pub struct Session {
    state_tx: watch::Sender<SessionState>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(SessionState::Init);
        Self {
            state_tx,
            inner: Mutex::new(SessionInner {
                suspended_since: None,
                connection_up_emitted: false,
                on_suspend: None,
                on_lost: None,
                election: CancellationToken::new(),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn set_suspend_callback(&self, cb: SessionCallback) {
        self.lock_inner().on_suspend = Some(cb);
    }

    pub fn set_lost_callback(&self, cb: SessionCallback) {
        self.lock_inner().on_lost = Some(cb);
    }

    /// Token cancelled when a suspended session reconnects
    pub fn election_token(&self) -> CancellationToken {
        self.lock_inner().election.clone()
    }

    /// How long the session has been suspended, zero when it is not
    pub fn suspended_for(&self) -> Duration {
        self.lock_inner()
            .suspended_since
            .map(|since| since.elapsed())
            .unwrap_or_default()
    }

    /// Apply a transition. Returns false when the transition was a no-op.
    pub fn transition(&self, next: SessionState) -> bool {
        let current = self.state();
        if current == next || current == SessionState::Lost {
            return false;
        }

        let callback = {
            let mut inner = self.lock_inner();
            match (current, next) {
                (SessionState::Init, SessionState::Connected) => {
                    if !inner.connection_up_emitted {
                        inner.connection_up_emitted = true;
                        tracing::info!("Coordination session connected");
                    }
                    None
                }
                (SessionState::Connected, SessionState::Suspended) => {
                    inner.suspended_since = Some(Instant::now());
                    tracing::warn!("Coordination session suspended");
                    inner.on_suspend.clone()
                }
                (SessionState::Suspended, SessionState::Connected) => {
                    inner.suspended_since = None;
                    inner.election.cancel();
                    inner.election = CancellationToken::new();
                    tracing::info!("Coordination session reconnected");
                    None
                }
                (_, SessionState::Lost) => {
                    tracing::error!("Coordination session lost (was {})", current);
                    match inner.on_lost.clone() {
                        Some(cb) => Some(cb),
                        None => {
                            drop(inner);
                            std::process::exit(1);
                        }
                    }
                }
                (from, to) => {
                    tracing::debug!("Ignoring session transition {} -> {}", from, to);
                    return false;
                }
            }
        };

        self.state_tx.send_replace(next);
        if let Some(cb) = callback {
            cb();
        }
        true
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, SessionInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_connect_suspend_reconnect() {
        let session = Session::new();
        let suspended = Arc::new(AtomicUsize::new(0));
        let counter = suspended.clone();
        session.set_suspend_callback(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(session.state(), SessionState::Init);
        assert!(session.transition(SessionState::Connected));
        assert!(!session.transition(SessionState::Connected));
        assert!(session.transition(SessionState::Suspended));
        assert_eq!(suspended.load(Ordering::SeqCst), 1);
        assert!(session.transition(SessionState::Connected));
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[test]
    fn test_reconnect_cancels_pending_election() {
        let session = Session::new();
        session.transition(SessionState::Connected);
        let token = session.election_token();
        session.transition(SessionState::Suspended);
        assert!(!token.is_cancelled());
        session.transition(SessionState::Connected);
        assert!(token.is_cancelled());
        assert!(!session.election_token().is_cancelled());
    }

    #[test]
    fn test_lost_is_terminal_and_invokes_callback() {
        let session = Session::new();
        let lost = Arc::new(AtomicUsize::new(0));
        let counter = lost.clone();
        session.set_lost_callback(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        session.transition(SessionState::Connected);
        assert!(session.transition(SessionState::Lost));
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        assert!(!session.transition(SessionState::Connected));
        assert_eq!(session.state(), SessionState::Lost);
    }

    #[test]
    fn test_init_cannot_suspend() {
        let session = Session::new();
        assert!(!session.transition(SessionState::Suspended));
        assert_eq!(session.state(), SessionState::Init);
    }
}
