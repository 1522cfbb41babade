use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Per-device push state machine:
/// INIT -> IN_PROGRESS -> {SUCCESS, RETRY, FAILED} -> INIT
///
/// A terminal router goes straight back to IN_PROGRESS on its next
/// dispatch. It returns to INIT once its config has been deleted or it
/// has been forgotten after leaving the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PushState {
    #[default]
    Init,
    InProgress,
    Success,
    Retry,
    Failed,
}

impl PushState {
    pub fn as_str(self) -> &'static str {
        match self {
            PushState::Init => "INIT",
            PushState::InProgress => "IN_PROGRESS",
            PushState::Success => "SUCCESS",
            PushState::Retry => "RETRY",
            PushState::Failed => "FAILED",
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, PushState::Retry | PushState::Failed)
    }
}

/// Commit statistics; process-local, reset on restart
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommitStats {
    pub total_commits_sent_since_up: u64,
    pub last_commit_time: String,
    pub last_commit_duration: String,
    pub commit_status_message: String,
}

/// What the engine remembers about one router between passes
#[derive(Debug, Clone)]
pub(crate) struct DeviceRecord {
    pub name: String,
    pub state: PushState,
    pub stats: CommitStats,
    pub last_config_hash: Option<String>,
    pub last_document: Option<serde_json::Value>,
    pub last_byte_count: usize,
    pub config_sent: bool,
    pub repush_interval: Duration,
    pub blocked_until: Option<Instant>,
}

impl DeviceRecord {
    pub fn new(name: &str, repush_interval: Duration) -> Self {
        Self {
            name: name.to_string(),
            state: PushState::Init,
            stats: CommitStats::default(),
            last_config_hash: None,
            last_document: None,
            last_byte_count: 0,
            config_sent: false,
            repush_interval,
            blocked_until: None,
        }
    }

    pub fn status(&self, uuid: &str) -> DeviceStatus {
        DeviceStatus {
            uuid: uuid.to_string(),
            name: self.name.clone(),
            state: self.state,
            commit_stats: self.stats.clone(),
            last_config_hash: self.last_config_hash.clone(),
            last_byte_count: self.last_byte_count,
            config_sent: self.config_sent,
            repush_interval_secs: self.repush_interval.as_secs(),
        }
    }
}

/// Read-only view of a router's push state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceStatus {
    pub uuid: String,
    pub name: String,
    pub state: PushState,
    pub commit_stats: CommitStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_config_hash: Option<String>,
    pub last_byte_count: usize,
    pub config_sent: bool,
    pub repush_interval_secs: u64,
}
