use serde::{Deserialize, Serialize};

pub const JOB_REQUEST_EXCHANGE: &str = "job_request_exchange";
pub const JOB_REQUEST_ROUTING_KEY: &str = "job.request";
pub const JOB_ABORT_ROUTING_KEY: &str = "job.abort";
pub const JOB_STATUS_EXCHANGE: &str = "job_status_exchange";
pub const JOB_STATUS_ROUTING_KEY_PREFIX: &str = "job.status.";

/// Status messages older than this are dropped by listeners
pub const JOB_STATUS_TTL_SECS: i64 = 5 * 60;

pub mod abort_mode {
    pub const FORCE: &str = "force";
    pub const GRACEFUL: &str = "graceful";
}

pub fn status_routing_key(execution_id: &str) -> String {
    format!("{}{}", JOB_STATUS_ROUTING_KEY_PREFIX, execution_id)
}

/// `<unix_millis>_<uuid_v4>`
pub fn new_execution_id() -> String {
    format!(
        "{}_{}",
        chrono::Utc::now().timestamp_millis(),
        uuid::Uuid::new_v4()
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Starting,
    InProgress,
    Success,
    Failure,
    Warning,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Failure | JobStatus::Warning)
    }

    fn rank(self) -> u8 {
        match self {
            JobStatus::Starting => 0,
            JobStatus::InProgress => 1,
            JobStatus::Success | JobStatus::Failure | JobStatus::Warning => 2,
        }
    }

    /// Whether moving from `self` to `next` goes forward. Terminal states
    /// never change.
    pub fn advances_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Starting => "STARTING",
            JobStatus::InProgress => "IN_PROGRESS",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failure => "FAILURE",
            JobStatus::Warning => "WARNING",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobParams {
    pub device_list: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VncApiInitParams {
    pub admin_user: String,
    pub admin_password: String,
    pub admin_tenant_name: String,
    pub api_server_port: String,
    pub api_server_use_ssl: bool,
}

/// Body published on `job.request`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_execution_id: String,
    pub input: serde_json::Value,
    pub job_template_fq_name: Vec<String>,
    #[serde(default)]
    pub api_server_host: Vec<String>,
    #[serde(default)]
    pub params: JobParams,
    #[serde(default)]
    pub vnc_api_init_params: VncApiInitParams,
    #[serde(default)]
    pub cluster_id: String,
    #[serde(default)]
    pub job_transaction_id: String,
    #[serde(default)]
    pub job_transaction_descr: String,
}

impl JobRequest {
    /// Fabric named in the input payload, if any
    pub fn fabric(&self) -> Option<&str> {
        self.input
            .get("fabric_fq_name")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }
}

/// Body published on `job.status.<id>`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusMessage {
    #[serde(default)]
    pub job_execution_id: String,
    pub job_status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Unix millis at publication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl JobStatusMessage {
    pub fn new(execution_id: &str, status: JobStatus, message: Option<String>) -> Self {
        Self {
            job_execution_id: execution_id.to_string(),
            job_status: status,
            message,
            timestamp: Some(chrono::Utc::now().timestamp_millis()),
        }
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.timestamp
            .map(|ts| now_millis - ts > JOB_STATUS_TTL_SECS * 1000)
            .unwrap_or(false)
    }
}

/// Body published on `job.abort`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobAbort {
    pub job_execution_id: String,
    pub abort_mode: String,
}
