//! Job dispatch: publish one push job on the request exchange and follow
//! its status on a per-execution routing key until it finishes, times out
//! or is cancelled.

pub mod bus;
pub mod types;
pub mod worker;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};
use crate::utils::{retry_with_backoff, Backoff};
use bus::MessageBus;
pub use types::*;

/// Request publication: 12 attempts, 2s start, 5s step, 15s cap
pub const PUBLISH_BACKOFF: Backoff = Backoff::new(12, 2, 5, 15);

/// Static part of every request envelope
#[derive(Debug, Clone, Default)]
pub struct JobEnvelope {
    pub api_server_hosts: Vec<String>,
    pub vnc_api_init_params: VncApiInitParams,
    pub cluster_id: String,
}

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Seconds between status polls
    pub timeout: Duration,
    pub max_retries: u32,
    pub envelope: JobEnvelope,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_retries: 60,
            envelope: JobEnvelope::default(),
        }
    }
}

/// One job to run
#[derive(Debug, Clone, Default)]
pub struct JobSpec {
    pub template: Vec<String>,
    pub input: serde_json::Value,
    pub device_list: Vec<String>,
    pub transaction_id: String,
    pub transaction_descr: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub execution_id: String,
    pub status: JobStatus,
    pub message: Option<String>,
}

#[derive(Debug, Default)]
struct Tracker {
    status: Option<JobStatus>,
    message: Option<String>,
}

impl Tracker {
    /// Apply one status message in arrival order
    fn apply(&mut self, msg: JobStatusMessage, now_millis: i64) {
        if msg.is_expired(now_millis) {
            tracing::debug!("Dropping expired status {} for {}", msg.job_status.as_str(), msg.job_execution_id);
            return;
        }
        let forward = match self.status {
            None => true,
            Some(cur) => cur.advances_to(msg.job_status),
        };
        if !forward {
            tracing::debug!(
                "Ignoring status regression for {}: {:?} -> {}",
                msg.job_execution_id,
                self.status,
                msg.job_status.as_str()
            );
            return;
        }
        self.status = Some(msg.job_status);
        if msg.message.is_some() {
            self.message = msg.message;
        }
    }

    fn terminal(&self) -> bool {
        self.status.map(JobStatus::is_terminal).unwrap_or(false)
    }
}

pub struct JobDispatcher {
    bus: Arc<dyn MessageBus>,
    settings: DispatcherSettings,
}

impl JobDispatcher {
    pub fn new(bus: Arc<dyn MessageBus>, settings: DispatcherSettings) -> Self {
        Self { bus, settings }
    }

    pub fn settings(&self) -> &DispatcherSettings {
        &self.settings
    }

    fn request(&self, execution_id: &str, job: &JobSpec) -> JobRequest {
        let env = &self.settings.envelope;
        JobRequest {
            job_execution_id: execution_id.to_string(),
            input: job.input.clone(),
            job_template_fq_name: job.template.clone(),
            api_server_host: env.api_server_hosts.clone(),
            params: JobParams {
                device_list: job.device_list.clone(),
            },
            vnc_api_init_params: env.vnc_api_init_params.clone(),
            cluster_id: env.cluster_id.clone(),
            job_transaction_id: job.transaction_id.clone(),
            job_transaction_descr: job.transaction_descr.clone(),
        }
    }

    /// Run one job to completion.
    ///
    /// The status consumer is bound before the request goes out and is
    /// always removed before returning. FAILURE and poll exhaustion become
    /// errors naming the devices, template and execution id.
    pub async fn execute(&self, job: &JobSpec, cancel: &CancellationToken) -> Result<JobOutcome> {
        let execution_id = new_execution_id();
        let bus::Subscription { id: sub_id, mut rx } = self
            .bus
            .subscribe(JOB_STATUS_EXCHANGE, &status_routing_key(&execution_id))
            .await?;

        let tracker = Arc::new(Mutex::new(Tracker::default()));
        let listener = {
            let tracker = tracker.clone();
            tokio::spawn(async move {
                while let Some(body) = rx.recv().await {
                    match serde_json::from_slice::<JobStatusMessage>(&body) {
                        Ok(msg) => tracker
                            .lock()
                            .unwrap_or_else(PoisonError::into_inner)
                            .apply(msg, chrono::Utc::now().timestamp_millis()),
                        Err(e) => tracing::warn!("Undecodable job status message: {}", e),
                    }
                }
            })
        };

        let result = self.publish_and_wait(&execution_id, job, &tracker, cancel).await;

        listener.abort();
        self.bus.unsubscribe(sub_id).await;
        result
    }

    async fn publish_and_wait(
        &self,
        execution_id: &str,
        job: &JobSpec,
        tracker: &Mutex<Tracker>,
        cancel: &CancellationToken,
    ) -> Result<JobOutcome> {
        let body = serde_json::to_vec(&self.request(execution_id, job))?;
        retry_with_backoff(PUBLISH_BACKOFF, "job request publish", || {
            self.bus
                .publish(JOB_REQUEST_EXCHANGE, JOB_REQUEST_ROUTING_KEY, body.clone())
        })
        .await?;
        tracing::info!(
            "Published job {} ({}) for {:?}",
            execution_id,
            job.template.join(":"),
            job.device_list
        );

        let mut retry_count = 0;
        loop {
            if tracker.lock().unwrap_or_else(PoisonError::into_inner).terminal() {
                break;
            }
            if retry_count >= self.settings.max_retries {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.abort(execution_id).await;
                    return Err(PipelineError::Cancelled);
                }
                _ = tokio::time::sleep(self.settings.timeout) => {}
            }
            retry_count += 1;
        }

        let (status, message) = {
            let t = tracker.lock().unwrap_or_else(PoisonError::into_inner);
            (t.status, t.message.clone())
        };
        let describe = |what: &str| {
            format!(
                "job {} for devices {:?} with template {} {}",
                execution_id,
                job.device_list,
                job.template.join(":"),
                what
            )
        };
        match status {
            Some(s @ (JobStatus::Success | JobStatus::Warning)) => {
                tracing::info!("Job {} finished with {}", execution_id, s.as_str());
                Ok(JobOutcome {
                    execution_id: execution_id.to_string(),
                    status: s,
                    message,
                })
            }
            Some(JobStatus::Failure) => Err(PipelineError::PushTransportFailure(describe(
                &format!("failed: {}", message.unwrap_or_default()),
            ))),
            _ => Err(PipelineError::PushTimeout(describe(&format!(
                "did not finish after {} polls",
                self.settings.max_retries
            )))),
        }
    }

    async fn abort(&self, execution_id: &str) {
        let msg = JobAbort {
            job_execution_id: execution_id.to_string(),
            abort_mode: abort_mode::FORCE.to_string(),
        };
        let body = match serde_json::to_vec(&msg) {
            Ok(b) => b,
            Err(e) => {
                tracing::error!("Error encoding abort for {}: {}", execution_id, e);
                return;
            }
        };
        if let Err(e) = self
            .bus
            .publish(JOB_REQUEST_EXCHANGE, JOB_ABORT_ROUTING_KEY, body)
            .await
        {
            tracing::warn!("Failed to publish abort for {}: {}", execution_id, e);
        }
    }
}
