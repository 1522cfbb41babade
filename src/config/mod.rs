use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::jobs::worker::WorkerSettings;
use crate::jobs::{DispatcherSettings, JobEnvelope, VncApiInitParams};
use crate::push::PushSettings;

/// Coordination store backing
pub mod coord_backend {
    pub const SQLITE: &str = "sqlite";
    pub const MEMORY: &str = "memory";
}

/// Config holds all application configuration
#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub coord_backend: String,
    pub coord_db_path: String,
    pub coord_max_connections: u32,
    pub coord_base_path: String,
    pub intent_path: String,
    pub reconcile_interval_secs: u64,
    pub job_timeout_secs: u64,
    pub job_max_retries: u32,
    pub max_job_count: usize,
    pub config_repush_interval_secs: u64,
    pub config_repush_max_interval_secs: u64,
    pub push_delay_per_kb: f64,
    pub push_delay_max_secs: u64,
    pub forced_cfg_push: bool,
    pub max_ae_device_count: u64,
    pub cluster_id: String,
    pub api_server_hosts: Vec<String>,
    pub admin_user: String,
    pub admin_password: String,
    pub admin_tenant_name: String,
    pub api_server_port: String,
    pub api_server_use_ssl: bool,
    pub simulate_job_worker: bool,
}

impl Config {
    /// Load configuration from environment variables with defaults
    pub fn load() -> Self {
        Self {
            listen_addr: get_env("LISTEN_ADDR", "0.0.0.0:8083"),
            coord_backend: get_env("COORD_BACKEND", coord_backend::SQLITE),
            coord_db_path: get_env("COORD_DB_PATH", "/data/coord.db"),
            coord_max_connections: parse_env("COORD_MAX_CONNECTIONS", 5),
            coord_base_path: get_env("COORD_BASE_PATH", "/fabric-push"),
            intent_path: get_env("INTENT_PATH", ""),
            reconcile_interval_secs: parse_env("RECONCILE_INTERVAL_SECS", 60),
            job_timeout_secs: parse_env("JOB_TIMEOUT_SECS", 15),
            job_max_retries: parse_env("JOB_MAX_RETRIES", 60),
            max_job_count: parse_env("MAX_JOB_COUNT", 100),
            config_repush_interval_secs: parse_env("CONFIG_REPUSH_INTERVAL_SECS", 15),
            config_repush_max_interval_secs: parse_env("CONFIG_REPUSH_MAX_INTERVAL_SECS", 300),
            push_delay_per_kb: parse_env("PUSH_DELAY_PER_KB", 0.01),
            push_delay_max_secs: parse_env("PUSH_DELAY_MAX_SECS", 5),
            forced_cfg_push: parse_bool(&get_env("FORCED_CFG_PUSH", "false")),
            max_ae_device_count: parse_env("MAX_AE_DEVICE_COUNT", 128),
            cluster_id: get_env("CLUSTER_ID", ""),
            api_server_hosts: get_env("API_SERVER_HOSTS", "127.0.0.1")
                .split(',')
                .map(str::trim)
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect(),
            admin_user: get_env("ADMIN_USER", "admin"),
            admin_password: get_env("ADMIN_PASSWORD", ""),
            admin_tenant_name: get_env("ADMIN_TENANT_NAME", "admin"),
            api_server_port: get_env("API_SERVER_PORT", "8082"),
            api_server_use_ssl: parse_bool(&get_env("API_SERVER_USE_SSL", "false")),
            simulate_job_worker: parse_bool(&get_env("SIMULATE_JOB_WORKER", "true")),
        }
    }

    /// Defaults for tests and embedded use: in-memory store, no intent file
    pub fn in_memory() -> Self {
        Self {
            coord_backend: coord_backend::MEMORY.to_string(),
            intent_path: String::new(),
            ..Self::load()
        }
    }

    pub fn dispatcher_settings(&self) -> DispatcherSettings {
        DispatcherSettings {
            timeout: Duration::from_secs(self.job_timeout_secs),
            max_retries: self.job_max_retries,
            envelope: JobEnvelope {
                api_server_hosts: self.api_server_hosts.clone(),
                vnc_api_init_params: VncApiInitParams {
                    admin_user: self.admin_user.clone(),
                    admin_password: self.admin_password.clone(),
                    admin_tenant_name: self.admin_tenant_name.clone(),
                    api_server_port: self.api_server_port.clone(),
                    api_server_use_ssl: self.api_server_use_ssl,
                },
                cluster_id: self.cluster_id.clone(),
            },
        }
    }

    pub fn push_settings(&self) -> PushSettings {
        PushSettings {
            repush_interval: Duration::from_secs(self.config_repush_interval_secs),
            repush_max_interval: Duration::from_secs(
                self.config_repush_max_interval_secs
                    .max(self.config_repush_interval_secs),
            ),
            push_delay_per_kb: self.push_delay_per_kb,
            push_delay_max: Duration::from_secs(self.push_delay_max_secs),
            forced_cfg_push: self.forced_cfg_push,
        }
    }

    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            max_job_count: self.max_job_count,
            ..Default::default()
        }
    }
}

fn get_env(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!("Ignoring invalid {}={:?}", key, raw);
            default
        }),
        Err(_) => default,
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("true"));
        assert!(parse_bool(" Yes "));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool(""));
    }

    #[test]
    fn test_defaults_feed_component_settings() {
        let cfg = Config::in_memory();
        assert_eq!(cfg.coord_backend, "memory");

        let push = cfg.push_settings();
        assert!(push.repush_max_interval >= push.repush_interval);
        let dispatch = cfg.dispatcher_settings();
        assert_eq!(dispatch.timeout, Duration::from_secs(cfg.job_timeout_secs));
        assert_eq!(dispatch.envelope.cluster_id, cfg.cluster_id);
        assert_eq!(cfg.worker_settings().max_job_count, cfg.max_job_count);
    }
}
