use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use render_common::store::StorageKind;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3302")]
    pub port: u16,

    /// Required inbound credential for every endpoint except the
    /// probes.
    pub api_key: String,

    #[envconfig(default = "3")]
    pub max_remote_workers: u32,

    #[envconfig(default = "2")]
    pub max_local_concurrency: usize,

    #[envconfig(from = "QUEUE_STORAGE", default = "MEMORY")]
    pub queue_storage: StorageKind,

    #[envconfig(default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(from = "POLL_INTERVAL_MS", default = "5000")]
    pub poll_interval: EnvMsDuration,

    #[envconfig(from = "TIMEOUT_CHECK_MS", default = "60000")]
    pub timeout_check: EnvMsDuration,

    #[envconfig(from = "RECONCILE_INTERVAL_MS", default = "300000")]
    pub reconcile_interval: EnvMsDuration,

    /// Fallback cadence for dispatch passes; enqueues and releases
    /// wake the dispatcher immediately.
    #[envconfig(from = "DISPATCH_TICK_MS", default = "1000")]
    pub dispatch_tick: EnvMsDuration,

    #[envconfig(default = "86400")]
    pub job_ttl_seconds: u64,

    /// Enables HMAC signing of webhook bodies when set.
    pub webhook_secret: Option<String>,

    #[envconfig(default = "3")]
    pub webhook_max_attempts: u32,

    #[envconfig(from = "WEBHOOK_TIMEOUT_MS", default = "30000")]
    pub webhook_timeout: EnvMsDuration,

    #[envconfig(default = "http://localhost:8000")]
    pub remote_api_base: String,

    pub remote_api_key: Option<String>,

    #[envconfig(from = "REMOTE_TIMEOUT_MS", default = "30000")]
    pub remote_timeout: EnvMsDuration,

    /// Executable the local pool hands `_vps` payloads to.
    #[envconfig(default = "media-worker")]
    pub local_processor_cmd: String,

    #[envconfig(default = "20")]
    pub rate_limit_per_second: u32,

    #[envconfig(default = "40")]
    pub rate_limit_burst: u32,

    #[envconfig(default = "5242880")]
    pub max_body_size: usize,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl std::fmt::Display for ParseEnvMsDurationError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "expected a duration in whole milliseconds")
    }
}

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ms_duration_parses() {
        let parsed: EnvMsDuration = "2500".parse().unwrap();
        assert_eq!(parsed.0, time::Duration::from_millis(2500));
        assert!("soon".parse::<EnvMsDuration>().is_err());
    }
}
