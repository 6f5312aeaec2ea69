use std::env;
use std::str::FromStr;
use std::time::Duration;

use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::backoff::BackoffPolicy;
use crate::error::{ConfigError, ValidationError};
use crate::models::ActivationRequest;
use crate::poller::DEFAULT_IDLE_INTERVAL;
use crate::reporter::ReportPolicy;

/// Tuning shared by every subscription of one worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
  pub worker_name: String,
  pub lease_timeout: Duration,
  pub request_timeout: Duration,
  pub max_jobs: u32,
  pub max_concurrent: usize,
  pub poll_backoff: BackoffPolicy,
  pub report_policy: ReportPolicy,
  pub idle_interval: Duration,
}

impl Default for WorkerSettings {
  fn default() -> Self {
    Self {
      worker_name: format!("worker-{}", Uuid::new_v4()),
      lease_timeout: Duration::from_secs(300),
      request_timeout: Duration::from_secs(20),
      max_jobs: 32,
      max_concurrent: 32,
      poll_backoff: BackoffPolicy::default(),
      report_policy: ReportPolicy::default(),
      idle_interval: DEFAULT_IDLE_INTERVAL,
    }
  }
}

impl WorkerSettings {
  pub fn with_worker_name(mut self, worker_name: impl Into<String>) -> Self {
    self.worker_name = worker_name.into();
    self
  }

  pub fn activation_request(&self, task_type: &str) -> ActivationRequest {
    ActivationRequest {
      task_type: task_type.to_string(),
      worker: self.worker_name.clone(),
      lease_timeout: self.lease_timeout,
      request_timeout: self.request_timeout,
      max_jobs: self.max_jobs,
    }
  }

  pub fn validate(&self) -> Result<(), ValidationError> {
    if self.worker_name.trim().is_empty() {
      return Err(ValidationError::EmptyWorkerName);
    }
    if self.max_concurrent == 0 {
      return Err(ValidationError::NotPositive("max concurrent"));
    }
    if self.max_concurrent > Semaphore::MAX_PERMITS {
      return Err(ValidationError::TooLarge("max concurrent"));
    }
    if self.poll_backoff.interval.is_zero() {
      return Err(ValidationError::NotPositive("poll backoff"));
    }
    if self.poll_backoff.max_attempts == Some(0) {
      return Err(ValidationError::NotPositive("poll max attempts"));
    }
    Ok(())
  }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
  pub broker_url: String,
  pub job_types: Vec<String>,
  pub settings: WorkerSettings,
}

impl WorkerConfig {
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
    let broker_url = lookup("BROKER_URL").ok_or(ConfigError::Missing("BROKER_URL"))?;
    let job_types: Vec<String> = lookup("JOB_TYPES")
      .unwrap_or_else(|| "echo".into())
      .split(',')
      .map(str::trim)
      .filter(|t| !t.is_empty())
      .map(String::from)
      .collect();

    let defaults = WorkerSettings::default();
    let poll_backoff = BackoffPolicy {
      interval: millis(&lookup, "POLL_BACKOFF_MS", defaults.poll_backoff.interval)?,
      max_attempts: optional(&lookup, "POLL_MAX_ATTEMPTS")?,
    };
    let settings = WorkerSettings {
      worker_name: lookup("WORKER_NAME").unwrap_or(defaults.worker_name),
      lease_timeout: millis(&lookup, "LEASE_TIMEOUT_MS", defaults.lease_timeout)?,
      request_timeout: millis(&lookup, "REQUEST_TIMEOUT_MS", defaults.request_timeout)?,
      max_jobs: parse(&lookup, "MAX_JOBS", defaults.max_jobs)?,
      max_concurrent: parse(&lookup, "MAX_CONCURRENT", defaults.max_concurrent)?,
      poll_backoff,
      report_policy: defaults
        .report_policy
        .with_max_retries(parse(&lookup, "REPORT_RETRIES", defaults.report_policy.max_retries)?),
      idle_interval: defaults.idle_interval,
    };
    settings.validate()?;
    for task_type in &job_types {
      settings.activation_request(task_type).validate()?;
    }

    Ok(Self { broker_url, job_types, settings })
  }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
  pub server_port: u16,
}

impl BrokerConfig {
  pub fn from_env() -> Result<Self, ConfigError> {
    Self::from_lookup(|key| env::var(key).ok())
  }

  pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
    Ok(Self {
      server_port: parse(&lookup, "SERVER_PORT", 8080)?,
    })
  }
}

fn optional<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str) -> Result<Option<T>, ConfigError> {
  match lookup(key) {
    Some(value) => value
      .trim()
      .parse()
      .map(Some)
      .map_err(|_| ConfigError::Invalid { key, value }),
    None => Ok(None),
  }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
  Ok(optional(lookup, key)?.unwrap_or(default))
}

fn millis(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
  Ok(optional::<u64>(lookup, key)?.map(Duration::from_millis).unwrap_or(default))
}
