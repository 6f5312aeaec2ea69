//! In-process broker with leases, retries and long-polling.
//!
//! Backs the HTTP gateway binary and the integration tests. Lease expiry is
//! tracked on the tokio clock so paused-time tests can drive it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, broadcast};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info};

use super::Broker;
use crate::error::{BrokerError, ValidationError};
use crate::models::{ActivationRequest, CompletionResult, FailureResult, Job, Variables, validate_task_type};

const EVENT_CAPACITY: usize = 256;
/// Upper bound applied to requested leases and long-poll waits.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewJob {
  #[serde(rename = "type")]
  pub task_type: String,
  #[serde(default)]
  pub variables: Variables,
  #[serde(default = "default_retries")]
  pub retries: u32,
  #[serde(default)]
  pub process_instance_key: Option<i64>,
  #[serde(default)]
  pub custom_headers: HashMap<String, String>,
}

fn default_retries() -> u32 {
  3
}

impl NewJob {
  pub fn new(task_type: impl Into<String>, variables: Variables) -> Self {
    Self {
      task_type: task_type.into(),
      variables,
      retries: default_retries(),
      ..Self::default()
    }
  }

  pub fn with_retries(mut self, retries: u32) -> Self {
    self.retries = retries;
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
  Activatable,
  Activated,
  Completed,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEvent {
  Created { key: i64, task_type: String },
  Activated { key: i64, worker: String },
  Completed { key: i64, variables: Variables },
  Failed { key: i64, error_message: String, retries: u32 },
}

impl JobEvent {
  pub fn key(&self) -> i64 {
    match self {
      JobEvent::Created { key, .. }
      | JobEvent::Activated { key, .. }
      | JobEvent::Completed { key, .. }
      | JobEvent::Failed { key, .. } => *key,
    }
  }

  pub fn name(&self) -> &'static str {
    match self {
      JobEvent::Created { .. } => "created",
      JobEvent::Activated { .. } => "activated",
      JobEvent::Completed { .. } => "completed",
      JobEvent::Failed { .. } => "failed",
    }
  }
}

#[derive(Debug)]
struct Entry {
  job: Job,
  status: JobStatus,
  lease_until: Option<Instant>,
  last_error: Option<String>,
}

impl Entry {
  fn activatable(&self, task_type: &str, now: Instant) -> bool {
    if self.job.task_type != task_type {
      return false;
    }
    match self.status {
      JobStatus::Activatable => true,
      JobStatus::Activated => self.lease_until.is_some_and(|until| until <= now),
      _ => false,
    }
  }
}

pub struct InMemoryBroker {
  jobs: Mutex<BTreeMap<i64, Entry>>,
  next_key: AtomicI64,
  available: Notify,
  events: broadcast::Sender<JobEvent>,
}

impl Default for InMemoryBroker {
  fn default() -> Self {
    Self::new()
  }
}

impl InMemoryBroker {
  pub fn new() -> Self {
    let (events, _) = broadcast::channel(EVENT_CAPACITY);
    Self {
      jobs: Mutex::new(BTreeMap::new()),
      next_key: AtomicI64::new(1),
      available: Notify::new(),
      events,
    }
  }

  fn jobs(&self) -> MutexGuard<'_, BTreeMap<i64, Entry>> {
    self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn publish(&self, event: JobEvent) {
    // no subscribers is fine
    let _ = self.events.send(event);
  }

  pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
    self.events.subscribe()
  }

  pub fn create_job(&self, new_job: NewJob) -> Result<i64, ValidationError> {
    validate_task_type(&new_job.task_type)?;
    let key = self.next_key.fetch_add(1, Ordering::Relaxed);
    let job = Job {
      key,
      process_instance_key: new_job.process_instance_key.unwrap_or(key),
      task_type: new_job.task_type.clone(),
      worker: String::new(),
      retries: new_job.retries,
      deadline: Utc::now(),
      custom_headers: new_job.custom_headers,
      variables: new_job.variables,
    };
    self.jobs().insert(
      key,
      Entry {
        job,
        status: JobStatus::Activatable,
        lease_until: None,
        last_error: None,
      },
    );
    info!(job_key = key, task_type = %new_job.task_type, "job created");
    self.publish(JobEvent::Created { key, task_type: new_job.task_type });
    self.available.notify_waiters();
    Ok(key)
  }

  /// Status as seen by the broker; an activated job past its lease reads as activatable.
  pub fn job_status(&self, key: i64) -> Option<JobStatus> {
    let jobs = self.jobs();
    let entry = jobs.get(&key)?;
    let expired = entry.status == JobStatus::Activated && entry.lease_until.is_some_and(|until| until <= Instant::now());
    Some(if expired { JobStatus::Activatable } else { entry.status })
  }

  pub fn last_error(&self, key: i64) -> Option<String> {
    self.jobs().get(&key).and_then(|entry| entry.last_error.clone())
  }

  fn take_activatable(&self, request: &ActivationRequest) -> Vec<Job> {
    let now = Instant::now();
    let lease = request.lease_timeout.min(MAX_TIMEOUT);
    let deadline = chrono::Duration::from_std(lease)
      .ok()
      .and_then(|lease| Utc::now().checked_add_signed(lease))
      .unwrap_or(DateTime::<Utc>::MAX_UTC);
    let mut activated = Vec::new();
    {
      let mut jobs = self.jobs();
      for entry in jobs.values_mut() {
        if activated.len() >= request.max_jobs as usize {
          break;
        }
        if !entry.activatable(&request.task_type, now) {
          continue;
        }
        if entry.status == JobStatus::Activated {
          debug!(job_key = entry.job.key, previous = %entry.job.worker, "lease expired, reassigning job");
        }
        entry.status = JobStatus::Activated;
        entry.lease_until = Some(now + lease);
        entry.job.worker = request.worker.clone();
        entry.job.deadline = deadline;
        activated.push(entry.job.clone());
      }
    }
    for job in &activated {
      self.publish(JobEvent::Activated { key: job.key, worker: job.worker.clone() });
    }
    activated
  }

  fn next_lease_expiry(&self, task_type: &str) -> Option<Instant> {
    self
      .jobs()
      .values()
      .filter(|entry| entry.status == JobStatus::Activated && entry.job.task_type == task_type)
      .filter_map(|entry| entry.lease_until)
      .min()
  }

  fn activated_entry<'a>(jobs: &'a mut BTreeMap<i64, Entry>, key: i64) -> Result<&'a mut Entry, BrokerError> {
    match jobs.get_mut(&key) {
      Some(entry) if entry.status == JobStatus::Activated => Ok(entry),
      _ => Err(BrokerError::NotFound(key)),
    }
  }
}

impl Broker for InMemoryBroker {
  async fn activate_jobs(&self, request: &ActivationRequest) -> Result<Vec<Job>, BrokerError> {
    request.validate().map_err(|e| BrokerError::Rejected(e.to_string()))?;
    let give_up_at = Instant::now() + request.request_timeout.min(MAX_TIMEOUT);
    loop {
      let notified = self.available.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      let jobs = self.take_activatable(request);
      if !jobs.is_empty() {
        return Ok(jobs);
      }

      let wake_at = match self.next_lease_expiry(&request.task_type) {
        Some(expiry) if expiry < give_up_at => expiry,
        _ => give_up_at,
      };
      tokio::select! {
        _ = &mut notified => {}
        _ = sleep_until(wake_at) => {
          if Instant::now() >= give_up_at {
            return Ok(Vec::new());
          }
        }
      }
    }
  }

  async fn complete_job(&self, result: &CompletionResult) -> Result<(), BrokerError> {
    {
      let mut jobs = self.jobs();
      let entry = Self::activated_entry(&mut jobs, result.job_key)?;
      entry.status = JobStatus::Completed;
      entry.lease_until = None;
      entry.job.variables.extend(result.variables.clone());
    }
    info!(job_key = result.job_key, "job completed");
    self.publish(JobEvent::Completed { key: result.job_key, variables: result.variables.clone() });
    Ok(())
  }

  async fn fail_job(&self, result: &FailureResult) -> Result<(), BrokerError> {
    let reopened = {
      let mut jobs = self.jobs();
      let entry = Self::activated_entry(&mut jobs, result.job_key)?;
      entry.job.retries = result.retries;
      entry.lease_until = None;
      entry.last_error = Some(result.error_message.clone());
      entry.status = if result.retries > 0 { JobStatus::Activatable } else { JobStatus::Failed };
      entry.status == JobStatus::Activatable
    };
    info!(job_key = result.job_key, retries = result.retries, error = %result.error_message, "job failed");
    self.publish(JobEvent::Failed {
      key: result.job_key,
      error_message: result.error_message.clone(),
      retries: result.retries,
    });
    if reopened {
      self.available.notify_waiters();
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Arc;
  use std::time::Duration;

  use serde_json::json;

  use super::*;

  fn request(task_type: &str, max_jobs: u32) -> ActivationRequest {
    ActivationRequest {
      task_type: task_type.into(),
      worker: "w1".into(),
      lease_timeout: Duration::from_secs(30),
      request_timeout: Duration::from_secs(5),
      max_jobs,
    }
  }

  fn vars(value: serde_json::Value) -> Variables {
    value.as_object().cloned().unwrap_or_default()
  }

  #[tokio::test(start_paused = true)]
  async fn empty_type_returns_empty_batch_after_request_timeout() {
    let broker = InMemoryBroker::new();
    let started = Instant::now();
    let jobs = broker.activate_jobs(&request("nothing-here", 5)).await.unwrap();
    assert!(jobs.is_empty());
    assert!(started.elapsed() >= Duration::from_secs(5));
  }

  #[tokio::test]
  async fn activates_only_matching_type_up_to_max() {
    let broker = InMemoryBroker::new();
    for _ in 0..3 {
      broker.create_job(NewJob::new("payment", vars(json!({"amount": 10})))).unwrap();
    }
    broker.create_job(NewJob::new("shipping", Variables::new())).unwrap();

    let jobs = broker.activate_jobs(&request("payment", 2)).await.unwrap();
    assert_eq!(jobs.len(), 2);
    assert!(jobs.iter().all(|j| j.task_type == "payment" && j.worker == "w1"));
    assert_eq!(jobs[0].variables["amount"], json!(10));

    let rest = broker.activate_jobs(&request("payment", 10)).await.unwrap();
    assert_eq!(rest.len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn long_poll_wakes_when_a_job_is_created() {
    let broker = Arc::new(InMemoryBroker::new());
    let poller = {
      let broker = broker.clone();
      tokio::spawn(async move { broker.activate_jobs(&request("payment", 1)).await })
    };
    tokio::time::sleep(Duration::from_secs(1)).await;
    let key = broker.create_job(NewJob::new("payment", Variables::new())).unwrap();

    let jobs = poller.await.unwrap().unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].key, key);
  }

  #[tokio::test(start_paused = true)]
  async fn expired_lease_makes_job_activatable_again() {
    let broker = InMemoryBroker::new();
    let key = broker.create_job(NewJob::new("payment", Variables::new())).unwrap();
    let mut short = request("payment", 1);
    short.lease_timeout = Duration::from_secs(2);
    assert_eq!(broker.activate_jobs(&short).await.unwrap().len(), 1);
    assert_eq!(broker.job_status(key), Some(JobStatus::Activated));

    tokio::time::advance(Duration::from_secs(3)).await;
    assert_eq!(broker.job_status(key), Some(JobStatus::Activatable));

    let mut other = request("payment", 1);
    other.worker = "w2".into();
    let jobs = broker.activate_jobs(&other).await.unwrap();
    assert_eq!(jobs[0].key, key);
    assert_eq!(jobs[0].worker, "w2");
  }

  #[tokio::test]
  async fn complete_is_accepted_once() {
    let broker = InMemoryBroker::new();
    let key = broker.create_job(NewJob::new("payment", Variables::new())).unwrap();
    broker.activate_jobs(&request("payment", 1)).await.unwrap();

    let done = CompletionResult { job_key: key, variables: vars(json!({"x": 1})) };
    broker.complete_job(&done).await.unwrap();
    assert_eq!(broker.job_status(key), Some(JobStatus::Completed));
    assert_eq!(broker.complete_job(&done).await, Err(BrokerError::NotFound(key)));

    let failed = FailureResult { job_key: key, error_message: "late".into(), retries: 0 };
    assert_eq!(broker.fail_job(&failed).await, Err(BrokerError::NotFound(key)));
  }

  #[tokio::test]
  async fn failure_with_retries_left_reopens_the_job() {
    let broker = InMemoryBroker::new();
    let key = broker.create_job(NewJob::new("payment", Variables::new()).with_retries(2)).unwrap();
    broker.activate_jobs(&request("payment", 1)).await.unwrap();

    let failed = FailureResult { job_key: key, error_message: "bad input".into(), retries: 1 };
    broker.fail_job(&failed).await.unwrap();
    assert_eq!(broker.job_status(key), Some(JobStatus::Activatable));
    assert_eq!(broker.last_error(key).as_deref(), Some("bad input"));

    let jobs = broker.activate_jobs(&request("payment", 1)).await.unwrap();
    assert_eq!(jobs[0].retries, 1);

    let failed = FailureResult { job_key: key, error_message: "still bad".into(), retries: 0 };
    broker.fail_job(&failed).await.unwrap();
    assert_eq!(broker.job_status(key), Some(JobStatus::Failed));
  }

  #[tokio::test]
  async fn oversized_lease_is_capped() {
    let broker = InMemoryBroker::new();
    let key = broker.create_job(NewJob::new("payment", Variables::new())).unwrap();
    let mut huge = request("payment", 1);
    huge.lease_timeout = Duration::from_millis(1_000_000_000_000_000_000);
    huge.request_timeout = Duration::from_millis(1_000_000_000_000_000_000);

    let jobs = broker.activate_jobs(&huge).await.unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].key, key);
    assert!(jobs[0].deadline > Utc::now() + chrono::Duration::days(364));
    assert!(jobs[0].deadline <= Utc::now() + chrono::Duration::days(366));
    assert_eq!(broker.job_status(key), Some(JobStatus::Activated));
  }

  #[tokio::test]
  async fn invalid_request_is_rejected() {
    let broker = InMemoryBroker::new();
    let err = broker.activate_jobs(&request("payment", 0)).await.unwrap_err();
    assert!(matches!(err, BrokerError::Rejected(_)));
  }

  #[tokio::test]
  async fn publishes_lifecycle_events() {
    let broker = InMemoryBroker::new();
    let mut events = broker.subscribe();
    let key = broker.create_job(NewJob::new("payment", Variables::new())).unwrap();
    broker.activate_jobs(&request("payment", 1)).await.unwrap();
    broker
      .complete_job(&CompletionResult { job_key: key, variables: Variables::new() })
      .await
      .unwrap();

    let names: Vec<_> = [
      events.recv().await.unwrap(),
      events.recv().await.unwrap(),
      events.recv().await.unwrap(),
    ]
    .iter()
    .map(|e| e.name())
    .collect();
    assert_eq!(names, ["created", "activated", "completed"]);
  }
}
