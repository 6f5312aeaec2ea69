use std::collections::HashMap;
use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ValidationError;

static TASK_TYPE: LazyLock<Regex> =
  LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_.:/\-]+$").expect("task type pattern is valid"));

pub type Variables = Map<String, Value>;

/// A unit of work handed out by the broker to exactly one worker at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
  pub key: i64,
  pub process_instance_key: i64,
  #[serde(rename = "type")]
  pub task_type: String,
  /// name of the worker which activated this job
  pub worker: String,
  /// retries the broker still allows for this job
  pub retries: u32,
  /// lease expiry; after this the broker may hand the job to someone else
  pub deadline: DateTime<Utc>,
  #[serde(default)]
  pub custom_headers: HashMap<String, String>,
  #[serde(default)]
  pub variables: Variables,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivationRequest {
  #[serde(rename = "type")]
  pub task_type: String,
  pub worker: String,
  #[serde(rename = "timeout_ms", with = "duration_ms")]
  pub lease_timeout: Duration,
  #[serde(rename = "request_timeout_ms", with = "duration_ms")]
  pub request_timeout: Duration,
  pub max_jobs: u32,
}

impl ActivationRequest {
  pub fn validate(&self) -> Result<(), ValidationError> {
    if self.task_type.trim().is_empty() {
      return Err(ValidationError::EmptyTaskType);
    }
    if self.worker.trim().is_empty() {
      return Err(ValidationError::EmptyWorkerName);
    }
    if self.lease_timeout.is_zero() {
      return Err(ValidationError::NotPositive("lease timeout"));
    }
    if self.request_timeout.is_zero() {
      return Err(ValidationError::NotPositive("request timeout"));
    }
    if self.max_jobs == 0 {
      return Err(ValidationError::NotPositive("max jobs"));
    }
    Ok(())
  }
}

/// Stricter check applied to task types of newly created jobs.
pub fn validate_task_type(task_type: &str) -> Result<(), ValidationError> {
  if task_type.is_empty() {
    return Err(ValidationError::EmptyTaskType);
  }
  if !TASK_TYPE.is_match(task_type) {
    return Err(ValidationError::InvalidTaskType(task_type.to_string()));
  }
  Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResult {
  pub job_key: i64,
  pub variables: Variables,
}

impl CompletionResult {
  /// Builds a completion from whatever the handler returned; non-object values complete with no variables.
  pub fn from_output(job_key: i64, output: Value) -> Self {
    let variables = match output {
      Value::Object(map) => map,
      _ => Map::new(),
    };
    Self { job_key, variables }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureResult {
  pub job_key: i64,
  pub error_message: String,
  pub retries: u32,
}

/// Wire body of a CompleteJob call; variables travel as a JSON document string.
#[derive(Debug, Serialize, Deserialize)]
pub struct CompleteJobBody {
  pub variables: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailJobBody {
  pub error_message: String,
  #[serde(default)]
  pub retries: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ActivateJobsResponse {
  pub jobs: Vec<Job>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
  Activated,
  Completed,
  Failed,
}

impl JobState {
  pub fn is_terminal(self) -> bool {
    !matches!(self, JobState::Activated)
  }

  /// Activated may move to Completed or Failed once; terminal states never move.
  pub fn transition(self, next: JobState) -> Option<JobState> {
    match (self, next) {
      (JobState::Activated, JobState::Completed) | (JobState::Activated, JobState::Failed) => Some(next),
      _ => None,
    }
  }
}

mod duration_ms {
  use std::time::Duration;

  use serde::{Deserialize, Deserializer, Serializer};

  pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(value.as_millis() as u64)
  }

  pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    u64::deserialize(deserializer).map(Duration::from_millis)
  }
}
