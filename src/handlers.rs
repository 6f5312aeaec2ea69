//! Built-in handlers for the `jobworker` binary, resolved by task type at startup.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow, bail};
use serde_json::{Value, json};
use tokio::time::sleep;
use tracing::info;

use crate::dispatcher::JobHandler;
use crate::models::Job;

/// Completes with the job's own variables.
pub async fn echo(job: Job) -> Result<Value> {
  info!("Echoing job {}", job.key);
  Ok(Value::Object(job.variables))
}

/// Sleeps for `delay_ms` milliseconds, then completes.
pub async fn delay(job: Job) -> Result<Value> {
  let delay_ms = job
    .variables
    .get("delay_ms")
    .and_then(|v| v.as_u64())
    .ok_or(anyhow!("Missing delay_ms in delay job {}", job.key))?;
  info!("Delaying job {} for {}ms", job.key, delay_ms);
  sleep(Duration::from_millis(delay_ms)).await;
  Ok(json!({ "delayed_ms": delay_ms }))
}

/// Always fails, with `reason` as the message when given.
pub async fn fail(job: Job) -> Result<Value> {
  let reason = job.variables.get("reason").and_then(|v| v.as_str()).unwrap_or("failure requested");
  bail!("{} (job {})", reason, job.key)
}

pub fn builtin(task_type: &str) -> Option<Arc<dyn JobHandler>> {
  match task_type {
    "echo" => Some(Arc::new(echo)),
    "delay" => Some(Arc::new(delay)),
    "fail" => Some(Arc::new(fail)),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::broker::scripted::job;

  fn with_vars(key: i64, vars: Value) -> Job {
    let mut job = job(key, "test");
    job.variables = vars.as_object().cloned().unwrap_or_default();
    job
  }

  #[tokio::test]
  async fn echo_returns_variables() {
    let out = echo(with_vars(1, json!({"a": "b"}))).await.unwrap();
    assert_eq!(out, json!({"a": "b"}));
  }

  #[tokio::test(start_paused = true)]
  async fn delay_requires_delay_ms() {
    assert_eq!(delay(with_vars(2, json!({"delay_ms": 1500}))).await.unwrap(), json!({"delayed_ms": 1500}));
    let err = delay(with_vars(3, json!({}))).await.unwrap_err();
    assert!(err.to_string().contains("Missing delay_ms"));
  }

  #[tokio::test]
  async fn fail_uses_reason() {
    let err = fail(with_vars(4, json!({"reason": "bad input"}))).await.unwrap_err();
    assert_eq!(err.to_string(), "bad input (job 4)");
  }

  #[test]
  fn resolves_known_types_only() {
    assert!(builtin("echo").is_some());
    assert!(builtin("delay").is_some());
    assert!(builtin("fail").is_some());
    assert!(builtin("email").is_none());
  }
}
