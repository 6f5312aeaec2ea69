//! Terminal job reports: `CompleteJob` on success, `FailJob` on handler error.
//!
//! An [`ActiveJob`] is consumed by whichever report is sent, so a job can
//! reach exactly one terminal state on this worker. Submissions that fail on
//! the transport are retried per [`ReportPolicy`]; answers from the broker
//! itself (unknown job, rejected) are final.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_retry::RetryIf;
use tokio_retry::strategy::ExponentialBackoff;
use tracing::{debug, error, warn};

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::models::{CompletionResult, FailureResult, Job, JobState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportPolicy {
  /// Extra attempts after the first one; 0 sends each report at most once.
  pub max_retries: usize,
  pub max_delay: Duration,
}

impl Default for ReportPolicy {
  fn default() -> Self {
    Self {
      max_retries: 5,
      max_delay: Duration::from_secs(5),
    }
  }
}

impl ReportPolicy {
  pub fn none() -> Self {
    Self {
      max_retries: 0,
      ..Self::default()
    }
  }

  pub fn with_max_retries(mut self, max_retries: usize) -> Self {
    self.max_retries = max_retries;
    self
  }

  /// 100ms, 200ms, 400ms, ... capped at `max_delay`.
  fn strategy(&self) -> impl Iterator<Item = Duration> + use<> {
    ExponentialBackoff::from_millis(2)
      .factor(50)
      .max_delay(self.max_delay)
      .take(self.max_retries)
  }
}

/// A job this worker activated and has not reported yet.
#[derive(Debug)]
pub struct ActiveJob {
  job: Job,
  state: JobState,
}

impl ActiveJob {
  pub fn new(job: Job) -> Self {
    Self {
      job,
      state: JobState::Activated,
    }
  }

  pub fn job(&self) -> &Job {
    &self.job
  }

  pub fn key(&self) -> i64 {
    self.job.key
  }

  fn finish(self, next: JobState) -> JobState {
    self.state.transition(next).unwrap_or(self.state)
  }
}

async fn submit<F, Fut>(policy: &ReportPolicy, job_key: i64, report: &'static str, action: F) -> Result<(), BrokerError>
where
  F: FnMut() -> Fut,
  Fut: Future<Output = Result<(), BrokerError>>,
{
  RetryIf::start(policy.strategy(), action, |err: &BrokerError| {
    let transient = err.is_transient();
    if transient {
      warn!(job_key, report, error = %err, "report submission failed");
    }
    transient
  })
  .await
}

pub struct CompletionReporter<B> {
  broker: Arc<B>,
  policy: ReportPolicy,
}

impl<B> Clone for CompletionReporter<B> {
  fn clone(&self) -> Self {
    Self {
      broker: self.broker.clone(),
      policy: self.policy,
    }
  }
}

impl<B: Broker> CompletionReporter<B> {
  pub fn new(broker: Arc<B>, policy: ReportPolicy) -> Self {
    Self { broker, policy }
  }

  pub async fn report(&self, active: ActiveJob, output: Value) -> Result<JobState, BrokerError> {
    let result = CompletionResult::from_output(active.key(), output);
    let (broker, sent) = (&self.broker, &result);
    if let Err(err) = submit(&self.policy, result.job_key, "complete", move || broker.complete_job(sent)).await {
      error!(job_key = result.job_key, error = %err, "could not report job completion, broker does not know the outcome");
      return Err(err);
    }
    debug!(job_key = result.job_key, "job completed");
    Ok(active.finish(JobState::Completed))
  }
}

pub struct FailureReporter<B> {
  broker: Arc<B>,
  policy: ReportPolicy,
}

impl<B> Clone for FailureReporter<B> {
  fn clone(&self) -> Self {
    Self {
      broker: self.broker.clone(),
      policy: self.policy,
    }
  }
}

impl<B: Broker> FailureReporter<B> {
  pub fn new(broker: Arc<B>, policy: ReportPolicy) -> Self {
    Self { broker, policy }
  }

  /// Reports a handler error, keeping its whole context chain in the message.
  pub async fn report(&self, active: ActiveJob, err: &anyhow::Error) -> Result<JobState, BrokerError> {
    self.report_message(active, format!("{err:#}")).await
  }

  pub async fn report_message(&self, active: ActiveJob, message: String) -> Result<JobState, BrokerError> {
    let job = active.job();
    error!(job_key = job.key, task_type = %job.task_type, error = %message, "job handler failed");
    let result = FailureResult {
      job_key: job.key,
      error_message: message,
      retries: job.retries.saturating_sub(1),
    };
    let (broker, sent) = (&self.broker, &result);
    if let Err(err) = submit(&self.policy, result.job_key, "fail", move || broker.fail_job(sent)).await {
      error!(job_key = result.job_key, error = %err, "could not report job failure, broker does not know the outcome");
      return Err(err);
    }
    Ok(active.finish(JobState::Failed))
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::broker::scripted::{ScriptedBroker, job};

  fn fast_policy(max_retries: usize) -> ReportPolicy {
    ReportPolicy {
      max_retries,
      max_delay: Duration::from_millis(10),
    }
  }

  #[tokio::test]
  async fn completion_sends_handler_output() {
    let broker = Arc::new(ScriptedBroker::default());
    let reporter = CompletionReporter::new(broker.clone(), ReportPolicy::none());

    let state = reporter.report(ActiveJob::new(job(42, "payment")), json!({"x": 1})).await;
    assert_eq!(state, Ok(JobState::Completed));
    broker.calls(|c| {
      assert_eq!(c.completions.len(), 1);
      assert_eq!(c.completions[0].job_key, 42);
      assert_eq!(Value::Object(c.completions[0].variables.clone()), json!({"x": 1}));
    });
  }

  #[tokio::test]
  async fn failure_carries_message_and_decrements_retries() {
    let broker = Arc::new(ScriptedBroker::default());
    let reporter = FailureReporter::new(broker.clone(), ReportPolicy::none());
    let err = anyhow::anyhow!("bad input").context("validating order");

    let state = reporter.report(ActiveJob::new(job(43, "payment")), &err).await;
    assert_eq!(state, Ok(JobState::Failed));
    broker.calls(|c| {
      assert_eq!(c.failures.len(), 1);
      assert_eq!(c.failures[0].job_key, 43);
      assert!(c.failures[0].error_message.contains("bad input"));
      assert!(c.failures[0].error_message.contains("validating order"));
      assert_eq!(c.failures[0].retries, 2);
    });
  }

  #[tokio::test(start_paused = true)]
  async fn transport_errors_are_retried() {
    let broker = Arc::new(ScriptedBroker::default().with_report_errors(vec![
      BrokerError::Transport("connection reset".into()),
      BrokerError::Transport("connection reset".into()),
    ]));
    let reporter = CompletionReporter::new(broker.clone(), fast_policy(3));

    let state = reporter.report(ActiveJob::new(job(1, "payment")), json!({})).await;
    assert_eq!(state, Ok(JobState::Completed));
    broker.calls(|c| {
      assert_eq!(c.complete_attempts, 3);
      assert_eq!(c.completions.len(), 1);
    });
  }

  #[tokio::test(start_paused = true)]
  async fn failure_reports_are_retried_on_transport_errors() {
    let broker = Arc::new(
      ScriptedBroker::default().with_report_errors(vec![BrokerError::Transport("connection reset".into())]),
    );
    let reporter = FailureReporter::new(broker.clone(), fast_policy(2));

    let state = reporter.report_message(ActiveJob::new(job(2, "payment")), "bad input".into()).await;
    assert_eq!(state, Ok(JobState::Failed));
    broker.calls(|c| {
      assert_eq!(c.fail_attempts, 2);
      assert_eq!(c.failures.len(), 1);
      assert_eq!(c.failures[0].error_message, "bad input");
    });
  }

  #[tokio::test(start_paused = true)]
  async fn failure_report_gives_up_after_its_retries() {
    let broker = Arc::new(ScriptedBroker::default().with_report_errors(vec![
      BrokerError::Transport("down".into()),
      BrokerError::Transport("down".into()),
      BrokerError::Transport("down".into()),
    ]));
    let reporter = FailureReporter::new(broker.clone(), fast_policy(2));

    let state = reporter.report_message(ActiveJob::new(job(3, "payment")), "bad input".into()).await;
    assert_eq!(state, Err(BrokerError::Transport("down".into())));
    broker.calls(|c| {
      assert_eq!(c.fail_attempts, 3);
      assert!(c.failures.is_empty());
    });
  }

  #[tokio::test]
  async fn broker_decisions_are_not_retried() {
    let broker = Arc::new(ScriptedBroker::default().with_report_errors(vec![BrokerError::NotFound(5)]));
    let reporter = CompletionReporter::new(broker.clone(), fast_policy(3));

    let state = reporter.report(ActiveJob::new(job(5, "payment")), json!({})).await;
    assert_eq!(state, Err(BrokerError::NotFound(5)));
    broker.calls(|c| {
      assert_eq!(c.complete_attempts, 1);
      assert!(c.completions.is_empty());
    });
  }

  #[tokio::test]
  async fn at_most_once_policy_gives_up_after_one_attempt() {
    let broker = Arc::new(
      ScriptedBroker::default().with_report_errors(vec![BrokerError::Transport("down".into())]),
    );
    let reporter = CompletionReporter::new(broker.clone(), ReportPolicy::none());

    let state = reporter.report(ActiveJob::new(job(6, "payment")), json!({})).await;
    assert!(matches!(state, Err(BrokerError::Transport(_))));
    broker.calls(|c| assert_eq!(c.complete_attempts, 1));
  }
}
