use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{JoinError, JoinHandle};
use tracing::{Instrument, info_span};

use crate::broker::Broker;
use crate::error::BrokerError;
use crate::models::{Job, JobState};
use crate::reporter::{ActiveJob, CompletionReporter, FailureReporter, ReportPolicy};

pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// User code run for every activated job of a subscribed task type.
///
/// Returning `Ok(value)` completes the job with `value` as its variables (an
/// object is expected; anything else completes with no variables). Returning
/// an error fails the job with the error's message.
pub trait JobHandler: Send + Sync + 'static {
  fn handle(&self, job: Job) -> HandlerFuture;
}

impl<F, Fut> JobHandler for F
where
  F: Fn(Job) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
  fn handle(&self, job: Job) -> HandlerFuture {
    Box::pin(self(job))
  }
}

/// Wraps a synchronous handler so it runs on the blocking pool.
pub fn blocking<F>(handler: F) -> impl JobHandler
where
  F: Fn(Job) -> anyhow::Result<Value> + Send + Sync + 'static,
{
  let handler = Arc::new(handler);
  move |job: Job| {
    let handler = handler.clone();
    async move {
      tokio::task::spawn_blocking(move || handler(job))
        .await
        .map_err(|e| anyhow!(panic_message(e)))?
    }
  }
}

fn panic_message(err: JoinError) -> String {
  if !err.is_panic() {
    return format!("handler task aborted: {err}");
  }
  let payload: Box<dyn Any + Send> = err.into_panic();
  let detail = payload
    .downcast_ref::<&str>()
    .map(|s| s.to_string())
    .or_else(|| payload.downcast_ref::<String>().cloned())
    .unwrap_or_else(|| "unknown panic".to_string());
  format!("handler panicked: {detail}")
}

/// Runs one handler per activated job on its own task and reports the outcome.
pub struct JobDispatcher<B> {
  handler: Arc<dyn JobHandler>,
  completions: CompletionReporter<B>,
  failures: FailureReporter<B>,
  slots: Arc<Semaphore>,
  // cloned into every job task; the receiver sees the channel close once all of them are done
  in_flight: Option<mpsc::Sender<()>>,
}

impl<B> Clone for JobDispatcher<B> {
  fn clone(&self) -> Self {
    Self {
      handler: self.handler.clone(),
      completions: self.completions.clone(),
      failures: self.failures.clone(),
      slots: self.slots.clone(),
      in_flight: self.in_flight.clone(),
    }
  }
}

impl<B: Broker> JobDispatcher<B> {
  pub fn new(broker: Arc<B>, handler: Arc<dyn JobHandler>, slots: Arc<Semaphore>, policy: ReportPolicy) -> Self {
    Self {
      handler,
      completions: CompletionReporter::new(broker.clone(), policy),
      failures: FailureReporter::new(broker, policy),
      slots,
      in_flight: None,
    }
  }

  /// Ties every dispatched job to `tracker` so its receiver can wait for them.
  pub fn with_in_flight(mut self, tracker: mpsc::Sender<()>) -> Self {
    self.in_flight = Some(tracker);
    self
  }

  /// Handler slots currently free.
  pub fn available(&self) -> usize {
    self.slots.available_permits()
  }

  /// Spawns the handler for `job` without blocking the caller. The job takes a
  /// free slot right away or waits for one on its own task. The returned handle
  /// resolves once the job's single terminal report has been sent (or given up on).
  pub fn dispatch(&self, job: Job) -> JoinHandle<Result<JobState, BrokerError>> {
    let permit = self.slots.clone().try_acquire_owned().ok();
    let span = info_span!("job", job_key = job.key, task_type = %job.task_type);
    let this = self.clone();
    tokio::spawn(
      async move {
        let _permit = match permit {
          Some(permit) => Some(permit),
          // the semaphore is never closed, so this only waits for a free slot
          None => this.slots.clone().acquire_owned().await.ok(),
        };
        this.execute(job).await
      }
      .instrument(span),
    )
  }

  async fn execute(&self, job: Job) -> Result<JobState, BrokerError> {
    let active = ActiveJob::new(job);
    // run the handler on its own task so a panic surfaces as a JoinError
    let outcome = tokio::spawn(self.handler.handle(active.job().clone())).await;
    match outcome {
      Ok(Ok(output)) => self.completions.report(active, output).await,
      Ok(Err(err)) => self.failures.report(active, &err).await,
      Err(err) => self.failures.report_message(active, panic_message(err)).await,
    }
  }
}
