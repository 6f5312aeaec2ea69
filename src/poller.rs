use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::backoff::{BackoffPolicy, RetryMachine, RetryState};
use crate::broker::Broker;
use crate::dispatcher::JobDispatcher;
use crate::models::ActivationRequest;

pub const DEFAULT_IDLE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerExit {
  Shutdown,
  GaveUp { attempts: u32 },
}

/// Long-polls the broker for one task type and hands every job to the dispatcher.
pub struct JobPoller<B> {
  broker: Arc<B>,
  request: ActivationRequest,
  dispatcher: JobDispatcher<B>,
  backoff: BackoffPolicy,
  idle_interval: Duration,
  shutdown: watch::Receiver<bool>,
}

/// Resolves once shutdown was requested or the controlling handle is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
  let _ = shutdown.wait_for(|stop| *stop).await;
}

fn stopping(shutdown: &watch::Receiver<bool>) -> bool {
  *shutdown.borrow() || shutdown.has_changed().is_err()
}

impl<B: Broker> JobPoller<B> {
  pub fn new(
    broker: Arc<B>,
    request: ActivationRequest,
    dispatcher: JobDispatcher<B>,
    shutdown: watch::Receiver<bool>,
  ) -> Self {
    Self {
      broker,
      request,
      dispatcher,
      backoff: BackoffPolicy::default(),
      idle_interval: DEFAULT_IDLE_INTERVAL,
      shutdown,
    }
  }

  pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
    self.backoff = backoff;
    self
  }

  pub fn with_idle_interval(mut self, idle_interval: Duration) -> Self {
    self.idle_interval = idle_interval;
    self
  }

  pub fn request(&self) -> &ActivationRequest {
    &self.request
  }

  pub async fn run(self) -> PollerExit {
    let JobPoller {
      broker,
      request,
      dispatcher,
      backoff,
      idle_interval,
      mut shutdown,
    } = self;
    let mut retry = RetryMachine::new(backoff);
    info!(task_type = %request.task_type, worker = %request.worker, "poller started");

    loop {
      let free = dispatcher.available();
      if free == 0 {
        tokio::select! {
          _ = shutdown_requested(&mut shutdown) => break,
          _ = sleep(idle_interval) => continue,
        }
      }

      let mut batch_request = request.clone();
      batch_request.max_jobs = request.max_jobs.min(u32::try_from(free).unwrap_or(u32::MAX));

      // an in-flight poll is never abandoned: the broker may already have leased its jobs
      match broker.activate_jobs(&batch_request).await {
        Ok(jobs) => {
          retry.on_success();
          if !jobs.is_empty() {
            debug!(task_type = %request.task_type, count = jobs.len(), "dispatching jobs");
          }
          for job in jobs {
            // completion is tracked by the job's own task
            drop(dispatcher.dispatch(job));
          }
        }
        Err(err) => {
          if stopping(&shutdown) {
            break;
          }
          match retry.on_failure() {
            RetryState::Backoff { attempt, delay } => {
              error!(task_type = %request.task_type, attempt, error = %err, "failed to activate jobs, retrying in {:?}", delay);
              tokio::select! {
                _ = shutdown_requested(&mut shutdown) => break,
                _ = sleep(delay) => {}
              }
            }
            RetryState::GaveUp { attempts } => {
              error!(task_type = %request.task_type, attempts, error = %err, "failed to activate jobs, giving up");
              return PollerExit::GaveUp { attempts };
            }
            RetryState::Polling => {}
          }
        }
      }

      if stopping(&shutdown) {
        break;
      }
    }

    info!(task_type = %request.task_type, "poller stopped");
    PollerExit::Shutdown
  }
}
