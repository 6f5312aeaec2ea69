//! A worker: one long-lived poller per subscribed task type, sharing a
//! broker handle and a pool of handler slots.

use std::collections::HashSet;
use std::sync::Arc;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::broker::Broker;
use crate::config::WorkerSettings;
use crate::dispatcher::{JobDispatcher, JobHandler};
use crate::error::ValidationError;
use crate::models::ActivationRequest;
use crate::poller::{JobPoller, PollerExit};

struct Subscription {
  request: ActivationRequest,
  handler: Arc<dyn JobHandler>,
}

pub struct WorkerBuilder<B> {
  broker: Arc<B>,
  settings: WorkerSettings,
  handlers: Vec<(String, Arc<dyn JobHandler>)>,
}

impl<B: Broker> WorkerBuilder<B> {
  pub fn subscribe(self, task_type: impl Into<String>, handler: impl JobHandler) -> Self {
    self.subscribe_shared(task_type, Arc::new(handler))
  }

  pub fn subscribe_shared(mut self, task_type: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
    self.handlers.push((task_type.into(), handler));
    self
  }

  /// Resolves every task type to its handler and validates the activation requests.
  pub fn build(self) -> Result<Worker<B>, ValidationError> {
    self.settings.validate()?;
    if self.handlers.is_empty() {
      return Err(ValidationError::NoSubscriptions);
    }

    let mut seen = HashSet::new();
    let mut subscriptions = Vec::with_capacity(self.handlers.len());
    for (task_type, handler) in self.handlers {
      if !seen.insert(task_type.clone()) {
        return Err(ValidationError::DuplicateSubscription(task_type));
      }
      let request = self.settings.activation_request(&task_type);
      request.validate()?;
      subscriptions.push(Subscription { request, handler });
    }

    Ok(Worker {
      broker: self.broker,
      settings: self.settings,
      subscriptions,
    })
  }
}

pub struct Worker<B> {
  broker: Arc<B>,
  settings: WorkerSettings,
  subscriptions: Vec<Subscription>,
}

impl<B: Broker> Worker<B> {
  pub fn builder(broker: Arc<B>, settings: WorkerSettings) -> WorkerBuilder<B> {
    WorkerBuilder {
      broker,
      settings,
      handlers: Vec::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.settings.worker_name
  }

  /// Spawns one poller task per subscription. Must be called inside a tokio runtime.
  pub fn start(self) -> WorkerHandle {
    let (shutdown, stop_rx) = watch::channel(false);
    let slots = Arc::new(Semaphore::new(self.settings.max_concurrent));
    let (tracker, in_flight) = mpsc::channel(1);
    let mut pollers = Vec::with_capacity(self.subscriptions.len());

    for subscription in self.subscriptions {
      let task_type = subscription.request.task_type.clone();
      let dispatcher = JobDispatcher::new(
        self.broker.clone(),
        subscription.handler,
        slots.clone(),
        self.settings.report_policy,
      )
      .with_in_flight(tracker.clone());
      let poller = JobPoller::new(self.broker.clone(), subscription.request, dispatcher, stop_rx.clone())
        .with_backoff(self.settings.poll_backoff)
        .with_idle_interval(self.settings.idle_interval);
      info!(worker = %self.settings.worker_name, task_type = %task_type, "subscribed");
      pollers.push((task_type, tokio::spawn(poller.run())));
    }

    WorkerHandle {
      shutdown,
      pollers,
      in_flight,
    }
  }
}

/// Controls the pollers of a running worker. In-flight handlers are never cancelled.
pub struct WorkerHandle {
  shutdown: watch::Sender<bool>,
  pollers: Vec<(String, JoinHandle<PollerExit>)>,
  in_flight: mpsc::Receiver<()>,
}

impl WorkerHandle {
  pub fn task_types(&self) -> impl Iterator<Item = &str> {
    self.pollers.iter().map(|(task_type, _)| task_type.as_str())
  }

  /// Stops polling, then waits for every poller to exit and every in-flight
  /// job to be reported.
  pub async fn shutdown(self) -> Vec<(String, PollerExit)> {
    let _ = self.shutdown.send(true);
    self.join().await
  }

  /// Waits for every poller to exit on its own (only finite backoff policies
  /// do), then for the jobs they dispatched.
  pub async fn join(self) -> Vec<(String, PollerExit)> {
    let WorkerHandle {
      shutdown,
      pollers,
      mut in_flight,
    } = self;
    let mut exits = Vec::with_capacity(pollers.len());
    for (task_type, handle) in pollers {
      match handle.await {
        Ok(exit) => exits.push((task_type, exit)),
        Err(e) => error!(task_type = %task_type, error = %e, "poller task died"),
      }
    }

    debug!("pollers stopped, waiting for in-flight jobs");
    // nothing is ever sent; the channel closes once the last job task has reported
    while in_flight.recv().await.is_some() {}
    drop(shutdown);
    exits
  }
}
