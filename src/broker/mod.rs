//! Client side of the job broker protocol.
//!
//! A broker hands out jobs (`ActivateJobs`) and records their outcome
//! (`CompleteJob` / `FailJob`). The worker only ever talks to it through the
//! [`Broker`] trait; the handle is built once and shared behind an `Arc`.

use std::future::Future;

use crate::error::BrokerError;
use crate::models::{ActivationRequest, CompletionResult, FailureResult, Job};

pub mod http;
pub mod memory;

pub use http::HttpBroker;
pub use memory::{InMemoryBroker, JobEvent, JobStatus, NewJob};

pub trait Broker: Send + Sync + 'static {
  /// Long-polls for up to `request.max_jobs` jobs; an empty batch is a normal answer.
  fn activate_jobs(
    &self,
    request: &ActivationRequest,
  ) -> impl Future<Output = Result<Vec<Job>, BrokerError>> + Send;

  fn complete_job(&self, result: &CompletionResult) -> impl Future<Output = Result<(), BrokerError>> + Send;

  fn fail_job(&self, result: &FailureResult) -> impl Future<Output = Result<(), BrokerError>> + Send;
}
