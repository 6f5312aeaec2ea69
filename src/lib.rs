pub mod backoff;
pub mod broker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod models;
pub mod poller;
pub mod reporter;
pub mod routes;
pub mod telemetry;
pub mod worker;

pub use broker::{Broker, HttpBroker, InMemoryBroker};
pub use dispatcher::{JobHandler, blocking};
pub use models::{ActivationRequest, CompletionResult, FailureResult, Job, JobState};
pub use worker::{Worker, WorkerHandle};
