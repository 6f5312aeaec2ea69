use std::sync::Arc;

use anyhow::{Context, anyhow};
use jobworker::{config::WorkerConfig, handlers, telemetry, HttpBroker, Worker};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  telemetry::init();
  let config = WorkerConfig::from_env()?;
  let broker = Arc::new(HttpBroker::new(&config.broker_url)?);

  let mut builder = Worker::builder(broker, config.settings);
  for task_type in &config.job_types {
    let handler = handlers::builtin(task_type).ok_or_else(|| anyhow!("Unknown task type: {}", task_type))?;
    builder = builder.subscribe_shared(task_type.as_str(), handler);
  }
  let worker = builder.build()?;
  info!("Worker {} polling {} at {}", worker.name(), config.job_types.join(", "), config.broker_url);
  let handle = worker.start();

  tokio::signal::ctrl_c().await.context("Failed to listen for ctrl-c")?;
  info!("Shutting down, waiting for pollers and in-flight jobs");
  for (task_type, exit) in handle.shutdown().await {
    info!("Poller for {} exited: {:?}", task_type, exit);
  }
  Ok(())
}
