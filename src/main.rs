use std::sync::Arc;

use jobworker::{config::BrokerConfig, routes::routes, telemetry, InMemoryBroker};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  telemetry::init();
  let config = BrokerConfig::from_env()?;
  let broker = Arc::new(InMemoryBroker::new());

  info!("Broker gateway listening on port {}", config.server_port);
  warp::serve(routes(broker))
    .run(([0, 0, 0, 0], config.server_port))
    .await;
  Ok(())
}
