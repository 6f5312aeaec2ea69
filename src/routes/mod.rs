use std::sync::Arc;

use warp::Filter;

use crate::broker::InMemoryBroker;

pub mod jobs;
pub mod sse;

pub fn routes(
  broker: Arc<InMemoryBroker>
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  jobs::job_routes(broker.clone())
    .or(sse::sse_route(broker))
}

fn with_broker(broker: Arc<InMemoryBroker>) -> impl Filter<Extract = (Arc<InMemoryBroker>,), Error = std::convert::Infallible> + Clone {
  warp::any().map(move || broker.clone())
}
