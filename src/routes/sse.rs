use std::convert::Infallible;
use std::sync::Arc;

use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::warn;
use warp::Filter;

use super::with_broker;
use crate::broker::InMemoryBroker;

/// `GET /jobs/{key}/events`: server-sent events for one job's state changes.
pub fn sse_route(broker: Arc<InMemoryBroker>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("jobs" / i64 / "events")
    .and(warp::get())
    .and(with_broker(broker))
    .and_then(handle_sse)
}

async fn handle_sse(key: i64, broker: Arc<InMemoryBroker>) -> Result<impl warp::Reply, Infallible> {
  let stream = BroadcastStream::new(broker.subscribe()).filter_map(move |event| match event {
    Ok(event) if event.key() == key => match serde_json::to_string(&event) {
      Ok(data) => Some(Ok::<_, Infallible>(warp::sse::Event::default().event(event.name()).data(data))),
      Err(e) => {
        warn!("Failed to encode event for job {}: {:?}", key, e);
        None
      }
    },
    Ok(_) => None,
    Err(e) => {
      warn!("Event stream for job {} lagged: {:?}", key, e);
      None
    }
  });

  Ok(warp::sse::reply(warp::sse::keep_alive().stream(stream)))
}
