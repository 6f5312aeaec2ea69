use std::convert::Infallible;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};
use warp::http::StatusCode;
use warp::{Filter, Reply};

use super::with_broker;
use crate::broker::{Broker, InMemoryBroker, JobStatus, NewJob};
use crate::error::BrokerError;
use crate::models::{
  ActivateJobsResponse, ActivationRequest, CompleteJobBody, CompletionResult, FailJobBody, FailureResult, Variables,
};

const MAX_BODY: u64 = 1024 * 1024;

#[derive(Serialize, Deserialize)]
pub struct CreatedJob {
  pub key: i64,
}

#[derive(Serialize)]
pub struct JobStatusResponse {
  pub key: i64,
  pub status: JobStatus,
  pub last_error: Option<String>,
}

pub fn job_routes(
  broker: Arc<InMemoryBroker>
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  create_route(broker.clone())
    .or(activate_route(broker.clone()))
    .or(complete_route(broker.clone()))
    .or(fail_route(broker.clone()))
    .or(status_route(broker))
}

fn create_route(broker: Arc<InMemoryBroker>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("jobs")
    .and(warp::post())
    .and(warp::body::content_length_limit(MAX_BODY))
    .and(warp::body::json())
    .and(with_broker(broker))
    .and_then(handle_create)
}

fn activate_route(broker: Arc<InMemoryBroker>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("jobs" / "activate")
    .and(warp::post())
    .and(warp::body::content_length_limit(MAX_BODY))
    .and(warp::body::json())
    .and(with_broker(broker))
    .and_then(handle_activate)
}

fn complete_route(broker: Arc<InMemoryBroker>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("jobs" / i64 / "complete")
    .and(warp::post())
    .and(warp::body::content_length_limit(MAX_BODY))
    .and(warp::body::json())
    .and(with_broker(broker))
    .and_then(handle_complete)
}

fn fail_route(broker: Arc<InMemoryBroker>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("jobs" / i64 / "fail")
    .and(warp::post())
    .and(warp::body::content_length_limit(MAX_BODY))
    .and(warp::body::json())
    .and(with_broker(broker))
    .and_then(handle_fail)
}

fn status_route(broker: Arc<InMemoryBroker>) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
  warp::path!("jobs" / i64)
    .and(warp::get())
    .and(with_broker(broker))
    .and_then(handle_status)
}

fn error_reply(err: BrokerError) -> warp::reply::Response {
  let status = match &err {
    BrokerError::NotFound(_) => StatusCode::NOT_FOUND,
    BrokerError::Rejected(_) => StatusCode::BAD_REQUEST,
    BrokerError::Transport(_) => StatusCode::SERVICE_UNAVAILABLE,
  };
  warn!("Request failed: {}", err);
  warp::reply::with_status(warp::reply::json(&json!({ "error": err.to_string() })), status).into_response()
}

async fn handle_create(new_job: NewJob, broker: Arc<InMemoryBroker>) -> Result<warp::reply::Response, Infallible> {
  match broker.create_job(new_job) {
    Ok(key) => Ok(warp::reply::with_status(warp::reply::json(&CreatedJob { key }), StatusCode::CREATED).into_response()),
    Err(e) => Ok(error_reply(BrokerError::Rejected(e.to_string()))),
  }
}

async fn handle_activate(
  request: ActivationRequest,
  broker: Arc<InMemoryBroker>,
) -> Result<warp::reply::Response, Infallible> {
  match broker.activate_jobs(&request).await {
    Ok(jobs) => {
      if !jobs.is_empty() {
        info!("Worker {} activated {} {} job(s)", request.worker, jobs.len(), request.task_type);
      }
      Ok(warp::reply::json(&ActivateJobsResponse { jobs }).into_response())
    }
    Err(e) => Ok(error_reply(e)),
  }
}

async fn handle_complete(
  key: i64,
  body: CompleteJobBody,
  broker: Arc<InMemoryBroker>,
) -> Result<warp::reply::Response, Infallible> {
  let variables = if body.variables.trim().is_empty() {
    Variables::new()
  } else {
    match serde_json::from_str::<Variables>(&body.variables) {
      Ok(variables) => variables,
      Err(e) => return Ok(error_reply(BrokerError::Rejected(format!("variables must be a JSON object: {e}")))),
    }
  };
  match broker.complete_job(&CompletionResult { job_key: key, variables }).await {
    Ok(()) => Ok(StatusCode::NO_CONTENT.into_response()),
    Err(e) => Ok(error_reply(e)),
  }
}

async fn handle_fail(key: i64, body: FailJobBody, broker: Arc<InMemoryBroker>) -> Result<warp::reply::Response, Infallible> {
  let result = FailureResult {
    job_key: key,
    error_message: body.error_message,
    retries: body.retries,
  };
  match broker.fail_job(&result).await {
    Ok(()) => Ok(StatusCode::NO_CONTENT.into_response()),
    Err(e) => Ok(error_reply(e)),
  }
}

async fn handle_status(key: i64, broker: Arc<InMemoryBroker>) -> Result<warp::reply::Response, Infallible> {
  match broker.job_status(key) {
    Some(status) => Ok(
      warp::reply::json(&JobStatusResponse {
        key,
        status,
        last_error: broker.last_error(key),
      })
      .into_response(),
    ),
    None => Ok(error_reply(BrokerError::NotFound(key))),
  }
}
