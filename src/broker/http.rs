use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use tracing::debug;

use super::Broker;
use crate::error::BrokerError;
use crate::models::{
  ActivateJobsResponse, ActivationRequest, CompleteJobBody, CompletionResult, FailJobBody, FailureResult, Job,
};

/// Extra time on top of the long-poll window before the client gives up on the broker.
const REQUEST_MARGIN: Duration = Duration::from_secs(5);
const REPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// Broker client speaking the JSON gateway protocol served by `routes`.
#[derive(Debug, Clone)]
pub struct HttpBroker {
  client: Client,
  base_url: String,
}

impl HttpBroker {
  pub fn new(base_url: impl Into<String>) -> Result<Self, BrokerError> {
    let client = Client::builder().timeout(REPORT_TIMEOUT).build()?;
    Ok(Self::with_client(client, base_url))
  }

  pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
    Self {
      client,
      base_url: base_url.into().trim_end_matches('/').to_string(),
    }
  }

  fn url(&self, path: &str) -> String {
    format!("{}{}", self.base_url, path)
  }
}

async fn check(response: Response, job_key: Option<i64>) -> Result<Response, BrokerError> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  let body = response.text().await.unwrap_or_default();
  match (status, job_key) {
    (StatusCode::NOT_FOUND, Some(key)) => Err(BrokerError::NotFound(key)),
    (StatusCode::BAD_REQUEST | StatusCode::CONFLICT, _) => Err(BrokerError::Rejected(body)),
    _ => Err(BrokerError::Transport(format!("unexpected status {status}: {body}"))),
  }
}

impl Broker for HttpBroker {
  async fn activate_jobs(&self, request: &ActivationRequest) -> Result<Vec<Job>, BrokerError> {
    let response = self
      .client
      .post(self.url("/jobs/activate"))
      .timeout(request.request_timeout + REQUEST_MARGIN)
      .json(request)
      .send()
      .await?;
    let batch: ActivateJobsResponse = check(response, None).await?.json().await?;
    debug!(task_type = %request.task_type, count = batch.jobs.len(), "activated jobs");
    Ok(batch.jobs)
  }

  async fn complete_job(&self, result: &CompletionResult) -> Result<(), BrokerError> {
    let body = CompleteJobBody {
      variables: serde_json::to_string(&result.variables).map_err(|e| BrokerError::Rejected(e.to_string()))?,
    };
    let response = self
      .client
      .post(self.url(&format!("/jobs/{}/complete", result.job_key)))
      .json(&body)
      .send()
      .await?;
    check(response, Some(result.job_key)).await?;
    Ok(())
  }

  async fn fail_job(&self, result: &FailureResult) -> Result<(), BrokerError> {
    let body = FailJobBody {
      error_message: result.error_message.clone(),
      retries: result.retries,
    };
    let response = self
      .client
      .post(self.url(&format!("/jobs/{}/fail", result.job_key)))
      .json(&body)
      .send()
      .await?;
    check(response, Some(result.job_key)).await?;
    Ok(())
  }
}
