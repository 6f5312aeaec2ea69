use thiserror::Error;

/// Failures talking to a job broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
  /// The broker could not be reached or did not answer in time.
  #[error("broker transport error: {0}")]
  Transport(String),

  #[error("job {0} not found or no longer activated")]
  NotFound(i64),

  #[error("broker rejected request: {0}")]
  Rejected(String),
}

impl BrokerError {
  /// Only transport failures are worth retrying; everything else is a broker decision.
  pub fn is_transient(&self) -> bool {
    matches!(self, BrokerError::Transport(_))
  }
}

impl From<reqwest::Error> for BrokerError {
  fn from(err: reqwest::Error) -> Self {
    BrokerError::Transport(err.to_string())
  }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
  #[error("task type must not be empty")]
  EmptyTaskType,

  #[error("invalid task type '{0}'")]
  InvalidTaskType(String),

  #[error("worker name must not be empty")]
  EmptyWorkerName,

  #[error("{0} must be positive")]
  NotPositive(&'static str),

  #[error("{0} is too large")]
  TooLarge(&'static str),

  #[error("worker has no subscriptions")]
  NoSubscriptions,

  #[error("task type '{0}' is already subscribed")]
  DuplicateSubscription(String),
}

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("missing environment variable {0}")]
  Missing(&'static str),

  #[error("invalid value '{value}' for {key}")]
  Invalid { key: &'static str, value: String },

  #[error(transparent)]
  Validation(#[from] ValidationError),
}
