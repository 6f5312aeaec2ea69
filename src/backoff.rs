//! Retry policy for the poll loop.
//!
//! Polling is a small state machine: every failed `ActivateJobs` moves it to
//! `Backoff`, a successful one resets it, and a finite policy eventually
//! ends in `GaveUp`.

use std::time::Duration;

use tokio_retry::strategy::FixedInterval;

pub const DEFAULT_POLL_BACKOFF: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
  pub interval: Duration,
  /// Consecutive failures tolerated before giving up; `None` retries forever.
  pub max_attempts: Option<u32>,
}

impl Default for BackoffPolicy {
  fn default() -> Self {
    Self {
      interval: DEFAULT_POLL_BACKOFF,
      max_attempts: None,
    }
  }
}

impl BackoffPolicy {
  pub fn fixed(interval: Duration) -> Self {
    Self {
      interval,
      max_attempts: None,
    }
  }

  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = Some(max_attempts);
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
  Polling,
  Backoff { attempt: u32, delay: Duration },
  GaveUp { attempts: u32 },
}

pub struct RetryMachine {
  policy: BackoffPolicy,
  failures: u32,
  delays: FixedInterval,
  state: RetryState,
}

impl RetryMachine {
  pub fn new(policy: BackoffPolicy) -> Self {
    Self {
      policy,
      failures: 0,
      delays: FixedInterval::new(policy.interval),
      state: RetryState::Polling,
    }
  }

  pub fn state(&self) -> RetryState {
    self.state
  }

  pub fn on_success(&mut self) -> RetryState {
    self.failures = 0;
    self.delays = FixedInterval::new(self.policy.interval);
    self.state = RetryState::Polling;
    self.state
  }

  pub fn on_failure(&mut self) -> RetryState {
    self.failures += 1;
    self.state = match self.policy.max_attempts {
      Some(max) if self.failures >= max => RetryState::GaveUp { attempts: self.failures },
      _ => RetryState::Backoff {
        attempt: self.failures,
        delay: self.delays.next().unwrap_or(self.policy.interval),
      },
    };
    self.state
  }
}
