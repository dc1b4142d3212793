//! Error taxonomy shared by the cache and the HTTP layer.

use std::time::Duration;

/// A classified failure of a fetch or mutation.
///
/// Errors are `Clone` because a single in-flight fetch may be awaited by
/// many consumers, each of which receives its own copy of the outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
  /// No response was received (connection refused, DNS, reset, ...).
  #[error("network error: {0}")]
  Network(String),
  /// The server responded with a status of 400 or above.
  #[error("HTTP {status}: {body}")]
  Http { status: u16, body: String },
  /// The request did not complete within the configured ceiling.
  #[error("request timed out after {0:?}")]
  Timeout(Duration),
  /// Caller-supplied input was rejected before any network call.
  #[error("invalid input: {0}")]
  Validation(String),
  /// The response body did not have any of the accepted shapes.
  #[error("failed to decode response: {0}")]
  Decode(String),
  /// The consumer stopped waiting for the result.
  #[error("request cancelled")]
  Cancelled,
  /// The task running the fetch panicked or was aborted.
  #[error("fetch task aborted: {0}")]
  Aborted(String),
}

impl FetchError {
  /// Build a validation error.
  pub fn validation(message: impl Into<String>) -> Self {
    Self::Validation(message.into())
  }

  /// HTTP status code, if the server responded.
  pub fn status(&self) -> Option<u16> {
    match self {
      Self::Http { status, .. } => Some(*status),
      _ => None,
    }
  }

  /// Whether retrying the same request may succeed.
  ///
  /// Network failures, timeouts and server errors are transient; client
  /// errors (including 401 and 404) and local failures are not.
  pub fn is_transient(&self) -> bool {
    match self {
      Self::Network(_) | Self::Timeout(_) => true,
      Self::Http { status, .. } => *status >= 500,
      Self::Validation(_) | Self::Decode(_) | Self::Cancelled | Self::Aborted(_) => false,
    }
  }

  pub fn is_unauthorized(&self) -> bool {
    self.status() == Some(401)
  }

  pub fn is_not_found(&self) -> bool {
    self.status() == Some(404)
  }
}
