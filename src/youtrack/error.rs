//! Typed request failures and the classifier that produces them.

use thiserror::Error;

/// A failed request, classified by whether retrying could help.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifiedFailure {
  /// 4xx: the request itself is wrong (bad input, auth, not found). Never retried.
  #[error("{message} (HTTP {status})")]
  Client { status: u16, message: String },
  /// Network fault, timeout or 5xx. Retried up to the configured budget.
  #[error("{message}")]
  Transient { status: Option<u16>, message: String },
  /// The server answered but the payload could not be understood.
  #[error("{message}")]
  Unknown { message: String },
}

impl ClassifiedFailure {
  pub fn is_client(&self) -> bool {
    matches!(self, ClassifiedFailure::Client { .. })
  }

  pub fn status(&self) -> Option<u16> {
    match self {
      ClassifiedFailure::Client { status, .. } => Some(*status),
      ClassifiedFailure::Transient { status, .. } => *status,
      ClassifiedFailure::Unknown { .. } => None,
    }
  }

  pub fn message(&self) -> &str {
    match self {
      ClassifiedFailure::Client { message, .. }
      | ClassifiedFailure::Transient { message, .. }
      | ClassifiedFailure::Unknown { message } => message,
    }
  }

  pub fn timeout(message: impl Into<String>) -> Self {
    ClassifiedFailure::Transient {
      status: None,
      message: message.into(),
    }
  }

  pub fn decode(message: impl Into<String>) -> Self {
    ClassifiedFailure::Unknown {
      message: message.into(),
    }
  }
}

/// Classify a failure by its HTTP status alone.
///
/// `None` means the request never produced a status (connect error, reset,
/// deadline exceeded) and is treated as transient.
pub fn classify(status: Option<u16>, message: impl Into<String>) -> ClassifiedFailure {
  let message = message.into();
  match status {
    Some(status) if (400..500).contains(&status) => ClassifiedFailure::Client { status, message },
    status => ClassifiedFailure::Transient { status, message },
  }
}

/// Classify a transport-level reqwest error.
pub fn classify_reqwest(err: &reqwest::Error) -> ClassifiedFailure {
  let message = if err.is_timeout() {
    format!("Request timed out: {}", err)
  } else if err.is_connect() {
    format!("Connection failed: {}", err)
  } else {
    format!("Request failed: {}", err)
  };
  classify(err.status().map(|s| s.as_u16()), message)
}

/// Pull a human-readable message out of an error response body.
///
/// JSON payloads are searched for `error_description`, `error` and `message`
/// in that order. Anything else falls back to the raw text. A body that cannot
/// be parsed never fails; the generic status message is used instead.
pub fn error_message(status: u16, is_json: bool, body: &str) -> String {
  let fallback = format!("Request failed with status {}", status);

  if is_json {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
      return fallback;
    };
    ["error_description", "error", "message"]
      .iter()
      .find_map(|key| {
        value
          .get(key)
          .and_then(|v| v.as_str())
          .filter(|s| !s.is_empty())
      })
      .map(String::from)
      .unwrap_or(fallback)
  } else if body.trim().is_empty() {
    fallback
  } else {
    body.to_string()
  }
}
