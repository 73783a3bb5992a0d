use std::path::PathBuf;

use thiserror::Error;

/// Failures surfaced by the fleet core.
///
/// `DriverUnavailable` is transient: background loops log it and try again on
/// their next tick, callers of one-shot operations may retry with backoff.
#[derive(Debug, Error)]
pub enum FleetError {
  #[error("terminal multiplexer unavailable: {0}")]
  DriverUnavailable(String),

  #[error("session '{0}' not found")]
  SessionNotFound(String),

  #[error("failed to start session '{name}': {reason}")]
  SpawnFailed { name: String, reason: String },

  #[error("failed to write to session '{name}': {reason}")]
  WriteFailed { name: String, reason: String },

  #[error("failed to persist {what}: {source}")]
  PersistenceFailure {
    what: String,
    #[source]
    source: anyhow::Error,
  },

  #[error("malformed registry {}: {reason}", path.display())]
  MalformedRegistry { path: PathBuf, reason: String },

  #[error("scheduled message '{0}' not found")]
  MessageNotFound(String),

  #[error("invalid scheduled message: {0}")]
  InvalidMessage(String),

  #[error("no check-in scheduled for '{0}'")]
  CheckInNotFound(String),

  #[error("invalid check-in: {0}")]
  InvalidCheckIn(String),
}

impl FleetError {
  /// True for failures worth retrying later without operator action.
  #[must_use]
  pub fn is_transient(&self) -> bool {
    matches!(self, Self::DriverUnavailable(_))
  }

  pub(crate) fn persistence(what: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
    Self::PersistenceFailure {
      what: what.into(),
      source: source.into(),
    }
  }
}

pub type FleetResult<T> = std::result::Result<T, FleetError>;
