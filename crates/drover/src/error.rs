use thiserror::Error;

/// Cycle-level failures the outer loop tells apart: a retryable cycle
/// error is logged and retried on the next tick, the drain exhaustion is
/// fatal once the one-shot waiver has been spent.
#[derive(Debug, Error)]
pub enum UploaderError {
  #[error("upload cycle failed: {0}")]
  Cycle(String),
  #[error("exceeded max number of waits while waiting for upload results")]
  DrainTimeout,
}
