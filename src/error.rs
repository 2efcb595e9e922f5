//! Typed errors for the failures callers are expected to match on. Everything else in the crate
//! goes through `anyhow` with context attached at the seam where it happened.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Bad or missing hyperparameters. Raised before any compute resources are touched.
    #[error("configuration error: {0}")]
    Config(String),
    /// The reduction window schedule ran out of entries while the training step kept growing.
    /// Schedules are expected to end with an open `until_step: null` entry.
    #[error("reduction window schedule exhausted at index {index} (global step {step})")]
    ScheduleExhausted { index: usize, step: u64 },
    /// The validation loader produced no batches, a mean loss would divide by zero.
    #[error("validation set produced no batches")]
    EmptyValidationSet,
    /// Collective communication failed. Fatal, the run restarts from the last checkpoint.
    #[error("collective communication failed: {0}")]
    Collective(String),
}
