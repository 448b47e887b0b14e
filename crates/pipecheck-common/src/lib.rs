//! Common types for pipecheck: errors, polling, retry and Kubernetes helpers

#![deny(missing_docs)]

pub mod error;
pub mod kube_utils;
pub mod poll;
pub mod retry;

pub use error::{AbsenceReason, Error, PipelineStage, Progress, RegistrationStage};
pub use poll::{PollError, Poller, Tick};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
