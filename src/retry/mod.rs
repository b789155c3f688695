//! Retry support: policy, failure classification and the executor

pub mod classify;
pub mod executor;
pub mod policy;

pub use classify::{ErrorClassifier, FailureKind};
pub use executor::{OperationFailure, RetryExecutor, Success};
pub use policy::RetryPolicy;
