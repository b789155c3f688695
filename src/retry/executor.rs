//! Retry executor
//!
//! Runs one logical cache operation under a `RetryPolicy`. Transient
//! failures are retried with capped exponential backoff; connection-level
//! failures first go through the manager's coalesced reconnect. The
//! executor is the only place that decides to give up.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

use super::classify::{ErrorClassifier, FailureKind};
use super::policy::RetryPolicy;
use crate::cluster::Endpoint;
use crate::connection::{ConnectionHandle, ConnectionManager};
use crate::shutdown::ShutdownSignal;
use crate::utils::CacheError;

/// Successful outcome and the attempt it succeeded on (1-based)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Success<T> {
    pub value: T,
    pub attempts: u32,
}

/// Last failure of an operation, with what is needed to diagnose it
#[derive(Error, Debug)]
#[error("{operation} failed ({kind}) after {attempts} attempt(s){}: {source}", endpoint_suffix(.endpoint))]
pub struct OperationFailure {
    pub kind: FailureKind,
    pub operation: String,
    pub attempts: u32,
    /// Last endpoint the failure was observed on
    pub endpoint: Option<Endpoint>,
    #[source]
    pub source: CacheError,
}

fn endpoint_suffix(endpoint: &Option<Endpoint>) -> String {
    endpoint
        .as_ref()
        .map(|ep| format!(" on {}", ep))
        .unwrap_or_default()
}

impl OperationFailure {
    fn new(operation: &str, kind: FailureKind, attempts: u32, source: CacheError) -> Self {
        Self {
            kind,
            operation: operation.to_string(),
            attempts,
            endpoint: source.endpoint().cloned(),
            source,
        }
    }
}

pub struct RetryExecutor {
    manager: Arc<ConnectionManager>,
    classifier: ErrorClassifier,
    shutdown: ShutdownSignal,
}

impl RetryExecutor {
    pub fn new(manager: Arc<ConnectionManager>, shutdown: ShutdownSignal) -> Self {
        Self::with_classifier(manager, ErrorClassifier::default(), shutdown)
    }

    pub fn with_classifier(
        manager: Arc<ConnectionManager>,
        classifier: ErrorClassifier,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            manager,
            classifier,
            shutdown,
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }

    /// Run `op`, returning only its value
    pub fn execute<T, F>(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        op: F,
    ) -> Result<T, OperationFailure>
    where
        F: FnMut(&ConnectionHandle) -> Result<T, CacheError>,
    {
        self.run(operation, policy, op).map(|success| success.value)
    }

    /// Run `op` until it succeeds, fails fatally, or the policy is exhausted
    ///
    /// `op` is called with the handle current at each attempt. Cancellation
    /// is checked before every attempt and interrupts backoff sleeps.
    pub fn run<T, F>(
        &self,
        operation: &str,
        policy: &RetryPolicy,
        mut op: F,
    ) -> Result<Success<T>, OperationFailure>
    where
        F: FnMut(&ConnectionHandle) -> Result<T, CacheError>,
    {
        let mut attempt: u32 = 0;

        loop {
            if self.shutdown.is_cancelled() {
                return Err(OperationFailure::new(
                    operation,
                    FailureKind::Fatal,
                    attempt,
                    CacheError::Cancelled,
                ));
            }

            let (error, generation) = match self.manager.current() {
                Ok(handle) => match op(&handle) {
                    Ok(value) => {
                        if attempt > 0 {
                            debug!("{} succeeded on attempt {}", operation, attempt + 1);
                        }
                        return Ok(Success {
                            value,
                            attempts: attempt + 1,
                        });
                    }
                    Err(e) => (e, Some(handle.generation())),
                },
                Err(e) => (e, None),
            };

            let kind = self.classifier.classify(&error);
            attempt += 1;

            if !kind.is_transient() {
                debug!("{} failed fatally: {}", operation, error);
                return Err(OperationFailure::new(operation, kind, attempt, error));
            }
            if attempt >= policy.max_attempts() {
                warn!(
                    "{} giving up after {} attempt(s): {}",
                    operation, attempt, error
                );
                return Err(OperationFailure::new(operation, kind, attempt, error));
            }

            warn!(
                "{} attempt {}/{} failed ({}): {}",
                operation,
                attempt,
                policy.max_attempts(),
                kind,
                error
            );

            if kind == FailureKind::TransientConnection {
                if let Some(generation) = generation {
                    let reason = error.to_string();
                    self.manager.report_fault(generation, &reason);
                    if let Err(e) = self.manager.force_reconnect(generation, &reason) {
                        match e {
                            CacheError::Disposed => {
                                return Err(OperationFailure::new(
                                    operation,
                                    FailureKind::Fatal,
                                    attempt,
                                    e,
                                ))
                            }
                            // Next attempt goes through the stale handle and
                            // reports the fault again
                            _ => warn!("{}: reconnect failed: {}", operation, e),
                        }
                    }
                }
            }

            if self.shutdown.wait_timeout(policy.backoff(attempt)) {
                return Err(OperationFailure::new(
                    operation,
                    FailureKind::Fatal,
                    attempt,
                    CacheError::Cancelled,
                ));
            }
        }
    }
}
