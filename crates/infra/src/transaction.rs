//! Transactional execution with bounded retry on storage conflicts.
//!
//! A unit of work runs inside one transaction at the configured isolation
//! level. Serialization failures and deadlocks surface as
//! `TrackerError::TransactionFailure`; when retries are enabled they are
//! retried up to the configured budget, after which the call fails with
//! `TrackerError::ExceededNumberOfRetries`. Every other error propagates
//! unchanged on the first occurrence.

use std::future::Future;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use synctrack_core::{ErrorKind, TrackerError, TrackerResult};

use crate::config::{TransactionConfig, TransactionRetryConfig};
use crate::store::{TransactionSource, UnitOfWork};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadCommitted,
    RepeatableRead,
    #[default]
    Serializable,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

impl std::str::FromStr for IsolationLevel {
    type Err = TrackerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace([' ', '-'], "_").as_str() {
            "read_committed" => Ok(IsolationLevel::ReadCommitted),
            "repeatable_read" => Ok(IsolationLevel::RepeatableRead),
            "serializable" => Ok(IsolationLevel::Serializable),
            other => Err(TrackerError::InvalidPayload(format!(
                "unknown isolation level '{other}'"
            ))),
        }
    }
}

/// Observability context of a unit of work. Never used for control flow.
#[derive(Debug, Clone)]
pub struct TxContext {
    pub operation: &'static str,
    pub correlation_id: String,
}

impl TxContext {
    pub fn new(operation: &'static str, correlation_id: impl Into<String>) -> Self {
        Self {
            operation,
            correlation_id: correlation_id.into(),
        }
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// retry budget is spent.
pub async fn with_retries<T, F, Fut>(
    policy: TransactionRetryConfig,
    ctx: &TxContext,
    mut op: F,
) -> TrackerResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = TrackerResult<T>>,
{
    let max_attempts = policy.max_attempts();
    let mut attempt = 0;

    loop {
        attempt += 1;
        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        match err.kind() {
            ErrorKind::TransactionFailure if policy.enabled => {
                if attempt >= max_attempts {
                    warn!(
                        operation = ctx.operation,
                        correlation_id = %ctx.correlation_id,
                        attempts = attempt,
                        error = %err,
                        "transaction retries exhausted"
                    );
                    return Err(TrackerError::ExceededNumberOfRetries {
                        retries: policy.num_retries,
                    });
                }
                debug!(
                    operation = ctx.operation,
                    correlation_id = %ctx.correlation_id,
                    attempt,
                    error = %err,
                    "transaction failed, retrying"
                );
            }
            _ => return Err(err),
        }
    }
}

/// Runs units of work against a [`TransactionSource`].
#[derive(Debug)]
pub struct TransactionManager<S> {
    source: S,
    config: TransactionConfig,
}

impl<S: TransactionSource> TransactionManager<S> {
    pub fn new(source: S, config: TransactionConfig) -> Self {
        Self { source, config }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    /// Execute `work` in a fresh transaction per attempt and commit it.
    pub async fn run<T, F>(&self, ctx: TxContext, work: F) -> TrackerResult<T>
    where
        T: Send,
        F: for<'u> Fn(&'u mut S::Uow) -> BoxFuture<'u, TrackerResult<T>> + Send + Sync,
    {
        let isolation = self.config.isolation_level;
        with_retries(self.config.retry, &ctx, || async {
            let mut uow = self.source.begin(isolation).await?;
            let value = work(&mut uow).await?;
            uow.commit().await?;
            Ok(value)
        })
        .await
    }
}
