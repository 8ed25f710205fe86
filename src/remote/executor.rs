//! Remote operation execution with endpoint fallback.
//!
//! The executor is a transport shim: it runs one remote operation against
//! one endpoint under a per-call timeout, and walks an endpoint list in
//! resolver order when asked to. It interprets failure classifications,
//! never domain semantics. Single-endpoint execution does not retry by
//! itself; the retry controller wraps it so rate limits absorb a bounded
//! number of attempts before the loop moves to the next endpoint.
//! `permission-denied` stops the walk immediately since another endpoint of
//! the same environment cannot change credentials.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::SettingsSpec;
use crate::error::{EndpointAttempt, ErrorClass, RemoteError, Result, SyncError};

use super::endpoint::ConnectionEndpoint;
use super::retry::{RetryPolicy, retry_with_policy};

/// Default per-call timeout.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Executes remote operations with timeout, retry, and endpoint fallback.
#[derive(Debug, Clone)]
pub struct RemoteExecutor {
    policy: RetryPolicy,
    call_timeout: Duration,
}

impl Default for RemoteExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteExecutor {
    /// Creates an executor with default policy and timeout.
    #[must_use]
    pub fn new() -> Self {
        Self {
            policy: RetryPolicy::default(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Builds an executor from the config-file settings.
    #[must_use]
    pub fn from_settings(settings: &SettingsSpec) -> Self {
        Self {
            policy: RetryPolicy::from_spec(&settings.retry),
            call_timeout: Duration::from_secs(settings.call_timeout_secs.max(1)),
        }
    }

    /// Overrides the retry policy.
    #[must_use]
    pub const fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Overrides the per-call timeout.
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Returns the configured retry policy.
    #[must_use]
    pub const fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs one operation against one endpoint, exactly once, under the
    /// per-call timeout.
    ///
    /// # Errors
    ///
    /// Returns the operation's own error, or [`RemoteError::Timeout`] when
    /// the call outlives the configured timeout.
    pub async fn execute_once<T, F, Fut>(
        &self,
        endpoint: &ConnectionEndpoint,
        operation: &str,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(ConnectionEndpoint) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let seconds = self.call_timeout.as_secs();
        match tokio::time::timeout(self.call_timeout, f(endpoint.clone())).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout {
                operation: operation.to_string(),
                seconds,
            }
            .into()),
        }
    }

    /// Runs one operation against one endpoint with the retry policy
    /// absorbing rate limits.
    ///
    /// # Errors
    ///
    /// Propagates the final error once the operation fails non-retryably or
    /// the policy is exhausted.
    pub async fn execute<T, F, Fut>(
        &self,
        endpoint: &ConnectionEndpoint,
        operation: &str,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut(ConnectionEndpoint) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let timeout = self.call_timeout;
        retry_with_policy(&self.policy, operation, || {
            let fut = f(endpoint.clone());
            let seconds = timeout.as_secs();
            async move {
                match tokio::time::timeout(timeout, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(RemoteError::Timeout {
                        operation: operation.to_string(),
                        seconds,
                    }
                    .into()),
                }
            }
        })
        .await
    }

    /// Runs the operation against each endpoint in order until one
    /// succeeds.
    ///
    /// Unreachable endpoints and exhausted rate limits move the walk to the
    /// next candidate; the first success wins. Unauthorized and
    /// operation-specific failures propagate immediately.
    ///
    /// # Errors
    ///
    /// Returns [`RemoteError::AllEndpointsFailed`] naming every endpoint
    /// attempted and each reason when no candidate succeeds.
    pub async fn execute_with_fallback<T, F, Fut>(
        &self,
        endpoints: &[ConnectionEndpoint],
        operation: &str,
        mut f: F,
    ) -> Result<T>
    where
        F: FnMut(ConnectionEndpoint) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if endpoints.is_empty() {
            return Err(SyncError::internal(format!(
                "no endpoints resolved for operation '{operation}'"
            )));
        }

        let mut attempts: Vec<EndpointAttempt> = Vec::new();

        for endpoint in endpoints {
            match self.execute(endpoint, operation, &mut f).await {
                Ok(value) => {
                    if !attempts.is_empty() {
                        debug!(
                            operation,
                            endpoint = %endpoint,
                            prior_failures = attempts.len(),
                            "operation succeeded after endpoint fallback"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => {
                    let class = error.class();
                    match class {
                        ErrorClass::Unreachable | ErrorClass::RateLimited => {
                            warn!(
                                operation,
                                endpoint = %endpoint,
                                %class,
                                "endpoint failed, trying next candidate"
                            );
                            attempts.push(EndpointAttempt {
                                endpoint: endpoint.describe(),
                                class,
                                message: error.to_string(),
                            });
                        }
                        _ => return Err(error),
                    }
                }
            }
        }

        Err(RemoteError::AllEndpointsFailed {
            operation: operation.to_string(),
            attempts,
        }
        .into())
    }
}
