//! Handler decorators. Each wraps a [`ToolHandler`] in another handler, so
//! they compose freely and the registry sees a plain handler.

use super::{ToolContext, ToolError, ToolHandler};
use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use switchboard_core::config::RetryConfig;

struct Timeout {
    inner: Arc<dyn ToolHandler>,
    duration: Duration,
}

#[async_trait]
impl ToolHandler for Timeout {
    async fn call(&self, arguments: Value, context: ToolContext) -> Result<Value> {
        match tokio::time::timeout(self.duration, self.inner.call(arguments, context)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::new(
                crate::protocol::error_codes::TOOL_TIMEOUT,
                format!("Handler timed out after {}ms", self.duration.as_millis()),
            )
            .into()),
        }
    }
}

/// Fail the call with a timeout error if `inner` runs longer than `duration`
pub fn with_timeout(inner: Arc<dyn ToolHandler>, duration: Duration) -> Arc<dyn ToolHandler> {
    Arc::new(Timeout { inner, duration })
}

struct Retry {
    inner: Arc<dyn ToolHandler>,
    config: RetryConfig,
}

#[async_trait]
impl ToolHandler for Retry {
    async fn call(&self, arguments: Value, context: ToolContext) -> Result<Value> {
        let mut attempt = 0;
        loop {
            let err = match self.inner.call(arguments.clone(), context.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if attempt >= self.config.max_retries || context.cancellation.is_cancelled() {
                return Err(err);
            }

            let backoff = self.config.backoff_for_attempt(attempt);
            attempt += 1;
            tracing::debug!(
                attempt,
                backoff_ms = backoff.as_millis() as u64,
                error = %err,
                "Retrying tool handler"
            );
            tokio::select! {
                _ = context.cancellation.cancelled() => return Err(err),
                _ = tokio::time::sleep(backoff) => {}
            }
        }
    }
}

/// Re-run `inner` on failure with exponential backoff, up to
/// `config.max_retries` extra attempts. Stops early once the call is
/// cancelled.
pub fn with_retry(inner: Arc<dyn ToolHandler>, config: RetryConfig) -> Arc<dyn ToolHandler> {
    Arc::new(Retry { inner, config })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::handler_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn flaky(failures: u32) -> (Arc<dyn ToolHandler>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handler = handler_fn(move |_args, _ctx| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < failures {
                    Err(anyhow::anyhow!("attempt {} failed", n))
                } else {
                    Ok(json!({ "attempt": n }))
                }
            }
        });
        (handler, calls)
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            initial_backoff_ms: 10,
            max_backoff_ms: 100,
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let (handler, calls) = flaky(2);
        let result = with_retry(handler, fast_retry(3))
            .call(json!({}), ToolContext::default())
            .await
            .unwrap();

        assert_eq!(result, json!({ "attempt": 2 }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let (handler, calls) = flaky(10);
        let err = with_retry(handler, fast_retry(2))
            .call(json!({}), ToolContext::default())
            .await
            .unwrap_err();

        assert!(err.to_string().contains("attempt 2 failed"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_when_cancelled() {
        let (handler, calls) = flaky(10);
        let context = ToolContext::default();
        context.cancellation.cancel();

        assert!(with_retry(handler, fast_retry(5)).call(json!({}), context).await.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_decorator() {
        let slow = handler_fn(|_args, _ctx| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(json!(null))
        });
        let err = with_timeout(slow, Duration::from_millis(50))
            .call(json!({}), ToolContext::default())
            .await
            .unwrap_err();

        let tool_error = err.downcast::<ToolError>().unwrap();
        assert_eq!(tool_error.code, crate::protocol::error_codes::TOOL_TIMEOUT);
    }
}
