//! Stream Retry
//!
//! Backoff wrapper for opening model streams. Transient failures (transport
//! errors, empty choices, retryable HTTP statuses) are retried with
//! exponential backoff and jitter; auth failures and cancellation are not.

use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::provider::{CompletionStream, ModelProvider};
use crate::types::{ChatCompletionRequest, LlmError, LlmResult};

/// Backoff for attempt `n` (0-based): `n^2 * 200ms` plus up to 500ms of jitter.
pub fn retry_backoff(attempt: usize) -> Duration {
    let base = Duration::from_millis((attempt * attempt) as u64 * 200);
    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..500));
    base + jitter
}

/// Open a streaming completion, retrying transient failures up to
/// `max_retries` times.
pub async fn create_chat_completion_stream_with_retries(
    provider: &dyn ModelProvider,
    req: ChatCompletionRequest,
    cancel: CancellationToken,
    max_retries: usize,
) -> LlmResult<CompletionStream> {
    let mut attempt = 0;

    loop {
        match provider
            .create_chat_completion_stream(req.clone(), cancel.clone())
            .await
        {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if !err.is_retryable() || attempt >= max_retries {
                    return Err(err);
                }
                attempt += 1;
                let wait = retry_backoff(attempt);
                tracing::warn!(
                    provider = provider.name(),
                    model = %req.model,
                    attempt,
                    error = %err,
                    "retrying model stream in {:?}",
                    wait
                );
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = cancel.cancelled() => return Err(LlmError::Canceled),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::StreamChunk;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    struct FlakyProvider {
        failures: AtomicUsize,
    }

    #[async_trait]
    impl ModelProvider for FlakyProvider {
        fn name(&self) -> &'static str {
            "flaky"
        }

        async fn create_chat_completion_stream(
            &self,
            _req: ChatCompletionRequest,
            _cancel: CancellationToken,
        ) -> LlmResult<CompletionStream> {
            if self.failures.fetch_sub(1, Ordering::SeqCst) > 1 {
                return Err(LlmError::Stream("connection reset".into()));
            }
            let (tx, rx) = mpsc::channel(1);
            tx.try_send(Ok(StreamChunk::content("ok"))).unwrap();
            Ok(CompletionStream::new(rx))
        }
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let provider = FlakyProvider {
            failures: AtomicUsize::new(3),
        };
        let stream = create_chat_completion_stream_with_retries(
            &provider,
            ChatCompletionRequest::default(),
            CancellationToken::new(),
            3,
        )
        .await
        .unwrap();
        assert_eq!(stream.collect_content().await.unwrap(), "ok");
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_error() {
        let provider = FlakyProvider {
            failures: AtomicUsize::new(100),
        };
        let res = create_chat_completion_stream_with_retries(
            &provider,
            ChatCompletionRequest::default(),
            CancellationToken::new(),
            2,
        )
        .await;
        assert!(matches!(res, Err(LlmError::Stream(_))));
    }

    #[test]
    fn test_backoff_grows_quadratically() {
        // strip jitter by comparing lower bounds
        assert!(retry_backoff(3) >= Duration::from_millis(1800));
        assert!(retry_backoff(1) >= Duration::from_millis(200));
    }
}
