use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use hiwar_core::errors::CompletionError;
use hiwar_core::messages::ChatMessage;
use hiwar_core::provider::{CompletionOptions, CompletionProvider};

/// Pre-programmed responses for deterministic testing without API calls.
pub enum MockResponse {
    Text(String),
    Error(CompletionError),
    /// Wait a duration, then resolve the inner response.
    Delay(Duration, Box<MockResponse>),
}

impl MockResponse {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn delayed(delay: Duration, inner: MockResponse) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock provider that returns pre-programmed responses in sequence and
/// records the prompt of every call.
pub struct MockProvider {
    responses: Mutex<VecDeque<MockResponse>>,
    requests: Mutex<Vec<Vec<ChatMessage>>>,
    call_count: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<MockResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            call_count: AtomicUsize::new(0),
        }
    }

    pub fn call_count(&self) -> usize {
        self.call_count.load(Ordering::Relaxed)
    }

    /// Prompts received so far, oldest first.
    pub fn requests(&self) -> Vec<Vec<ChatMessage>> {
        self.requests.lock().clone()
    }
}

#[async_trait]
impl CompletionProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn model(&self) -> &str {
        "mock-model"
    }

    async fn complete(
        &self,
        messages: &[ChatMessage],
        _options: &CompletionOptions,
    ) -> Result<String, CompletionError> {
        let idx = self.call_count.fetch_add(1, Ordering::Relaxed);
        self.requests.lock().push(messages.to_vec());

        let next = self.responses.lock().pop_front();
        let Some(mut current) = next else {
            return Err(CompletionError::InvalidRequest(format!(
                "MockProvider: no response configured for call {idx}"
            )));
        };

        loop {
            match current {
                MockResponse::Text(text) => return Ok(text),
                MockResponse::Error(e) => return Err(e),
                MockResponse::Delay(duration, inner) => {
                    tokio::time::sleep(duration).await;
                    current = *inner;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sequential_responses() {
        let mock = MockProvider::new(vec![MockResponse::text("first"), MockResponse::text("second")]);
        let opts = CompletionOptions::default();

        assert_eq!(mock.complete(&[], &opts).await.unwrap(), "first");
        assert_eq!(mock.complete(&[], &opts).await.unwrap(), "second");
        assert_eq!(mock.call_count(), 2);
    }

    #[tokio::test]
    async fn exhausted_responses() {
        let mock = MockProvider::new(vec![MockResponse::text("only one")]);
        let opts = CompletionOptions::default();

        let _ = mock.complete(&[], &opts).await;
        let err = mock.complete(&[], &opts).await.unwrap_err();
        assert!(matches!(err, CompletionError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn records_prompts() {
        let mock = MockProvider::new(vec![MockResponse::text("ok")]);
        mock.complete(&[ChatMessage::user("مرحبا")], &CompletionOptions::default())
            .await
            .unwrap();

        let requests = mock.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0], vec![ChatMessage::user("مرحبا")]);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_error() {
        let mock = MockProvider::new(vec![MockResponse::delayed(
            Duration::from_secs(5),
            MockResponse::Error(CompletionError::Network("reset".into())),
        )]);

        let start = tokio::time::Instant::now();
        let err = mock.complete(&[], &CompletionOptions::default()).await.unwrap_err();
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(matches!(err, CompletionError::Network(_)));
    }
}
