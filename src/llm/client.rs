use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::sleep;
use tracing::warn;

use crate::config::LlmConfig;

/// One message in a chat-completion request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Errors from the upstream text-generation endpoint
#[derive(Debug)]
pub enum LlmError {
    /// The attempt exceeded the request timeout.
    Timeout,

    /// Connection-level failure before a response arrived.
    Network(String),

    /// Upstream answered with a non-success status.
    Upstream { status: u16, body: String },

    /// Upstream answered 2xx but the body carried no usable completion.
    InvalidResponse(String),
}

impl LlmError {
    /// Timeouts, connection failures and 5xx responses may succeed on a
    /// later attempt. A 4xx means the request itself is bad and a retry
    /// would send the same bad request again.
    pub fn is_transient(&self) -> bool {
        match self {
            LlmError::Timeout | LlmError::Network(_) => true,
            LlmError::Upstream { status, .. } => *status >= 500,
            LlmError::InvalidResponse(_) => false,
        }
    }
}

impl fmt::Display for LlmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LlmError::Timeout => write!(f, "LLM request timed out"),
            LlmError::Network(msg) => write!(f, "LLM request failed: {}", msg),
            LlmError::Upstream { status, body } => {
                write!(f, "LLM endpoint returned status {}: {}", status, body)
            }
            LlmError::InvalidResponse(msg) => write!(f, "unusable LLM response: {}", msg),
        }
    }
}

impl std::error::Error for LlmError {}

/// A single completion call against the external endpoint. Retry lives in
/// `complete_with_retry`, not here.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, LlmError>;
}

/// Retry schedule for completion calls
///
/// The worker path allows several attempts with exponential spacing; the
/// synchronous fallback path uses a single attempt so request latency
/// stays bounded.
#[derive(Debug, Clone, Copy)]
pub struct CallRetry {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

/// Schedule used on the worker path: 3 attempts, 2s then 4s apart.
pub const WORKER_CALL_RETRY: CallRetry = CallRetry {
    max_attempts: 3,
    base_delay: Duration::from_millis(1000),
};

impl CallRetry {
    /// Single attempt, no delays.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based): `base_delay * 2^attempt`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

/// Call the completion endpoint, retrying transient failures per `retry`.
/// Permanent failures surface immediately.
pub async fn complete_with_retry(
    api: &dyn ChatApi,
    messages: &[ChatMessage],
    temperature: f32,
    retry: CallRetry,
) -> Result<String, LlmError> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match api.complete(messages, temperature).await {
            Ok(text) => return Ok(text),
            Err(err) if err.is_transient() && attempt < retry.max_attempts => {
                let delay = retry.delay_after(attempt);
                warn!(
                    "Completion attempt {}/{} failed, retrying in {:?}: {}",
                    attempt, retry.max_attempts, delay, err
                );
                sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    content: String,
}

/// Client for an OpenAI-compatible chat-completions endpoint
pub struct OpenAiClient {
    http: reqwest::Client,
    api_url: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .expect("Failed to build HTTP client");

        Self {
            http,
            api_url: config.api_url.clone(),
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
        }
    }
}

#[async_trait]
impl ChatApi for OpenAiClient {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<String, LlmError> {
        let request = CompletionRequest {
            model: &self.model,
            messages,
            temperature,
            max_tokens: self.max_tokens,
        };

        let response = self
            .http
            .post(&self.api_url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| {
                if err.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Network(err.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Upstream {
                status: status.as_u16(),
                body,
            });
        }

        let completion: CompletionResponse = response
            .json()
            .await
            .map_err(|err| LlmError::InvalidResponse(err.to_string()))?;

        completion
            .choices
            .into_iter()
            .next()
            .map(|choice| choice.message.content)
            .ok_or_else(|| LlmError::InvalidResponse("response contained no choices".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// ChatApi double that plays back a scripted sequence of results.
    struct Scripted {
        script: Mutex<Vec<Result<String, LlmError>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(script: Vec<Result<String, LlmError>>) -> Self {
            Self {
                script: Mutex::new(script),
                calls: AtomicUsize::new(0),
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ChatApi for Scripted {
        async fn complete(
            &self,
            _messages: &[ChatMessage],
            _temperature: f32,
        ) -> Result<String, LlmError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut script = self.script.lock().unwrap();
            if script.is_empty() {
                return Err(LlmError::Network("script exhausted".into()));
            }
            script.remove(0)
        }
    }

    fn messages() -> Vec<ChatMessage> {
        vec![ChatMessage::user("hello")]
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let api = Scripted::new(vec![
            Err(LlmError::Timeout),
            Err(LlmError::Upstream {
                status: 503,
                body: "overloaded".into(),
            }),
            Ok("hi there".into()),
        ]);

        let reply = complete_with_retry(&api, &messages(), 0.7, WORKER_CALL_RETRY)
            .await
            .unwrap();

        assert_eq!(reply, "hi there");
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_exhaustion_surfaces_the_last_error() {
        let api = Scripted::new(vec![
            Err(LlmError::Timeout),
            Err(LlmError::Timeout),
            Err(LlmError::Network("connection reset".into())),
        ]);

        let err = complete_with_retry(&api, &messages(), 0.7, WORKER_CALL_RETRY)
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::Network(_)));
        assert_eq!(api.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn client_errors_are_never_retried() {
        let api = Scripted::new(vec![Err(LlmError::Upstream {
            status: 400,
            body: "bad request".into(),
        })]);

        let err = complete_with_retry(&api, &messages(), 0.7, WORKER_CALL_RETRY)
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::Upstream { status: 400, .. }));
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn no_retry_schedule_makes_a_single_attempt() {
        let api = Scripted::new(vec![Err(LlmError::Timeout)]);

        let err = complete_with_retry(&api, &messages(), 0.7, CallRetry::none())
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::Timeout));
        assert_eq!(api.calls(), 1);
    }

    #[test]
    fn delays_double_starting_from_twice_the_base() {
        assert_eq!(
            WORKER_CALL_RETRY.delay_after(1),
            Duration::from_millis(2000)
        );
        assert_eq!(
            WORKER_CALL_RETRY.delay_after(2),
            Duration::from_millis(4000)
        );
    }

    #[test]
    fn transient_classification() {
        assert!(LlmError::Timeout.is_transient());
        assert!(LlmError::Network("reset".into()).is_transient());
        assert!(
            LlmError::Upstream {
                status: 500,
                body: String::new()
            }
            .is_transient()
        );
        assert!(
            !LlmError::Upstream {
                status: 429,
                body: String::new()
            }
            .is_transient()
        );
        assert!(!LlmError::InvalidResponse("empty".into()).is_transient());
    }
}
