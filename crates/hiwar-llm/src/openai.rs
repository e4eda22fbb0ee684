use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::instrument;

use hiwar_core::errors::CompletionError;
use hiwar_core::messages::ChatMessage;
use hiwar_core::provider::{CompletionOptions, CompletionProvider};

pub const DEFAULT_BASE_URL: &str = "https://api.poe.com/v1";
pub const DEFAULT_MODEL: &str = "assistant";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Where and as whom to reach an OpenAI-compatible `/chat/completions` endpoint.
#[derive(Clone)]
pub struct ProviderConfig {
    pub api_key: SecretString,
    pub base_url: String,
    pub model: String,
}

impl ProviderConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: SecretString::from(api_key.into()),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("api_key", &"[REDACTED]")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish()
    }
}

pub struct OpenAiCompatProvider {
    client: Client,
    api_key: SecretString,
    endpoint: String,
    model: String,
}

impl OpenAiCompatProvider {
    pub fn new(config: ProviderConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        let endpoint = format!("{}/chat/completions", config.base_url.trim_end_matches('/'));

        Self {
            client,
            api_key: config.api_key,
            endpoint,
            model: config.model,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn build_body(&self, messages: &[ChatMessage], options: &CompletionOptions) -> Value {
        json!({
            "model": self.model,
            "messages": messages,
            "temperature": options.temperature,
            "max_tokens": options.max_tokens,
            "top_p": options.top_p,
            "frequency_penalty": options.frequency_penalty,
            "presence_penalty": options.presence_penalty,
        })
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

fn first_choice_text(response: ChatCompletionResponse) -> Result<String, CompletionError> {
    let content = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| CompletionError::MalformedResponse("no choices in response".into()))?
        .message
        .content
        .ok_or_else(|| CompletionError::MalformedResponse("choice has no content".into()))?;

    Ok(content.trim_matches(' ').to_string())
}

fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl CompletionProvider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        "openai-compatible"
    }

    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip(self, messages, options), fields(model = %self.model, messages = messages.len()))]
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: &CompletionOptions,
    ) -> Result<String, CompletionError> {
        let resp = self
            .client
            .post(&self.endpoint)
            .bearer_auth(self.api_key.expose_secret())
            .header("accept", "application/json")
            .json(&self.build_body(messages, options))
            .send()
            .await
            .map_err(|e| CompletionError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            if status.as_u16() == 429 {
                return Err(CompletionError::RateLimited {
                    retry_after: retry_after(resp.headers()),
                });
            }
            let body = resp.text().await.unwrap_or_default();
            return Err(CompletionError::from_status(status.as_u16(), body));
        }

        let parsed: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| CompletionError::MalformedResponse(e.to_string()))?;

        let text = first_choice_text(parsed)?;
        tracing::debug!(chars = text.chars().count(), "Completion received");
        Ok(text)
    }
}
