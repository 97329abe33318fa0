use std::{env, time::Duration};

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};

use crate::{
    config::JudgeConfig,
    error::JudgeError,
    judge::{JudgeCompletion, JudgeModel},
    types::TokenUsage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Debug, Clone)]
pub struct OpenAIJudgeConfig {
    pub api_key: String,
    pub base_url: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub request_timeout: Duration,
    pub num_retries: u32,
    pub retry_backoff: Duration,
}

impl OpenAIJudgeConfig {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: model.into(),
            temperature: 0.0,
            max_tokens: 512,
            request_timeout: Duration::from_secs(60),
            num_retries: 3,
            retry_backoff: Duration::from_millis(500),
        }
    }

    /// Reads the key from the variable named by `api_key_env`.
    pub fn from_judge_config(judge: &JudgeConfig) -> Result<Self, JudgeError> {
        let api_key = env::var(&judge.api_key_env)
            .ok()
            .filter(|key| !key.is_empty())
            .ok_or_else(|| JudgeError::MissingApiKey(judge.api_key_env.clone()))?;

        let mut config = Self::new(api_key, judge.model.clone());
        if let Some(ref base_url) = judge.base_url {
            config.base_url = base_url.clone();
        }
        config.temperature = judge.temperature;
        config.max_tokens = judge.max_tokens;
        config.request_timeout = Duration::from_secs(judge.timeout);
        config.num_retries = judge.num_retries;
        Ok(config)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_retries(mut self, num_retries: u32, retry_backoff: Duration) -> Self {
        self.num_retries = num_retries;
        self.retry_backoff = retry_backoff;
        self
    }
}

/// Judge backed by any OpenAI-compatible `chat/completions` endpoint.
#[derive(Debug, Clone)]
pub struct OpenAIJudge {
    client: Client,
    config: OpenAIJudgeConfig,
}

impl OpenAIJudge {
    pub fn from_config(config: OpenAIJudgeConfig) -> Result<Self, JudgeError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self { client, config })
    }

    pub fn from_judge_config(judge: &JudgeConfig) -> Result<Self, JudgeError> {
        Self::from_config(OpenAIJudgeConfig::from_judge_config(judge)?)
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn with_default_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.bearer_auth(&self.config.api_key)
    }

    async fn complete_once(&self, body: &ChatRequestBody<'_>) -> Result<JudgeCompletion, Attempt> {
        let response = self
            .with_default_headers(self.client.post(self.endpoint("chat/completions")))
            .json(body)
            .send()
            .await
            .map_err(|e| Attempt::Retry(e.into()))?;
        let status = response.status();

        if !status.is_success() {
            let text = response.text().await.map_err(|e| Attempt::Retry(e.into()))?;
            let message = match serde_json::from_str::<ErrorEnvelope>(&text) {
                Ok(envelope) => envelope.error.message,
                Err(_) => format!("unexpected status {status}: {text}"),
            };
            let error = JudgeError::Provider(message);
            return Err(if is_retryable(status) {
                Attempt::Retry(error)
            } else {
                Attempt::Fatal(error)
            });
        }

        let parsed: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| Attempt::Fatal(e.into()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or(Attempt::Fatal(JudgeError::EmptyResponse))?;

        Ok(JudgeCompletion {
            text,
            usage: parsed.usage,
        })
    }
}

enum Attempt {
    Retry(JudgeError),
    Fatal(JudgeError),
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

#[async_trait]
impl JudgeModel for OpenAIJudge {
    async fn complete(&self, prompt: &str) -> Result<JudgeCompletion, JudgeError> {
        let body = ChatRequestBody {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
            max_tokens: self.config.max_tokens,
        };

        let mut attempt = 0;
        loop {
            match self.complete_once(&body).await {
                Ok(completion) => return Ok(completion),
                Err(Attempt::Fatal(error)) => return Err(error),
                Err(Attempt::Retry(error)) if attempt >= self.config.num_retries => return Err(error),
                Err(Attempt::Retry(error)) => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %error, "judge request failed, retrying");
                    tokio::time::sleep(self.config.retry_backoff * attempt).await;
                }
            }
        }
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ResponseChoice>,
    #[serde(default)]
    usage: Option<TokenUsage>,
}

#[derive(Debug, Deserialize)]
struct ResponseChoice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}
