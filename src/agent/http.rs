use std::{
    env,
    time::{Duration, Instant},
};

use async_stream::try_stream;
use async_trait::async_trait;
use futures_core::Stream;
use futures_util::{pin_mut, StreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::Value;

use crate::{
    agent::{
        streaming::{extract_line, StreamEventKind, StreamParser},
        AgentClient, AgentRequest, AgentResponse,
    },
    config::{ApiConfig, EndpointType},
    error::ApiError,
    types::{ToolCall, ToolCallSequence},
};

const QUERY_PATH: &str = "v1/query";
const STREAMING_QUERY_PATH: &str = "v1/streaming_query";

#[derive(Debug, Clone)]
pub struct HttpAgentConfig {
    pub api_base: String,
    pub endpoint_type: EndpointType,
    pub request_timeout: Duration,
    pub api_key: Option<String>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub no_tools: Option<bool>,
    pub system_prompt: Option<String>,
}

impl HttpAgentConfig {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            endpoint_type: EndpointType::Streaming,
            request_timeout: Duration::from_secs(crate::config::DEFAULT_API_TIMEOUT_SECS),
            api_key: None,
            provider: None,
            model: None,
            no_tools: None,
            system_prompt: None,
        }
    }

    /// Builds from the `api` config section; the bearer token comes from `API_KEY`.
    pub fn from_api_config(api: &ApiConfig) -> Self {
        Self {
            api_base: api.api_base.clone(),
            endpoint_type: api.endpoint_type,
            request_timeout: api.request_timeout(),
            api_key: env::var("API_KEY").ok().filter(|key| !key.is_empty()),
            provider: Some(api.provider.clone()),
            model: Some(api.model.clone()),
            no_tools: api.no_tools,
            system_prompt: api.system_prompt.clone(),
        }
    }

    pub fn with_endpoint_type(mut self, endpoint_type: EndpointType) -> Self {
        self.endpoint_type = endpoint_type;
        self
    }

    pub fn with_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_model(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }
}

/// Talks to the agent's `/v1/query` or `/v1/streaming_query` endpoint.
#[derive(Debug, Clone)]
pub struct HttpAgentClient {
    client: Client,
    config: HttpAgentConfig,
}

impl HttpAgentClient {
    pub fn from_config(config: HttpAgentConfig) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|source| ApiError::Http {
                operation: "client setup",
                source,
            })?;

        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!(
            "{}/{}",
            self.config.api_base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    fn with_default_headers(&self, builder: RequestBuilder) -> RequestBuilder {
        match self.config.api_key {
            Some(ref key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn complete_request(&self, mut request: AgentRequest) -> AgentRequest {
        if request.provider.is_none() {
            request.provider = self.config.provider.clone();
        }
        if request.model.is_none() {
            request.model = self.config.model.clone();
        }
        if request.no_tools.is_none() {
            request.no_tools = self.config.no_tools;
        }
        if request.system_prompt.is_none() {
            request.system_prompt = self.config.system_prompt.clone();
        }
        request
    }

    fn timeout_error(&self, endpoint: &'static str) -> ApiError {
        ApiError::Timeout {
            endpoint,
            seconds: self.config.request_timeout.as_secs(),
        }
    }

    fn transport_error(&self, endpoint: &'static str, operation: &'static str, source: reqwest::Error) -> ApiError {
        if source.is_timeout() {
            self.timeout_error(endpoint)
        } else {
            ApiError::Http { operation, source }
        }
    }

    async fn ensure_success(&self, response: Response, endpoint: &'static str) -> Result<Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error(endpoint, "reading error body", e))?;
        Err(ApiError::Status {
            status: status.as_u16(),
            message: extract_error_message(&text),
        })
    }

    async fn standard_query(&self, request: &AgentRequest) -> Result<AgentResponse, ApiError> {
        let response = self
            .with_default_headers(self.client.post(self.endpoint(QUERY_PATH)))
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error("standard", "standard query", e))?;
        let response = self.ensure_success(response, "standard").await?;

        let text = response
            .text()
            .await
            .map_err(|e| self.transport_error("standard", "standard query", e))?;
        let body: QueryResponseBody = serde_json::from_str(&text)
            .map_err(|e| ApiError::InvalidResponse(e.to_string()))?;
        body.into_agent_response()
    }

    async fn streaming_query(&self, request: &AgentRequest) -> Result<AgentResponse, ApiError> {
        let started = Instant::now();
        let response = self
            .with_default_headers(self.client.post(self.endpoint(STREAMING_QUERY_PATH)))
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await
            .map_err(|e| self.transport_error("streaming", "streaming query", e))?;
        let response = self.ensure_success(response, "streaming").await?;

        let mut parser = StreamParser::new();
        let mut first_token: Option<Duration> = None;
        let lines = line_stream(response);
        pin_mut!(lines);

        while let Some(line) = lines.next().await {
            let line = line.map_err(|e| self.transport_error("streaming", "streaming query", e))?;
            let kind = parser.push_line(&line)?;
            if first_token.is_none()
                && matches!(
                    kind,
                    Some(StreamEventKind::Token | StreamEventKind::ToolCall | StreamEventKind::TurnComplete)
                )
            {
                first_token = Some(started.elapsed());
            }
        }

        let mut answer: AgentResponse = parser.finish()?.into();
        answer.time_to_first_token = first_token.map(|d| d.as_secs_f64());
        answer.streaming_duration = Some(started.elapsed().as_secs_f64());
        Ok(answer)
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    async fn query(&self, request: AgentRequest) -> Result<AgentResponse, ApiError> {
        let request = self.complete_request(request);
        match self.config.endpoint_type {
            EndpointType::Streaming => self.streaming_query(&request).await,
            EndpointType::Query => self.standard_query(&request).await,
        }
    }
}

/// Splits the response body into lines as bytes arrive.
fn line_stream(response: Response) -> impl Stream<Item = Result<String, reqwest::Error>> {
    try_stream! {
        let mut buffer = Vec::new();
        let mut body = response.bytes_stream();

        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            buffer.extend_from_slice(&chunk);
            while let Some(line) = extract_line(&mut buffer) {
                yield line;
            }
        }

        if !buffer.is_empty() {
            yield String::from_utf8_lossy(&buffer).trim_end().to_string();
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponseBody {
    #[serde(default)]
    response: Option<String>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    contexts: Option<Vec<String>>,
    #[serde(default)]
    rag_chunks: Option<Vec<RagChunk>>,
    #[serde(default)]
    tool_calls: Option<Vec<Value>>,
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RagChunk {
    content: String,
}

impl QueryResponseBody {
    fn into_agent_response(self) -> Result<AgentResponse, ApiError> {
        let response = self
            .response
            .ok_or_else(|| ApiError::InvalidResponse("API response missing 'response' field".to_string()))?;
        let conversation_id = self
            .conversation_id
            .filter(|id| !id.trim().is_empty())
            .ok_or_else(|| {
                ApiError::InvalidResponse("API response missing 'conversation_id' field".to_string())
            })?;

        let contexts = match (self.contexts, self.rag_chunks) {
            (Some(contexts), _) if !contexts.is_empty() => contexts,
            (_, Some(chunks)) => chunks.into_iter().map(|chunk| chunk.content).collect(),
            _ => Vec::new(),
        };

        Ok(AgentResponse {
            response: response.trim().to_string(),
            conversation_id,
            contexts,
            tool_calls: self
                .tool_calls
                .map(|calls| format_tool_calls(&calls))
                .unwrap_or_default(),
            input_tokens: self.input_tokens.unwrap_or(0),
            output_tokens: self.output_tokens.unwrap_or(0),
            time_to_first_token: None,
            streaming_duration: None,
        })
    }
}

/// Accepts `{name, args}` and `{tool_name, arguments}`; each call becomes its own sequence.
fn format_tool_calls(raw: &[Value]) -> Vec<ToolCallSequence> {
    raw.iter()
        .filter_map(Value::as_object)
        .filter_map(|call| {
            let name = call
                .get("tool_name")
                .or_else(|| call.get("name"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let arguments = call
                .get("arguments")
                .or_else(|| call.get("args"))
                .and_then(Value::as_object)
                .map(|args| args.clone().into_iter().collect())
                .unwrap_or_default();
            if name.is_empty() {
                return None;
            }
            Some(vec![ToolCall {
                tool_name: name.to_string(),
                arguments,
                result: call.get("result").filter(|v| !v.is_null()).cloned(),
            }])
        })
        .collect()
}

/// Pulls a readable message from an error body, preferring `detail`.
pub(crate) fn extract_error_message(body: &str) -> String {
    let Ok(parsed) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    match parsed.get("detail") {
        Some(Value::Object(detail)) => {
            let response = detail.get("response").and_then(Value::as_str).unwrap_or_default();
            match detail.get("cause").and_then(Value::as_str) {
                Some(cause) if !cause.is_empty() => format!("{response} - {cause}"),
                _ => response.to_string(),
            }
        }
        Some(Value::String(detail)) => detail.clone(),
        Some(other) => other.to_string(),
        None => body.to_string(),
    }
}
