pub mod http;
pub mod streaming;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{error::ApiError, types::ToolCallSequence};

pub use http::{HttpAgentClient, HttpAgentConfig};
pub use streaming::{parse_stream, StreamEventKind, StreamParser, StreamedAnswer};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub attachment_type: String,
    pub content: String,
    pub content_type: String,
}

impl Attachment {
    pub fn configuration(content: impl Into<String>) -> Self {
        Self {
            attachment_type: "configuration".to_string(),
            content: content.into(),
            content_type: "text/plain".to_string(),
        }
    }
}

/// Body sent to both the standard and the streaming endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRequest {
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_tools: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<Attachment>,
}

impl AgentRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            provider: None,
            model: None,
            no_tools: None,
            conversation_id: None,
            system_prompt: None,
            attachments: Vec::new(),
        }
    }

    pub fn with_conversation_id(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id;
        self
    }

    pub fn with_attachments<I, S>(mut self, attachments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attachments = attachments
            .into_iter()
            .map(Attachment::configuration)
            .collect();
        self
    }
}

/// Normalized agent answer, whichever endpoint produced it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentResponse {
    pub response: String,
    pub conversation_id: String,
    pub contexts: Vec<String>,
    pub tool_calls: Vec<ToolCallSequence>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    /// Seconds until the first streamed token, streaming only.
    pub time_to_first_token: Option<f64>,
    /// Seconds spent reading the stream, streaming only.
    pub streaming_duration: Option<f64>,
}

impl From<StreamedAnswer> for AgentResponse {
    fn from(answer: StreamedAnswer) -> Self {
        Self {
            response: answer.response,
            conversation_id: answer.conversation_id,
            contexts: Vec::new(),
            tool_calls: answer.tool_calls,
            input_tokens: answer.input_tokens,
            output_tokens: answer.output_tokens,
            time_to_first_token: None,
            streaming_duration: None,
        }
    }
}

/// The agent under test.
#[async_trait]
pub trait AgentClient: Send + Sync {
    async fn query(&self, request: AgentRequest) -> Result<AgentResponse, ApiError>;
}
