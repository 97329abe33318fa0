use serde::Deserialize;
use serde_json::{Map, Value};

use crate::{error::StreamError, types::{ToolCall, ToolCallSequence}};

const DATA_PREFIX: &str = "data: ";

/// What a successfully consumed stream produced.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamedAnswer {
    pub response: String,
    pub conversation_id: String,
    /// One single-call sequence per `tool_call` event, in arrival order.
    pub tool_calls: Vec<ToolCallSequence>,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Kind of event a line carried, reported so callers can take timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEventKind {
    Start,
    Token,
    ToolCall,
    TurnComplete,
    End,
    Other,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    event: String,
    #[serde(default)]
    data: Map<String, Value>,
}

/// Incremental parser for the agent's line-oriented event stream.
#[derive(Debug, Default)]
pub struct StreamParser {
    conversation_id: Option<String>,
    response: Option<String>,
    tool_calls: Vec<ToolCallSequence>,
    input_tokens: u64,
    output_tokens: u64,
}

impl StreamParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes one line. Noise is ignored and reported as `Ok(None)`; an
    /// `error` event aborts the stream.
    pub fn push_line(&mut self, line: &str) -> Result<Option<StreamEventKind>, StreamError> {
        let line = line.trim();
        let Some(payload) = line.strip_prefix(DATA_PREFIX) else {
            return Ok(None);
        };

        let envelope: Envelope = match serde_json::from_str(payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::debug!(error = %e, "skipping undecodable stream line");
                return Ok(None);
            }
        };

        let kind = match envelope.event.as_str() {
            "error" => {
                let message = envelope
                    .data
                    .get("token")
                    .map(value_text)
                    .unwrap_or_else(|| Value::Object(envelope.data.clone()).to_string());
                tracing::error!(message = %message, "error event from streaming API");
                return Err(StreamError::Api(message));
            }
            "start" => {
                if let Some(id) = envelope.data.get("conversation_id").and_then(Value::as_str) {
                    let id = id.trim();
                    if !id.is_empty() {
                        tracing::debug!(conversation_id = %id, "stream started");
                        self.conversation_id = Some(id.to_string());
                    }
                }
                StreamEventKind::Start
            }
            "turn_complete" => {
                if let Some(token) = envelope.data.get("token") {
                    let answer = value_text(token).trim().to_string();
                    tracing::debug!(chars = answer.len(), "final response received");
                    self.response = Some(answer);
                }
                StreamEventKind::TurnComplete
            }
            "tool_call" => {
                if let Some(call) = envelope.data.get("token").and_then(parse_tool_call) {
                    tracing::debug!(tool = %call.tool_name, "tool call received");
                    self.tool_calls.push(vec![call]);
                }
                StreamEventKind::ToolCall
            }
            "end" => {
                if let Some(tokens) = envelope.data.get("input_tokens").and_then(Value::as_u64) {
                    self.input_tokens = tokens;
                }
                if let Some(tokens) = envelope.data.get("output_tokens").and_then(Value::as_u64) {
                    self.output_tokens = tokens;
                }
                StreamEventKind::End
            }
            "token" => StreamEventKind::Token,
            _ => StreamEventKind::Other,
        };

        Ok(Some(kind))
    }

    pub fn finish(self) -> Result<StreamedAnswer, StreamError> {
        let response = self
            .response
            .filter(|r| !r.is_empty())
            .ok_or(StreamError::MissingResponse)?;
        let conversation_id = self
            .conversation_id
            .ok_or(StreamError::MissingConversationId)?;

        Ok(StreamedAnswer {
            response,
            conversation_id,
            tool_calls: self.tool_calls,
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
        })
    }
}

/// Parses a complete, finite stream in one pass.
pub fn parse_stream<I, S>(lines: I) -> Result<StreamedAnswer, StreamError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parser = StreamParser::new();
    for line in lines {
        parser.push_line(line.as_ref())?;
    }
    parser.finish()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Both `tool_name` and `arguments` must be present.
fn parse_tool_call(token: &Value) -> Option<ToolCall> {
    let object = token.as_object()?;
    let tool_name = object.get("tool_name").and_then(Value::as_str)?;
    if tool_name.is_empty() {
        tracing::debug!("tool call missing tool_name field");
        return None;
    }
    let Some(arguments) = object.get("arguments") else {
        tracing::debug!(tool = %tool_name, "tool call missing arguments field");
        return None;
    };
    let arguments = match arguments {
        Value::Object(map) => map.clone().into_iter().collect(),
        other => {
            tracing::debug!(tool = %tool_name, arguments = %other, "tool call arguments are not an object");
            return None;
        }
    };

    Some(ToolCall {
        tool_name: tool_name.to_string(),
        arguments,
        result: object.get("result").filter(|v| !v.is_null()).cloned(),
    })
}

/// Pulls the next newline-terminated line out of `buffer`.
pub(crate) fn extract_line(buffer: &mut Vec<u8>) -> Option<String> {
    let position = buffer.iter().position(|byte| *byte == b'\n')?;
    let line: Vec<u8> = buffer.drain(..=position).collect();
    Some(
        String::from_utf8_lossy(&line)
            .trim_end_matches(['\r', '\n'])
            .to_string(),
    )
}
