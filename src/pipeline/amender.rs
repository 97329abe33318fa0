use std::sync::Arc;

use crate::{
    agent::{AgentClient, AgentRequest},
    error::ApiError,
    types::TurnSpec,
};

/// Fills a declared turn with a live answer from the agent.
#[derive(Clone)]
pub struct ApiDataAmender {
    client: Arc<dyn AgentClient>,
}

impl ApiDataAmender {
    pub fn new(client: Arc<dyn AgentClient>) -> Self {
        Self { client }
    }

    /// Queries the agent for `turn` and returns an amended copy.
    ///
    /// Contexts and tool calls are only replaced when the agent returned some.
    /// On error the caller keeps its original turn.
    pub async fn amend_turn(
        &self,
        turn: &TurnSpec,
        conversation_id: Option<&str>,
    ) -> Result<TurnSpec, ApiError> {
        tracing::debug!(
            turn = %turn.turn_id,
            conversation_id = conversation_id.unwrap_or("<new>"),
            "querying agent"
        );

        let request = AgentRequest::new(turn.query.clone())
            .with_conversation_id(conversation_id.map(str::to_string))
            .with_attachments(turn.attachments.iter().cloned());
        let answer = self.client.query(request).await?;

        let mut amended = turn.clone();
        amended.response = Some(answer.response);
        amended.conversation_id = Some(answer.conversation_id);
        if !answer.contexts.is_empty() {
            tracing::debug!(turn = %turn.turn_id, count = answer.contexts.len(), "contexts amended");
            amended.contexts = Some(answer.contexts);
        }
        if !answer.tool_calls.is_empty() {
            tracing::debug!(turn = %turn.turn_id, count = answer.tool_calls.len(), "tool calls amended");
            amended.tool_calls = Some(answer.tool_calls);
        }
        amended.api_input_tokens += answer.input_tokens;
        amended.api_output_tokens += answer.output_tokens;
        if answer.time_to_first_token.is_some() {
            amended.time_to_first_token = answer.time_to_first_token;
        }
        if answer.streaming_duration.is_some() {
            amended.streaming_duration = answer.streaming_duration;
        }

        Ok(amended)
    }
}
