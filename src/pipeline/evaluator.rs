use std::{sync::Arc, time::Instant};

use serde::Serialize;
use serde_json::Value;

use crate::{
    metrics::{split_metric_identifier, MetricManager, ScorerRegistry, DEFAULT_THRESHOLD},
    types::{EvaluationRequest, EvaluationResult, TokenCounter, Verdict},
};

/// Scores one (conversation, turn?, metric) request and applies its threshold.
#[derive(Debug, Clone)]
pub struct MetricsEvaluator {
    manager: MetricManager,
    registry: Arc<ScorerRegistry>,
    api_enabled: bool,
}

impl MetricsEvaluator {
    pub fn new(manager: MetricManager, registry: Arc<ScorerRegistry>, api_enabled: bool) -> Self {
        Self {
            manager,
            registry,
            api_enabled,
        }
    }

    /// Always yields exactly one result; failures become ERROR rows.
    pub async fn evaluate_metric(&self, request: EvaluationRequest<'_>) -> EvaluationResult {
        let started = Instant::now();
        let metric = request.metric_identifier;
        match request.turn_id() {
            Some(turn) => tracing::debug!(turn, metric, "evaluating"),
            None => tracing::debug!(
                conversation = %request.conversation.conversation_group_id,
                metric,
                "evaluating"
            ),
        }

        let Some((framework, metric_name)) = split_metric_identifier(metric) else {
            return self.error_result(&request, format!("Invalid metric identifier: {metric}"), started);
        };
        let Some(scorer) = self.registry.scorer_for(metric) else {
            return self.error_result(&request, format!("Unsupported framework: {framework}"), started);
        };

        if scorer.requires_api() && !self.api_enabled {
            tracing::debug!(metric, "skipping script metric, API disabled");
            return EvaluationResult::new(
                request.conversation,
                request.turn_data(),
                metric,
                Verdict::Skipped,
                "Script metrics require API mode",
            )
            .with_turn_echo(request.turn_data());
        }

        let level = request.level();
        let metadata = self.manager.metric_metadata(
            metric,
            level,
            Some(request.conversation),
            request.turn_data(),
        );

        let mut tokens = TokenCounter::new();
        let outcome = scorer
            .evaluate(metric_name, &request, metadata, &mut tokens)
            .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(metric, error = %e, "metric evaluation failed");
                let mut result = self.error_result(&request, format!("Evaluation error: {e}"), started);
                result.judge_llm_input_tokens = tokens.input_tokens;
                result.judge_llm_output_tokens = tokens.output_tokens;
                return result;
            }
        };

        let Some(score) = outcome.score else {
            let mut result = self.error_result(&request, outcome.reason, started);
            result.judge_llm_input_tokens = tokens.input_tokens;
            result.judge_llm_output_tokens = tokens.output_tokens;
            return result;
        };

        let threshold = metadata
            .and_then(|m| m.threshold)
            .unwrap_or(DEFAULT_THRESHOLD);
        let verdict = Verdict::from_score(score, threshold);
        tracing::debug!(metric, score, threshold, verdict = %verdict, "metric evaluated");

        let turn = request.turn_data();
        let mut result = EvaluationResult::new(request.conversation, turn, metric, verdict, outcome.reason)
            .with_turn_echo(turn);
        result.score = Some(score);
        result.threshold = Some(threshold);
        result.execution_time = started.elapsed().as_secs_f64();
        result.judge_llm_input_tokens = tokens.input_tokens;
        result.judge_llm_output_tokens = tokens.output_tokens;
        result.metrics_metadata = self.metadata_echo(&request);
        if let Some(turn) = turn {
            result.tool_calls = to_json_str(&turn.tool_calls);
            result.contexts = to_json_str(&turn.contexts);
            result.expected_response = turn.expected_response.clone();
            result.expected_intent = turn.expected_intent.clone();
            result.expected_keywords = to_json_str(&turn.expected_keywords);
            result.expected_tool_calls = to_json_str(&turn.expected_tool_calls);
        }
        result
    }

    fn error_result(
        &self,
        request: &EvaluationRequest<'_>,
        reason: String,
        started: Instant,
    ) -> EvaluationResult {
        let turn = request.turn_data();
        let mut result = EvaluationResult::new(
            request.conversation,
            turn,
            request.metric_identifier,
            Verdict::Error,
            reason,
        )
        .with_turn_echo(turn);
        result.execution_time = started.elapsed().as_secs_f64();
        result.metrics_metadata = self.metadata_echo(request);
        result
    }

    /// Effective metadata without the threshold, which has its own column.
    fn metadata_echo(&self, request: &EvaluationRequest<'_>) -> Option<String> {
        let metadata = self.manager.metric_metadata(
            request.metric_identifier,
            request.level(),
            Some(request.conversation),
            request.turn_data(),
        )?;
        let Ok(Value::Object(mut fields)) = serde_json::to_value(metadata) else {
            return None;
        };
        fields.remove("threshold");
        if fields.is_empty() {
            return None;
        }
        serde_json::to_string(&fields).ok()
    }
}

/// `None` for missing or empty values.
fn to_json_str<T: Serialize>(value: &Option<T>) -> Option<String> {
    let value = serde_json::to_value(value.as_ref()?).ok()?;
    match value {
        Value::Null => None,
        Value::Array(ref items) if items.is_empty() => None,
        Value::Object(ref fields) if fields.is_empty() => None,
        other => serde_json::to_string(&other).ok(),
    }
}
