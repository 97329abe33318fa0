use std::{path::Path, sync::Arc};

use crate::{
    config::SystemConfig,
    metrics::MetricManager,
    pipeline::{
        amender::ApiDataAmender,
        errors::{mark_all_metrics_as_error, mark_cascade_failure, mark_remaining_as_skipped},
        evaluator::MetricsEvaluator,
    },
    script::ScriptExecutor,
    types::{ConversationSpec, EvaluationRequest, EvaluationResult, Verdict},
};

/// A conversation after processing: amended turns plus its result rows.
#[derive(Debug, Clone)]
pub struct ProcessedConversation {
    pub conversation: ConversationSpec,
    pub results: Vec<EvaluationResult>,
}

/// Drives one conversation through setup, turns, conversation metrics and cleanup.
#[derive(Clone)]
pub struct ConversationProcessor {
    config: Arc<SystemConfig>,
    manager: MetricManager,
    evaluator: MetricsEvaluator,
    amender: Option<ApiDataAmender>,
    scripts: Arc<dyn ScriptExecutor>,
}

enum Stop {
    Cascade,
    Skip,
}

impl ConversationProcessor {
    /// `amender` is `None` when the agent API is disabled; scripts then never run.
    pub fn new(
        config: Arc<SystemConfig>,
        evaluator: MetricsEvaluator,
        amender: Option<ApiDataAmender>,
        scripts: Arc<dyn ScriptExecutor>,
    ) -> Self {
        Self {
            manager: MetricManager::new(config.clone()),
            config,
            evaluator,
            amender,
            scripts,
        }
    }

    fn api_enabled(&self) -> bool {
        self.amender.is_some()
    }

    pub async fn process_conversation(&self, mut conversation: ConversationSpec) -> ProcessedConversation {
        let id = conversation.conversation_group_id.clone();
        tracing::info!(conversation = %id, "evaluating conversation");

        let turn_metrics: Vec<Vec<String>> = conversation
            .turns
            .iter()
            .map(|turn| self.manager.resolve_turn_metrics(turn))
            .collect();
        let conversation_metrics = self.manager.resolve_conversation_metrics(&conversation);

        if turn_metrics.iter().all(Vec::is_empty) && conversation_metrics.is_empty() {
            tracing::debug!(conversation = %id, "no metrics apply, skipping");
            return ProcessedConversation {
                conversation,
                results: Vec::new(),
            };
        }

        let summary = self.manager.count_metrics_for_conversation(&conversation);
        tracing::debug!(
            conversation = %id,
            turn_metrics = summary.turn_metrics,
            conversation_metrics = summary.conversation_metrics,
            turns = summary.total_turns,
            "resolved metrics"
        );

        if let Some(reason) = self.run_setup(&conversation).await {
            let results =
                mark_all_metrics_as_error(&conversation, &turn_metrics, &conversation_metrics, &reason);
            self.run_cleanup(&conversation).await;
            return ProcessedConversation {
                conversation,
                results,
            };
        }

        let skip_on_failure = conversation
            .skip_on_failure
            .unwrap_or(self.config.skip_on_failure);
        let mut results = Vec::new();
        let mut stop = None;
        let mut conversation_id: Option<String> = None;

        for index in 0..conversation.turns.len() {
            if let Some(ref amender) = self.amender {
                let turn = &conversation.turns[index];
                // Declared ids only seed the first turn; afterwards the live thread wins.
                let thread_id = match conversation_id {
                    Some(ref threaded) => Some(threaded.clone()),
                    None if index == 0 => turn.conversation_id.clone(),
                    None => None,
                };
                match amender.amend_turn(turn, thread_id.as_deref()).await {
                    Ok(amended) => {
                        conversation_id = amended.conversation_id.clone();
                        conversation.turns[index] = amended;
                    }
                    Err(e) => {
                        tracing::error!(
                            conversation = %id,
                            turn = %turn.turn_id,
                            error = %e,
                            "API amendment failed, cascading errors"
                        );
                        results.extend(mark_cascade_failure(
                            &conversation,
                            index,
                            &turn_metrics,
                            &conversation_metrics,
                            &e.to_string(),
                        ));
                        stop = Some(Stop::Cascade);
                        break;
                    }
                }
            }

            let turn_results = self
                .evaluate_turn(&conversation, index, &turn_metrics[index])
                .await;
            let failed = turn_results.iter().any(|r| r.result.is_failure());
            results.extend(turn_results);

            if skip_on_failure && failed {
                results.extend(mark_remaining_as_skipped(
                    &conversation,
                    index,
                    &turn_metrics,
                    &conversation_metrics,
                ));
                stop = Some(Stop::Skip);
                break;
            }
        }

        if stop.is_none() {
            results.extend(
                self.evaluate_conversation(&conversation, &conversation_metrics)
                    .await,
            );
        }

        self.run_cleanup(&conversation).await;

        if let Some(Stop::Cascade) = stop {
            tracing::warn!(conversation = %id, "conversation ended early after API error");
        }

        ProcessedConversation {
            conversation,
            results,
        }
    }

    async fn evaluate_turn(
        &self,
        conversation: &ConversationSpec,
        index: usize,
        metrics: &[String],
    ) -> Vec<EvaluationResult> {
        let turn = &conversation.turns[index];
        let mut results = Vec::with_capacity(metrics.len());
        for metric in metrics {
            if turn.is_metric_invalid(metric) {
                tracing::error!(turn = %turn.turn_id, metric = %metric, "invalid turn metric, not evaluated");
                results.push(EvaluationResult::new(
                    conversation,
                    Some(turn),
                    metric.as_str(),
                    Verdict::Error,
                    format!("Invalid turn metric '{metric}', check validation errors"),
                ));
                continue;
            }
            let request = EvaluationRequest::for_turn(conversation, metric, index, turn);
            results.push(self.evaluator.evaluate_metric(request).await);
        }
        results
    }

    async fn evaluate_conversation(
        &self,
        conversation: &ConversationSpec,
        metrics: &[String],
    ) -> Vec<EvaluationResult> {
        let mut results = Vec::with_capacity(metrics.len());
        for metric in metrics {
            if conversation.is_metric_invalid(metric) {
                tracing::error!(
                    conversation = %conversation.conversation_group_id,
                    metric = %metric,
                    "invalid conversation metric, not evaluated"
                );
                results.push(EvaluationResult::new(
                    conversation,
                    None,
                    metric.as_str(),
                    Verdict::Error,
                    format!("Invalid conversation metric '{metric}', check validation errors"),
                ));
                continue;
            }
            let request = EvaluationRequest::for_conversation(conversation, metric);
            results.push(self.evaluator.evaluate_metric(request).await);
        }
        results
    }

    /// Returns the failure reason, if any.
    async fn run_setup(&self, conversation: &ConversationSpec) -> Option<String> {
        if !self.api_enabled() {
            return None;
        }
        let script = conversation.setup_script.as_deref()?;
        tracing::debug!(conversation = %conversation.conversation_group_id, script = %script.display(), "running setup script");
        match self.scripts.run_script(script).await {
            Ok(true) => None,
            Ok(false) => Some(format!("Setup script failed: {}", script.display())),
            Err(e) => Some(format!("Setup script error: {e}")),
        }
    }

    async fn run_cleanup(&self, conversation: &ConversationSpec) {
        if !self.api_enabled() {
            return;
        }
        let Some(script) = conversation.cleanup_script.as_deref() else {
            return;
        };
        match self.scripts.run_script(script).await {
            Ok(true) => tracing::debug!(script = %script.display(), "cleanup script completed"),
            Ok(false) => warn_cleanup(script, "script returned non-zero exit status"),
            Err(e) => warn_cleanup(script, &e.to_string()),
        }
    }
}

fn warn_cleanup(script: &Path, error: &str) {
    tracing::warn!(script = %script.display(), error, "cleanup script failed");
}
