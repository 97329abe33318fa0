//! Turns failures into explicit result rows so nothing goes missing.

use crate::types::{ConversationSpec, EvaluationResult, TurnSpec, Verdict};

/// ERROR rows for one turn's metrics.
pub fn mark_turn_metrics_as_error(
    conversation: &ConversationSpec,
    turn: &TurnSpec,
    metrics: &[String],
    reason: &str,
) -> Vec<EvaluationResult> {
    tracing::warn!(
        conversation = %conversation.conversation_group_id,
        turn = %turn.turn_id,
        reason,
        "marking turn metrics as ERROR"
    );
    rows(conversation, Some(turn), metrics, Verdict::Error, reason)
}

pub fn mark_conversation_metrics_as_error(
    conversation: &ConversationSpec,
    metrics: &[String],
    reason: &str,
) -> Vec<EvaluationResult> {
    tracing::warn!(
        conversation = %conversation.conversation_group_id,
        count = metrics.len(),
        reason,
        "marking conversation metrics as ERROR"
    );
    rows(conversation, None, metrics, Verdict::Error, reason)
}

/// ERROR for every resolved turn metric and every conversation metric.
///
/// `turn_metrics[i]` belongs to `conversation.turns[i]`.
pub fn mark_all_metrics_as_error(
    conversation: &ConversationSpec,
    turn_metrics: &[Vec<String>],
    conversation_metrics: &[String],
    reason: &str,
) -> Vec<EvaluationResult> {
    tracing::warn!(
        conversation = %conversation.conversation_group_id,
        reason,
        "marking all metrics as ERROR"
    );
    let mut results: Vec<EvaluationResult> = conversation
        .turns
        .iter()
        .zip(turn_metrics)
        .flat_map(|(turn, metrics)| rows(conversation, Some(turn), metrics, Verdict::Error, reason))
        .collect();
    results.extend(mark_conversation_metrics_as_error(
        conversation,
        conversation_metrics,
        reason,
    ));
    results
}

/// An amendment failed at `failed_index`: that turn reports the API error,
/// every later turn and every conversation metric reports the cascade.
pub fn mark_cascade_failure(
    conversation: &ConversationSpec,
    failed_index: usize,
    turn_metrics: &[Vec<String>],
    conversation_metrics: &[String],
    error: &str,
) -> Vec<EvaluationResult> {
    let Some(failed_turn) = conversation.turns.get(failed_index) else {
        return Vec::new();
    };
    let own_reason = format!("API Error: {error}");
    let cascade_reason = format!(
        "Cascade failure from turn {} API error: {error}",
        failed_turn.turn_id
    );

    let mut results = mark_turn_metrics_as_error(
        conversation,
        failed_turn,
        turn_metrics.get(failed_index).map(Vec::as_slice).unwrap_or_default(),
        &own_reason,
    );
    for (turn, metrics) in conversation
        .turns
        .iter()
        .zip(turn_metrics)
        .skip(failed_index + 1)
    {
        results.extend(rows(conversation, Some(turn), metrics, Verdict::Error, &cascade_reason));
    }
    results.extend(mark_conversation_metrics_as_error(
        conversation,
        conversation_metrics,
        &cascade_reason,
    ));
    results
}

/// SKIPPED rows for turns after `failed_index` and for all conversation metrics.
pub fn mark_remaining_as_skipped(
    conversation: &ConversationSpec,
    failed_index: usize,
    turn_metrics: &[Vec<String>],
    conversation_metrics: &[String],
) -> Vec<EvaluationResult> {
    let Some(failed_turn) = conversation.turns.get(failed_index) else {
        return Vec::new();
    };
    let reason = format!("Skipped due to failure in turn {}", failed_turn.turn_id);
    tracing::info!(
        conversation = %conversation.conversation_group_id,
        turn = %failed_turn.turn_id,
        "skipping remaining evaluations after failure"
    );

    let mut results: Vec<EvaluationResult> = conversation
        .turns
        .iter()
        .zip(turn_metrics)
        .skip(failed_index + 1)
        .flat_map(|(turn, metrics)| rows(conversation, Some(turn), metrics, Verdict::Skipped, &reason))
        .collect();
    results.extend(rows(conversation, None, conversation_metrics, Verdict::Skipped, &reason));
    results
}

fn rows(
    conversation: &ConversationSpec,
    turn: Option<&TurnSpec>,
    metrics: &[String],
    verdict: Verdict,
    reason: &str,
) -> Vec<EvaluationResult> {
    metrics
        .iter()
        .map(|metric| EvaluationResult::new(conversation, turn, metric.as_str(), verdict, reason))
        .collect()
}

/// Counts of ERROR rows, split by level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ErrorSummary {
    pub total_errors: usize,
    pub turn_errors: usize,
    pub conversation_errors: usize,
}

impl ErrorSummary {
    pub fn from_results(results: &[EvaluationResult]) -> Self {
        results
            .iter()
            .filter(|r| r.result == Verdict::Error)
            .fold(Self::default(), |mut summary, result| {
                summary.total_errors += 1;
                if result.is_turn_level() {
                    summary.turn_errors += 1;
                } else {
                    summary.conversation_errors += 1;
                }
                summary
            })
    }
}
