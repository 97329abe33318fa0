use std::sync::Arc;

use crate::{
    config::SystemConfig,
    types::{ConversationSpec, MetadataMap, MetricLevel, MetricMetadata, TurnSpec},
};

/// Threshold applied when no metadata names one.
pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Decides which metrics apply where, and at what threshold.
#[derive(Debug, Clone)]
pub struct MetricManager {
    config: Arc<SystemConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSummary {
    pub turn_metrics: usize,
    pub conversation_metrics: usize,
    pub total_turns: usize,
}

impl MetricManager {
    pub fn new(config: Arc<SystemConfig>) -> Self {
        Self { config }
    }

    /// `None` selects the level's `default: true` metrics, `Some([])` selects
    /// nothing, and an explicit list is returned unchanged.
    pub fn resolve_metrics(&self, metrics: Option<&[String]>, level: MetricLevel) -> Vec<String> {
        match metrics {
            None => self.default_metrics(level),
            Some(list) => list.to_vec(),
        }
    }

    pub fn resolve_turn_metrics(&self, turn: &TurnSpec) -> Vec<String> {
        self.resolve_metrics(turn.turn_metrics.as_deref(), MetricLevel::Turn)
    }

    pub fn resolve_conversation_metrics(&self, conversation: &ConversationSpec) -> Vec<String> {
        self.resolve_metrics(
            conversation.conversation_metrics.as_deref(),
            MetricLevel::Conversation,
        )
    }

    /// Level metadata first (turn for TURN, conversation for CONVERSATION),
    /// then the system defaults of that level.
    pub fn metric_metadata<'a>(
        &'a self,
        metric: &str,
        level: MetricLevel,
        conversation: Option<&'a ConversationSpec>,
        turn: Option<&'a TurnSpec>,
    ) -> Option<&'a MetricMetadata> {
        let level_metadata = match level {
            MetricLevel::Turn => turn.map(|t| &t.turn_metrics_metadata),
            MetricLevel::Conversation => conversation.map(|c| &c.conversation_metrics_metadata),
        };

        level_metadata
            .and_then(|metadata| metadata.get(metric))
            .or_else(|| self.system_metadata(level).get(metric))
    }

    pub fn effective_threshold(
        &self,
        metric: &str,
        level: MetricLevel,
        conversation: Option<&ConversationSpec>,
        turn: Option<&TurnSpec>,
    ) -> Option<f64> {
        self.metric_metadata(metric, level, conversation, turn)
            .and_then(|metadata| metadata.threshold)
    }

    pub fn count_metrics_for_conversation(&self, conversation: &ConversationSpec) -> MetricsSummary {
        MetricsSummary {
            turn_metrics: conversation
                .turns
                .iter()
                .map(|turn| self.resolve_turn_metrics(turn).len())
                .sum(),
            conversation_metrics: self.resolve_conversation_metrics(conversation).len(),
            total_turns: conversation.turns.len(),
        }
    }

    pub fn system_metadata(&self, level: MetricLevel) -> &MetadataMap {
        match level {
            MetricLevel::Turn => &self.config.default_turn_metrics_metadata,
            MetricLevel::Conversation => &self.config.default_conversation_metrics_metadata,
        }
    }

    fn default_metrics(&self, level: MetricLevel) -> Vec<String> {
        self.system_metadata(level)
            .iter()
            .filter(|(_, metadata)| metadata.default)
            .map(|(metric, _)| metric.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> MetricManager {
        let config = SystemConfig::default()
            .with_default_turn_metric(
                "custom:answer_correctness",
                MetricMetadata::with_threshold(0.7).as_default(),
            )
            .with_default_turn_metric("custom:tool_eval", MetricMetadata::with_threshold(1.0))
            .with_default_turn_metric("custom:keywords_eval", MetricMetadata::default().as_default())
            .with_default_conversation_metric(
                "custom:conversation_quality",
                MetricMetadata::with_threshold(0.6).as_default(),
            );
        MetricManager::new(Arc::new(config))
    }

    #[test]
    fn unset_resolves_to_level_defaults() {
        let manager = manager();
        assert_eq!(
            manager.resolve_metrics(None, MetricLevel::Turn),
            vec!["custom:answer_correctness", "custom:keywords_eval"]
        );
        assert_eq!(
            manager.resolve_metrics(None, MetricLevel::Conversation),
            vec!["custom:conversation_quality"]
        );
    }

    #[test]
    fn defaults_follow_config_declaration_order() {
        let config = SystemConfig::from_yaml_str(
            r#"
default_turn_metrics_metadata:
  custom:tool_eval:
    default: true
  custom:answer_correctness:
    default: true
  ragas:faithfulness:
    threshold: 0.8
  custom:keywords_eval:
    default: true
"#,
        )
        .unwrap();
        let manager = MetricManager::new(Arc::new(config));

        assert_eq!(
            manager.resolve_metrics(None, MetricLevel::Turn),
            vec!["custom:tool_eval", "custom:answer_correctness", "custom:keywords_eval"]
        );
    }

    #[test]
    fn empty_resolves_to_nothing_and_explicit_is_verbatim() {
        let manager = manager();
        let empty: Vec<String> = Vec::new();
        assert!(manager.resolve_metrics(Some(&empty), MetricLevel::Turn).is_empty());

        let explicit = vec!["ragas:faithfulness".to_string(), "custom:tool_eval".to_string()];
        assert_eq!(
            manager.resolve_metrics(Some(&explicit), MetricLevel::Turn),
            explicit
        );
        assert_eq!(
            manager.resolve_metrics(Some(&explicit), MetricLevel::Conversation),
            explicit
        );
    }

    #[test]
    fn resolution_is_idempotent() {
        let manager = manager();
        let first = manager.resolve_metrics(None, MetricLevel::Turn);
        let second = manager.resolve_metrics(None, MetricLevel::Turn);
        assert_eq!(first, second);
    }

    #[test]
    fn turn_override_beats_system_default() {
        let manager = manager();
        let turn = TurnSpec::new("t1", "q")
            .with_metric_metadata("custom:answer_correctness", MetricMetadata::with_threshold(0.95));
        let conversation = ConversationSpec::new("c1", vec![turn.clone()]);

        let threshold = manager.effective_threshold(
            "custom:answer_correctness",
            MetricLevel::Turn,
            Some(&conversation),
            Some(&turn),
        );
        assert_eq!(threshold, Some(0.95));
    }

    #[test]
    fn falls_back_to_system_default_then_none() {
        let manager = manager();
        let turn = TurnSpec::new("t1", "q");
        assert_eq!(
            manager.effective_threshold("custom:answer_correctness", MetricLevel::Turn, None, Some(&turn)),
            Some(0.7)
        );
        assert_eq!(
            manager.effective_threshold("ragas:faithfulness", MetricLevel::Turn, None, Some(&turn)),
            None
        );
    }

    #[test]
    fn level_metadata_does_not_leak_across_levels() {
        let manager = manager();
        let turn = TurnSpec::new("t1", "q").with_metric_metadata(
            "custom:conversation_quality",
            MetricMetadata::with_threshold(0.99),
        );
        let mut conversation = ConversationSpec::new("c1", vec![turn.clone()]);
        conversation.conversation_metrics_metadata.insert(
            "custom:answer_correctness".to_string(),
            MetricMetadata::with_threshold(0.11),
        );

        assert_eq!(
            manager.effective_threshold(
                "custom:conversation_quality",
                MetricLevel::Conversation,
                Some(&conversation),
                Some(&turn),
            ),
            Some(0.6)
        );
        assert_eq!(
            manager.effective_threshold(
                "custom:answer_correctness",
                MetricLevel::Turn,
                Some(&conversation),
                Some(&turn),
            ),
            Some(0.7)
        );
    }

    #[test]
    fn metadata_carries_matcher_flags() {
        let manager = manager();
        let mut metadata = MetricMetadata::with_threshold(1.0);
        metadata.ordered = Some(false);
        let turn = TurnSpec::new("t1", "q").with_metric_metadata("custom:tool_eval", metadata);

        let resolved = manager
            .metric_metadata("custom:tool_eval", MetricLevel::Turn, None, Some(&turn))
            .unwrap();
        assert_eq!(resolved.ordered, Some(false));
    }

    #[test]
    fn counts_metrics_across_turns() {
        let manager = manager();
        let conversation = ConversationSpec::new(
            "c1",
            vec![
                TurnSpec::new("t1", "q"),
                TurnSpec::new("t2", "q").with_turn_metrics(Vec::<String>::new()),
                TurnSpec::new("t3", "q").with_turn_metrics(["custom:tool_eval"]),
            ],
        );
        assert_eq!(
            manager.count_metrics_for_conversation(&conversation),
            MetricsSummary {
                turn_metrics: 3,
                conversation_metrics: 1,
                total_turns: 3,
            }
        );
    }
}
