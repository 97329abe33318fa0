//! Reading, validating and persisting conversation files.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
};

use jsonschema::{Draft, JSONSchema};
use serde_json::Value;

use crate::{
    config::SystemConfig,
    error::{EvalError, Result, ValidationErrors},
    metrics::{split_metric_identifier, MetricManager, ScorerRegistry},
    types::{ConversationSpec, MetadataMap, MetricLevel, TurnSpec},
};

/// Loads conversations from a YAML/JSON file, or every such file in a directory
/// (sorted by file name). The documents are checked against the schema first.
pub fn load_conversations(path: impl AsRef<Path>) -> Result<Vec<ConversationSpec>> {
    let path = path.as_ref();
    let files = if path.is_dir() {
        let mut files = Vec::new();
        for entry in fs::read_dir(path)? {
            let p = entry?.path();
            let ext = p.extension().and_then(|s| s.to_str()).unwrap_or("");
            if matches!(ext, "yaml" | "yml" | "json") {
                files.push(p);
            }
        }
        files.sort();
        files
    } else {
        vec![path.to_path_buf()]
    };

    let mut conversations = Vec::new();
    for file in files {
        let document = read_document(&file)?;
        validate_schema(&document).map_err(|mut errors| {
            for message in &mut errors.0 {
                *message = format!("{}: {message}", file.display());
            }
            errors
        })?;
        let mut loaded: Vec<ConversationSpec> = serde_json::from_value(document)?;
        tracing::debug!(file = %file.display(), count = loaded.len(), "loaded conversations");
        conversations.append(&mut loaded);
    }
    Ok(conversations)
}

fn read_document(path: &Path) -> Result<Value> {
    let bytes = fs::read(path)?;
    let ext = path.extension().and_then(|s| s.to_str()).unwrap_or("");
    let document = if ext == "json" {
        serde_json::from_slice(&bytes)?
    } else {
        serde_yaml::from_slice(&bytes)?
    };
    Ok(document)
}

/// JSON schema of a conversation file.
pub fn conversation_schema() -> std::result::Result<Value, serde_json::Error> {
    serde_json::to_value(schemars::schema_for!(Vec<ConversationSpec>))
}

pub fn validate_schema(document: &Value) -> std::result::Result<(), ValidationErrors> {
    let schema = conversation_schema()
        .map_err(|e| ValidationErrors(vec![format!("conversation schema unavailable: {e}")]))?;
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(&schema)
        .map_err(|e| ValidationErrors(vec![format!("invalid conversation schema: {e}")]))?;

    if let Err(errors) = compiled.validate(document) {
        return Err(ValidationErrors(
            errors
                .take(20)
                .map(|e| format!("schema violation at '{}': {e}", e.instance_path))
                .collect(),
        ));
    }
    Ok(())
}

/// Problems that do not stop the run; the affected metrics were marked invalid.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub metric_errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_clean(&self) -> bool {
        self.metric_errors.is_empty()
    }
}

/// Semantic checks on loaded conversations.
///
/// Structural problems are returned as errors. Unknown metrics and metrics
/// missing their required fields are recorded in the turn's (or
/// conversation's) invalid set so the processor reports them as ERROR rows.
pub struct DataValidator<'a> {
    config: &'a SystemConfig,
    registry: &'a ScorerRegistry,
    manager: MetricManager,
}

impl<'a> DataValidator<'a> {
    pub fn new(config: &'a SystemConfig, registry: &'a ScorerRegistry, manager: MetricManager) -> Self {
        Self {
            config,
            registry,
            manager,
        }
    }

    pub fn validate(
        &self,
        conversations: &mut [ConversationSpec],
    ) -> std::result::Result<ValidationReport, ValidationErrors> {
        let mut errors = ValidationErrors::default();
        let mut report = ValidationReport::default();
        let mut group_ids = HashSet::new();

        for conversation in conversations.iter_mut() {
            let id = conversation.conversation_group_id.clone();
            if id.trim().is_empty() {
                errors.push("conversation_group_id must not be empty");
            } else if !group_ids.insert(id.clone()) {
                errors.push(format!("duplicate conversation_group_id: {id}"));
            }
            if conversation.turns.is_empty() {
                errors.push(format!("conversation {id}: at least one turn is required"));
            }

            if let Some(ref mut metrics) = conversation.conversation_metrics {
                check_identifiers(metrics, &format!("conversation {id}"), &mut errors);
            }
            check_thresholds(
                &conversation.conversation_metrics_metadata,
                &format!("conversation {id}"),
                &mut errors,
            );

            let mut turn_ids = HashSet::new();
            for turn in conversation.turns.iter_mut() {
                let scope = format!("conversation {id}, turn {}", turn.turn_id);
                if turn.turn_id.trim().is_empty() {
                    errors.push(format!("conversation {id}: turn_id must not be empty"));
                } else if !turn_ids.insert(turn.turn_id.clone()) {
                    errors.push(format!("conversation {id}: duplicate turn_id {}", turn.turn_id));
                }
                if turn.query.trim().is_empty() {
                    errors.push(format!("{scope}: query must not be empty"));
                }
                if let Some(ref mut metrics) = turn.turn_metrics {
                    check_identifiers(metrics, &scope, &mut errors);
                }
                check_thresholds(&turn.turn_metrics_metadata, &scope, &mut errors);
                check_expected_tool_calls(turn, &scope, &mut errors);
            }

            if !errors.is_empty() {
                continue;
            }

            let conversation_metrics = self.manager.resolve_conversation_metrics(conversation);
            for metric in conversation_metrics {
                if let Some(problem) = self.unknown_metric(&metric, MetricLevel::Conversation) {
                    report.metric_errors.push(format!("conversation {id}: {problem}"));
                    conversation.invalid_metrics.insert(metric);
                }
            }

            for turn in conversation.turns.iter_mut() {
                for metric in self.manager.resolve_turn_metrics(turn) {
                    let problem = self
                        .unknown_metric(&metric, MetricLevel::Turn)
                        .or_else(|| self.missing_fields(&metric, turn));
                    if let Some(problem) = problem {
                        report
                            .metric_errors
                            .push(format!("conversation {id}, turn {}: {problem}", turn.turn_id));
                        turn.invalid_metrics.insert(metric);
                    }
                }
            }
        }

        if !errors.is_empty() {
            return Err(errors);
        }
        for problem in &report.metric_errors {
            tracing::error!("{problem}");
        }
        Ok(report)
    }

    fn unknown_metric(&self, metric: &str, level: MetricLevel) -> Option<String> {
        if self.registry.is_known(metric) || self.manager.system_metadata(level).contains_key(metric) {
            return None;
        }
        let candidates = self
            .registry
            .known_metrics()
            .chain(self.manager.system_metadata(level).keys().map(String::as_str));
        Some(match suggest(metric, candidates) {
            Some(suggestion) => format!("unknown metric '{metric}', did you mean '{suggestion}'?"),
            None => format!("unknown metric '{metric}'"),
        })
    }

    /// Fields the agent API fills in are not required while it is enabled.
    fn missing_fields(&self, metric: &str, turn: &TurnSpec) -> Option<String> {
        let api = self.config.api.enabled;
        let mut missing = Vec::new();

        if !api && turn.response.as_deref().map_or(true, |r| r.trim().is_empty()) {
            missing.push("response");
        }
        match metric {
            "custom:tool_eval" => {
                if turn.expected_tool_calls.is_none() {
                    missing.push("expected_tool_calls");
                }
                if !api && turn.tool_calls.is_none() {
                    missing.push("tool_calls");
                }
            }
            "custom:keywords_eval" if turn.expected_keywords.is_none() => missing.push("expected_keywords"),
            "custom:answer_correctness" if turn.expected_response.is_none() => {
                missing.push("expected_response")
            }
            "custom:intent_eval" if turn.expected_intent.is_none() => missing.push("expected_intent"),
            "script:action_eval" if turn.verify_script.is_none() => missing.push("verify_script"),
            _ => {}
        }

        (!missing.is_empty())
            .then(|| format!("metric '{metric}' requires field(s): {}", missing.join(", ")))
    }
}

/// Rejects malformed ids and drops duplicates, keeping the first occurrence.
fn check_identifiers(metrics: &mut Vec<String>, scope: &str, errors: &mut ValidationErrors) {
    let mut seen = HashSet::new();
    metrics.retain(|metric| {
        if split_metric_identifier(metric).is_none() {
            errors.push(format!(
                "{scope}: metric '{metric}' must have the form 'framework:metric_name'"
            ));
        }
        let first = seen.insert(metric.clone());
        if !first {
            tracing::warn!(scope, metric = %metric, "duplicate metric removed");
        }
        first
    });
}

fn check_thresholds(metadata: &MetadataMap, scope: &str, errors: &mut ValidationErrors) {
    for (metric, meta) in metadata {
        if let Some(threshold) = meta.threshold.filter(|t| !(0.0..=1.0).contains(t)) {
            errors.push(format!(
                "{scope}: threshold {threshold} for metric '{metric}' is outside 0.0..=1.0"
            ));
        }
    }
}

fn check_expected_tool_calls(turn: &TurnSpec, scope: &str, errors: &mut ValidationErrors) {
    let Some(ref expected) = turn.expected_tool_calls else {
        return;
    };
    let alternatives = expected.alternatives();
    let empty = alternatives.iter().filter(|alternative| alternative.is_empty()).count();

    if alternatives.is_empty() {
        errors.push(format!("{scope}: expected_tool_calls must declare at least one alternative"));
    } else if alternatives.len() == 1 && empty == 1 {
        errors.push(format!(
            "{scope}: an empty tool-call alternative cannot be the only alternative"
        ));
    } else if empty > 1 {
        errors.push(format!("{scope}: at most one empty tool-call alternative is allowed"));
    }

    for (index, alternative) in alternatives.iter().enumerate() {
        if alternative.iter().any(Vec::is_empty) {
            errors.push(format!(
                "{scope}: alternative {} contains an empty tool-call sequence",
                index + 1
            ));
        }
    }
}

fn suggest<'a>(metric: &str, candidates: impl Iterator<Item = &'a str>) -> Option<&'a str> {
    candidates
        .map(|candidate| (strsim::levenshtein(metric, candidate), candidate))
        .filter(|(distance, _)| *distance <= 3)
        .min_by_key(|(distance, _)| *distance)
        .map(|(_, candidate)| candidate)
}

/// Writes the amended conversations next to a timestamped name derived from
/// the original file: `{stem}_amended_{YYYYmmdd_HHMMSS}{.ext}`.
pub fn save_amended_conversations(
    conversations: &[ConversationSpec],
    original_path: &Path,
    output_dir: &Path,
) -> Result<PathBuf> {
    fs::create_dir_all(output_dir)?;

    let stem = original_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("evaluation_data");
    let ext = original_path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("yaml");
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let path = output_dir.join(format!("{stem}_amended_{timestamp}.{ext}"));

    let body = if ext == "json" {
        serde_json::to_string_pretty(conversations)?
    } else {
        serde_yaml::to_string(conversations)?
    };
    fs::write(&path, body).map_err(EvalError::Io)?;
    tracing::info!(path = %path.display(), "amended evaluation data saved");
    Ok(path)
}
