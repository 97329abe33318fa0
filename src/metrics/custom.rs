//! Judge-model backed metrics: answer correctness and intent.

use std::sync::Arc;

use handlebars::Handlebars;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::json;

use crate::{
    error::{JudgeError, ScoreError},
    judge::JudgeModel,
    metrics::MetricOutcome,
    types::{EvaluationRequest, TokenCounter, TurnSpec},
};

const ANSWER_CORRECTNESS_PROMPT: &str = "Evaluate the answer correctness of the given response.

Question: {{query}}
Response: {{response}}
Expected Response: {{expected_response}}

Consider:
- Factual accuracy compared to expected response
- Completeness of information
- Alignment with expected response
- Absence of contradictory information

Rate the answer correctness and provide your reasoning.

Format your response as:
Score: [your score on a scale of 0.0 to 1.0]
Reason: [your detailed explanation]";

const INTENT_EVALUATION_PROMPT: &str = "Evaluate whether the response demonstrates the expected intent or purpose.

Question: {{query}}
Response: {{response}}
Expected Intent: {{expected_intent}}

Consider:
- What the response is trying to accomplish
- Whether that matches the expected intent
- The style and approach, not the factual content

Format your response as:
Score: [1 if the intent matches, 0 if it does not]
Reason: [your detailed explanation]";

static RE_FRACTION: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d+\.?\d*)/(\d+\.?\d*)").unwrap());
static RE_OUT_OF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+\.?\d*)\s+out\s+of\s+(\d+\.?\d*)").unwrap());
static RE_DECIMAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+\.\d+").unwrap());
static RE_INTEGER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// The `custom:` metrics that need a judge model.
pub struct JudgedMetrics {
    judge: Arc<dyn JudgeModel>,
    templates: Handlebars<'static>,
}

impl JudgedMetrics {
    pub const SUPPORTED: [&'static str; 2] = ["answer_correctness", "intent_eval"];

    pub fn new(judge: Arc<dyn JudgeModel>) -> Self {
        let mut templates = Handlebars::new();
        templates.register_escape_fn(handlebars::no_escape);
        Self { judge, templates }
    }

    pub fn judge_name(&self) -> &str {
        self.judge.name()
    }

    pub async fn evaluate(
        &self,
        metric_name: &str,
        request: &EvaluationRequest<'_>,
        tokens: &mut TokenCounter,
    ) -> Result<MetricOutcome, ScoreError> {
        let Some(turn) = request.turn_data() else {
            return Ok(MetricOutcome::unscored(match metric_name {
                "intent_eval" => "Intent evaluation is a turn-level metric",
                _ => "Answer correctness is a turn-level metric",
            }));
        };

        match metric_name {
            "answer_correctness" => self.answer_correctness(turn, tokens).await,
            "intent_eval" => self.intent(turn, tokens).await,
            other => Ok(MetricOutcome::unscored(format!(
                "Unsupported custom metric: {other}"
            ))),
        }
    }

    async fn answer_correctness(
        &self,
        turn: &TurnSpec,
        tokens: &mut TokenCounter,
    ) -> Result<MetricOutcome, ScoreError> {
        let prompt = self.render(
            ANSWER_CORRECTNESS_PROMPT,
            &json!({
                "query": turn.query,
                "response": turn.response.as_deref().unwrap_or_default(),
                "expected_response": turn.expected_response.as_deref().unwrap_or_default(),
            }),
        )?;

        Ok(match self.ask(&prompt, tokens).await {
            Ok(text) => match parse_score_response(&text) {
                (Some(score), reason) => MetricOutcome::scored(
                    score,
                    format!("Custom answer correctness: {score:.2} - {reason}"),
                ),
                (None, _) => unparsable(&text),
            },
            Err(e) => MetricOutcome::unscored(format!(
                "Answer correctness evaluation failed: {e}"
            )),
        })
    }

    async fn intent(&self, turn: &TurnSpec, tokens: &mut TokenCounter) -> Result<MetricOutcome, ScoreError> {
        let Some(expected_intent) = turn.expected_intent.as_deref() else {
            return Ok(MetricOutcome::unscored(
                "No expected intent provided for intent evaluation",
            ));
        };
        let prompt = self.render(
            INTENT_EVALUATION_PROMPT,
            &json!({
                "query": turn.query,
                "response": turn.response.as_deref().unwrap_or_default(),
                "expected_intent": expected_intent,
            }),
        )?;

        Ok(match self.ask(&prompt, tokens).await {
            Ok(text) => match parse_score_response(&text) {
                (Some(score), reason) => {
                    MetricOutcome::scored(score, format!("Intent evaluation: {score:.2} - {reason}"))
                }
                (None, _) => unparsable(&text),
            },
            Err(e) => MetricOutcome::unscored(format!("Intent evaluation failed: {e}")),
        })
    }

    fn render(&self, template: &str, data: &serde_json::Value) -> Result<String, ScoreError> {
        self.templates
            .render_template(template, data)
            .map_err(|e| JudgeError::Template(e.to_string()).into())
    }

    async fn ask(&self, prompt: &str, tokens: &mut TokenCounter) -> Result<String, JudgeError> {
        let completion = self.judge.complete(prompt).await?;
        if let Some(ref usage) = completion.usage {
            tokens.record(usage);
        }
        Ok(completion.text)
    }
}

fn unparsable(text: &str) -> MetricOutcome {
    let head: String = text.chars().take(100).collect();
    MetricOutcome::unscored(format!("Could not parse score from LLM response: {head}..."))
}

/// Reads `Score:` and `Reason:` lines, falling back to numbers found anywhere
/// in the text. Scores above 1 are rescaled from 0-10 or 0-100.
pub fn parse_score_response(text: &str) -> (Option<f64>, String) {
    let mut score = None;
    let mut reason = text.to_string();

    for line in text.lines().map(str::trim) {
        if let Some(value) = strip_label(line, "score:") {
            if let Ok(parsed) = value.parse::<f64>() {
                score = Some(parsed);
            }
        } else if let Some(value) = strip_label(line, "reason:") {
            reason = value.to_string();
        }
    }

    let score = score.or_else(|| extract_score_from_text(text)).map(|score| {
        if score > 1.0 && score <= 10.0 {
            score / 10.0
        } else if score > 10.0 && score <= 100.0 {
            score / 100.0
        } else {
            score
        }
    });

    (score, reason)
}

fn strip_label<'a>(line: &'a str, label: &str) -> Option<&'a str> {
    let head = line.get(..label.len())?;
    head.eq_ignore_ascii_case(label)
        .then(|| line[label.len()..].trim())
}

fn extract_score_from_text(text: &str) -> Option<f64> {
    for pattern in [&*RE_FRACTION, &*RE_OUT_OF] {
        if let Some(captures) = pattern.captures(text) {
            let numerator: f64 = captures[1].parse().ok()?;
            let denominator: f64 = captures[2].parse().ok()?;
            return (denominator > 0.0).then(|| numerator / denominator);
        }
    }

    RE_DECIMAL
        .find(text)
        .or_else(|| RE_INTEGER.find(text))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        judge::{JudgeCompletion, ScriptedJudge},
        types::{ConversationSpec, TokenUsage},
    };

    fn conversation(turn: TurnSpec) -> ConversationSpec {
        ConversationSpec::new("conv", vec![turn])
    }

    #[test]
    fn parses_labelled_score_and_reason() {
        let (score, reason) = parse_score_response("Score: 0.85\nReason: mostly right");
        assert_eq!(score, Some(0.85));
        assert_eq!(reason, "mostly right");
    }

    #[test]
    fn falls_back_to_patterns_in_text() {
        assert_eq!(parse_score_response("I'd give it 8.5/10").0, Some(0.85));
        assert_eq!(parse_score_response("Rating: 4 out of 5").0, Some(0.8));
        assert_eq!(parse_score_response("roughly 0.4 overall").0, Some(0.4));
        assert_eq!(parse_score_response("SCORE: 7").0, Some(0.7));
        assert_eq!(parse_score_response("a solid 85").0, Some(0.85));
        assert_eq!(parse_score_response("no number here").0, None);
        assert_eq!(parse_score_response("3/0").0, None);
    }

    #[tokio::test]
    async fn answer_correctness_renders_prompt_and_counts_tokens() {
        let judge = Arc::new(ScriptedJudge::new([JudgeCompletion::new(
            "Score: 0.9\nReason: matches the expected answer",
        )
        .with_usage(TokenUsage {
            prompt_tokens: 40,
            completion_tokens: 9,
            total_tokens: 49,
        })]));
        let metrics = JudgedMetrics::new(judge.clone());

        let mut turn = TurnSpec::new("t1", "What is <b>OpenShift</b>?").with_response("A platform");
        turn.expected_response = Some("A Kubernetes platform".to_string());
        let conv = conversation(turn);
        let request =
            EvaluationRequest::for_turn(&conv, "custom:answer_correctness", 0, &conv.turns[0]);

        let mut tokens = TokenCounter::new();
        let outcome = metrics
            .evaluate("answer_correctness", &request, &mut tokens)
            .await
            .unwrap();

        assert_eq!(outcome.score, Some(0.9));
        assert_eq!(
            outcome.reason,
            "Custom answer correctness: 0.90 - matches the expected answer"
        );
        assert_eq!(tokens.input_tokens, 40);
        assert_eq!(tokens.output_tokens, 9);

        let prompts = judge.prompts();
        assert!(prompts[0].contains("Question: What is <b>OpenShift</b>?"));
        assert!(prompts[0].contains("Expected Response: A Kubernetes platform"));
    }

    #[tokio::test]
    async fn unparsable_judge_output_has_no_score() {
        let judge = Arc::new(ScriptedJudge::new([JudgeCompletion::new("cannot decide")]));
        let metrics = JudgedMetrics::new(judge);
        let conv = conversation(TurnSpec::new("t1", "q").with_response("r"));
        let request = EvaluationRequest::for_turn(&conv, "custom:answer_correctness", 0, &conv.turns[0]);

        let outcome = metrics
            .evaluate("answer_correctness", &request, &mut TokenCounter::new())
            .await
            .unwrap();
        assert_eq!(outcome.score, None);
        assert!(outcome.reason.starts_with("Could not parse score from LLM response: cannot decide"));
    }

    #[tokio::test]
    async fn judge_failure_becomes_unscored_outcome() {
        let metrics = JudgedMetrics::new(Arc::new(ScriptedJudge::new([])));
        let mut turn = TurnSpec::new("t1", "q").with_response("r");
        turn.expected_intent = Some("explain".to_string());
        let conv = conversation(turn);
        let request = EvaluationRequest::for_turn(&conv, "custom:intent_eval", 0, &conv.turns[0]);

        let outcome = metrics
            .evaluate("intent_eval", &request, &mut TokenCounter::new())
            .await
            .unwrap();
        assert_eq!(outcome.score, None);
        assert!(outcome.reason.starts_with("Intent evaluation failed:"), "{}", outcome.reason);
    }

    #[tokio::test]
    async fn conversation_scope_is_rejected() {
        let metrics = JudgedMetrics::new(Arc::new(ScriptedJudge::new([])));
        let conv = conversation(TurnSpec::new("t1", "q"));
        let request = EvaluationRequest::for_conversation(&conv, "custom:answer_correctness");

        let outcome = metrics
            .evaluate("answer_correctness", &request, &mut TokenCounter::new())
            .await
            .unwrap();
        assert_eq!(outcome.reason, "Answer correctness is a turn-level metric");
    }
}
