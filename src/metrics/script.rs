use crate::{
    metrics::MetricOutcome,
    script::ScriptExecutor,
    types::EvaluationRequest,
};

/// `script:action_eval`: the turn's verify script decides, exit 0 scores 1.0.
pub async fn evaluate_action(
    executor: &dyn ScriptExecutor,
    metric_name: &str,
    request: &EvaluationRequest<'_>,
) -> MetricOutcome {
    let Some(turn) = request.turn_data() else {
        return MetricOutcome::unscored("Script evaluation is only supported for turn-level metrics");
    };
    if metric_name != "action_eval" {
        return MetricOutcome::unscored(format!("Unsupported script metric: {metric_name}"));
    }
    let Some(ref script) = turn.verify_script else {
        return MetricOutcome::unscored("No verify script provided");
    };

    match executor.run_script(script).await {
        Ok(true) => MetricOutcome::scored(1.0, format!("Verify script passed: {}", script.display())),
        Ok(false) => MetricOutcome::scored(0.0, format!("Verify script failed: {}", script.display())),
        Err(e) => {
            tracing::error!(script = %script.display(), error = %e, "verify script could not run");
            MetricOutcome::unscored(format!("Script execution error: {e}"))
        }
    }
}
