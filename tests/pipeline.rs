use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use dialeval::{
    AgentClient, AgentRequest, AgentResponse, ApiConfig, ApiError, EvalError, EvaluationPipeline,
    JudgeCompletion, ScorerRegistry, ScriptError, ScriptExecutor, ScriptedJudge, SystemConfig,
    ToolCall, Verdict,
};

const DATA: &str = r#"
- conversation_group_id: pods
  tag: smoke
  cleanup_script: cleanup.sh
  turns:
    - turn_id: t1
      query: how many pods are running?
      expected_keywords: [["answer", "pods"]]
      expected_response: three pods
      turn_metrics: ["custom:keywords_eval", "custom:answer_correctness"]
    - turn_id: t2
      query: list the pods
      expected_tool_calls:
        - - tool_name: list_pods
            arguments:
              namespace: default
      turn_metrics: ["custom:tool_eval"]
- conversation_group_id: broken
  turns:
    - turn_id: t1
      query: first question
      expected_keywords: [["answer"]]
      turn_metrics: ["custom:keywords_eval"]
    - turn_id: t2
      query: unreachable question
      expected_keywords: [["answer"]]
      turn_metrics: ["custom:keywords_eval"]
    - turn_id: t3
      query: third question
      expected_keywords: [["answer"]]
      turn_metrics: ["custom:keywords_eval"]
"#;

/// Echoes the query, calls `list_pods` for listing queries and fails "unreachable" ones.
#[derive(Default)]
struct EchoAgent {
    requests: Mutex<Vec<AgentRequest>>,
}

#[async_trait]
impl AgentClient for EchoAgent {
    async fn query(&self, request: AgentRequest) -> Result<AgentResponse, ApiError> {
        let query = request.query.clone();
        let thread = request
            .conversation_id
            .clone()
            .unwrap_or_else(|| format!("thread-{query}"));
        self.requests.lock().unwrap().push(request);

        if query.contains("unreachable") {
            return Err(ApiError::Status {
                status: 502,
                message: "bad gateway".to_string(),
            });
        }
        let tool_calls = if query.starts_with("list") {
            vec![vec![ToolCall::new("list_pods").with_argument("namespace", "default")]]
        } else {
            Vec::new()
        };
        Ok(AgentResponse {
            response: format!("answer: there are three pods ({query})"),
            conversation_id: thread,
            tool_calls,
            input_tokens: 12,
            output_tokens: 4,
            ..AgentResponse::default()
        })
    }
}

#[derive(Default)]
struct RecordingScripts {
    outcomes: HashMap<PathBuf, bool>,
    runs: Mutex<Vec<PathBuf>>,
}

#[async_trait]
impl ScriptExecutor for RecordingScripts {
    async fn run_script(&self, path: &Path) -> Result<bool, ScriptError> {
        self.runs.lock().unwrap().push(path.to_path_buf());
        self.outcomes
            .get(path)
            .copied()
            .ok_or_else(|| ScriptError::NotFound(path.to_path_buf()))
    }
}

fn write_data(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("conversations.yaml");
    fs::write(&path, body).unwrap();
    path
}

fn config(output_dir: &Path) -> SystemConfig {
    let mut config = SystemConfig::default();
    config.output.output_dir = output_dir.to_path_buf();
    config
}

#[tokio::test]
async fn amends_evaluates_and_persists_conversations() {
    let dir = tempfile::tempdir().unwrap();
    let data = write_data(dir.path(), DATA);
    let output = dir.path().join("out");

    let agent = Arc::new(EchoAgent::default());
    let scripts = Arc::new(RecordingScripts {
        outcomes: HashMap::from([(PathBuf::from("cleanup.sh"), true)]),
        ..RecordingScripts::default()
    });
    let judge = Arc::new(ScriptedJudge::new([JudgeCompletion::new(
        "Score: 0.8\nReason: close to the expected answer",
    )]));

    let pipeline = EvaluationPipeline::builder(config(&output))
        .with_agent_client(agent.clone())
        .with_script_executor(scripts.clone())
        .with_judge(judge.clone())
        .build()
        .unwrap();
    let output_data = pipeline.run_path(&data).await.unwrap();
    let results = &output_data.results;

    assert!(output_data.validation.is_clean());
    assert_eq!(results.len(), 6);

    assert_eq!(results[0].metric_identifier, "custom:keywords_eval");
    assert_eq!(results[0].result, Verdict::Pass);
    assert_eq!(results[0].tag.as_deref(), Some("smoke"));
    assert_eq!(results[0].api_input_tokens, 12);
    assert_eq!(results[1].metric_identifier, "custom:answer_correctness");
    assert_eq!(results[1].result, Verdict::Pass);
    assert_eq!(results[1].score, Some(0.8));
    assert_eq!(results[2].metric_identifier, "custom:tool_eval");
    assert_eq!(results[2].result, Verdict::Pass);
    assert!(results[2].tool_calls.as_deref().unwrap().contains("list_pods"));

    assert_eq!(results[3].conversation_group_id, "broken");
    assert_eq!(results[3].result, Verdict::Pass);
    assert_eq!(results[4].result, Verdict::Error);
    assert_eq!(results[4].reason, "API Error: Agent API error: 502 - bad gateway");
    assert_eq!(results[5].turn_id.as_deref(), Some("t3"));
    assert_eq!(results[5].result, Verdict::Error);
    assert!(results[5].reason.starts_with("Cascade failure from turn t2"));

    // t3 of the broken conversation is never sent to the agent.
    let requests = agent.requests.lock().unwrap();
    assert_eq!(requests.len(), 4);
    assert_eq!(requests[1].conversation_id.as_deref(), Some("thread-how many pods are running?"));
    assert_eq!(*scripts.runs.lock().unwrap(), vec![PathBuf::from("cleanup.sh")]);
    assert_eq!(judge.prompts().len(), 1);

    let amended = output_data.amended_path.as_ref().unwrap();
    let name = amended.file_name().unwrap().to_str().unwrap();
    assert!(name.starts_with("conversations_amended_"));
    assert!(name.ends_with(".yaml"));

    let reloaded = dialeval::load_conversations(amended).unwrap();
    assert_eq!(reloaded.len(), 2);
    assert!(reloaded[0].turns[0]
        .response
        .as_deref()
        .unwrap()
        .starts_with("answer: there are three pods"));
    assert_eq!(reloaded[0].turns[1].tool_calls.as_ref().unwrap()[0][0].tool_name, "list_pods");
    assert_eq!(reloaded[1].turns[1].response, None);
}

#[tokio::test]
async fn static_mode_uses_declared_responses_and_skips_scripts() {
    let dir = tempfile::tempdir().unwrap();
    let data = write_data(
        dir.path(),
        r#"
- conversation_group_id: static
  setup_script: setup.sh
  turns:
    - turn_id: t1
      query: how many pods?
      response: There are three pods.
      expected_keywords: [["three", "pods"]]
      verify_script: verify.sh
      turn_metrics: ["custom:keywords_eval", "script:action_eval", "custom:keywords_evl"]
"#,
    );
    let output = dir.path().join("out");
    let scripts = Arc::new(RecordingScripts::default());

    let pipeline = EvaluationPipeline::builder(config(&output).with_api(ApiConfig::disabled()))
        .with_script_executor(scripts.clone())
        .with_scorer_registry(ScorerRegistry::builtin(None, scripts.clone()))
        .build()
        .unwrap();
    let output_data = pipeline.run_path(&data).await.unwrap();
    let results = &output_data.results;

    assert_eq!(results.len(), 3);
    assert_eq!(results[0].result, Verdict::Pass);
    assert_eq!(results[0].response, "There are three pods.");
    assert_eq!(results[1].result, Verdict::Skipped);
    assert_eq!(results[1].reason, "Script metrics require API mode");
    assert_eq!(results[2].result, Verdict::Error);
    assert_eq!(
        results[2].reason,
        "Invalid turn metric 'custom:keywords_evl', check validation errors"
    );
    assert_eq!(output_data.validation.metric_errors.len(), 1);
    assert!(output_data.validation.metric_errors[0].contains("did you mean 'custom:keywords_eval'"));

    assert!(scripts.runs.lock().unwrap().is_empty());
    assert!(output_data.amended_path.is_none());
    assert!(!output.exists());
    assert_eq!(output_data.error_summary().total_errors, 1);
}

#[tokio::test]
async fn structural_problems_abort_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let data = write_data(
        dir.path(),
        r#"
- conversation_group_id: dup
  turns:
    - turn_id: t1
      query: first
- conversation_group_id: dup
  turns:
    - turn_id: t1
      query: second
"#,
    );
    let agent = Arc::new(EchoAgent::default());
    let pipeline = EvaluationPipeline::builder(config(dir.path()))
        .with_agent_client(agent.clone())
        .with_scorer_registry(ScorerRegistry::builtin(None, Arc::new(RecordingScripts::default())))
        .build()
        .unwrap();

    let err = pipeline.run_path(&data).await.unwrap_err();
    match err {
        EvalError::Validation(errors) => {
            assert!(errors.0.iter().any(|e| e.contains("duplicate conversation_group_id: dup")));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(agent.requests.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_fields_fail_schema_validation() {
    let dir = tempfile::tempdir().unwrap();
    let data = write_data(
        dir.path(),
        r#"
- conversation_group_id: typo
  turns:
    - turn_id: t1
      query: hello
      expected_respons: oops
"#,
    );

    let err = dialeval::load_conversations(&data).unwrap_err();
    assert!(matches!(err, EvalError::Validation(_)));
}
