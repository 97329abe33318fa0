pub mod agent;
pub mod config;
pub mod error;
pub mod judge;
pub mod loader;
pub mod metrics;
pub mod pipeline;
pub mod script;
pub mod types;

pub use error::{ApiError, ConfigError, EvalError, JudgeError, Result, ScoreError, ScriptError, ValidationErrors};
pub use config::{
    init_logging, ApiConfig, EndpointType, JudgeConfig, LoggingConfig, OutputConfig, ScriptConfig,
    SystemConfig,
};
pub use types::{
    ConversationSpec, EvaluationRequest, EvaluationResult, ExpectedToolCalls, MetadataMap,
    MetricLevel, MetricMetadata, TokenCounter, TokenUsage, ToolCall, ToolCallSequence, TurnSpec,
    Verdict,
};
pub use agent::{
    AgentClient, AgentRequest, AgentResponse, Attachment, HttpAgentClient, HttpAgentConfig,
    StreamParser, StreamedAnswer,
};
pub use judge::{JudgeCompletion, JudgeModel, OpenAIJudge, OpenAIJudgeConfig, ScriptedJudge};
pub use script::{ProcessScriptExecutor, ScriptExecutor};
pub use metrics::{
    JudgedFramework, MetricManager, MetricOutcome, Scorer, ScorerRegistry, DEFAULT_THRESHOLD,
};
pub use loader::{
    load_conversations, save_amended_conversations, DataValidator, ValidationReport,
};
pub use pipeline::{
    ApiDataAmender, ConversationProcessor, ErrorSummary, EvaluationPipeline,
    EvaluationPipelineBuilder, MetricsEvaluator, PipelineOutput, ProcessedConversation,
};
