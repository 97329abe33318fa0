pub mod amender;
pub mod errors;
pub mod evaluator;
pub mod processor;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures_util::{stream, StreamExt};

use crate::{
    agent::{AgentClient, HttpAgentClient, HttpAgentConfig},
    config::SystemConfig,
    error::{ConfigError, Result},
    judge::{JudgeModel, OpenAIJudge},
    loader::{load_conversations, save_amended_conversations, DataValidator, ValidationReport},
    metrics::{MetricManager, ScorerRegistry},
    script::{ProcessScriptExecutor, ScriptExecutor},
    types::{ConversationSpec, EvaluationResult},
};

pub use amender::ApiDataAmender;
pub use errors::ErrorSummary;
pub use evaluator::MetricsEvaluator;
pub use processor::{ConversationProcessor, ProcessedConversation};

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Flat result list, conversations in input order.
    pub results: Vec<EvaluationResult>,
    /// Conversations after amendment.
    pub conversations: Vec<ConversationSpec>,
    pub amended_path: Option<PathBuf>,
    pub validation: ValidationReport,
}

impl PipelineOutput {
    pub fn error_summary(&self) -> ErrorSummary {
        ErrorSummary::from_results(&self.results)
    }
}

pub struct EvaluationPipelineBuilder {
    config: SystemConfig,
    agent: Option<Arc<dyn AgentClient>>,
    judge: Option<Arc<dyn JudgeModel>>,
    scripts: Option<Arc<dyn ScriptExecutor>>,
    registry: Option<ScorerRegistry>,
}

impl EvaluationPipelineBuilder {
    pub fn with_agent_client(mut self, agent: Arc<dyn AgentClient>) -> Self {
        self.agent = Some(agent);
        self
    }

    pub fn with_judge(mut self, judge: Arc<dyn JudgeModel>) -> Self {
        self.judge = Some(judge);
        self
    }

    pub fn with_script_executor(mut self, scripts: Arc<dyn ScriptExecutor>) -> Self {
        self.scripts = Some(scripts);
        self
    }

    /// Replaces the built-in scorers entirely.
    pub fn with_scorer_registry(mut self, registry: ScorerRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Missing collaborators are built from the config: an HTTP agent client
    /// (API enabled only), an OpenAI-compatible judge when its key is set, and
    /// a process script runner.
    pub fn build(self) -> Result<EvaluationPipeline> {
        let config = Arc::new(self.config);

        let scripts = self.scripts.unwrap_or_else(|| {
            Arc::new(ProcessScriptExecutor::new(Duration::from_secs(config.scripts.timeout)))
        });

        let registry = match self.registry {
            Some(registry) => registry,
            None => {
                let judge = self.judge.or_else(|| match OpenAIJudge::from_judge_config(&config.judge) {
                    Ok(judge) => Some(Arc::new(judge) as Arc<dyn JudgeModel>),
                    Err(e) => {
                        tracing::warn!(error = %e, "judge model unavailable, judged metrics disabled");
                        None
                    }
                });
                ScorerRegistry::builtin(judge, scripts.clone())
            }
        };
        let registry = Arc::new(registry);

        let amender = if config.api.enabled {
            let agent = match self.agent {
                Some(agent) => agent,
                None => {
                    let client = HttpAgentClient::from_config(HttpAgentConfig::from_api_config(&config.api))
                        .map_err(|e| ConfigError::InvalidValue {
                            field: "api",
                            message: e.to_string(),
                        })?;
                    Arc::new(client) as Arc<dyn AgentClient>
                }
            };
            Some(ApiDataAmender::new(agent))
        } else {
            None
        };

        let manager = MetricManager::new(config.clone());
        let evaluator = MetricsEvaluator::new(manager.clone(), registry.clone(), config.api.enabled);
        let processor = ConversationProcessor::new(config.clone(), evaluator, amender, scripts);

        Ok(EvaluationPipeline {
            config,
            manager,
            registry,
            processor,
        })
    }
}

/// Validates, processes and persists a batch of conversations.
pub struct EvaluationPipeline {
    config: Arc<SystemConfig>,
    manager: MetricManager,
    registry: Arc<ScorerRegistry>,
    processor: ConversationProcessor,
}

impl EvaluationPipeline {
    pub fn builder(config: SystemConfig) -> EvaluationPipelineBuilder {
        EvaluationPipelineBuilder {
            config,
            agent: None,
            judge: None,
            scripts: None,
            registry: None,
        }
    }

    pub fn config(&self) -> &SystemConfig {
        &self.config
    }

    pub fn registry(&self) -> &ScorerRegistry {
        &self.registry
    }

    pub async fn run_path(&self, path: impl AsRef<Path>) -> Result<PipelineOutput> {
        let path = path.as_ref();
        let conversations = load_conversations(path)?;
        self.run(conversations, Some(path)).await
    }

    /// Conversations are processed concurrently up to `max_concurrency`;
    /// turns within a conversation are always sequential.
    pub async fn run(
        &self,
        mut conversations: Vec<ConversationSpec>,
        original_path: Option<&Path>,
    ) -> Result<PipelineOutput> {
        let validation = DataValidator::new(&self.config, &self.registry, self.manager.clone())
            .validate(&mut conversations)?;

        tracing::info!(
            conversations = conversations.len(),
            api = self.config.api.enabled,
            "starting evaluation"
        );

        let processed: Vec<ProcessedConversation> = stream::iter(conversations)
            .map(|conversation| self.processor.process_conversation(conversation))
            .buffered(self.config.max_concurrency.max(1))
            .collect()
            .await;

        let mut results = Vec::new();
        let mut conversations = Vec::with_capacity(processed.len());
        for item in processed {
            results.extend(item.results);
            conversations.push(item.conversation);
        }

        let amended_path = match original_path {
            Some(original) if self.config.api.enabled => {
                match save_amended_conversations(&conversations, original, &self.config.output.output_dir) {
                    Ok(path) => Some(path),
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to save amended evaluation data");
                        None
                    }
                }
            }
            _ => None,
        };

        let summary = ErrorSummary::from_results(&results);
        tracing::info!(
            results = results.len(),
            errors = summary.total_errors,
            "evaluation finished"
        );

        Ok(PipelineOutput {
            results,
            conversations,
            amended_path,
            validation,
        })
    }
}
