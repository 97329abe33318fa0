use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = EvalError> = std::result::Result<T, E>;

/// Failures that abort a run before any conversation starts.
#[derive(Debug, Error)]
pub enum EvalError {
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("data validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse system config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: &'static str, message: String },

    #[error("unsupported endpoint type: {0}, must be one of streaming, query")]
    UnsupportedEndpoint(String),

    #[error("invalid logging filter: {0}")]
    Logging(String),
}

/// Structural problems found while validating conversation specs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<String>);

impl ValidationErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn push(&mut self, message: impl Into<String>) {
        self.0.push(message.into());
    }
}

impl std::fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} error(s): {}", self.0.len(), self.0.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

/// Transport failures talking to the agent under test.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("API {endpoint} query timeout after {seconds} seconds")]
    Timeout { endpoint: &'static str, seconds: u64 },

    #[error("Agent API error: {status} - {message}")]
    Status { status: u16, message: String },

    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error("Response validation error: {0}")]
    InvalidResponse(String),

    #[error("Unexpected error in {operation}: {source}")]
    Http {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("Streaming API error: {0}")]
    Api(String),

    #[error("No final response found in streaming output")]
    MissingResponse,

    #[error("No Conversation ID found")]
    MissingConversationId,
}

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Script not found: {0}")]
    NotFound(PathBuf),

    #[error("Script path is not a file: {0}")]
    NotAFile(PathBuf),

    #[error("Script timeout after {seconds}s: {path}")]
    Timeout { path: PathBuf, seconds: u64 },

    #[error("Error running script {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("missing API key: set the {0} environment variable")]
    MissingApiKey(String),

    #[error("LLM returned empty response")]
    EmptyResponse,

    #[error("prompt rendering failed: {0}")]
    Template(String),
}

/// Raised by a scorer when the metric cannot be computed at all.
#[derive(Debug, Error)]
pub enum ScoreError {
    #[error(transparent)]
    Judge(#[from] JudgeError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("{0}")]
    Other(String),
}
