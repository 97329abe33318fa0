use std::{collections::BTreeMap, env, fs, path::Path, path::PathBuf, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::{error::ConfigError, types::MetadataMap};

pub const DEFAULT_API_BASE: &str = "http://localhost:8080";
pub const DEFAULT_API_TIMEOUT_SECS: u64 = 300;
pub const DEFAULT_PROVIDER: &str = "openai";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_OUTPUT_DIR: &str = "./eval_output";
pub const DEFAULT_SCRIPT_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointType {
    Streaming,
    Query,
}

impl Default for EndpointType {
    fn default() -> Self {
        Self::Streaming
    }
}

impl FromStr for EndpointType {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "streaming" => Ok(Self::Streaming),
            "query" => Ok(Self::Query),
            other => Err(ConfigError::UnsupportedEndpoint(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub api_base: String,
    pub endpoint_type: EndpointType,
    /// Seconds.
    pub timeout: u64,
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub no_tools: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            api_base: DEFAULT_API_BASE.to_string(),
            endpoint_type: EndpointType::default(),
            timeout: DEFAULT_API_TIMEOUT_SECS,
            provider: DEFAULT_PROVIDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            no_tools: None,
            system_prompt: None,
        }
    }
}

impl ApiConfig {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JudgeConfig {
    pub provider: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// Seconds.
    pub timeout: u64,
    pub num_retries: u32,
    pub api_key_env: String,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            provider: DEFAULT_PROVIDER.to_string(),
            model: DEFAULT_MODEL.to_string(),
            base_url: None,
            temperature: 0.0,
            max_tokens: 512,
            timeout: DEFAULT_API_TIMEOUT_SECS,
            num_retries: 3,
            api_key_env: "OPENAI_API_KEY".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    pub output_dir: PathBuf,
    pub base_filename: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
            base_filename: "evaluation".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Level for this crate's own targets.
    pub source_level: String,
    /// Level for every other target.
    pub package_level: String,
    pub package_overrides: BTreeMap<String, String>,
    pub show_timestamps: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            source_level: "info".to_string(),
            package_level: "warn".to_string(),
            package_overrides: BTreeMap::new(),
            show_timestamps: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptConfig {
    /// Seconds.
    pub timeout: u64,
}

impl Default for ScriptConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SCRIPT_TIMEOUT_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub api: ApiConfig,
    pub judge: JudgeConfig,
    pub output: OutputConfig,
    pub logging: LoggingConfig,
    pub scripts: ScriptConfig,
    pub default_turn_metrics_metadata: MetadataMap,
    pub default_conversation_metrics_metadata: MetadataMap,
    pub skip_on_failure: bool,
    pub max_concurrency: usize,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            judge: JudgeConfig::default(),
            output: OutputConfig::default(),
            logging: LoggingConfig::default(),
            scripts: ScriptConfig::default(),
            default_turn_metrics_metadata: MetadataMap::new(),
            default_conversation_metrics_metadata: MetadataMap::new(),
            skip_on_failure: false,
            max_concurrency: 1,
        }
    }
}

impl SystemConfig {
    pub fn from_yaml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Applies `DIALEVAL_*` environment overrides on top of the file values.
    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(api_base) = env::var("DIALEVAL_API_BASE") {
            self.api.api_base = api_base;
        }
        if let Ok(enabled) = env::var("DIALEVAL_API_ENABLED") {
            self.api.enabled = parse_bool("DIALEVAL_API_ENABLED", &enabled)?;
        }
        if let Ok(endpoint) = env::var("DIALEVAL_ENDPOINT_TYPE") {
            self.api.endpoint_type = endpoint.parse()?;
        }
        if let Ok(output_dir) = env::var("DIALEVAL_OUTPUT_DIR") {
            self.output.output_dir = PathBuf::from(output_dir);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn with_api(mut self, api: ApiConfig) -> Self {
        self.api = api;
        self
    }

    pub fn with_default_turn_metric(
        mut self,
        metric: impl Into<String>,
        metadata: crate::types::MetricMetadata,
    ) -> Self {
        self.default_turn_metrics_metadata.insert(metric.into(), metadata);
        self
    }

    pub fn with_default_conversation_metric(
        mut self,
        metric: impl Into<String>,
        metadata: crate::types::MetricMetadata,
    ) -> Self {
        self.default_conversation_metrics_metadata
            .insert(metric.into(), metadata);
        self
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.api.enabled && self.api.api_base.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "api.api_base",
                message: "must not be empty when the API is enabled".to_string(),
            });
        }
        if self.api.timeout == 0 {
            return Err(ConfigError::InvalidValue {
                field: "api.timeout",
                message: "must be greater than zero".to_string(),
            });
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "max_concurrency",
                message: "must be at least 1".to_string(),
            });
        }
        let thresholds = self
            .default_turn_metrics_metadata
            .iter()
            .chain(self.default_conversation_metrics_metadata.iter());
        for (metric, metadata) in thresholds {
            if let Some(threshold) = metadata.threshold {
                if !(0.0..=1.0).contains(&threshold) {
                    return Err(ConfigError::InvalidValue {
                        field: "threshold",
                        message: format!("{metric}: {threshold} is outside 0.0..=1.0"),
                    });
                }
            }
        }
        Ok(())
    }
}

fn parse_bool(field: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            field,
            message: format!("expected a boolean, got {other}"),
        }),
    }
}

fn normalize_level(level: &str) -> Result<&'static str, ConfigError> {
    match level.trim().to_ascii_lowercase().as_str() {
        "trace" => Ok("trace"),
        "debug" => Ok("debug"),
        "info" => Ok("info"),
        "warn" | "warning" => Ok("warn"),
        "error" | "critical" => Ok("error"),
        "off" => Ok("off"),
        other => Err(ConfigError::Logging(format!("unknown level {other}"))),
    }
}

/// Builds an `EnvFilter` directive string from the logging section.
pub fn build_filter_directives(logging: &LoggingConfig) -> Result<String, ConfigError> {
    let mut directives = vec![
        normalize_level(&logging.package_level)?.to_string(),
        format!("{}={}", env!("CARGO_CRATE_NAME"), normalize_level(&logging.source_level)?),
    ];
    for (target, level) in &logging.package_overrides {
        directives.push(format!("{target}={}", normalize_level(level)?));
    }
    Ok(directives.join(","))
}

/// Installs the global subscriber. `RUST_LOG` takes precedence over the config.
///
/// Calling this more than once keeps the first subscriber.
pub fn init_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let filter = match env::var("RUST_LOG") {
        Ok(directives) => EnvFilter::try_new(directives),
        Err(_) => EnvFilter::try_new(build_filter_directives(logging)?),
    }
    .map_err(|e| ConfigError::Logging(e.to_string()))?;

    let timed = logging.show_timestamps.then(|| tracing_subscriber::fmt::layer());
    let untimed = (!logging.show_timestamps).then(|| tracing_subscriber::fmt::layer().without_time());

    if tracing_subscriber::registry()
        .with(filter)
        .with(timed)
        .with(untimed)
        .try_init()
        .is_err()
    {
        tracing::debug!("tracing subscriber already installed");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_missing_sections() {
        let config = SystemConfig::from_yaml_str("skip_on_failure: true\n").unwrap();
        assert!(config.skip_on_failure);
        assert!(config.api.enabled);
        assert_eq!(config.api.api_base, DEFAULT_API_BASE);
        assert_eq!(config.api.endpoint_type, EndpointType::Streaming);
        assert_eq!(config.api.timeout, 300);
        assert_eq!(config.output.output_dir, PathBuf::from("./eval_output"));
        assert_eq!(config.scripts.timeout, 300);
    }

    #[test]
    fn parses_metric_metadata_sections() {
        let yaml = r#"
api:
  enabled: false
  endpoint_type: query
default_turn_metrics_metadata:
  "custom:tool_eval":
    threshold: 1.0
    default: true
    ordered: false
  "custom:answer_correctness":
    threshold: 0.75
default_conversation_metrics_metadata:
  "custom:conversation_quality":
    threshold: 0.6
"#;
        let config = SystemConfig::from_yaml_str(yaml).unwrap();
        assert!(!config.api.enabled);
        assert_eq!(config.api.endpoint_type, EndpointType::Query);
        let tool_eval = &config.default_turn_metrics_metadata["custom:tool_eval"];
        assert!(tool_eval.default);
        assert_eq!(tool_eval.ordered, Some(false));
        assert_eq!(config.default_conversation_metrics_metadata.len(), 1);
    }

    #[test]
    fn rejects_unknown_endpoint_type() {
        assert!(SystemConfig::from_yaml_str("api:\n  endpoint_type: grpc\n").is_err());
        assert!(matches!(
            "grpc".parse::<EndpointType>(),
            Err(ConfigError::UnsupportedEndpoint(_))
        ));
    }

    #[test]
    fn rejects_out_of_range_threshold() {
        let yaml = "default_turn_metrics_metadata:\n  \"custom:x\":\n    threshold: 1.5\n";
        assert!(matches!(
            SystemConfig::from_yaml_str(yaml),
            Err(ConfigError::InvalidValue { field: "threshold", .. })
        ));
    }

    #[test]
    fn filter_directives_include_overrides() {
        let mut logging = LoggingConfig::default();
        logging.source_level = "DEBUG".to_string();
        logging.package_level = "warning".to_string();
        logging
            .package_overrides
            .insert("reqwest".to_string(), "error".to_string());

        let directives = build_filter_directives(&logging).unwrap();
        assert_eq!(directives, "warn,dialeval=debug,reqwest=error");
    }

    #[test]
    fn filter_directives_reject_unknown_level() {
        let mut logging = LoggingConfig::default();
        logging.source_level = "loud".to_string();
        assert!(matches!(
            build_filter_directives(&logging),
            Err(ConfigError::Logging(_))
        ));
    }
}
