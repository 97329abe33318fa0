use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::ScriptError;

/// Runs setup, cleanup and verification scripts.
#[async_trait]
pub trait ScriptExecutor: Send + Sync {
    /// `Ok(true)` when the script exited with status 0.
    async fn run_script(&self, path: &Path) -> Result<bool, ScriptError>;
}

/// Executes scripts as child processes, inheriting the current environment.
#[derive(Debug, Clone)]
pub struct ProcessScriptExecutor {
    timeout: Duration,
}

impl ProcessScriptExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn resolve(path: &Path) -> Result<PathBuf, ScriptError> {
        let resolved = if path.is_absolute() {
            path.to_path_buf()
        } else {
            std::env::current_dir()
                .map(|cwd| cwd.join(path))
                .unwrap_or_else(|_| path.to_path_buf())
        };

        if !resolved.exists() {
            return Err(ScriptError::NotFound(resolved));
        }
        if !resolved.is_file() {
            return Err(ScriptError::NotAFile(resolved));
        }
        Ok(resolved)
    }
}

impl Default for ProcessScriptExecutor {
    fn default() -> Self {
        Self::new(Duration::from_secs(crate::config::DEFAULT_SCRIPT_TIMEOUT_SECS))
    }
}

#[async_trait]
impl ScriptExecutor for ProcessScriptExecutor {
    async fn run_script(&self, path: &Path) -> Result<bool, ScriptError> {
        let script = Self::resolve(path)?;
        tracing::debug!(script = %script.display(), "running script");

        let child = Command::new(&script)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(source)) => {
                return Err(ScriptError::Spawn {
                    path: script,
                    source,
                })
            }
            Err(_) => {
                return Err(ScriptError::Timeout {
                    path: script,
                    seconds: self.timeout.as_secs(),
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            tracing::debug!(script = %script.display(), "stdout: {}", stdout.trim());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let success = output.status.success();
        if !stderr.trim().is_empty() {
            if success {
                tracing::debug!(script = %script.display(), "stderr: {}", stderr.trim());
            } else {
                tracing::error!(script = %script.display(), "stderr: {}", stderr.trim());
            }
        }

        if success {
            tracing::debug!(script = %script.display(), "script completed successfully");
        } else {
            tracing::warn!(
                script = %script.display(),
                code = ?output.status.code(),
                "script failed"
            );
        }
        Ok(success)
    }
}
