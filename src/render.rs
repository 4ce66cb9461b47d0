//! Slide renderers.
//!
//! A [`SlideRenderer`] turns assembled deck markdown into presentation
//! output. Two implementations are available:
//!
//! | Name | Output |
//! |------|--------|
//! | `passthrough` | The markdown itself, unchanged |
//! | `marp` | Standalone HTML from the `marp` CLI |

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

use crate::config::RenderConfig;
use crate::error::CompileError;
use crate::runtime::{run_with_timeout, ProcessFailure};

#[async_trait]
pub trait SlideRenderer: Send + Sync {
    fn name(&self) -> &str;

    async fn render(&self, markup: &str) -> Result<String, CompileError>;
}

/// Returns the markup unchanged.
pub struct PassthroughRenderer;

#[async_trait]
impl SlideRenderer for PassthroughRenderer {
    fn name(&self) -> &str {
        "passthrough"
    }

    async fn render(&self, markup: &str) -> Result<String, CompileError> {
        Ok(markup.to_string())
    }
}

/// Shells out to `marp --html deck.md -o deck.html` in a scratch directory.
pub struct MarpCliRenderer {
    command: PathBuf,
    timeout: Duration,
}

impl MarpCliRenderer {
    pub fn new(config: &RenderConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

fn render_error(message: impl Into<String>) -> CompileError {
    CompileError::Render {
        message: message.into(),
    }
}

#[async_trait]
impl SlideRenderer for MarpCliRenderer {
    fn name(&self) -> &str {
        "marp"
    }

    async fn render(&self, markup: &str) -> Result<String, CompileError> {
        let scratch = tempfile::Builder::new()
            .prefix("deck-marp-")
            .tempdir()
            .map_err(|e| render_error(format!("failed to create scratch directory: {}", e)))?;
        let input = scratch.path().join("deck.md");
        let output = scratch.path().join("deck.html");

        tokio::fs::write(&input, markup)
            .await
            .map_err(|e| render_error(format!("failed to write deck.md: {}", e)))?;

        let mut cmd = Command::new(&self.command);
        cmd.arg("--html")
            .arg("--allow-local-files")
            .arg(&input)
            .arg("-o")
            .arg(&output)
            .current_dir(scratch.path());

        let result = match run_with_timeout(cmd, self.timeout).await {
            Ok(result) => result,
            Err(ProcessFailure::TimedOut) => {
                return Err(render_error(format!(
                    "{} timed out after {}s",
                    self.command.display(),
                    self.timeout.as_secs()
                )))
            }
            Err(ProcessFailure::Spawn(e)) => {
                return Err(render_error(format!(
                    "failed to start {}: {}. Is marp-cli installed?",
                    self.command.display(),
                    e
                )))
            }
        };

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(render_error(format!(
                "{} failed: {}",
                self.command.display(),
                stderr.trim()
            )));
        }

        tokio::fs::read_to_string(&output)
            .await
            .map_err(|e| render_error(format!("renderer wrote no output: {}", e)))
    }
}

/// Create the renderer named by `config.renderer`.
pub fn create_renderer(config: &RenderConfig) -> Result<Arc<dyn SlideRenderer>> {
    match config.renderer.as_str() {
        "passthrough" => Ok(Arc::new(PassthroughRenderer)),
        "marp" => Ok(Arc::new(MarpCliRenderer::new(config))),
        other => bail!("Unknown renderer: {}", other),
    }
}
