//! Statistical runtime invocation.
//!
//! A [`StatRuntime`] turns one R code body into text output: an SVG document
//! for plots, an HTML table, captured console text, or knitted markdown.
//! [`RscriptRuntime`] is the production implementation. For every call it
//!
//! 1. creates a private scratch directory (`tempfile::TempDir`),
//! 2. writes the user code and a small wrapper program into it,
//! 3. runs `Rscript --vanilla wrapper.R` with a timeout,
//! 4. reads the output file the wrapper wrote.
//!
//! The scratch directory is removed when the `TempDir` drops, which covers
//! success, failure and timeout alike. A timed-out child is killed because
//! the process future is dropped with `kill_on_drop(true)` set.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::config::RuntimeConfig;
use crate::error::ExecutionError;
use crate::models::CodeKind;

/// What the wrapper program should produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Draw to an SVG device.
    Svg,
    /// Render the last value as an HTML table.
    Table,
    /// Capture console output as plain text.
    Generic,
    /// Knit an R Markdown snippet to markdown.
    Document,
}

impl ExecMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecMode::Svg => "svg",
            ExecMode::Table => "table",
            ExecMode::Generic => "generic",
            ExecMode::Document => "document",
        }
    }

    fn output_file(&self) -> &'static str {
        match self {
            ExecMode::Svg => "out.svg",
            ExecMode::Table => "out.html",
            ExecMode::Generic => "out.txt",
            ExecMode::Document => "out.md",
        }
    }
}

impl From<CodeKind> for ExecMode {
    fn from(kind: CodeKind) -> Self {
        match kind {
            CodeKind::Plot => ExecMode::Svg,
            CodeKind::Table => ExecMode::Table,
            CodeKind::Generic => ExecMode::Generic,
        }
    }
}

/// An external interpreter for statistical code.
#[async_trait]
pub trait StatRuntime: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Run `code` and return its output text for `mode`.
    async fn run(&self, code: &str, mode: ExecMode) -> Result<String, ExecutionError>;
}

// ============ Process helper ============

/// Why a child process did not produce an [`Output`].
#[derive(Debug)]
pub(crate) enum ProcessFailure {
    Spawn(std::io::Error),
    TimedOut,
}

/// Run `cmd` to completion, killing it if `timeout` elapses first.
pub(crate) async fn run_with_timeout(
    mut cmd: Command,
    timeout: Duration,
) -> Result<Output, ProcessFailure> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_) => Err(ProcessFailure::TimedOut),
        Ok(Err(e)) => Err(ProcessFailure::Spawn(e)),
        Ok(Ok(output)) => Ok(output),
    }
}

// ============ Rscript ============

/// Runs code through the `Rscript` executable.
pub struct RscriptRuntime {
    command: PathBuf,
    timeout: Duration,
    scratch_dir: Option<PathBuf>,
    plot_width_in: f32,
    plot_height_in: f32,
}

impl RscriptRuntime {
    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
            scratch_dir: config.scratch_dir.clone(),
            plot_width_in: config.plot_width_in,
            plot_height_in: config.plot_height_in,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn scratch(&self) -> Result<tempfile::TempDir, ExecutionError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("deck-r-");
        let dir = match &self.scratch_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        };
        dir.map_err(|e| ExecutionError::Io {
            detail: format!("failed to create scratch directory: {}", e),
        })
    }

    /// Build the wrapper program that sources `code_path` and writes `out_path`.
    pub fn wrapper_program(&self, mode: ExecMode, code_path: &Path, out_path: &Path) -> String {
        let code = r_string(&code_path.to_string_lossy());
        let out = r_string(&out_path.to_string_lossy());
        match mode {
            ExecMode::Svg => format!(
                "svg(filename = {out}, width = {w}, height = {h})\n\
                 source({code}, local = new.env(), print.eval = TRUE)\n\
                 invisible(dev.off())\n",
                w = self.plot_width_in,
                h = self.plot_height_in,
            ),
            ExecMode::Table => format!(
                "options(knitr.table.format = \"html\")\n\
                 .deck_value <- source({code}, local = new.env())$value\n\
                 {TABLE_TO_HTML}\
                 writeLines(.deck_html(.deck_value), {out})\n"
            ),
            ExecMode::Generic => format!(
                ".deck_out <- capture.output(source({code}, local = new.env(), print.eval = TRUE))\n\
                 writeLines(.deck_out, {out})\n"
            ),
            ExecMode::Document => format!(
                "if (!requireNamespace(\"knitr\", quietly = TRUE)) stop(\"package 'knitr' is required\")\n\
                 .deck_md <- knitr::knit(text = readLines({code}, warn = FALSE), quiet = TRUE)\n\
                 writeLines(.deck_md, {out})\n"
            ),
        }
    }
}

/// Converts a value into an HTML `<table>`. kable and gt output pass through.
const TABLE_TO_HTML: &str = r#".deck_html <- function(x) {
  if (inherits(x, "knitr_kable")) return(paste(as.character(x), collapse = "\n"))
  if (inherits(x, "gt_tbl")) return(as.character(gt::as_raw_html(x)))
  x <- as.data.frame(x)
  esc <- function(s) {
    s <- gsub("&", "&amp;", s, fixed = TRUE)
    s <- gsub("<", "&lt;", s, fixed = TRUE)
    gsub(">", "&gt;", s, fixed = TRUE)
  }
  head <- paste0("<tr>", paste0("<th>", esc(names(x)), "</th>", collapse = ""), "</tr>")
  cells <- vapply(seq_len(nrow(x)), function(i) {
    paste0("<tr>", paste0("<td>", esc(format(unlist(x[i, , drop = TRUE]))), "</td>", collapse = ""), "</tr>")
  }, character(1))
  paste0("<table>\n<thead>\n", head, "\n</thead>\n<tbody>\n",
         paste(cells, collapse = "\n"), "\n</tbody>\n</table>")
}
"#;

/// Quote `s` as an R string literal.
fn r_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out.push('"');
    out
}

#[async_trait]
impl StatRuntime for RscriptRuntime {
    fn name(&self) -> &str {
        "rscript"
    }

    async fn run(&self, code: &str, mode: ExecMode) -> Result<String, ExecutionError> {
        let scratch = self.scratch()?;
        let code_path = scratch.path().join("code.R");
        let script_path = scratch.path().join("wrapper.R");
        let out_path = scratch.path().join(mode.output_file());

        let io = |what: &str, e: std::io::Error| ExecutionError::Io {
            detail: format!("failed to write {}: {}", what, e),
        };
        tokio::fs::write(&code_path, code)
            .await
            .map_err(|e| io("code file", e))?;
        tokio::fs::write(&script_path, self.wrapper_program(mode, &code_path, &out_path))
            .await
            .map_err(|e| io("wrapper script", e))?;

        let mut cmd = Command::new(&self.command);
        cmd.arg("--vanilla")
            .arg(&script_path)
            .current_dir(scratch.path());

        let output = match run_with_timeout(cmd, self.timeout).await {
            Ok(output) => output,
            Err(ProcessFailure::TimedOut) => {
                return Err(ExecutionError::Timeout {
                    timeout_secs: self.timeout.as_secs(),
                })
            }
            Err(ProcessFailure::Spawn(e)) => {
                return Err(ExecutionError::RuntimeFailure {
                    detail: format!("failed to start {}: {}", self.command.display(), e),
                })
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !output.status.success() {
            let detail = if stderr.is_empty() {
                format!("{} exited with {}", self.command.display(), output.status)
            } else {
                stderr
            };
            return Err(ExecutionError::RuntimeFailure { detail });
        }
        if !stderr.is_empty() {
            debug!(operation = "runtime", mode = mode.as_str(), stderr = %stderr, "Runtime stderr");
        }

        let text = match tokio::fs::read(&out_path).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(_) => {
                return Err(ExecutionError::OutputMissing {
                    detail: format!("{} was not written", mode.output_file()),
                })
            }
        };

        if matches!(mode, ExecMode::Svg | ExecMode::Table) && text.trim().is_empty() {
            return Err(ExecutionError::OutputMissing {
                detail: format!("{} is empty", mode.output_file()),
            });
        }

        Ok(text)
    }
}
