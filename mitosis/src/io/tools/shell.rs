//! `shell`: run one allow-listed program.
//!
//! The command comes from the step description (the first backtick-quoted
//! span if present). It is split on whitespace and executed directly, never
//! through a shell, so pipes and redirection are not available.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::error::ToolExecutionError;
use crate::io::config::ShellConfig;
use crate::io::process::run_argv;
use crate::io::tools::{Tool, ToolOutput, ToolRequest};

pub const NAME: &str = "shell";

pub struct ShellTool {
    allowed: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl ShellTool {
    pub fn new(config: &ShellConfig, timeout: Duration) -> Self {
        Self {
            allowed: config.allowed_commands.clone(),
            timeout,
            output_limit_bytes: config.output_limit_bytes,
        }
    }

    fn parse(&self, description: &str) -> Result<Vec<String>, ToolExecutionError> {
        let source = match description.split('`').nth(1) {
            Some(quoted) if description.matches('`').count() >= 2 => quoted,
            _ => description,
        };
        let argv = source
            .split_whitespace()
            .map(str::to_string)
            .collect::<Vec<_>>();
        let Some(program) = argv.first() else {
            return Err(ToolExecutionError::failed(NAME, "no command given"));
        };
        let base = Path::new(program)
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or(program);
        if base != program || !self.allowed.iter().any(|allowed| allowed == base) {
            return Err(ToolExecutionError::failed(
                NAME,
                format!("command '{program}' is not allowed"),
            ));
        }
        Ok(argv)
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        NAME
    }

    fn description(&self) -> &str {
        "Run a single allow-listed command (no pipes or redirection) and return its output."
    }

    async fn execute(&self, request: &ToolRequest) -> Result<ToolOutput, ToolExecutionError> {
        let argv = self.parse(&request.step_description)?;
        let timeout = self.timeout;
        let limit = self.output_limit_bytes;
        let run = tokio::task::spawn_blocking({
            let argv = argv.clone();
            move || run_argv(&argv, timeout, limit)
        })
        .await
        .map_err(|e| ToolExecutionError::failed(NAME, format!("join command thread: {e}")))?
        .map_err(|e| ToolExecutionError::failed(NAME, format!("{e:#}")))?;

        if run.timed_out {
            return Err(ToolExecutionError::Timeout {
                tool: NAME.to_string(),
                timeout_secs: timeout.as_secs(),
            });
        }
        if !run.succeeded() {
            return Err(ToolExecutionError::failed(
                NAME,
                format!(
                    "'{}' exited with {:?}: {}",
                    argv.join(" "),
                    run.exit_code,
                    run.stderr.trim()
                ),
            ));
        }

        Ok(ToolOutput {
            summary: run.summary(),
            data: json!({
                "command": argv,
                "exit_code": run.exit_code,
                "stderr": run.stderr,
            }),
        })
    }
}
