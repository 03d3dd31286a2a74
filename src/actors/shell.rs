use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncReadExt;
use tokio::process::Command;

use super::{Actor, ActorResponse, InvocationRequest};
use crate::config::ActorsConfig;

/// Runs `sh -c <command>` from the step payload.
///
/// The child is killed when the invocation future is dropped, so step
/// timeouts and plan cancellation stop the process too.
pub struct ShellActor {
    working_dir: Option<PathBuf>,
    dangerous: Vec<Regex>,
    max_output_bytes: usize,
}

#[derive(Debug, Deserialize)]
struct ShellParams {
    command: String,
    #[serde(default)]
    env: std::collections::HashMap<String, String>,
}

impl ShellActor {
    pub fn new(config: &ActorsConfig) -> Self {
        let dangerous = config
            .dangerous_patterns
            .iter()
            .filter_map(|p| Regex::new(p).ok())
            .collect();
        Self {
            working_dir: config.working_dir.clone(),
            dangerous,
            max_output_bytes: config.max_output_bytes,
        }
    }

    fn matched_dangerous(&self, command: &str) -> Vec<&str> {
        self.dangerous
            .iter()
            .filter(|re| re.is_match(command))
            .map(|re| re.as_str())
            .collect()
    }

    /// Truncate on a UTF-8 boundary
    fn truncate_output(output: String, max_bytes: usize) -> String {
        if output.len() <= max_bytes {
            return output;
        }
        let mut end = max_bytes;
        while !output.is_char_boundary(end) {
            end -= 1;
        }
        format!(
            "{}\n[OUTPUT TRUNCATED: {} of {} bytes shown]",
            &output[..end],
            end,
            output.len()
        )
    }
}

#[async_trait]
impl Actor for ShellActor {
    fn id(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Runs a shell command; payload: {\"command\": \"...\"}. Exit status 0 is success."
    }

    async fn invoke(&self, request: &InvocationRequest) -> Result<ActorResponse> {
        let params: ShellParams = match serde_json::from_value(request.payload.clone()) {
            Ok(p) => p,
            Err(e) => {
                return Ok(ActorResponse::failure(format!(
                    "Invalid input for shell actor: {}",
                    e
                )))
            }
        };

        let matched = self.matched_dangerous(&params.command);
        if !matched.is_empty() {
            tracing::warn!("Refusing dangerous command '{}'", params.command);
            return Ok(ActorResponse::failure(format!(
                "Permission denied: command matches dangerous patterns: {}",
                matched.join(", ")
            )));
        }

        tracing::debug!("Step {} running: {}", request.step_id, params.command);

        let mut command = Command::new("sh");
        command
            .arg("-c")
            .arg(&params.command)
            .envs(&params.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().context("Failed to spawn command")?;
        let mut stdout = child.stdout.take().context("Failed to capture stdout")?;
        let mut stderr = child.stderr.take().context("Failed to capture stderr")?;

        let mut stdout_buf = Vec::new();
        let mut stderr_buf = Vec::new();
        let (out, err) = tokio::join!(
            stdout.read_to_end(&mut stdout_buf),
            stderr.read_to_end(&mut stderr_buf)
        );
        out.context("Failed to read stdout")?;
        err.context("Failed to read stderr")?;
        let status = child.wait().await.context("Failed to wait for process")?;

        let stdout = Self::truncate_output(
            String::from_utf8_lossy(&stdout_buf).into_owned(),
            self.max_output_bytes,
        );
        let stderr = Self::truncate_output(
            String::from_utf8_lossy(&stderr_buf).into_owned(),
            self.max_output_bytes,
        );

        if status.success() {
            Ok(ActorResponse::success(json!({
                "stdout": stdout,
                "stderr": stderr,
                "exit_code": 0,
            })))
        } else {
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            Ok(ActorResponse::failure(format!(
                "Command failed ({}): {}",
                status, detail
            )))
        }
    }
}
