//! Transports to the out-of-process feedback generator.
//!
//! Both transports return `Ok(GeneratorOutcome)` for anything the generator
//! answered, including malformed output, and `Err` only when the call itself
//! could not be made. The caller owns the timeout.

use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::config::{FeedbackMode, FeedbackSettings};
use crate::models::feedback::{FeedbackRequest, GeneratorOutcome};

#[async_trait]
pub trait FeedbackGenerator: Send + Sync {
    async fn generate(&self, request: &FeedbackRequest) -> Result<GeneratorOutcome>;
}

pub fn build_generator(settings: &FeedbackSettings) -> Arc<dyn FeedbackGenerator> {
    match settings.mode {
        FeedbackMode::Subprocess => Arc::new(SubprocessFeedbackGenerator::new(
            settings.python_bin.clone(),
            settings.objective_script.clone(),
            settings.writing_script.clone(),
        )),
        FeedbackMode::Http => Arc::new(HttpFeedbackGenerator::new(settings.http_base_url.clone())),
    }
}

/// Runs `python_bin <script>` per call, JSON in on stdin and out on stdout.
pub struct SubprocessFeedbackGenerator {
    python_bin: String,
    objective_script: String,
    writing_script: String,
}

impl SubprocessFeedbackGenerator {
    pub fn new(python_bin: String, objective_script: String, writing_script: String) -> Self {
        Self {
            python_bin,
            objective_script,
            writing_script,
        }
    }

    fn script_for(&self, request: &FeedbackRequest) -> &str {
        match request {
            FeedbackRequest::Objective(_) => &self.objective_script,
            FeedbackRequest::Writing(_) => &self.writing_script,
        }
    }
}

#[async_trait]
impl FeedbackGenerator for SubprocessFeedbackGenerator {
    async fn generate(&self, request: &FeedbackRequest) -> Result<GeneratorOutcome> {
        let payload = serde_json::to_vec(request).context("Failed to encode generator payload")?;

        let mut cmd = Command::new(&self.python_bin);
        cmd.arg(self.script_for(request))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.python_bin))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&payload)
                .await
                .context("Failed to write generator payload")?;
            // Closing stdin signals end of input to the script.
            drop(stdin);
        }

        let output = child
            .wait_with_output()
            .await
            .context("Failed to wait for generator process")?;

        let stdout = String::from_utf8_lossy(&output.stdout);

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::warn!(
                attempt_id = %request.attempt_id(),
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "Feedback generator exited with failure"
            );
            let detail = stderr.lines().last().unwrap_or("").trim().to_string();
            return Ok(GeneratorOutcome::Failure {
                error: if detail.is_empty() {
                    format!("generator exited with status {}", output.status.code().unwrap_or(-1))
                } else {
                    format!(
                        "generator exited with status {}: {}",
                        output.status.code().unwrap_or(-1),
                        detail
                    )
                },
            });
        }

        Ok(parse_stdout(&stdout))
    }
}

/// Scripts may print diagnostics before their JSON result, so when the
/// whole output is not one JSON document the last non-empty line is used.
fn parse_stdout(stdout: &str) -> GeneratorOutcome {
    if serde_json::from_str::<serde_json::Value>(stdout.trim()).is_ok() {
        return GeneratorOutcome::parse(stdout);
    }

    let last = stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("");
    GeneratorOutcome::parse(last)
}

/// Posts the payload to `{base}/internal/feedback/{track}`.
pub struct HttpFeedbackGenerator {
    client: Client,
    base_url: String,
}

impl HttpFeedbackGenerator {
    pub fn new(base_url: String) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, request: &FeedbackRequest) -> String {
        format!("{}/internal/feedback/{}", self.base_url, request.track_name())
    }
}

#[async_trait]
impl FeedbackGenerator for HttpFeedbackGenerator {
    async fn generate(&self, request: &FeedbackRequest) -> Result<GeneratorOutcome> {
        let url = self.endpoint(request);
        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to call feedback generator at {}", url))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read feedback generator response")?;

        if !status.is_success() {
            return Ok(GeneratorOutcome::Failure {
                error: format!("generator returned HTTP {}", status.as_u16()),
            });
        }

        Ok(GeneratorOutcome::parse(&body))
    }
}
