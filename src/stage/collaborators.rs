//! Collaborator contracts consumed by the stage executor.
//!
//! Four seams: [`PromptBuilder`] (pure), [`LlmClient`] (async, fallible),
//! [`CodeVerifier`] (subprocess), and [`AstChecker`] (pure). Each has a
//! default implementation; [`NoopLlm`] makes dry runs possible without an
//! API key.

use std::path::Path;
use std::time::Duration;

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::error::{ErrorClass, StageFailure};
use crate::store::TaskRow;
use crate::types::{Complexity, Stage};

// ---------------------------------------------------------------------------
// Prompt builder
// ---------------------------------------------------------------------------

/// A rendered prompt plus its routing metadata.
#[derive(Debug, Clone)]
pub struct Prompt {
    /// Full prompt text.
    pub text: String,
    /// Model tier hint derived from task complexity.
    pub tier: Complexity,
    /// sha256 of the text, recorded on the attempt row.
    pub fingerprint: String,
}

/// Builds stage prompts. Pure: identical inputs produce identical output.
pub trait PromptBuilder: Send + Sync {
    /// Render the prompt for one stage of one task.
    fn build(&self, task: &TaskRow, stage: Stage) -> Prompt;
}

/// Default prompt builder: a fixed template per stage, tier from task
/// complexity.
#[derive(Debug, Clone, Default)]
pub struct TieredPromptBuilder;

impl PromptBuilder for TieredPromptBuilder {
    fn build(&self, task: &TaskRow, stage: Stage) -> Prompt {
        let mut text = String::new();
        text.push_str(&format!("# {}: {}\n\n", task.task_key, task.title));
        text.push_str(&format!("Goal: {}\n", task.goal));
        text.push_str(&format!("Stage: {}\n\n", stage));

        match stage {
            Stage::Red | Stage::RedFix => {
                if let Some(test_file) = &task.test_file {
                    text.push_str(&format!("Write a failing test in `{test_file}`.\n"));
                }
                if stage == Stage::RedFix {
                    text.push_str("The previous test output was broken; repair it.\n");
                }
            }
            Stage::Green | Stage::Fix => {
                if let Some(impl_file) = &task.impl_file {
                    text.push_str(&format!(
                        "Implement `{impl_file}` so the tests pass.\n"
                    ));
                }
                if stage == Stage::Fix {
                    text.push_str("Verification failed; fix the implementation.\n");
                }
                if !task.module_exports.is_empty() {
                    text.push_str(&format!(
                        "The module must export: {}.\n",
                        task.module_exports.join(", ")
                    ));
                }
            }
            Stage::Verify | Stage::ReVerify => {}
        }

        if !task.acceptance_criteria.is_empty() {
            text.push_str("\nAcceptance criteria:\n");
            for criterion in &task.acceptance_criteria {
                text.push_str(&format!("- {criterion}\n"));
            }
        }
        if let Some(hints) = &task.hints {
            text.push_str(&format!("\nHints:\n{hints}\n"));
        }

        let fingerprint = hex::encode(Sha256::digest(text.as_bytes()));
        Prompt {
            text,
            tier: task.complexity,
            fingerprint,
        }
    }
}

// ---------------------------------------------------------------------------
// LLM client
// ---------------------------------------------------------------------------

/// Errors returned by LLM providers.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    /// Provider rate limit; retryable.
    #[error("provider rate limited")]
    RateLimited,
    /// The call exceeded its timeout; retryable.
    #[error("provider call timed out")]
    Timeout,
    /// Authentication or authorization failure; fatal for this worker.
    #[error("provider auth failure: {0}")]
    Auth(String),
    /// Response did not match the expected schema; fatal for this task.
    #[error("malformed provider response: {0}")]
    Malformed(String),
    /// HTTP transport failure; retryable.
    #[error("provider transport failure: {0}")]
    Transport(String),
}

impl LlmError {
    /// Map onto the core error taxonomy.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::RateLimited | Self::Timeout | Self::Transport(_) => ErrorClass::Transient,
            Self::Auth(_) => ErrorClass::FatalWorker,
            Self::Malformed(_) => ErrorClass::FatalTask,
        }
    }

    /// Convert into a classified stage failure.
    pub fn into_failure(self) -> StageFailure {
        StageFailure {
            class: self.class(),
            message: self.to_string(),
        }
    }
}

/// A completed LLM invocation.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Response text.
    pub content: String,
    /// Tokens consumed by the prompt.
    pub input_tokens: u64,
    /// Tokens generated.
    pub output_tokens: u64,
}

impl LlmResponse {
    /// Total tokens, for budget accounting.
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Core LLM collaborator interface.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Invoke the model with a rendered prompt.
    ///
    /// # Errors
    ///
    /// Returns [`LlmError`]; only `RateLimited`, `Timeout`, and
    /// `Transport` are retryable.
    async fn invoke(&self, prompt: &Prompt) -> Result<LlmResponse, LlmError>;

    /// Provider name for logs.
    fn name(&self) -> &str;
}

/// No-op client for dry runs: every invocation "succeeds" with an empty
/// response and a token estimate derived from the prompt length.
#[derive(Debug, Clone, Default)]
pub struct NoopLlm;

#[async_trait]
impl LlmClient for NoopLlm {
    async fn invoke(&self, prompt: &Prompt) -> Result<LlmResponse, LlmError> {
        let estimate = u64::try_from(prompt.text.len()).unwrap_or(u64::MAX) / 4;
        Ok(LlmResponse {
            content: String::new(),
            input_tokens: estimate,
            output_tokens: 0,
        })
    }

    fn name(&self) -> &str {
        "noop"
    }
}

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Anthropic messages API client.
#[derive(Debug, Clone)]
pub struct HttpLlm {
    model: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpLlm {
    /// Create a client for the given model with a per-call timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(model: String, api_key: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            model,
            api_key,
            client,
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlm {
    async fn invoke(&self, prompt: &Prompt) -> Result<LlmResponse, LlmError> {
        let body = json!({
            "model": self.model,
            "max_tokens": 4096,
            "messages": [{"role": "user", "content": prompt.text}],
        });

        let response = self
            .client
            .post(ANTHROPIC_API_BASE)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::Timeout
                } else {
                    LlmError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let payload = response
            .text()
            .await
            .map_err(|e| LlmError::Transport(e.to_string()))?;

        if status.as_u16() == 429 {
            return Err(LlmError::RateLimited);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(LlmError::Auth(redact_error_snippet(&payload)));
        }
        if !status.is_success() {
            return Err(LlmError::Transport(format!(
                "status {}: {}",
                status.as_u16(),
                redact_error_snippet(&payload)
            )));
        }

        let parsed: MessagesResponse =
            serde_json::from_str(&payload).map_err(|e| LlmError::Malformed(e.to_string()))?;

        let content = parsed
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
                ContentBlock::Other => None,
            })
            .collect();

        Ok(LlmResponse {
            content,
            input_tokens: parsed.usage.input_tokens,
            output_tokens: parsed.usage.output_tokens,
        })
    }

    fn name(&self) -> &str {
        "anthropic"
    }
}

/// Messages-API response, reduced to the fields the executor consumes.
#[derive(Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: TokenUsage,
}

/// One response content block. Non-text blocks are accepted and ignored.
#[derive(Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Default, Deserialize)]
struct TokenUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// Longest error snippet kept for logs and audit rows.
const ERROR_SNIPPET_CHARS: usize = 200;

/// Collapse an HTTP error body to one bounded line with credential shapes
/// blanked out. Redaction runs before truncation, so a cut can never
/// expose the head of a key.
fn redact_error_snippet(raw: &str) -> String {
    static KEY_SHAPES: OnceLock<Option<Regex>> = OnceLock::new();
    let shapes = KEY_SHAPES
        .get_or_init(|| Regex::new(r"(sk-ant-|sk-|ghp_|glpat-|xox[a-z]-)[A-Za-z0-9_\-]{8,}").ok());
    let redacted = match shapes {
        Some(re) => re.replace_all(raw, "<credential>"),
        None => raw.into(),
    };

    let mut snippet = String::with_capacity(ERROR_SNIPPET_CHARS);
    for word in redacted.split_whitespace() {
        if !snippet.is_empty() {
            snippet.push(' ');
        }
        snippet.push_str(word);
        if snippet.chars().count() > ERROR_SNIPPET_CHARS {
            break;
        }
    }
    if snippet.chars().count() > ERROR_SNIPPET_CHARS {
        let cut = snippet
            .char_indices()
            .nth(ERROR_SNIPPET_CHARS)
            .map_or(snippet.len(), |(i, _)| i);
        snippet.truncate(cut);
        snippet.push_str(" [cut]");
    }
    snippet
}

// ---------------------------------------------------------------------------
// Code verifier
// ---------------------------------------------------------------------------

/// Errors produced by the verifier before a command even runs.
#[derive(Debug, thiserror::Error)]
pub enum VerifierError {
    /// The task carries no usable command.
    #[error("empty verify command")]
    EmptyCommand,
    /// The subprocess could not be spawned.
    #[error("failed to spawn verifier: {0}")]
    Spawn(String),
}

/// Output of one verify command execution.
#[derive(Debug, Clone)]
pub struct VerifyOutput {
    /// Process exit code (`None` when killed).
    pub exit_code: Option<i32>,
    /// Tail of captured stdout.
    pub stdout_tail: String,
    /// Tail of captured stderr.
    pub stderr_tail: String,
    /// Whether the command exceeded its timeout.
    pub timed_out: bool,
}

impl VerifyOutput {
    /// Whether the command passed (exit 0, no timeout).
    pub fn passed(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Subprocess runner for verify commands.
#[async_trait]
pub trait CodeVerifier: Send + Sync {
    /// Run an argv vector, never via a shell interpreter.
    ///
    /// # Errors
    ///
    /// Returns [`VerifierError`] when the command is empty or cannot spawn.
    async fn run(&self, command: &[String]) -> Result<VerifyOutput, VerifierError>;
}

/// Max characters of stdout/stderr kept on an attempt row.
const OUTPUT_TAIL_CHARS: usize = 4000;

/// Default verifier: `tokio::process` with a timeout and tail capture.
#[derive(Debug, Clone)]
pub struct ProcessVerifier {
    timeout: Duration,
}

impl ProcessVerifier {
    /// Create a verifier with a per-call timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl CodeVerifier for ProcessVerifier {
    async fn run(&self, command: &[String]) -> Result<VerifyOutput, VerifierError> {
        let Some((program, args)) = command.split_first() else {
            return Err(VerifierError::EmptyCommand);
        };

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        match tokio::time::timeout(self.timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(VerifyOutput {
                exit_code: output.status.code(),
                stdout_tail: tail(&String::from_utf8_lossy(&output.stdout)),
                stderr_tail: tail(&String::from_utf8_lossy(&output.stderr)),
                timed_out: false,
            }),
            Ok(Err(e)) => Err(VerifierError::Spawn(e.to_string())),
            // Dropping the output future kills the child (kill_on_drop).
            Err(_) => Ok(VerifyOutput {
                exit_code: None,
                stdout_tail: String::new(),
                stderr_tail: String::new(),
                timed_out: true,
            }),
        }
    }
}

/// Keep the last [`OUTPUT_TAIL_CHARS`] characters of collaborator output.
fn tail(s: &str) -> String {
    let count = s.chars().count();
    if count <= OUTPUT_TAIL_CHARS {
        return s.to_owned();
    }
    s.chars()
        .skip(count.saturating_sub(OUTPUT_TAIL_CHARS))
        .collect()
}

// ---------------------------------------------------------------------------
// AST checker
// ---------------------------------------------------------------------------

/// A static-review finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// What is wrong.
    pub message: String,
}

/// Pure static review over implementation source text.
pub trait AstChecker: Send + Sync {
    /// Analyze source text against the exports the task promised.
    fn analyze(&self, source: &str, expected_exports: &[String]) -> Vec<Violation>;
}

/// Default checker: every declared module export must appear in the source.
#[derive(Debug, Clone, Default)]
pub struct ExportChecker;

impl AstChecker for ExportChecker {
    fn analyze(&self, source: &str, expected_exports: &[String]) -> Vec<Violation> {
        expected_exports
            .iter()
            .filter(|name| !source.contains(name.as_str()))
            .map(|name| Violation {
                message: format!("missing module export: {name}"),
            })
            .collect()
    }
}

/// Read the implementation file for review; `None` when there is nothing
/// to review (no path configured or file absent, as in dry runs).
pub fn read_review_source(impl_file: Option<&str>) -> Option<String> {
    let path = impl_file?;
    if !Path::new(path).exists() {
        return None;
    }
    std::fs::read_to_string(path).ok()
}
