//! Stage executor: runs one pipeline stage through the collaborators and
//! records the attempt.
//!
//! Deliberately thin; the value is the contracts it enforces. LLM stages
//! (RED, RED_FIX, GREEN, FIX) render a prompt and invoke the client;
//! verification stages (VERIFY, RE_VERIFY) run the task's verify command
//! and the static export review.

pub mod collaborators;

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::{ErrorClass, StageFailure};
use crate::store::{NewAttempt, Store, StoreResult, TaskRow};
use crate::types::{Stage, TaskStatus};

use self::collaborators::{
    read_review_source, AstChecker, CodeVerifier, LlmClient, PromptBuilder, VerifierError,
};

/// How a stage execution ended, seen by the worker's pipeline loop.
#[derive(Debug, Clone)]
pub enum StageDisposition {
    /// The stage did what it was supposed to.
    Success,
    /// The verify command exited non-zero: the implementation needs a FIX
    /// round. Not an infrastructure failure.
    TestsFailed,
    /// Static review found violations the pipeline cannot fix.
    ReviewViolations {
        /// Review findings, already formatted.
        messages: Vec<String>,
    },
    /// An infrastructure or collaborator failure, classified.
    Failure(StageFailure),
}

impl StageDisposition {
    /// Whether the stage counts as successful for breaker reporting.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Result of one stage execution, consumed by the worker loop.
#[derive(Debug, Clone)]
pub struct StageReport {
    /// Outcome.
    pub disposition: StageDisposition,
    /// Whether the LLM was invoked (counts against the budget).
    pub invoked_llm: bool,
    /// Tokens consumed by the invocation, when one happened.
    pub tokens: u64,
    /// Attempt number assigned to the recorded attempt.
    pub attempt_number: i64,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: i64,
}

/// Executes single stages via the collaborator seams.
#[derive(Clone)]
pub struct StageExecutor {
    store: Store,
    prompts: Arc<dyn PromptBuilder>,
    llm: Arc<dyn LlmClient>,
    verifier: Arc<dyn CodeVerifier>,
    reviewer: Arc<dyn AstChecker>,
}

impl StageExecutor {
    /// Wire an executor over the store and the four collaborators.
    pub fn new(
        store: Store,
        prompts: Arc<dyn PromptBuilder>,
        llm: Arc<dyn LlmClient>,
        verifier: Arc<dyn CodeVerifier>,
        reviewer: Arc<dyn AstChecker>,
    ) -> Self {
        Self {
            store,
            prompts,
            llm,
            verifier,
            reviewer,
        }
    }

    /// Run one stage of one task and record the attempt row.
    ///
    /// # Errors
    ///
    /// Returns a store error only when the attempt cannot be persisted;
    /// collaborator failures are folded into the report.
    pub async fn execute(&self, task: &TaskRow, stage: Stage) -> StoreResult<StageReport> {
        let started_at = Utc::now();
        debug!(task_key = %task.task_key, stage = %stage, "executing stage");

        let mut invoked_llm = false;
        let mut tokens: u64 = 0;
        let mut prompt_fingerprint = None;
        let mut stdout_tail = None;
        let mut stderr_tail = None;
        let mut files_created = Vec::new();
        let mut files_modified = Vec::new();

        let disposition = if let Some(violation) = self.claim_violation(task, stage).await? {
            StageDisposition::Failure(violation)
        } else if stage.is_llm_stage() {
            let prompt = self.prompts.build(task, stage);
            prompt_fingerprint = Some(prompt.fingerprint.clone());
            invoked_llm = true;
            match self.llm.invoke(&prompt).await {
                Ok(response) => {
                    tokens = response.total_tokens();
                    match stage {
                        Stage::Red | Stage::RedFix => {
                            files_created.extend(task.test_file.clone());
                        }
                        Stage::Green | Stage::Fix => {
                            files_modified.extend(task.impl_file.clone());
                        }
                        Stage::Verify | Stage::ReVerify => {}
                    }
                    StageDisposition::Success
                }
                Err(e) => StageDisposition::Failure(e.into_failure()),
            }
        } else {
            let (disposition, out, err) = self.run_verification(task).await;
            stdout_tail = out;
            stderr_tail = err;
            disposition
        };

        let completed_at = Utc::now();
        let duration_ms = completed_at
            .signed_duration_since(started_at)
            .num_milliseconds();

        let (success, error) = match &disposition {
            StageDisposition::Success => (true, None),
            StageDisposition::TestsFailed => (false, Some("verification failed".to_owned())),
            StageDisposition::ReviewViolations { messages } => {
                (false, Some(format!("static review: {}", messages.join("; "))))
            }
            StageDisposition::Failure(f) => (false, Some(f.message.clone())),
        };

        let attempt_number = self
            .store
            .record_attempt(&NewAttempt {
                task_id: task.id,
                stage,
                started_at,
                completed_at,
                success,
                error,
                files_created,
                files_modified,
                stdout_tail,
                stderr_tail,
                prompt_fingerprint,
            })
            .await?;

        if success {
            info!(task_key = %task.task_key, stage = %stage, attempt_number, "stage succeeded");
        } else {
            info!(task_key = %task.task_key, stage = %stage, attempt_number, "stage failed");
        }

        Ok(StageReport {
            disposition,
            invoked_llm,
            tokens,
            attempt_number,
            duration_ms,
        })
    }

    /// Re-read the task and assert the claim invariant: a stage may only
    /// execute against an in-progress task with a live claim. Anything
    /// else means the store and the worker disagree about who owns the
    /// task, and the run must stop.
    async fn claim_violation(
        &self,
        task: &TaskRow,
        stage: Stage,
    ) -> StoreResult<Option<StageFailure>> {
        let current = self.store.get_task(task.id).await?;
        if current.status == TaskStatus::InProgress && current.claim_by.is_some() {
            return Ok(None);
        }
        Ok(Some(StageFailure::invariant_violated(format!(
            "stage {stage} reached task {} in status {} with claim_by={:?}; \
             expected an in-progress task with a live claim",
            current.task_key, current.status, current.claim_by
        ))))
    }

    /// VERIFY / RE_VERIFY: run the task's command, then the static review.
    ///
    /// Returns the disposition plus the command's output tails for the
    /// attempt row.
    async fn run_verification(
        &self,
        task: &TaskRow,
    ) -> (StageDisposition, Option<String>, Option<String>) {
        let mut stdout_tail = None;
        let mut stderr_tail = None;

        if !task.verify_command.is_empty() {
            match self.verifier.run(&task.verify_command).await {
                Ok(output) => {
                    stdout_tail = Some(output.stdout_tail.clone());
                    stderr_tail = Some(output.stderr_tail.clone());
                    if output.timed_out {
                        return (
                            StageDisposition::Failure(StageFailure::transient(
                                "verify command timed out",
                            )),
                            stdout_tail,
                            stderr_tail,
                        );
                    }
                    if !output.passed() {
                        return (StageDisposition::TestsFailed, stdout_tail, stderr_tail);
                    }
                }
                Err(VerifierError::EmptyCommand) => {}
                Err(e @ VerifierError::Spawn(_)) => {
                    return (
                        StageDisposition::Failure(StageFailure {
                            class: ErrorClass::FatalWorker,
                            message: e.to_string(),
                        }),
                        None,
                        None,
                    );
                }
            }
        }

        if let Some(source) = read_review_source(task.impl_file.as_deref()) {
            let violations = self.reviewer.analyze(&source, &task.module_exports);
            if !violations.is_empty() {
                return (
                    StageDisposition::ReviewViolations {
                        messages: violations.into_iter().map(|v| v.message).collect(),
                    },
                    stdout_tail,
                    stderr_tail,
                );
            }
        }

        (StageDisposition::Success, stdout_tail, stderr_tail)
    }
}
