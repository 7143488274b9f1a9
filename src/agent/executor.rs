//! The agent executor: an LLM-guided, tool-using [`Processor`].
//!
//! Each `process` call is one turn: load the conversation from `job.data`,
//! ask the model for one decision, act on it, and write the conversation
//! back. Errors inside a turn are recorded in the execution history and
//! turned into an outcome; nothing escapes as an `Err`.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::agent::compaction::HistoryCompactor;
use crate::agent::persona::Persona;
use crate::agent::prompts;
use crate::agent::state::{AgentJobState, ExecutionEntry, ExecutionKind};
use crate::config::ExecutorConfig;
use crate::error::{ConfigError, Result};
use crate::jobs::Job;
use crate::llm::{
    AgentDecision, ChatMessage, CompletionRequest, LlmProvider, ToolCall, ToolCompletionRequest,
    decision_response_schema,
};
use crate::store::{Annotation, AnnotationStore, AuditLog};
use crate::tools::{ExecutionContext, ToolRegistry};
use crate::worker::{ProcessingOutcome, Processor};

/// Tag on annotations that hold questions for a human.
pub const CLARIFICATION_TAG: &str = "clarification_needed";

const REPLAN_SUMMARY_MAX_TOKENS: u32 = 512;

/// Collaborators of the executor. The completion service is optional so a
/// process without credentials can still start; every turn then fails with
/// a configuration error.
#[derive(Clone)]
pub struct AgentDeps {
    pub llm: Option<Arc<dyn LlmProvider>>,
    pub tools: Arc<ToolRegistry>,
    pub annotations: Option<Arc<dyn AnnotationStore>>,
    pub audit: Option<Arc<dyn AuditLog>>,
}

impl AgentDeps {
    pub fn new(llm: Option<Arc<dyn LlmProvider>>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            llm,
            tools,
            annotations: None,
            audit: None,
        }
    }

    pub fn with_annotations(mut self, annotations: Arc<dyn AnnotationStore>) -> Self {
        self.annotations = Some(annotations);
        self
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = Some(audit);
        self
    }
}

pub struct AgentExecutor {
    persona: Persona,
    deps: AgentDeps,
    config: ExecutorConfig,
}

impl AgentExecutor {
    pub fn new(persona: Persona, deps: AgentDeps, config: ExecutorConfig) -> Self {
        Self {
            persona,
            deps,
            config,
        }
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    /// One turn against already-loaded state. Every path leaves `state`
    /// ready to be persisted.
    async fn run_turn(&self, job: &Job, state: &mut AgentJobState) -> ProcessingOutcome {
        let Some(llm) = self.deps.llm.clone() else {
            let err = ConfigError::MissingRequired {
                key: "AGENT_JOBS_LLM_API_KEY".to_string(),
                hint: "No completion service is configured for this worker.".to_string(),
            };
            tracing::error!(job_id = %job.id, error = %err, "Agent turn cannot run");
            state.record(
                ExecutionEntry::new(ExecutionKind::SystemError, serde_json::Value::Null)
                    .named("configuration")
                    .with_error(err.to_string()),
            );
            return ProcessingOutcome::failed(err.to_string());
        };

        let tools = self.deps.tools.tool_definitions().await;

        if state.conversation_history.is_empty() {
            let goal = prompts::task_goal(job);
            state.conversation_history = vec![
                ChatMessage::system(prompts::system_prompt(&self.persona, &tools)),
                ChatMessage::user(prompts::initial_user_message(
                    &goal,
                    state.last_failure_summary.as_deref(),
                )),
            ];
            tracing::debug!(job_id = %job.id, goal = %goal, "Seeded conversation");
        }

        let compactor = HistoryCompactor::new(Arc::clone(&llm), self.config.compaction);
        match compactor.compact(&mut state.conversation_history).await {
            Ok(0) => {}
            Ok(removed) => {
                state.record(
                    ExecutionEntry::new(
                        ExecutionKind::LlmEvent,
                        serde_json::json!({ "removedMessages": removed }),
                    )
                    .named("history_compacted"),
                );
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "History compaction failed");
                state.record(
                    ExecutionEntry::new(ExecutionKind::LlmWarning, serde_json::Value::Null)
                        .named("history_compaction")
                        .with_error(e.to_string()),
                );
            }
        }

        let request = ToolCompletionRequest::new(state.conversation_history.clone(), tools)
            .with_response_schema(decision_response_schema())
            .with_max_tokens(self.config.max_tokens)
            .with_temperature(self.config.temperature);

        let decision = match llm.complete_with_tools(request).await {
            Ok(response) => AgentDecision::from_response(&response),
            Err(e) => Err(e),
        };

        let decision = match decision {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Planning request failed");
                state.record(
                    ExecutionEntry::new(ExecutionKind::LlmError, serde_json::Value::Null)
                        .named("planning")
                        .with_error(e.to_string()),
                );
                return ProcessingOutcome::failed(format!("Completion service error: {e}"));
            }
        };

        match decision {
            AgentDecision::Clarify { questions } => self.clarify(job, state, questions).await,
            AgentDecision::Replan { reason } => self.replan(job, state, &llm, reason).await,
            AgentDecision::UseTools { calls, thought } => {
                self.use_tools(job, state, calls, thought).await
            }
            AgentDecision::Finish { summary, output } => {
                tracing::info!(job_id = %job.id, "Agent reported the goal complete");
                state
                    .conversation_history
                    .push(ChatMessage::assistant(summary.clone()));
                state.record(
                    ExecutionEntry::new(
                        ExecutionKind::LlmEvent,
                        serde_json::json!({ "summary": summary }),
                    )
                    .named("finished"),
                );
                let output = output.or_else(|| Some(serde_json::Value::String(summary.clone())));
                ProcessingOutcome::completed(summary, output)
            }
        }
    }

    async fn clarify(
        &self,
        job: &Job,
        state: &mut AgentJobState,
        questions: Vec<String>,
    ) -> ProcessingOutcome {
        let detail = serde_json::json!({ "questions": &questions });

        match &self.deps.annotations {
            Some(store) => {
                let annotation = Annotation::new(
                    questions.join("\n"),
                    vec![CLARIFICATION_TAG.to_string(), format!("job:{}", job.id)],
                )
                .for_job(job.id)
                .by_agent(self.persona.id.clone());
                if let Err(e) = store.record(annotation).await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to record clarification");
                    state.record(
                        ExecutionEntry::new(ExecutionKind::SystemError, detail.clone())
                            .named("clarification_needed")
                            .with_error(e.to_string()),
                    );
                }
            }
            None => {
                tracing::warn!(job_id = %job.id, "No annotation store; clarification only kept in history");
            }
        }

        state.record(ExecutionEntry::new(ExecutionKind::LlmEvent, detail).named("clarification_needed"));
        tracing::info!(job_id = %job.id, count = questions.len(), "Agent needs clarification");

        ProcessingOutcome::continue_processing(format!(
            "Waiting for a human to answer {} clarifying question(s) before planning further",
            questions.len()
        ))
    }

    async fn replan(
        &self,
        job: &Job,
        state: &mut AgentJobState,
        llm: &Arc<dyn LlmProvider>,
        reason: String,
    ) -> ProcessingOutcome {
        let history = &state.conversation_history;
        let window = &history[history.len().saturating_sub(self.config.replan_window)..];

        let request = CompletionRequest::new(vec![
            ChatMessage::system(prompts::REPLAN_SYSTEM_PROMPT),
            ChatMessage::user(format!(
                "Reason for abandoning: {reason}\n\n{}",
                prompts::transcript(window)
            )),
        ])
        .with_max_tokens(REPLAN_SUMMARY_MAX_TOKENS)
        .with_temperature(0.0);

        let summary = match llm.complete(request).await {
            Ok(resp) if !resp.content.trim().is_empty() => resp.content.trim().to_string(),
            Ok(_) => format!("The previous attempt was abandoned: {reason}"),
            Err(e) => {
                tracing::warn!(job_id = %job.id, error = %e, "Replan summary failed");
                state.record(
                    ExecutionEntry::new(ExecutionKind::LlmWarning, serde_json::Value::Null)
                        .named("replan_summary")
                        .with_error(e.to_string()),
                );
                format!("The previous attempt was abandoned: {reason}")
            }
        };

        state.conversation_history.clear();
        state.last_failure_summary = Some(summary);
        state.record(
            ExecutionEntry::new(
                ExecutionKind::LlmEvent,
                serde_json::json!({ "reason": reason }),
            )
            .named("replan"),
        );
        tracing::info!(job_id = %job.id, reason = %reason, "Agent requested a replan");

        ProcessingOutcome::continue_processing(format!("Replanning: {reason}"))
    }

    async fn use_tools(
        &self,
        job: &Job,
        state: &mut AgentJobState,
        calls: Vec<ToolCall>,
        thought: Option<String>,
    ) -> ProcessingOutcome {
        let ctx = ExecutionContext::new(self.persona.id.clone(), job.id);
        state
            .conversation_history
            .push(ChatMessage::assistant_with_tool_calls(thought, calls.clone()));

        let mut failures = 0usize;
        for call in &calls {
            let started = Instant::now();
            let result = self
                .deps
                .tools
                .invoke(&call.name, call.arguments.clone(), &ctx)
                .await;
            let elapsed_ms = started.elapsed().as_millis() as u64;

            let (content, entry) = match result {
                Ok(output) => {
                    tracing::debug!(job_id = %job.id, tool = %call.name, elapsed_ms, "Tool succeeded");
                    let content = match &output.result {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    let entry = ExecutionEntry::new(
                        ExecutionKind::ToolCall,
                        serde_json::json!({
                            "callId": call.id,
                            "arguments": call.arguments,
                            "result": output.result,
                            "elapsedMs": elapsed_ms,
                        }),
                    );
                    (content, entry)
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(job_id = %job.id, tool = %call.name, error = %e, "Tool failed");
                    let content = serde_json::json!({ "error": e.to_string() }).to_string();
                    let entry = ExecutionEntry::new(
                        ExecutionKind::ToolCall,
                        serde_json::json!({
                            "callId": call.id,
                            "arguments": call.arguments,
                            "elapsedMs": elapsed_ms,
                        }),
                    )
                    .with_error(e.to_string());
                    (content, entry)
                }
            };

            state
                .conversation_history
                .push(ChatMessage::tool_result(&call.id, &call.name, content));
            state.record(entry.named(&call.name));
        }

        ProcessingOutcome::continue_processing(format!(
            "Executed {} tool call(s), {} failed",
            calls.len(),
            failures
        ))
    }

    async fn append_audit(&self, job: &Job, state: &AgentJobState, from: usize) {
        let Some(audit) = &self.deps.audit else {
            return;
        };
        let records: Vec<_> = state.execution_history[from..]
            .iter()
            .map(|entry| entry.to_audit_record(job.id))
            .collect();
        if records.is_empty() {
            return;
        }
        if let Err(e) = audit.append(&records).await {
            tracing::warn!(job_id = %job.id, error = %e, "Failed to append audit records");
        }
    }
}

#[async_trait]
impl Processor for AgentExecutor {
    async fn process(&self, job: &mut Job) -> Result<ProcessingOutcome> {
        let mut state = match AgentJobState::load(job) {
            Ok(state) => state,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Agent state is unusable");
                return Ok(ProcessingOutcome::failed(e.to_string()));
            }
        };
        let recorded_before = state.execution_history.len();

        let outcome = self.run_turn(job, &mut state).await;

        if let Err(e) = state.store(job) {
            tracing::error!(job_id = %job.id, error = %e, "Failed to store agent state");
            return Ok(ProcessingOutcome::failed(e.to_string()));
        }
        self.append_audit(job, &state, recorded_before).await;

        tracing::debug!(
            job_id = %job.id,
            status = %outcome.status,
            history = state.conversation_history.len(),
            "Agent turn finished"
        );
        Ok(outcome)
    }
}
