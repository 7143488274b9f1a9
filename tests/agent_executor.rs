//! Agent executor driven by the worker loop with a scripted completion service.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tempfile::TempDir;

use agent_jobs::agent::prompts::SUMMARY_PREFIX;
use agent_jobs::agent::{
    AgentDeps, AgentExecutor, AgentJobState, CLARIFICATION_TAG, ExecutionKind, Persona,
};
use agent_jobs::clock::ManualClock;
use agent_jobs::config::{CompactionConfig, ExecutorConfig, SandboxConfig, WorkerConfig};
use agent_jobs::error::LlmError;
use agent_jobs::jobs::{Job, JobStatus};
use agent_jobs::llm::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role, ToolCall,
    ToolCompletionRequest, ToolCompletionResponse,
};
use agent_jobs::store::{
    AnnotationStore, AuditLog, InMemoryStore, JobRepository, LibSqlStore, QueueRepository,
};
use agent_jobs::tools::ToolRegistry;
use agent_jobs::tools::builtin::register_builtin_tools;
use agent_jobs::worker::{ProcessingStatus, Processor, TickOutcome, WorkerLoop};

/// Answers planning requests from a script and records what it was sent.
struct ScriptedLlm {
    decisions: Mutex<VecDeque<ToolCompletionResponse>>,
    planning_requests: Mutex<Vec<ToolCompletionRequest>>,
    summaries: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    fn new(decisions: Vec<ToolCompletionResponse>) -> Arc<Self> {
        Arc::new(Self {
            decisions: Mutex::new(decisions.into()),
            planning_requests: Mutex::new(Vec::new()),
            summaries: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn model_name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        self.summaries.lock().unwrap().push(request);
        Ok(CompletionResponse {
            content: "the user said hello several times".to_string(),
            input_tokens: 10,
            output_tokens: 5,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        self.planning_requests.lock().unwrap().push(request);
        self.decisions
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| LlmError::RequestFailed {
                provider: "scripted".to_string(),
                reason: "script exhausted".to_string(),
            })
    }
}

fn decision(content: &str, tool_calls: Vec<ToolCall>) -> ToolCompletionResponse {
    let finish_reason = if tool_calls.is_empty() {
        FinishReason::Stop
    } else {
        FinishReason::ToolUse
    };
    ToolCompletionResponse {
        content: Some(content.to_string()),
        tool_calls,
        input_tokens: 0,
        output_tokens: 0,
        finish_reason,
        response_id: None,
    }
}

struct Harness {
    store: Arc<InMemoryStore>,
    worker: Arc<WorkerLoop>,
    executor: Arc<AgentExecutor>,
    queue_id: uuid::Uuid,
    _sandbox: TempDir,
    sandbox_root: std::path::PathBuf,
}

async fn harness(llm: Arc<ScriptedLlm>, config: ExecutorConfig) -> Harness {
    let sandbox = TempDir::new().unwrap();
    let sandbox_root = sandbox.path().to_path_buf();
    let clock = Arc::new(ManualClock::default());
    let store = Arc::new(InMemoryStore::with_clock(clock.clone()));
    let queue = store.create_queue("Q").await.unwrap();

    let tools = Arc::new(ToolRegistry::new());
    let annotations: Arc<dyn AnnotationStore> = store.clone();
    register_builtin_tools(
        &tools,
        &SandboxConfig {
            root: sandbox_root.clone(),
            ..SandboxConfig::default()
        },
        Some(annotations.clone()),
    )
    .await;

    let deps = AgentDeps::new(Some(llm), tools)
        .with_annotations(annotations)
        .with_audit(store.clone());
    let executor = Arc::new(AgentExecutor::new(
        Persona::new("agent-1", "Builder", "software engineer"),
        deps,
        config,
    ));

    let worker = Arc::new(
        WorkerLoop::new(
            &queue,
            store.clone(),
            store.clone(),
            executor.clone(),
            WorkerConfig::default(),
        )
        .with_clock(clock),
    );

    Harness {
        store,
        worker,
        executor,
        queue_id: queue.id,
        _sandbox: sandbox,
        sandbox_root,
    }
}

#[tokio::test]
async fn write_file_turn_then_completion() {
    let llm = ScriptedLlm::new(vec![
        decision(
            "",
            vec![ToolCall {
                id: "call_1".to_string(),
                name: "write_file".to_string(),
                arguments: serde_json::json!({"path": "X.txt", "content": "hello"}),
            }],
        ),
        decision(
            r#"{"finalSummary": "created X", "output": {"file": "X.txt"}}"#,
            vec![],
        ),
    ]);
    let h = harness(llm.clone(), ExecutorConfig::default()).await;

    let job = Job::new(h.queue_id, "J1", serde_json::json!({"goal": "create file X"}))
        .with_priority(5)
        .unwrap();
    h.store.add(&job).await.unwrap();

    // Turn 1: one tool call.
    let outcome = h.worker.tick().await.unwrap();
    assert_eq!(
        outcome,
        TickOutcome::Processed {
            job_id: job.id,
            status: ProcessingStatus::ContinueProcessing
        }
    );
    let stored = h.store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Waiting);

    let state = AgentJobState::load(&stored).unwrap();
    assert_eq!(state.execution_history.len(), 1);
    assert_eq!(state.execution_history[0].kind, ExecutionKind::ToolCall);
    assert_eq!(state.execution_history[0].name.as_deref(), Some("write_file"));
    assert!(state.execution_history[0].error.is_none());

    let tool_msg = state
        .conversation_history
        .iter()
        .find(|m| m.role == Role::Tool)
        .expect("tool result in history");
    assert_eq!(tool_msg.tool_call_id.as_deref(), Some("call_1"));
    assert_eq!(
        std::fs::read_to_string(h.sandbox_root.join("X.txt")).unwrap(),
        "hello"
    );

    // Turn 2: final answer.
    let outcome = h.worker.tick().await.unwrap();
    assert!(matches!(
        outcome,
        TickOutcome::Processed {
            status: ProcessingStatus::Completed,
            ..
        }
    ));
    let stored = h.store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Completed);
    assert_eq!(stored.result(), Some(&serde_json::json!({"file": "X.txt"})));

    let requests = llm.planning_requests.lock().unwrap();
    assert_eq!(requests.len(), 2);
    assert!(requests[1].messages.iter().any(|m| m.role == Role::Tool));
    assert!(requests[0].tools.iter().any(|t| t.name == "write_file"));
    assert!(requests[0].response_schema.is_some());

    let audit = h.store.list_for_job(job.id).await.unwrap();
    assert_eq!(audit.first().map(|r| r.kind.as_str()), Some("tool_call"));
}

#[tokio::test]
async fn sandbox_escape_is_reported_to_the_model() {
    let llm = ScriptedLlm::new(vec![decision(
        "",
        vec![ToolCall {
            id: "call_1".to_string(),
            name: "write_file".to_string(),
            arguments: serde_json::json!({"path": "../outside.txt", "content": "x"}),
        }],
    )]);
    let h = harness(llm, ExecutorConfig::default()).await;
    let mut job = Job::new(h.queue_id, "escape", serde_json::json!({"goal": "escape"}));

    let outcome = h.executor.process(&mut job).await.unwrap();
    assert_eq!(outcome.status, ProcessingStatus::ContinueProcessing);

    let state = AgentJobState::load(&job).unwrap();
    let entry = &state.execution_history[0];
    assert!(entry.error.as_deref().unwrap().contains("sandbox"));
    let last = state.conversation_history.last().unwrap();
    assert!(last.content.contains("error"));
    assert!(!h.sandbox_root.parent().unwrap().join("outside.txt").exists());
}

#[tokio::test]
async fn clarifying_questions_are_annotated() {
    let llm = ScriptedLlm::new(vec![decision(
        r#"{"clarifyingQuestions": ["Which auth method?"]}"#,
        vec![ToolCall {
            id: "ignored".to_string(),
            name: "shell".to_string(),
            arguments: serde_json::json!({"command": "rm -rf build"}),
        }],
    )]);
    let h = harness(llm, ExecutorConfig::default()).await;
    let job = Job::new(h.queue_id, "J1", serde_json::json!({"goal": "add login"}));
    h.store.add(&job).await.unwrap();

    let outcome = h.worker.tick().await.unwrap();
    assert!(matches!(
        outcome,
        TickOutcome::Processed {
            status: ProcessingStatus::ContinueProcessing,
            ..
        }
    ));

    let notes = h.store.find_by_tag(CLARIFICATION_TAG).await.unwrap();
    assert_eq!(notes.len(), 1);
    assert!(notes[0].has_tag(&format!("job:{}", job.id)));
    assert_eq!(notes[0].content, "Which auth method?");
    assert_eq!(notes[0].agent_id.as_deref(), Some("agent-1"));

    let stored = h.store.find_by_id(job.id).await.unwrap().unwrap();
    assert_eq!(stored.status(), JobStatus::Waiting);
    let state = AgentJobState::load(&stored).unwrap();
    // Only the seeded system and task messages; no tool calls were attempted.
    assert_eq!(state.conversation_history.len(), 2);
    assert!(state.conversation_history.iter().all(|m| m.tool_calls.is_empty()));
}

#[tokio::test]
async fn long_history_is_compacted_before_planning() {
    let llm = ScriptedLlm::new(vec![decision(r#"{"finalSummary": "done"}"#, vec![])]);
    let config = ExecutorConfig {
        compaction: CompactionConfig {
            ceiling: 6,
            chunk_size: 3,
            preserve_prefix: 2,
        },
        ..ExecutorConfig::default()
    };
    let h = harness(llm.clone(), config).await;

    let mut job = Job::new(h.queue_id, "long", serde_json::json!({"goal": "chat"}));
    let mut state = AgentJobState::default();
    state.conversation_history = vec![
        ChatMessage::system("sys"),
        ChatMessage::user("Task: chat"),
    ];
    for i in 0..5 {
        state
            .conversation_history
            .push(ChatMessage::user(format!("hello {i}")));
    }
    state.store(&mut job).unwrap();

    let outcome = h.executor.process(&mut job).await.unwrap();
    assert_eq!(outcome.status, ProcessingStatus::Completed);

    let requests = llm.planning_requests.lock().unwrap();
    let sent = &requests[0].messages;
    assert_eq!(sent.len(), 7 - (3 - 1));
    assert_eq!(sent[0].content, "sys");
    assert!(sent[2].content.starts_with(SUMMARY_PREFIX));
    assert_eq!(sent[3].content, "hello 3");
    assert_eq!(llm.summaries.lock().unwrap().len(), 1);

    let state = AgentJobState::load(&job).unwrap();
    assert!(
        state
            .execution_history
            .iter()
            .any(|e| e.name.as_deref() == Some("history_compacted"))
    );
}

#[tokio::test]
async fn history_at_ceiling_is_not_compacted() {
    let llm = ScriptedLlm::new(vec![decision(r#"{"finalSummary": "done"}"#, vec![])]);
    let config = ExecutorConfig {
        compaction: CompactionConfig {
            ceiling: 6,
            chunk_size: 3,
            preserve_prefix: 2,
        },
        ..ExecutorConfig::default()
    };
    let h = harness(llm.clone(), config).await;

    let mut job = Job::new(h.queue_id, "short", serde_json::json!({"goal": "chat"}));
    let mut state = AgentJobState::default();
    state.conversation_history = (0..6)
        .map(|i| ChatMessage::user(format!("m{i}")))
        .collect();
    state.store(&mut job).unwrap();

    h.executor.process(&mut job).await.unwrap();
    assert_eq!(llm.planning_requests.lock().unwrap()[0].messages.len(), 6);
    assert!(llm.summaries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn agent_state_survives_the_database() {
    let store = LibSqlStore::new_memory().await.unwrap();
    let queue = store.create_queue("durable").await.unwrap();
    let job = Job::new(queue.id, "persist", serde_json::json!({"goal": "x"}));
    store.add(&job).await.unwrap();
    let mut job = store.mark_job_as_started(job.id).await.unwrap();

    let mut state = AgentJobState::default();
    state.conversation_history = vec![
        ChatMessage::system("sys"),
        ChatMessage::user("Task: x"),
        ChatMessage::assistant_with_tool_calls(
            Some("listing".to_string()),
            vec![ToolCall {
                id: "c1".to_string(),
                name: "list_dir".to_string(),
                arguments: serde_json::json!({"path": "."}),
            }],
        ),
        ChatMessage::tool_result("c1", "list_dir", "a.txt"),
        ChatMessage::assistant("found a.txt"),
    ];
    state.last_failure_summary = Some("first try timed out".to_string());
    state.store(&mut job).unwrap();
    store.save(&job).await.unwrap();

    let reloaded = store.find_by_id(job.id).await.unwrap().unwrap();
    let back = AgentJobState::load(&reloaded).unwrap();
    assert_eq!(back.conversation_history.len(), 5);
    assert_eq!(back, state);
    assert_eq!(reloaded.status(), JobStatus::Active);
}
