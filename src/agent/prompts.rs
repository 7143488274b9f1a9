//! Prompt text for planning, compaction and replanning.

use crate::agent::persona::Persona;
use crate::jobs::Job;
use crate::llm::{ChatMessage, Role, ToolDefinition};

/// Longest rendering of a single message inside a summarization transcript.
const TRANSCRIPT_MESSAGE_CHARS: usize = 2000;

/// System prompt opening every conversation.
pub fn system_prompt(persona: &Persona, tools: &[ToolDefinition]) -> String {
    let mut prompt = format!("You are {}, a {}.\n", persona.name, persona.role);
    if !persona.goal.is_empty() {
        prompt.push_str(&format!("Your overall goal: {}.\n", persona.goal));
    }
    if !persona.backstory.is_empty() {
        prompt.push_str(&format!("Background: {}\n", persona.backstory));
    }

    prompt.push_str("\n## Tools\n");
    if tools.is_empty() {
        prompt.push_str("No tools are available.\n");
    } else {
        for tool in tools {
            prompt.push_str(&format!("- {}: {}\n", tool.name, tool.description));
        }
    }

    prompt.push_str(
        "\n## Workflow\n\
         - Work one step at a time. Call tools to inspect and change the workspace; \
         you will see each result before your next step.\n\
         - Never assume a tool succeeded. Read its result.\n\
         - When the goal is complete, call no tools and reply with a JSON object \
         holding `finalSummary` and, if useful, `output`.\n\
         - If you cannot proceed without information only a human has, reply with \
         `clarifyingQuestions`.\n\
         - If your approach is clearly failing, reply with `requestReplan: true` and a \
         `replanReason`; the conversation will restart with a summary of this attempt.\n",
    );
    prompt
}

/// The task goal: the payload's `goal` or `prompt` field, a bare string
/// payload, or failing those the job name.
pub fn task_goal(job: &Job) -> String {
    let payload = job.payload();
    ["goal", "prompt"]
        .iter()
        .find_map(|key| payload.get(*key).and_then(|v| v.as_str()))
        .or_else(|| payload.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| job.name.clone())
}

/// First user turn of a (re)seeded conversation.
pub fn initial_user_message(goal: &str, last_failure_summary: Option<&str>) -> String {
    let mut message = format!("Task: {goal}");
    if let Some(summary) = last_failure_summary.filter(|s| !s.trim().is_empty()) {
        message.push_str(
            "\n\nA previous attempt at this task was abandoned. What happened:\n",
        );
        message.push_str(summary.trim());
        message.push_str("\n\nTake a different approach this time.");
    }
    message
}

pub const COMPACTION_SYSTEM_PROMPT: &str = "You condense agent conversations. Summarize the \
messages below in a few sentences. Keep file names, commands, tool results and decisions \
that later steps may depend on. Reply with the summary only.";

pub const REPLAN_SYSTEM_PROMPT: &str = "An agent abandoned its current plan. Summarize the \
attempt below in a few sentences: what it tried, what went wrong, and anything it learned \
that the next attempt should know. Reply with the summary only.";

/// Prefix of the synthetic message that replaces a compacted chunk.
pub const SUMMARY_PREFIX: &str = "[Summary of earlier conversation]";

/// Render messages as plain text for a summarization request.
pub fn transcript(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for msg in messages {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        let mut line = match &msg.name {
            Some(name) => format!("[{role}:{name}] "),
            None => format!("[{role}] "),
        };
        line.push_str(&clip(&msg.content, TRANSCRIPT_MESSAGE_CHARS));
        for call in &msg.tool_calls {
            line.push_str(&format!("\n  -> {}({})", call.name, call.arguments));
        }
        out.push_str(&line);
        out.push('\n');
    }
    out
}

fn clip(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &s[..idx]),
        None => s.to_string(),
    }
}
