//! Parsing a completion into exactly one planning decision.
//!
//! The model may populate several fields of its structured reply at once.
//! Precedence is fixed: clarifying questions, then a replan request, then
//! tool calls, then a final answer.

use serde::{Deserialize, Serialize};

use crate::error::LlmError;
use crate::llm::provider::{FinishReason, ToolCall, ToolCompletionResponse};

/// The one authoritative outcome of a planning step.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentDecision {
    /// A human must answer these before planning can continue.
    Clarify { questions: Vec<String> },
    /// Discard the conversation and start over.
    Replan { reason: String },
    /// Run these tools, in order.
    UseTools {
        calls: Vec<ToolCall>,
        thought: Option<String>,
    },
    /// The goal is met.
    Finish {
        summary: String,
        output: Option<serde_json::Value>,
    },
}

/// Shape of the JSON text the model is asked to produce.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StructuredReply {
    #[serde(default, alias = "final_summary", skip_serializing_if = "Option::is_none")]
    pub final_summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, alias = "request_replan", skip_serializing_if = "Option::is_none")]
    pub request_replan: Option<bool>,
    #[serde(default, alias = "replan_reason", skip_serializing_if = "Option::is_none")]
    pub replan_reason: Option<String>,
    #[serde(
        default,
        alias = "clarifying_questions",
        skip_serializing_if = "Option::is_none"
    )]
    pub clarifying_questions: Option<Vec<String>>,
}

impl StructuredReply {
    /// Parse the text part of a reply. Text that is not a JSON object is taken
    /// as a bare final summary.
    pub fn parse(content: &str) -> Self {
        let trimmed = strip_code_fence(content.trim());
        if trimmed.starts_with('{')
            && let Ok(reply) = serde_json::from_str::<StructuredReply>(trimmed)
        {
            return reply;
        }
        Self {
            final_summary: (!trimmed.is_empty()).then(|| trimmed.to_string()),
            ..Self::default()
        }
    }
}

/// JSON schema for [`StructuredReply`], sent with every planning request.
pub fn decision_response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "finalSummary": {
                "type": "string",
                "description": "Summary of what was accomplished. Set only when the goal is complete."
            },
            "output": {
                "description": "Structured result of the task, if any."
            },
            "requestReplan": {
                "type": "boolean",
                "description": "Set to true to abandon the current approach and start over."
            },
            "replanReason": {
                "type": "string",
                "description": "Why the current approach failed."
            },
            "clarifyingQuestions": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Questions a human must answer before work can continue."
            }
        },
        "additionalProperties": false
    })
}

impl AgentDecision {
    /// Derive the decision for a tool-enabled completion.
    ///
    /// A reply with no tool calls that did not stop normally (length limit,
    /// content filter, unknown) is an error rather than a silent finish.
    pub fn from_response(response: &ToolCompletionResponse) -> Result<Self, LlmError> {
        let reply = response
            .content
            .as_deref()
            .map(StructuredReply::parse)
            .unwrap_or_default();

        let questions: Vec<String> = reply
            .clarifying_questions
            .clone()
            .unwrap_or_default()
            .into_iter()
            .map(|q| q.trim().to_string())
            .filter(|q| !q.is_empty())
            .collect();
        if !questions.is_empty() {
            return Ok(Self::Clarify { questions });
        }

        if reply.request_replan.unwrap_or(false) {
            return Ok(Self::Replan {
                reason: reply
                    .replan_reason
                    .unwrap_or_else(|| "no reason given".to_string()),
            });
        }

        if !response.tool_calls.is_empty() {
            return Ok(Self::UseTools {
                calls: response.tool_calls.clone(),
                thought: reply.final_summary.or(response.content.clone()),
            });
        }

        match response.finish_reason {
            FinishReason::Stop | FinishReason::ToolUse => Ok(Self::Finish {
                summary: reply.final_summary.unwrap_or_default(),
                output: reply.output,
            }),
            other => Err(LlmError::InvalidResponse {
                provider: "completion".to_string(),
                reason: format!("completion ended with {other:?} and requested no tools"),
            }),
        }
    }
}

fn strip_code_fence(s: &str) -> &str {
    let Some(rest) = s.strip_prefix("```") else {
        return s;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}
