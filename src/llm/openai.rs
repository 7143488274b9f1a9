//! OpenAI-compatible chat completions client.
//!
//! Speaks the `/chat/completions` wire format, which most hosted and local
//! model servers accept.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::error::{ConfigError, LlmError};
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
    ToolCall, ToolCompletionRequest, ToolCompletionResponse, ToolDefinition,
};

const PROVIDER: &str = "openai";

/// HTTP client for an OpenAI-compatible endpoint.
pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    api_key: SecretString,
}

impl OpenAiProvider {
    /// Build a client. Fails when no API key is configured.
    pub fn new(config: &LlmConfig) -> Result<Self, ConfigError> {
        let api_key = config.require_api_key()?.clone();
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ConfigError::InvalidValue {
                key: "AGENT_JOBS_LLM_TIMEOUT_SECS".to_string(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        tracing::info!(model = %config.model, base_url = %config.base_url, "Using OpenAI-compatible provider");
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
        })
    }

    async fn send(&self, body: &WireRequest<'_>) -> Result<WireResponse, LlmError> {
        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(self.api_key.expose_secret())
            .json(body)
            .send()
            .await
            .map_err(|e| LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            return Err(LlmError::AuthFailed {
                provider: PROVIDER.to_string(),
            });
        }
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(LlmError::RateLimited {
                provider: PROVIDER.to_string(),
                retry_after,
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(LlmError::RequestFailed {
                provider: PROVIDER.to_string(),
                reason: format!("HTTP {status}: {}", truncate(&text, 500)),
            });
        }

        let text = response.text().await.map_err(|e| LlmError::RequestFailed {
            provider: PROVIDER.to_string(),
            reason: e.to_string(),
        })?;
        parse_response(&text)
    }
}

#[async_trait]
impl LlmProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let body = WireRequest {
            model: &self.model,
            messages: wire_messages(&request.messages),
            tools: Vec::new(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: None,
        };
        let wire = self.send(&body).await?;
        let choice = first_choice(wire.choices)?;
        Ok(CompletionResponse {
            content: choice.message.content.unwrap_or_default(),
            input_tokens: wire.usage.as_ref().map_or(0, |u| u.prompt_tokens),
            output_tokens: wire.usage.as_ref().map_or(0, |u| u.completion_tokens),
            finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
            response_id: wire.id,
        })
    }

    async fn complete_with_tools(
        &self,
        request: ToolCompletionRequest,
    ) -> Result<ToolCompletionResponse, LlmError> {
        let body = build_tool_request(&self.model, &request);
        let wire = self.send(&body).await?;
        into_tool_response(wire)
    }
}

// ── Wire format ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct WireRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<WireTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tool_calls: Vec<WireToolCall>,
}

impl From<&ChatMessage> for WireMessage {
    fn from(msg: &ChatMessage) -> Self {
        let role = match msg.role {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        Self {
            role,
            content: msg.content.clone(),
            tool_call_id: msg.tool_call_id.clone(),
            name: msg.name.clone(),
            tool_calls: msg
                .tool_calls
                .iter()
                .map(|tc| WireToolCall {
                    id: tc.id.clone(),
                    kind: "function".to_string(),
                    function: WireFunctionCall {
                        name: tc.name.clone(),
                        arguments: tc.arguments.to_string(),
                    },
                })
                .collect(),
        }
    }
}

impl WireMessage {
    /// A tool result whose call is no longer in the history, replayed as a user turn.
    fn detached_result(msg: &ChatMessage) -> Self {
        let name = msg.name.as_deref().unwrap_or("unknown");
        Self {
            role: "user",
            content: format!("[tool {name} result]\n{}", msg.content),
            tool_call_id: None,
            name: None,
            tool_calls: Vec::new(),
        }
    }
}

/// Convert a history to wire messages.
///
/// Compaction can fold an assistant `tool_calls` message into a summary while
/// its results stay behind. Endpoints reject a `tool` message without a
/// preceding call, so such results are sent as user content instead.
fn wire_messages(messages: &[ChatMessage]) -> Vec<WireMessage> {
    let mut issued: HashSet<&str> = HashSet::new();
    let mut wire = Vec::with_capacity(messages.len());
    for msg in messages {
        issued.extend(msg.tool_calls.iter().map(|tc| tc.id.as_str()));
        let answered = msg
            .tool_call_id
            .as_deref()
            .is_some_and(|id| issued.contains(id));
        if matches!(msg.role, Role::Tool) && !answered {
            wire.push(WireMessage::detached_result(msg));
        } else {
            wire.push(WireMessage::from(msg));
        }
    }
    wire
}

#[derive(Debug, Serialize)]
struct WireTool {
    #[serde(rename = "type")]
    kind: &'static str,
    function: WireFunction,
}

#[derive(Debug, Serialize)]
struct WireFunction {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

impl From<&ToolDefinition> for WireTool {
    fn from(def: &ToolDefinition) -> Self {
        Self {
            kind: "function",
            function: WireFunction {
                name: def.name.clone(),
                description: def.description.clone(),
                parameters: def.parameters.clone(),
            },
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct WireToolCall {
    id: String,
    #[serde(rename = "type", default = "function_kind")]
    kind: String,
    function: WireFunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

#[derive(Debug, Serialize, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct WireResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChoice {
    message: WireReply,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireReply {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
}

fn build_tool_request<'a>(model: &'a str, request: &ToolCompletionRequest) -> WireRequest<'a> {
    WireRequest {
        model,
        messages: wire_messages(&request.messages),
        tools: request.tools.iter().map(WireTool::from).collect(),
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        response_format: request.response_schema.as_ref().map(|schema| {
            serde_json::json!({
                "type": "json_schema",
                "json_schema": { "name": "agent_decision", "schema": schema }
            })
        }),
    }
}

fn parse_response(text: &str) -> Result<WireResponse, LlmError> {
    serde_json::from_str(text).map_err(|e| LlmError::InvalidResponse {
        provider: PROVIDER.to_string(),
        reason: format!("{e}: {}", truncate(text, 200)),
    })
}

fn first_choice(choices: Vec<WireChoice>) -> Result<WireChoice, LlmError> {
    choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::InvalidResponse {
            provider: PROVIDER.to_string(),
            reason: "response contained no choices".to_string(),
        })
}

fn into_tool_response(wire: WireResponse) -> Result<ToolCompletionResponse, LlmError> {
    let input_tokens = wire.usage.as_ref().map_or(0, |u| u.prompt_tokens);
    let output_tokens = wire.usage.as_ref().map_or(0, |u| u.completion_tokens);
    let response_id = wire.id;
    let choice = first_choice(wire.choices)?;

    let tool_calls = choice
        .message
        .tool_calls
        .into_iter()
        .map(|tc| ToolCall {
            id: tc.id,
            name: tc.function.name,
            arguments: parse_arguments(&tc.function.arguments),
        })
        .collect();

    Ok(ToolCompletionResponse {
        content: choice.message.content.filter(|c| !c.is_empty()),
        tool_calls,
        input_tokens,
        output_tokens,
        finish_reason: map_finish_reason(choice.finish_reason.as_deref()),
        response_id,
    })
}

/// Tool arguments arrive as a JSON string. Keep unparseable text as a string
/// so argument validation can report it.
fn parse_arguments(raw: &str) -> serde_json::Value {
    if raw.trim().is_empty() {
        return serde_json::json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("stop") => FinishReason::Stop,
        Some("length") => FinishReason::Length,
        Some("tool_calls") | Some("function_call") => FinishReason::ToolUse,
        Some("content_filter") => FinishReason::ContentFilter,
        _ => FinishReason::Unknown,
    }
}

fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        format!("{}...", s.chars().take(max_chars).collect::<String>())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_key_is_config_error() {
        let config = LlmConfig::default();
        assert!(matches!(
            OpenAiProvider::new(&config),
            Err(ConfigError::MissingRequired { .. })
        ));
    }

    #[test]
    fn tool_request_includes_schema_and_tools() {
        let request = ToolCompletionRequest::new(
            vec![
                ChatMessage::system("sys"),
                ChatMessage::assistant_with_tool_calls(
                    None,
                    vec![ToolCall {
                        id: "c1".into(),
                        name: "shell".into(),
                        arguments: serde_json::json!({"command": "ls"}),
                    }],
                ),
                ChatMessage::tool_result("c1", "shell", "ok"),
            ],
            vec![ToolDefinition {
                name: "shell".into(),
                description: "run".into(),
                parameters: serde_json::json!({"type": "object"}),
            }],
        )
        .with_response_schema(serde_json::json!({"type": "object"}));

        let body = serde_json::to_value(build_tool_request("m", &request)).unwrap();
        assert_eq!(body["model"], "m");
        assert_eq!(body["tools"][0]["function"]["name"], "shell");
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["messages"][1]["tool_calls"][0]["function"]["arguments"], "{\"command\":\"ls\"}");
        assert_eq!(body["messages"][2]["role"], "tool");
        assert_eq!(body["messages"][2]["tool_call_id"], "c1");
    }

    #[test]
    fn results_without_their_call_become_user_turns() {
        // Shape left behind when a compaction chunk ends between a call and its results.
        let request = ToolCompletionRequest::new(
            vec![
                ChatMessage::system("sys"),
                ChatMessage::user("goal"),
                ChatMessage::user("[Summary of earlier conversation]\nlisted files"),
                ChatMessage::tool_result("a3", "shell", "a.txt"),
                ChatMessage::tool_result("b3", "read_file", "hello"),
                ChatMessage::assistant_with_tool_calls(
                    None,
                    vec![ToolCall {
                        id: "a4".into(),
                        name: "shell".into(),
                        arguments: serde_json::json!({"command": "pwd"}),
                    }],
                ),
                ChatMessage::tool_result("a4", "shell", "/sandbox"),
            ],
            Vec::new(),
        );

        let body = serde_json::to_value(build_tool_request("m", &request)).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 7);

        assert_eq!(messages[3]["role"], "user");
        assert_eq!(messages[3]["content"], "[tool shell result]\na.txt");
        assert!(messages[3].get("tool_call_id").is_none());
        assert_eq!(messages[4]["role"], "user");
        assert_eq!(messages[4]["content"], "[tool read_file result]\nhello");

        assert_eq!(messages[6]["role"], "tool");
        assert_eq!(messages[6]["tool_call_id"], "a4");
        assert!(
            messages
                .iter()
                .filter(|m| m["role"] == "tool")
                .all(|m| m["tool_call_id"] == "a4")
        );
    }

    #[test]
    fn parses_tool_call_response() {
        let text = r#"{
            "id": "resp_1",
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [{
                        "id": "call_1",
                        "type": "function",
                        "function": {"name": "write_file", "arguments": "{\"path\":\"x\",\"content\":\"y\"}"}
                    }]
                },
                "finish_reason": "tool_calls"
            }],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        }"#;
        let resp = into_tool_response(parse_response(text).unwrap()).unwrap();
        assert_eq!(resp.finish_reason, FinishReason::ToolUse);
        assert_eq!(resp.tool_calls.len(), 1);
        assert_eq!(resp.tool_calls[0].arguments["path"], "x");
        assert_eq!(resp.input_tokens, 12);
        assert!(resp.content.is_none());
        assert_eq!(resp.response_id.as_deref(), Some("resp_1"));
    }

    #[test]
    fn empty_choices_is_invalid() {
        let wire = parse_response(r#"{"choices": []}"#).unwrap();
        assert!(into_tool_response(wire).is_err());
    }

    #[test]
    fn malformed_arguments_stay_as_text() {
        assert_eq!(
            parse_arguments("{not json"),
            serde_json::Value::String("{not json".into())
        );
        assert_eq!(parse_arguments(""), serde_json::json!({}));
    }

    #[test]
    fn finish_reasons() {
        assert_eq!(map_finish_reason(Some("stop")), FinishReason::Stop);
        assert_eq!(map_finish_reason(Some("length")), FinishReason::Length);
        assert_eq!(map_finish_reason(None), FinishReason::Unknown);
    }
}
