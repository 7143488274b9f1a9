//! Conversation history compaction.
//!
//! Once a history grows past the ceiling, the oldest chunk after the
//! preserved prefix is folded into one summary message. A failed summary
//! leaves the history untouched so the next turn can try again.

use std::sync::Arc;

use crate::agent::prompts::{COMPACTION_SYSTEM_PROMPT, SUMMARY_PREFIX, transcript};
use crate::config::CompactionConfig;
use crate::error::LlmError;
use crate::llm::{ChatMessage, CompletionRequest, LlmProvider};

const SUMMARY_MAX_TOKENS: u32 = 512;

/// True when a history of `len` messages must be compacted.
pub fn needs_compaction(len: usize, config: &CompactionConfig) -> bool {
    len > config.ceiling
}

/// Summarizes old conversation chunks through the completion service.
pub struct HistoryCompactor {
    llm: Arc<dyn LlmProvider>,
    config: CompactionConfig,
}

impl HistoryCompactor {
    pub fn new(llm: Arc<dyn LlmProvider>, config: CompactionConfig) -> Self {
        Self { llm, config }
    }

    /// Run one compaction pass if the history is over the ceiling.
    ///
    /// Returns how many messages were removed (0 when nothing was due).
    pub async fn compact(&self, history: &mut Vec<ChatMessage>) -> Result<usize, LlmError> {
        if !needs_compaction(history.len(), &self.config) {
            return Ok(0);
        }

        let start = self.config.preserve_prefix.min(history.len());
        let end = (start + self.config.chunk_size).min(history.len());
        if end - start < 2 {
            return Ok(0);
        }

        let request = CompletionRequest::new(vec![
            ChatMessage::system(COMPACTION_SYSTEM_PROMPT),
            ChatMessage::user(transcript(&history[start..end])),
        ])
        .with_max_tokens(SUMMARY_MAX_TOKENS)
        .with_temperature(0.0);

        let response = self.llm.complete(request).await?;
        let summary = response.content.trim();
        if summary.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.llm.model_name().to_string(),
                reason: "empty compaction summary".to_string(),
            });
        }

        let synthetic = ChatMessage::user(format!("{SUMMARY_PREFIX}\n{summary}"));
        history.splice(start..end, std::iter::once(synthetic));

        let removed = end - start - 1;
        tracing::debug!(
            removed,
            remaining = history.len(),
            "Compacted conversation history"
        );
        Ok(removed)
    }
}
