//! Annotation tool: lets the agent leave tagged notes for humans or later turns.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::store::{Annotation, AnnotationStore};
use crate::tools::tool::{ExecutionContext, Tool, ToolError, ToolOutput, require_str};

pub struct AnnotateTool {
    store: Arc<dyn AnnotationStore>,
}

impl AnnotateTool {
    pub fn new(store: Arc<dyn AnnotationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Tool for AnnotateTool {
    fn name(&self) -> &str {
        "annotate"
    }

    fn description(&self) -> &str {
        "Record a note about the current task. Notes are tagged so they can be \
         found later; the current job is tagged automatically."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "content": {
                    "type": "string",
                    "description": "The note to record"
                },
                "tags": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Extra tags for the note (optional)"
                }
            },
            "required": ["content"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let content = require_str(&params, "content")?;
        if content.trim().is_empty() {
            return Err(ToolError::InvalidParameters(
                "'content' must not be empty".to_string(),
            ));
        }

        let mut tags: Vec<String> = params
            .get("tags")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|t| t.as_str())
                    .map(|t| t.trim().to_string())
                    .filter(|t| !t.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let job_tag = format!("job:{}", ctx.job_id);
        if !tags.contains(&job_tag) {
            tags.push(job_tag);
        }

        let annotation = Annotation::new(content, tags)
            .for_job(ctx.job_id)
            .by_agent(ctx.agent_id.clone());
        let id = annotation.id;
        let recorded_tags = annotation.tags.clone();

        self.store
            .record(annotation)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("failed to record annotation: {e}")))?;

        Ok(ToolOutput::success(
            serde_json::json!({
                "id": id.to_string(),
                "tags": recorded_tags,
                "success": true
            }),
            start.elapsed(),
        ))
    }
}
