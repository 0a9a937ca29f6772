// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use sigrid_model::{ToolResultPart, Usage};

/// The result of executing a tool.
///
/// `parts` is what the model sees; `details` is an opaque payload carried
/// through to renderers and the session log but never sent to the model.
/// Sub-agent tools report their own token `usage` so the parent session can
/// account for it.
#[derive(Debug, Clone, Default)]
pub struct ToolResult {
    pub parts: Vec<ToolResultPart>,
    pub details: Option<Value>,
    pub is_error: bool,
    pub usage: Option<Usage>,
}

impl ToolResult {
    /// Successful plain-text result.
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            parts: vec![ToolResultPart::text(content)],
            ..Default::default()
        }
    }

    /// Error result containing a plain-text error message.
    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            parts: vec![ToolResultPart::text(msg)],
            is_error: true,
            ..Default::default()
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// Plain-text content — concatenation of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                ToolResultPart::Text { text } => Some(text.as_str()),
                ToolResultPart::Image { .. } => None,
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A streamed partial result, forwarded as a `tool_call_update` event.
#[derive(Debug, Clone)]
pub struct ToolUpdate {
    pub call_id: String,
    pub parts: Vec<ToolResultPart>,
}

/// Narrow view of the session a tool may consult during execution.
///
/// Deliberately small: tools must not reach back into the session core.
#[derive(Clone)]
pub struct ToolCtx {
    pub model_id: String,
    pub cwd: PathBuf,
    pub session_file: Option<PathBuf>,
    /// Number of user messages queued behind the current turn, letting
    /// long-running tools yield early when the user has moved on.
    pub queued_messages: Arc<dyn Fn() -> usize + Send + Sync>,
}

impl ToolCtx {
    pub fn new(model_id: impl Into<String>, cwd: PathBuf) -> Self {
        Self {
            model_id: model_id.into(),
            cwd,
            session_file: None,
            queued_messages: Arc::new(|| 0),
        }
    }
}

impl std::fmt::Debug for ToolCtx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCtx")
            .field("model_id", &self.model_id)
            .field("cwd", &self.cwd)
            .field("session_file", &self.session_file)
            .finish()
    }
}

/// Trait every tool must implement.
///
/// `execute` receives the model-chosen call id, parsed JSON arguments, a
/// channel for streaming partial results, the narrow session view, and a
/// cancellation token.  A cancelled tool must return promptly with
/// `is_error = true`; errors are wrapped in [`ToolResult::err`], never
/// propagated as panics.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    /// JSON Schema for parameters
    fn parameters_schema(&self) -> Value;
    async fn execute(
        &self,
        call_id: &str,
        args: &Value,
        updates: mpsc::Sender<ToolUpdate>,
        ctx: &ToolCtx,
        cancel: CancellationToken,
    ) -> ToolResult;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn ok_result_has_single_text_part() {
        let r = ToolResult::ok("hello");
        assert!(!r.is_error);
        assert_eq!(r.text(), "hello");
        assert_eq!(r.parts.len(), 1);
    }

    #[test]
    fn err_result_sets_flag() {
        let r = ToolResult::err("boom");
        assert!(r.is_error);
        assert_eq!(r.text(), "boom");
    }

    #[test]
    fn details_are_carried_opaquely() {
        let r = ToolResult::ok("x").with_details(json!({"diff": "+1 -1"}));
        assert_eq!(r.details.unwrap()["diff"], "+1 -1");
    }

    #[test]
    fn text_skips_image_parts() {
        let r = ToolResult {
            parts: vec![
                ToolResultPart::text("caption"),
                ToolResultPart::Image {
                    mime_type: "image/png".into(),
                    data: "AAAA".into(),
                },
            ],
            ..Default::default()
        };
        assert_eq!(r.text(), "caption");
    }

    #[test]
    fn ctx_default_queue_probe_returns_zero() {
        let ctx = ToolCtx::new("m", PathBuf::from("/tmp"));
        assert_eq!((ctx.queued_messages)(), 0);
    }
}
