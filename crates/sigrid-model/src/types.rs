// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

use crate::thinking::ThinkingLevel;

// ─── Roles and stop reasons ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// Why the model stopped producing output for one assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Normal completion; the model is done with the user's request.
    EndTurn,
    /// The model requested one or more tool calls and expects results.
    ToolUse,
    /// The stream was cancelled externally; content blocks are partial.
    Aborted,
    /// The provider reported an error; see `error_message`.
    Error,
    /// The provider hit its output-token ceiling.
    Length,
}

impl StopReason {
    /// A terminal reason ends the agent loop; `ToolUse` continues it.
    pub fn is_terminal(self) -> bool {
        !matches!(self, StopReason::ToolUse)
    }
}

// ─── Usage accounting ─────────────────────────────────────────────────────────

/// Token usage for one assistant message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub input: u64,
    pub output: u64,
    pub cache_read: u64,
    pub cache_write: u64,
    /// Cost in USD as reported (or estimated) by the provider driver.
    #[serde(default)]
    pub cost: f64,
}

impl Usage {
    /// Total context the request occupied — the quantity compared against
    /// the model's context window when deciding whether to compact.
    pub fn context_tokens(&self) -> u64 {
        self.input + self.output + self.cache_read + self.cache_write
    }

    pub fn add(&mut self, other: &Usage) {
        self.input += other.input;
        self.output += other.output;
        self.cache_read += other.cache_read;
        self.cache_write += other.cache_write;
        self.cost += other.cost;
    }
}

// ─── Content blocks ───────────────────────────────────────────────────────────

/// One block inside an assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolCall {
        id: String,
        name: String,
        /// Parsed JSON argument object.
        #[serde(default)]
        arguments: serde_json::Value,
    },
}

/// One part of a user message (text or inline image).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UserPart {
    Text { text: String },
    Image { mime_type: String, data: String },
}

/// One part of a tool result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ToolResultPart {
    Text { text: String },
    Image { mime_type: String, data: String },
}

impl ToolResultPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

// ─── Messages ─────────────────────────────────────────────────────────────────

/// A full assistant message: ordered content blocks plus stop metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub blocks: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default)]
    pub usage: Usage,
}

impl AssistantMessage {
    /// Concatenated text of all `Text` blocks.
    pub fn text(&self) -> String {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// All tool-call blocks, in order.
    pub fn tool_calls(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some((id.as_str(), name.as_str(), arguments)),
                _ => None,
            })
            .collect()
    }
}

/// An LLM-facing conversation message.
///
/// This is a tagged sum rather than a `role` + `content` pair so that new
/// variants are compile-time-exhaustive at every match site.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "role", rename_all = "lowercase")]
pub enum Message {
    System {
        text: String,
    },
    User {
        parts: Vec<UserPart>,
    },
    Assistant {
        #[serde(flatten)]
        message: AssistantMessage,
    },
    Tool {
        tool_call_id: String,
        parts: Vec<ToolResultPart>,
        #[serde(default)]
        is_error: bool,
    },
}

impl Message {
    pub fn system(text: impl Into<String>) -> Self {
        Self::System { text: text.into() }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::User {
            parts: vec![UserPart::Text { text: text.into() }],
        }
    }

    pub fn user_parts(parts: Vec<UserPart>) -> Self {
        Self::User { parts }
    }

    pub fn assistant(message: AssistantMessage) -> Self {
        Self::Assistant { message }
    }

    /// Assistant message containing a single text block with a normal stop.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::Assistant {
            message: AssistantMessage {
                blocks: vec![ContentBlock::Text { text: text.into() }],
                stop_reason: StopReason::EndTurn,
                error_message: None,
                usage: Usage::default(),
            },
        }
    }

    pub fn tool_result(
        tool_call_id: impl Into<String>,
        parts: Vec<ToolResultPart>,
        is_error: bool,
    ) -> Self {
        Self::Tool {
            tool_call_id: tool_call_id.into(),
            parts,
            is_error,
        }
    }

    pub fn role(&self) -> Role {
        match self {
            Message::System { .. } => Role::System,
            Message::User { .. } => Role::User,
            Message::Assistant { .. } => Role::Assistant,
            Message::Tool { .. } => Role::Tool,
        }
    }

    /// Plain text of the message, when it is purely textual.
    pub fn as_text(&self) -> Option<String> {
        match self {
            Message::System { text } => Some(text.clone()),
            Message::User { parts } => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|p| match p {
                        UserPart::Text { text } => Some(text.as_str()),
                        UserPart::Image { .. } => None,
                    })
                    .collect();
                if texts.is_empty() {
                    None
                } else {
                    Some(texts.join("\n"))
                }
            }
            Message::Assistant { message } => {
                let t = message.text();
                if t.is_empty() {
                    None
                } else {
                    Some(t)
                }
            }
            Message::Tool { parts, .. } => {
                let texts: Vec<&str> = parts
                    .iter()
                    .filter_map(|p| match p {
                        ToolResultPart::Text { text } => Some(text.as_str()),
                        ToolResultPart::Image { .. } => None,
                    })
                    .collect();
                if texts.is_empty() {
                    None
                } else {
                    Some(texts.join("\n"))
                }
            }
        }
    }

    /// Approximate token count using the 4-chars-per-token heuristic;
    /// images use a flat conservative estimate.
    pub fn approx_tokens(&self) -> u64 {
        const IMAGE_TOKENS: u64 = 765;
        let chars: u64 = match self {
            Message::System { text } => text.len() as u64,
            Message::User { parts } => parts
                .iter()
                .map(|p| match p {
                    UserPart::Text { text } => text.len() as u64,
                    UserPart::Image { .. } => IMAGE_TOKENS * 4,
                })
                .sum(),
            Message::Assistant { message } => message
                .blocks
                .iter()
                .map(|b| match b {
                    ContentBlock::Text { text } => text.len() as u64,
                    ContentBlock::Thinking { thinking } => thinking.len() as u64,
                    ContentBlock::ToolCall {
                        name, arguments, ..
                    } => (name.len() + arguments.to_string().len()) as u64,
                })
                .sum(),
            Message::Tool { parts, .. } => parts
                .iter()
                .map(|p| match p {
                    ToolResultPart::Text { text } => text.len() as u64,
                    ToolResultPart::Image { .. } => IMAGE_TOKENS * 4,
                })
                .sum(),
        };
        (chars / 4).max(1)
    }
}

// ─── Provider request / response ──────────────────────────────────────────────

/// A tool schema provided to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the parameters object
    pub parameters: serde_json::Value,
}

/// Request sent to a model provider.
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub system: String,
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSchema>,
    pub thinking_level: ThinkingLevel,
}

/// A single streamed event from the model.
///
/// These map one-to-one onto the turn engine's stream events; a provider
/// driver translates its wire format into this sum.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    TextDelta {
        text: String,
    },
    ThinkingDelta {
        text: String,
    },
    /// A fragment of a tool call.  Providers that interleave parallel tool
    /// calls key fragments by `index`; `id`/`name` arrive on the first
    /// fragment and are empty afterwards, `arguments` accumulates.
    ToolCallDelta {
        index: u32,
        id: String,
        name: String,
        arguments: String,
    },
    /// Final usage statistics for the message.
    Usage(Usage),
    /// The stream finished with the given reason.
    Stop {
        reason: StopReason,
    },
    /// The provider reported an error; the message is error-terminated.
    Error {
        message: String,
    },
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    // ── Construction ─────────────────────────────────────────────────────────

    #[test]
    fn user_message_sets_role_and_text() {
        let m = Message::user("hello");
        assert_eq!(m.role(), Role::User);
        assert_eq!(m.as_text().as_deref(), Some("hello"));
    }

    #[test]
    fn assistant_text_is_end_turn() {
        let m = Message::assistant_text("reply");
        match &m {
            Message::Assistant { message } => {
                assert_eq!(message.stop_reason, StopReason::EndTurn);
                assert_eq!(message.text(), "reply");
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn tool_result_carries_id_and_error_flag() {
        let m = Message::tool_result("call-1", vec![ToolResultPart::text("out")], true);
        match &m {
            Message::Tool {
                tool_call_id,
                is_error,
                ..
            } => {
                assert_eq!(tool_call_id, "call-1");
                assert!(*is_error);
            }
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn assistant_tool_calls_are_extracted_in_order() {
        let msg = AssistantMessage {
            blocks: vec![
                ContentBlock::Text {
                    text: "calling".into(),
                },
                ContentBlock::ToolCall {
                    id: "a".into(),
                    name: "read".into(),
                    arguments: serde_json::json!({"path": "x"}),
                },
                ContentBlock::ToolCall {
                    id: "b".into(),
                    name: "write".into(),
                    arguments: serde_json::json!({}),
                },
            ],
            stop_reason: StopReason::ToolUse,
            error_message: None,
            usage: Usage::default(),
        };
        let calls = msg.tool_calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "a");
        assert_eq!(calls[1].1, "write");
    }

    // ── Stop reasons ─────────────────────────────────────────────────────────

    #[test]
    fn tool_use_is_not_terminal() {
        assert!(!StopReason::ToolUse.is_terminal());
        assert!(StopReason::EndTurn.is_terminal());
        assert!(StopReason::Aborted.is_terminal());
        assert!(StopReason::Error.is_terminal());
        assert!(StopReason::Length.is_terminal());
    }

    // ── Usage ────────────────────────────────────────────────────────────────

    #[test]
    fn usage_context_tokens_sums_all_categories() {
        let u = Usage {
            input: 10,
            output: 20,
            cache_read: 30,
            cache_write: 5,
            cost: 0.0,
        };
        assert_eq!(u.context_tokens(), 65);
    }

    #[test]
    fn usage_add_accumulates() {
        let mut a = Usage {
            input: 1,
            output: 2,
            cache_read: 3,
            cache_write: 4,
            cost: 0.5,
        };
        a.add(&Usage {
            input: 10,
            output: 10,
            cache_read: 10,
            cache_write: 10,
            cost: 0.5,
        });
        assert_eq!(a.input, 11);
        assert_eq!(a.cache_write, 14);
        assert!((a.cost - 1.0).abs() < 1e-9);
    }

    // ── Token approximation ──────────────────────────────────────────────────

    #[test]
    fn approx_tokens_divides_text_by_four() {
        assert_eq!(Message::user("12345678").approx_tokens(), 2);
    }

    #[test]
    fn approx_tokens_minimum_is_one() {
        assert_eq!(Message::user("").approx_tokens(), 1);
    }

    #[test]
    fn approx_tokens_image_uses_flat_estimate() {
        let m = Message::user_parts(vec![UserPart::Image {
            mime_type: "image/png".into(),
            data: "AAAA".into(),
        }]);
        assert_eq!(m.approx_tokens(), 765);
    }

    // ── Serialisation round-trip ─────────────────────────────────────────────

    #[test]
    fn message_round_trips_through_json() {
        let m = Message::user("test payload");
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn assistant_message_round_trips_with_stop_metadata() {
        let m = Message::Assistant {
            message: AssistantMessage {
                blocks: vec![ContentBlock::ToolCall {
                    id: "t1".into(),
                    name: "bash".into(),
                    arguments: serde_json::json!({"command": "ls"}),
                }],
                stop_reason: StopReason::ToolUse,
                error_message: None,
                usage: Usage {
                    input: 9,
                    output: 3,
                    ..Default::default()
                },
            },
        };
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("tool_use"), "{json}");
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn error_message_field_is_omitted_when_none() {
        let m = Message::assistant_text("ok");
        let json = serde_json::to_string(&m).unwrap();
        assert!(!json.contains("error_message"), "{json}");
    }

    #[test]
    fn content_block_tag_is_snake_case() {
        let b = ContentBlock::ToolCall {
            id: "x".into(),
            name: "f".into(),
            arguments: serde_json::json!({}),
        };
        let json = serde_json::to_string(&b).unwrap();
        assert!(json.contains(r#""type":"tool_call""#), "{json}");
    }
}
