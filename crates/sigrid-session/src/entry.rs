// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sigrid_model::{AssistantMessage, ThinkingLevel, ToolResultPart, Usage, UserPart};

/// One record in the session tree.
///
/// Entries are immutable once appended; branching re-parents new entries
/// under a past `parent_id`, it never rewrites existing ones.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub id: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EntryPayload,
}

impl Entry {
    /// Fresh entry with a new id and the current time; the store assigns
    /// `parent_id` on append.
    pub fn new(payload: EntryPayload) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }
}

/// How a custom message is delivered into the LLM context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomDelivery {
    /// Appears in the LLM prefix as a user message.
    User,
    /// Log-only; never enters the LLM prefix.
    Hidden,
}

/// Entry payload variants.
///
/// The `type` tag is persisted with each JSONL record.  Records whose tag
/// this build does not know fall into `Unknown`, which retains the raw
/// object so old logs round-trip through newer and older builds unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPayload {
    UserMessage {
        content: Vec<UserPart>,
    },
    AssistantMessage {
        message: AssistantMessage,
    },
    ToolResult {
        tool_call_id: String,
        parts: Vec<ToolResultPart>,
        #[serde(default)]
        is_error: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        /// Token usage of sub-agent (`task`) tool calls.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    FileMention {
        path: String,
        content: String,
    },
    BashExecution {
        command: String,
        output: String,
        #[serde(default)]
        exit_code: Option<i32>,
        #[serde(default)]
        excluded_from_context: bool,
    },
    CustomMessage {
        custom_type: String,
        content: String,
        deliver_as: CustomDelivery,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
    },
    Compaction {
        summary: String,
        /// First original entry retained after the summary; `None` when the
        /// whole prefix was summarized away.
        #[serde(default)]
        first_kept_entry_id: Option<String>,
        tokens_before: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        #[serde(default)]
        from_extension: bool,
    },
    BranchSummary {
        summary: String,
        /// Head of the branch that was abandoned by the navigation.
        abandoned_leaf_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        details: Option<Value>,
        #[serde(default)]
        from_extension: bool,
    },
    ModelChange {
        provider: String,
        model_id: String,
    },
    ThinkingLevelChange {
        level: ThinkingLevel,
    },
    /// Forward-compatibility: a record written by a newer build.  The raw
    /// fields (including its original `type`) are kept verbatim and
    /// re-emitted on write.
    #[serde(untagged)]
    Unknown {
        #[serde(flatten)]
        record: serde_json::Map<String, Value>,
    },
}

impl EntryPayload {
    /// Entries the LLM never sees directly (metadata, summaries, hidden
    /// custom messages are filtered separately during projection).
    pub fn is_metadata(&self) -> bool {
        matches!(
            self,
            EntryPayload::Compaction { .. }
                | EntryPayload::BranchSummary { .. }
                | EntryPayload::ModelChange { .. }
                | EntryPayload::ThinkingLevelChange { .. }
                | EntryPayload::Unknown { .. }
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use sigrid_model::{ContentBlock, StopReason};

    use super::*;

    fn user_entry(text: &str) -> Entry {
        Entry::new(EntryPayload::UserMessage {
            content: vec![UserPart::Text { text: text.into() }],
        })
    }

    #[test]
    fn new_entries_get_unique_ids() {
        let a = user_entry("a");
        let b = user_entry("b");
        assert_ne!(a.id, b.id);
        assert!(a.parent_id.is_none());
    }

    #[test]
    fn user_entry_round_trips() {
        let e = user_entry("hello");
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains(r#""type":"user_message""#), "{json}");
        let back: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn assistant_entry_round_trips_with_usage() {
        let e = Entry::new(EntryPayload::AssistantMessage {
            message: AssistantMessage {
                blocks: vec![ContentBlock::Text {
                    text: "hi".into(),
                }],
                stop_reason: StopReason::EndTurn,
                error_message: None,
                usage: Usage {
                    input: 12,
                    output: 4,
                    ..Default::default()
                },
            },
        });
        let json = serde_json::to_string(&e).unwrap();
        let back: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn compaction_entry_round_trips() {
        let e = Entry::new(EntryPayload::Compaction {
            summary: "did things".into(),
            first_kept_entry_id: Some("e42".into()),
            tokens_before: 9999,
            details: None,
            from_extension: false,
        });
        let json = serde_json::to_string(&e).unwrap();
        let back: Entry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn unknown_record_type_is_retained_opaquely() {
        let json = r#"{"id":"x1","parent_id":null,"timestamp":"2026-01-01T00:00:00Z","type":"hologram","beam":42}"#;
        let e: Entry = serde_json::from_str(json).unwrap();
        match &e.payload {
            EntryPayload::Unknown { record } => {
                assert_eq!(record["type"], "hologram");
                assert_eq!(record["beam"], 42);
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
        // Round-trip preserves the foreign fields verbatim.
        let out = serde_json::to_value(&e).unwrap();
        assert_eq!(out["type"], "hologram");
        assert_eq!(out["beam"], 42);
        assert_eq!(out["id"], "x1");
    }

    #[test]
    fn unknown_is_metadata() {
        let json = r#"{"id":"x","timestamp":"2026-01-01T00:00:00Z","type":"future_thing"}"#;
        let e: Entry = serde_json::from_str(json).unwrap();
        assert!(e.payload.is_metadata());
    }

    #[test]
    fn metadata_classification() {
        assert!(Entry::new(EntryPayload::ModelChange {
            provider: "p".into(),
            model_id: "m".into()
        })
        .payload
        .is_metadata());
        assert!(!user_entry("x").payload.is_metadata());
        assert!(!Entry::new(EntryPayload::BashExecution {
            command: "ls".into(),
            output: String::new(),
            exit_code: Some(0),
            excluded_from_context: false,
        })
        .payload
        .is_metadata());
    }

    #[test]
    fn custom_delivery_serializes_lowercase() {
        let e = Entry::new(EntryPayload::CustomMessage {
            custom_type: "note".into(),
            content: "hi".into(),
            deliver_as: CustomDelivery::Hidden,
            details: None,
        });
        let json = serde_json::to_string(&e).unwrap();
        assert!(json.contains(r#""deliver_as":"hidden""#), "{json}");
    }
}
