// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;

use sigrid_model::{AssistantMessage, Message, Role, ToolResultPart};
use sigrid_tools::ToolResult;

/// One streamed fragment of an in-progress assistant message.
#[derive(Debug, Clone)]
pub enum MessageDelta {
    Text { text: String },
    Thinking { text: String },
    /// Tool-call argument fragment.  TTSR inspects these alongside text.
    ToolCallArguments {
        index: u32,
        name: String,
        arguments: String,
    },
}

impl MessageDelta {
    /// The textual content a stream rule engine should inspect.
    pub fn rule_text(&self) -> Option<&str> {
        match self {
            MessageDelta::Text { text } => Some(text),
            MessageDelta::ToolCallArguments { arguments, .. } => Some(arguments),
            MessageDelta::Thinking { .. } => None,
        }
    }
}

/// Fine-grained events emitted by the turn engine, in a total order per
/// session.  The controller forwards them to persistence, TTSR, extension
/// hooks and UI listeners.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    AgentStart,
    TurnStart,
    MessageStart {
        role: Role,
    },
    MessageUpdate {
        delta: MessageDelta,
    },
    MessageEnd {
        message: Message,
    },
    ToolCallStart {
        call_id: String,
        name: String,
        arguments: serde_json::Value,
    },
    ToolCallUpdate {
        call_id: String,
        parts: Vec<ToolResultPart>,
    },
    ToolCallEnd {
        call_id: String,
        name: String,
        result: ToolResult,
    },
    TurnEnd {
        message: AssistantMessage,
        tool_results: Vec<(String, ToolResult)>,
    },
    AgentEnd {
        messages: Vec<Message>,
    },
}

/// What made the compactor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionReason {
    /// Context tokens exceeded `context_window - reserve_tokens`.
    Threshold,
    /// The provider rejected the request as too large.
    Overflow,
}

/// Controller-level events delivered to UI listeners.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Agent(AgentEvent),
    AutoRetryStart {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
        error_message: String,
    },
    AutoRetryEnd {
        success: bool,
        attempt: u32,
        final_error: Option<String>,
    },
    AutoCompactionStart {
        reason: CompactionReason,
    },
    AutoCompactionEnd {
        success: bool,
        aborted: bool,
        will_retry: bool,
    },
    SessionCompact {
        tokens_before: u64,
        summary_entry_id: String,
    },
    TtsrTriggered {
        rules: Vec<String>,
    },
    SessionStart {
        session_id: String,
    },
    SessionSwitch {
        path: PathBuf,
    },
    SessionBranch {
        entry_id: String,
    },
    SessionTree {
        target_id: String,
    },
    SessionShutdown,
}
