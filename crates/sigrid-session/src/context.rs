// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use sigrid_model::{Message, StopReason, ThinkingLevel, UserPart};

use crate::{CustomDelivery, Entry, EntryPayload};

/// LLM-facing projection of a branch: the message prefix plus the session
/// metadata recorded in it.
#[derive(Debug, Clone, Default)]
pub struct SessionContext {
    pub messages: Vec<Message>,
    /// Most recent persisted model selection `(provider, model_id)`.
    pub model: Option<(String, String)>,
    /// Most recent persisted thinking level.
    pub thinking_level: Option<ThinkingLevel>,
    pub title: Option<String>,
}

/// Build the LLM message prefix from a root→leaf branch.
///
/// When the branch contains a compaction, the prefix becomes a synthetic
/// system note holding the summary, followed by the entries from
/// `first_kept_entry_id` onward; everything older is dropped.  Non-LLM
/// entries (metadata, hidden custom messages, excluded bash runs) are
/// skipped, as are error-terminated assistant messages — those stay in the
/// log for history but must not drive the next turn.
pub fn build_session_context(branch: &[&Entry]) -> SessionContext {
    let mut ctx = SessionContext::default();

    // Session metadata comes from the full branch regardless of compaction.
    for entry in branch {
        match &entry.payload {
            EntryPayload::ModelChange { provider, model_id } => {
                ctx.model = Some((provider.clone(), model_id.clone()));
            }
            EntryPayload::ThinkingLevelChange { level } => {
                ctx.thinking_level = Some(*level);
            }
            EntryPayload::UserMessage { content } if ctx.title.is_none() => {
                ctx.title = content.iter().find_map(|p| match p {
                    UserPart::Text { text } => {
                        let line = text.lines().next().unwrap_or("").trim();
                        if line.is_empty() {
                            None
                        } else {
                            Some(line.chars().take(80).collect())
                        }
                    }
                    UserPart::Image { .. } => None,
                });
            }
            _ => {}
        }
    }

    // Locate the last compaction and the cut point it defines.
    let mut start = 0usize;
    let mut compaction_index = None;
    for (i, entry) in branch.iter().enumerate() {
        if let EntryPayload::Compaction { .. } = &entry.payload {
            compaction_index = Some(i);
        }
    }
    if let Some(ci) = compaction_index {
        let EntryPayload::Compaction {
            summary,
            first_kept_entry_id,
            ..
        } = &branch[ci].payload
        else {
            unreachable!()
        };
        ctx.messages.push(Message::system(format!(
            "The conversation history before this point was compacted into the \
             following summary:\n\n{summary}"
        )));
        start = match first_kept_entry_id {
            Some(first_kept) => branch
                .iter()
                .position(|e| e.id == *first_kept)
                // A dangling pointer keeps only post-compaction entries.
                .unwrap_or(ci + 1),
            None => ci + 1,
        };
    }

    for entry in &branch[start..] {
        if let Some(message) = entry_to_message(entry) {
            ctx.messages.push(message);
        }
    }
    ctx
}

/// Map one entry to its LLM-visible message, or `None` when the entry is
/// filtered from the prefix.  Exposed so the compactor can weigh and
/// serialize exactly what the model would have seen.
pub fn entry_to_message(entry: &Entry) -> Option<Message> {
    match &entry.payload {
        EntryPayload::UserMessage { content } => Some(Message::user_parts(content.clone())),
        EntryPayload::AssistantMessage { message } => {
            if message.stop_reason == StopReason::Error {
                return None;
            }
            Some(Message::assistant(message.clone()))
        }
        EntryPayload::ToolResult {
            tool_call_id,
            parts,
            is_error,
            ..
        } => Some(Message::tool_result(
            tool_call_id.clone(),
            parts.clone(),
            *is_error,
        )),
        EntryPayload::FileMention { path, content } => Some(Message::user(format!(
            "<file path=\"{path}\">\n{content}\n</file>"
        ))),
        EntryPayload::BashExecution {
            command,
            output,
            exit_code,
            excluded_from_context,
        } => {
            if *excluded_from_context {
                return None;
            }
            let status = exit_code
                .map(|c| format!(" (exit {c})"))
                .unwrap_or_default();
            Some(Message::user(format!(
                "Ran shell command{status}:\n$ {command}\n{output}"
            )))
        }
        EntryPayload::CustomMessage {
            content,
            deliver_as,
            ..
        } => match deliver_as {
            CustomDelivery::User => Some(Message::user(content.clone())),
            CustomDelivery::Hidden => None,
        },
        EntryPayload::Compaction { .. }
        | EntryPayload::BranchSummary { .. }
        | EntryPayload::ModelChange { .. }
        | EntryPayload::ThinkingLevelChange { .. }
        | EntryPayload::Unknown { .. } => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
