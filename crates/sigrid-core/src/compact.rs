// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use sigrid_config::CompactionSettings;
use sigrid_model::Message;
use sigrid_session::{entry_to_message, Entry, EntryPayload};

/// Instruction for the summarization request.
const SUMMARIZE_PROMPT: &str =
    "You are a context compaction assistant. Summarise the conversation history below \
     in a concise, information-dense way. Preserve all technical details, decisions, \
     file names, code snippets, and tool outputs that may be relevant to future work. \
     The summary will replace the original history to free up context space.";

/// A prepared compaction: which entries to summarize, which to keep.
#[derive(Debug, Clone)]
pub struct CompactionPlan {
    /// LLM-visible messages being summarized away, in branch order.
    pub summarize_messages: Vec<Message>,
    /// First original entry retained after the summary; `None` when the
    /// whole live region is summarized.
    pub first_kept_entry_id: Option<String>,
    /// Estimated tokens of the live region before compaction.
    pub tokens_before: u64,
    /// Summary of the previous compaction, for incremental summarization.
    pub previous_summary: Option<String>,
}

/// Decide what to compact, or `None` when there is nothing worth doing:
/// the live region is already within `keep_recent_tokens`, or the branch
/// tail is itself a compaction.
///
/// The cut point walks back from the leaf until `keep_recent_tokens` worth
/// of entries are protected, then moves further back so the kept region
/// never begins with a tool result — splitting a tool-call/tool-result
/// group would leave orphaned results that providers reject.
pub fn prepare_compaction(
    branch: &[&Entry],
    settings: &CompactionSettings,
) -> Option<CompactionPlan> {
    if let Some(last) = branch.last() {
        if matches!(last.payload, EntryPayload::Compaction { .. }) {
            return None;
        }
    }

    // The live region starts after the cut of the latest compaction.
    let mut start = 0usize;
    let mut previous_summary = None;
    for (i, entry) in branch.iter().enumerate() {
        if let EntryPayload::Compaction {
            summary,
            first_kept_entry_id,
            ..
        } = &entry.payload
        {
            previous_summary = Some(summary.clone());
            start = match first_kept_entry_id {
                Some(kept) => branch.iter().position(|e| e.id == *kept).unwrap_or(i + 1),
                None => i + 1,
            };
        }
    }

    // LLM-visible entries of the live region, with their projections.
    let live: Vec<(&Entry, Message, u64)> = branch[start..]
        .iter()
        .filter_map(|entry| {
            entry_to_message(entry).map(|m| {
                let tokens = m.approx_tokens();
                (*entry, m, tokens)
            })
        })
        .collect();
    if live.is_empty() {
        return None;
    }
    let tokens_before: u64 = live.iter().map(|(_, _, t)| t).sum();

    // Walk back from the tail, protecting keep_recent_tokens.
    let mut kept_tokens = 0u64;
    let mut cut = live.len();
    while cut > 0 && kept_tokens < settings.keep_recent_tokens {
        cut -= 1;
        kept_tokens += live[cut].2;
    }
    // Never start the kept region on a tool result: pull the whole tool
    // interaction group (assistant tool calls and sibling results) into it.
    while cut > 0
        && cut < live.len()
        && matches!(live[cut].0.payload, EntryPayload::ToolResult { .. })
    {
        cut -= 1;
    }
    if cut == 0 {
        return None;
    }

    Some(CompactionPlan {
        summarize_messages: live[..cut].iter().map(|(_, m, _)| m.clone()).collect(),
        first_kept_entry_id: live.get(cut).map(|(entry, _, _)| entry.id.clone()),
        tokens_before,
        previous_summary,
    })
}

/// Build the message list for the summarization request.
pub fn build_summary_request(plan: &CompactionPlan, custom_instructions: Option<&str>) -> Vec<Message> {
    let mut prompt = String::from(SUMMARIZE_PROMPT);
    if let Some(extra) = custom_instructions {
        prompt.push_str("\n\nAdditional instructions: ");
        prompt.push_str(extra);
    }
    if let Some(previous) = &plan.previous_summary {
        prompt.push_str("\n\nAn earlier portion of this conversation was already summarised as:\n");
        prompt.push_str(previous);
        prompt.push_str("\nFold it into the new summary.");
    }
    prompt.push_str("\n\n---\n\n");
    prompt.push_str(&serialize_messages(&plan.summarize_messages));
    vec![Message::user(prompt)]
}

/// Serialize messages into plain text for the summarization prompt.
pub fn serialize_messages(messages: &[Message]) -> String {
    messages
        .iter()
        .map(|m| match m {
            Message::System { text } => format!("System: {text}"),
            Message::User { .. } => {
                format!("User: {}", m.as_text().unwrap_or_else(|| "[image]".into()))
            }
            Message::Assistant { message } => {
                let mut parts = Vec::new();
                let text = message.text();
                if !text.is_empty() {
                    parts.push(text);
                }
                for (_, name, args) in message.tool_calls() {
                    parts.push(format!("[tool_call: {name}({args})]"));
                }
                format!("Assistant: {}", parts.join("\n"))
            }
            Message::Tool { .. } => format!(
                "Tool: {}",
                m.as_text().unwrap_or_else(|| "[image result]".into())
            ),
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use sigrid_model::{
        AssistantMessage, ContentBlock, StopReason, ToolResultPart, Usage, UserPart,
    };
    use sigrid_session::LogStore;

    use super::*;

    fn settings(keep_recent: u64) -> CompactionSettings {
        CompactionSettings {
            enabled: true,
            reserve_tokens: 1000,
            keep_recent_tokens: keep_recent,
        }
    }

    fn user(text: &str) -> EntryPayload {
        EntryPayload::UserMessage {
            content: vec![UserPart::Text { text: text.into() }],
        }
    }

    fn assistant(text: &str) -> EntryPayload {
        EntryPayload::AssistantMessage {
            message: AssistantMessage {
                blocks: vec![ContentBlock::Text { text: text.into() }],
                stop_reason: StopReason::EndTurn,
                error_message: None,
                usage: Usage::default(),
            },
        }
    }

    fn tool_use(text: &str, call_id: &str) -> EntryPayload {
        EntryPayload::AssistantMessage {
            message: AssistantMessage {
                blocks: vec![
                    ContentBlock::Text { text: text.into() },
                    ContentBlock::ToolCall {
                        id: call_id.into(),
                        name: "read".into(),
                        arguments: serde_json::json!({}),
                    },
                ],
                stop_reason: StopReason::ToolUse,
                error_message: None,
                usage: Usage::default(),
            },
        }
    }

    fn tool_result(call_id: &str, text: &str) -> EntryPayload {
        EntryPayload::ToolResult {
            tool_call_id: call_id.into(),
            parts: vec![ToolResultPart::text(text)],
            is_error: false,
            details: None,
            usage: None,
        }
    }

    /// ~50 tokens of filler.
    fn filler() -> String {
        "x".repeat(200)
    }

    #[test]
    fn small_session_yields_no_plan() {
        let mut store = LogStore::in_memory();
        store.append(user("hi"));
        store.append(assistant("hello"));
        assert!(prepare_compaction(&store.get_branch(), &settings(20_000)).is_none());
    }

    #[test]
    fn plan_splits_old_from_recent() {
        let mut store = LogStore::in_memory();
        for _ in 0..10 {
            store.append(user(&filler()));
            store.append(assistant(&filler()));
        }
        let kept_first = store.append(user("recent question"));
        store.append(assistant("recent answer"));

        // keep_recent_tokens small: only the tail survives.
        let plan = prepare_compaction(&store.get_branch(), &settings(10)).unwrap();
        assert!(!plan.summarize_messages.is_empty());
        let first_kept = plan.first_kept_entry_id.unwrap();
        // Every summarized message precedes the kept boundary.
        let branch = store.get_branch();
        let kept_pos = branch.iter().position(|e| e.id == first_kept).unwrap();
        assert!(kept_pos >= branch.len() - 3);
        let _ = kept_first;
    }

    #[test]
    fn kept_region_never_starts_on_tool_result() {
        let mut store = LogStore::in_memory();
        for _ in 0..5 {
            store.append(user(&filler()));
            store.append(assistant(&filler()));
        }
        store.append(tool_use(&filler(), "c1"));
        let tr = store.append(tool_result("c1", &filler()));
        store.append(assistant("after tools"));

        // Pick keep_recent so the naive cut would land on the tool result.
        let branch = store.get_branch();
        let tr_entry = store.get_entry(&tr).unwrap();
        let tr_tokens = entry_to_message(tr_entry).unwrap().approx_tokens();
        let plan = prepare_compaction(&branch, &settings(tr_tokens)).unwrap();

        let first_kept = plan.first_kept_entry_id.unwrap();
        let kept_entry = store.get_entry(&first_kept).unwrap();
        assert!(
            !matches!(kept_entry.payload, EntryPayload::ToolResult { .. }),
            "cut must not orphan a tool result"
        );
        // The matching tool-use assistant is kept alongside its result.
        let kept_pos = branch.iter().position(|e| e.id == first_kept).unwrap();
        let tr_pos = branch.iter().position(|e| e.id == tr).unwrap();
        assert!(kept_pos <= tr_pos - 1);
    }

    #[test]
    fn branch_ending_in_compaction_is_already_compacted() {
        let mut store = LogStore::in_memory();
        store.append(user(&filler()));
        store.append(EntryPayload::Compaction {
            summary: "done".into(),
            first_kept_entry_id: None,
            tokens_before: 100,
            details: None,
            from_extension: false,
        });
        assert!(prepare_compaction(&store.get_branch(), &settings(0)).is_none());
    }

    #[test]
    fn second_compaction_summarizes_only_the_live_region() {
        let mut store = LogStore::in_memory();
        store.append(user("ancient history"));
        store.append(EntryPayload::Compaction {
            summary: "earlier summary".into(),
            first_kept_entry_id: None,
            tokens_before: 50,
            details: None,
            from_extension: false,
        });
        for _ in 0..10 {
            store.append(user(&filler()));
            store.append(assistant(&filler()));
        }
        let plan = prepare_compaction(&store.get_branch(), &settings(10)).unwrap();
        assert_eq!(plan.previous_summary.as_deref(), Some("earlier summary"));
        assert!(plan
            .summarize_messages
            .iter()
            .all(|m| !m.as_text().map_or(false, |t| t.contains("ancient"))));
    }

    #[test]
    fn tokens_before_counts_live_messages() {
        let mut store = LogStore::in_memory();
        for _ in 0..4 {
            store.append(user(&filler()));
        }
        let plan = prepare_compaction(&store.get_branch(), &settings(10)).unwrap();
        assert!(plan.tokens_before >= 4 * 50 - 10);
    }

    // ── Summary request ───────────────────────────────────────────────────────

    #[test]
    fn summary_request_embeds_history_and_instructions() {
        let plan = CompactionPlan {
            summarize_messages: vec![
                Message::user("What is Rust?"),
                Message::assistant_text("A systems language."),
            ],
            first_kept_entry_id: None,
            tokens_before: 100,
            previous_summary: None,
        };
        let req = build_summary_request(&plan, Some("focus on file names"));
        let text = req[0].as_text().unwrap();
        assert!(text.contains("What is Rust?"));
        assert!(text.contains("systems language"));
        assert!(text.contains("focus on file names"));
    }

    #[test]
    fn summary_request_folds_in_previous_summary() {
        let plan = CompactionPlan {
            summarize_messages: vec![Message::user("more work")],
            first_kept_entry_id: None,
            tokens_before: 10,
            previous_summary: Some("we built a parser".into()),
        };
        let text = build_summary_request(&plan, None)[0].as_text().unwrap();
        assert!(text.contains("we built a parser"));
    }

    #[test]
    fn serialize_includes_tool_calls_and_results() {
        let messages = vec![
            Message::Assistant {
                message: AssistantMessage {
                    blocks: vec![ContentBlock::ToolCall {
                        id: "c".into(),
                        name: "bash".into(),
                        arguments: serde_json::json!({"command": "ls"}),
                    }],
                    stop_reason: StopReason::ToolUse,
                    error_message: None,
                    usage: Usage::default(),
                },
            },
            Message::tool_result("c", vec![ToolResultPart::text("file.txt")], false),
        ];
        let text = serialize_messages(&messages);
        assert!(text.contains("bash"));
        assert!(text.contains("file.txt"));
    }
}
