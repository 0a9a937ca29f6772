// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Minimal HTML transcript export.
//!
//! Intentionally plain: one self-contained file, no assets, so transcripts
//! can be attached to bug reports and read anywhere.

use std::io::Write;
use std::path::Path;

use anyhow::Context;

use sigrid_model::StopReason;
use sigrid_session::{Entry, EntryPayload};

/// Write the branch as a standalone HTML document.
pub fn write_html_transcript(
    path: &Path,
    title: &str,
    branch: &[&Entry],
) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;

    writeln!(
        file,
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>{}</title>\n\
         <style>body{{font-family:monospace;max-width:60em;margin:2em auto}}\
         .role{{font-weight:bold;margin-top:1em}}\
         .aborted{{color:#a60}}.error{{color:#c00}}pre{{white-space:pre-wrap}}</style>\n\
         </head><body>\n<h1>{}</h1>",
        escape(title),
        escape(title)
    )?;
    for entry in branch {
        render_entry(&mut file, entry)?;
    }
    writeln!(file, "</body></html>")?;
    Ok(())
}

fn render_entry(out: &mut impl Write, entry: &Entry) -> anyhow::Result<()> {
    match &entry.payload {
        EntryPayload::UserMessage { .. } => {
            let text = sigrid_session::entry_to_message(entry)
                .and_then(|m| m.as_text())
                .unwrap_or_default();
            writeln!(
                out,
                "<div class=\"role\">user</div><pre>{}</pre>",
                escape(&text)
            )?;
        }
        EntryPayload::AssistantMessage { message } => {
            let class = match message.stop_reason {
                StopReason::Aborted => " aborted",
                StopReason::Error => " error",
                _ => "",
            };
            writeln!(out, "<div class=\"role{class}\">assistant</div>")?;
            writeln!(out, "<pre>{}</pre>", escape(&message.text()))?;
            for (id, name, args) in message.tool_calls() {
                writeln!(
                    out,
                    "<pre>[tool call {} {}({})]</pre>",
                    escape(id),
                    escape(name),
                    escape(&args.to_string())
                )?;
            }
            if let Some(error) = &message.error_message {
                writeln!(out, "<pre class=\"error\">{}</pre>", escape(error))?;
            }
        }
        EntryPayload::ToolResult {
            tool_call_id,
            is_error,
            ..
        } => {
            let text = sigrid_session::entry_to_message(entry)
                .and_then(|m| m.as_text())
                .unwrap_or_default();
            let class = if *is_error { " error" } else { "" };
            writeln!(
                out,
                "<div class=\"role{class}\">tool result ({})</div><pre>{}</pre>",
                escape(tool_call_id),
                escape(&text)
            )?;
        }
        EntryPayload::BashExecution {
            command, output, ..
        } => {
            writeln!(
                out,
                "<div class=\"role\">bash</div><pre>$ {}\n{}</pre>",
                escape(command),
                escape(output)
            )?;
        }
        EntryPayload::Compaction { summary, .. } => {
            writeln!(
                out,
                "<div class=\"role\">[compacted]</div><pre>{}</pre>",
                escape(summary)
            )?;
        }
        EntryPayload::BranchSummary { summary, .. } => {
            writeln!(
                out,
                "<div class=\"role\">[branch summary]</div><pre>{}</pre>",
                escape(summary)
            )?;
        }
        EntryPayload::FileMention { path, .. } => {
            writeln!(out, "<div class=\"role\">[file: {}]</div>", escape(path))?;
        }
        EntryPayload::CustomMessage { content, .. } => {
            writeln!(
                out,
                "<div class=\"role\">[note]</div><pre>{}</pre>",
                escape(content)
            )?;
        }
        EntryPayload::ModelChange { .. }
        | EntryPayload::ThinkingLevelChange { .. }
        | EntryPayload::Unknown { .. } => {}
    }
    Ok(())
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use sigrid_model::{AssistantMessage, ContentBlock, Usage, UserPart};
    use sigrid_session::LogStore;

    use super::*;

    #[test]
    fn transcript_contains_messages_and_escapes_html() {
        let mut store = LogStore::in_memory();
        store.append(EntryPayload::UserMessage {
            content: vec![UserPart::Text {
                text: "show me <script>".into(),
            }],
        });
        store.append(EntryPayload::AssistantMessage {
            message: AssistantMessage {
                blocks: vec![ContentBlock::Text {
                    text: "no & never".into(),
                }],
                stop_reason: StopReason::EndTurn,
                error_message: None,
                usage: Usage::default(),
            },
        });

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.html");
        write_html_transcript(&path, "my session", &store.get_branch()).unwrap();

        let html = std::fs::read_to_string(&path).unwrap();
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("no &amp; never"));
        assert!(html.contains("<h1>my session</h1>"));
    }
}
