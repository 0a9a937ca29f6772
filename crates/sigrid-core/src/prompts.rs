// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::Path;

/// Assemble the system prompt.
///
/// Rebuilt whenever the active tool set changes (the registry's generation
/// counter drives this); `custom` replaces the default preamble entirely.
pub fn system_prompt(custom: Option<&str>, tool_names: &[String], cwd: &Path) -> String {
    let mut prompt = match custom {
        Some(text) => text.to_string(),
        None => "You are a coding agent operating inside the user's project. \
                 Prefer taking action through the available tools over describing \
                 what the user should do. Keep answers short; let tool output \
                 speak for itself."
            .to_string(),
    };
    prompt.push_str(&format!("\n\nWorking directory: {}", cwd.display()));
    if !tool_names.is_empty() {
        prompt.push_str(&format!("\nAvailable tools: {}", tool_names.join(", ")));
    }
    prompt
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
