// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;

use regex::Regex;
use tracing::debug;

use sigrid_config::{RepeatMode, TtsrSettings};

/// One user-authored stream rule.
#[derive(Debug, Clone)]
pub struct TtsrRule {
    pub name: String,
    pub path: String,
    pub pattern: Regex,
    /// Rule body injected verbatim into the interrupt message.
    pub content: String,
}

impl TtsrRule {
    /// Build a rule, rejecting patterns that match the empty string — a
    /// zero-width pattern would fire on every delta forever.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        pattern: &str,
        content: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let regex = Regex::new(pattern)?;
        if regex.is_match("") {
            anyhow::bail!("rule pattern {pattern:?} matches the empty string");
        }
        Ok(Self {
            name: name.into(),
            path: path.into(),
            pattern: regex,
            content: content.into(),
        })
    }

    fn key(&self) -> String {
        format!("{}:{}", self.name, self.path)
    }
}

/// Time-travel stream rules: match user rules against in-progress
/// assistant output; on violation the turn is aborted and restarted with a
/// synthetic interrupt message.
///
/// The engine itself only detects and records; the controller performs the
/// abort, the optional partial-message discard, and the `continue`.
pub struct TtsrEngine {
    settings: TtsrSettings,
    rules: Vec<TtsrRule>,
    /// Sliding window over the current turn's assistant output.
    buffer: String,
    /// Rule key → turn count at last firing.
    injected: HashMap<String, u64>,
    /// Completed turns this session (drives `after-gap`).
    turn_count: u64,
    /// Rules matched in the current abort window, pending injection.
    pending: Vec<TtsrRule>,
}

impl TtsrEngine {
    pub fn new(settings: TtsrSettings, rules: Vec<TtsrRule>) -> Self {
        Self {
            settings,
            rules,
            buffer: String::new(),
            injected: HashMap::new(),
            turn_count: 0,
            pending: Vec::new(),
        }
    }

    pub fn rules(&self) -> &[TtsrRule] {
        &self.rules
    }

    /// Reset the sliding buffer at each turn start.
    pub fn on_turn_start(&mut self) {
        self.buffer.clear();
    }

    /// Advance the turn counter at each turn end.
    pub fn on_turn_end(&mut self) {
        self.turn_count += 1;
    }

    /// Feed one assistant delta (text or tool-call arguments).  Returns the
    /// names of newly triggered rules; non-empty means the caller must
    /// abort the turn and later inject [`Self::take_pending_message`].
    ///
    /// All rules matching within one abort window coalesce into a single
    /// trigger; a rule fires at most once per window.
    pub fn feed(&mut self, delta: &str) -> Vec<String> {
        if !self.settings.enabled || self.rules.is_empty() {
            return Vec::new();
        }
        self.buffer.push_str(delta);
        let mut triggered = Vec::new();
        for rule in &self.rules {
            if !rule.pattern.is_match(&self.buffer) {
                continue;
            }
            let key = rule.key();
            if self.pending.iter().any(|r| r.key() == key) {
                continue;
            }
            let suppressed = match self.injected.get(&key) {
                None => false,
                Some(&fired_at) => match self.settings.repeat_mode {
                    RepeatMode::Once => true,
                    RepeatMode::AfterGap => {
                        self.turn_count.saturating_sub(fired_at) < self.settings.repeat_gap
                    }
                },
            };
            if suppressed {
                continue;
            }
            debug!(rule = %rule.name, "stream rule triggered");
            self.injected.insert(key, self.turn_count);
            self.pending.push(rule.clone());
            triggered.push(rule.name.clone());
        }
        triggered
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drain pending injections into the synthetic interrupt message the
    /// controller appends before continuing the turn.
    pub fn take_pending_message(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let blocks: Vec<String> = self
            .pending
            .drain(..)
            .map(|rule| {
                format!(
                    "<system_interrupt reason=\"rule_violation\" rule=\"{}\" path=\"{}\">\n{}\n</system_interrupt>",
                    rule.name, rule.path, rule.content
                )
            })
            .collect();
        Some(blocks.join("\n\n"))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
