// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Merged settings for one session.
///
/// Every field has a serde default so that partial YAML layers deserialize
/// cleanly; the resolver deep-merges layers before deserializing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub model: ModelSettings,
    pub compaction: CompactionSettings,
    pub retry: RetrySettings,
    pub steering: SteeringSettings,
    pub ttsr: TtsrSettings,
    pub bash: BashSettings,
    pub ssh: SshSettings,
    /// Requested thinking level; clamped to the model's capability at use.
    pub thinking_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub provider: String,
    pub id: String,
}

impl Default for ModelSettings {
    fn default() -> Self {
        Self {
            provider: String::new(),
            id: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionSettings {
    pub enabled: bool,
    /// Compaction triggers when context tokens exceed
    /// `context_window - reserve_tokens` (strictly greater).
    pub reserve_tokens: u64,
    /// Token budget of recent entries preserved verbatim after the summary.
    pub keep_recent_tokens: u64,
}

impl Default for CompactionSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            reserve_tokens: 16_384,
            keep_recent_tokens: 20_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub enabled: bool,
    pub max_retries: u32,
    pub base_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 5,
            base_delay_ms: 1_000,
        }
    }
}

/// How queued steering messages are delivered into a running turn.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SteeringMode {
    /// Deliver the whole queue inline.
    #[default]
    All,
    /// Deliver one message; the rest drain into the follow-up queue.
    OneAtATime,
}

/// When a steering message interrupts the stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptMode {
    /// At the next stream chunk boundary.
    #[default]
    Immediate,
    /// After the current tool call batch completes.
    Wait,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SteeringSettings {
    pub steering_mode: SteeringMode,
    pub interrupt_mode: InterruptMode,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RepeatMode {
    /// Each rule fires at most once per session.
    #[default]
    Once,
    /// A rule may fire again once enough turns have passed.
    AfterGap,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContextMode {
    /// The aborted partial assistant message stays in the context.
    #[default]
    Keep,
    /// The partial message is removed from the context before continuing.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsrSettings {
    pub enabled: bool,
    pub repeat_mode: RepeatMode,
    /// Minimum completed turns between two firings of the same rule
    /// under `repeat_mode = after-gap`.
    pub repeat_gap: u64,
    pub context_mode: ContextMode,
}

impl Default for TtsrSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            repeat_mode: RepeatMode::Once,
            repeat_gap: 5,
            context_mode: ContextMode::Keep,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BashSettings {
    /// In-memory tail retained for the model; earlier bytes live only in
    /// the spill file.
    pub max_output_bytes: usize,
    /// Total sanitized output beyond which the spill file is created.
    pub spill_threshold_bytes: usize,
    pub default_timeout_secs: u64,
}

impl Default for BashSettings {
    fn default() -> Self {
        Self {
            max_output_bytes: 200_000,
            spill_threshold_bytes: 200_000,
            default_timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub enabled: bool,
    /// Mount the remote filesystem via sshfs when available.
    pub mount_remote: bool,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            mount_remote: false,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert!(s.compaction.enabled);
        assert_eq!(s.compaction.reserve_tokens, 16_384);
        assert_eq!(s.retry.max_retries, 5);
        assert_eq!(s.steering.steering_mode, SteeringMode::All);
        assert_eq!(s.ttsr.repeat_mode, RepeatMode::Once);
        assert!(s.bash.spill_threshold_bytes <= s.bash.max_output_bytes);
    }

    #[test]
    fn partial_yaml_layers_deserialize_with_defaults() {
        let s: Settings = serde_yaml::from_str("retry:\n  max_retries: 2\n").unwrap();
        assert_eq!(s.retry.max_retries, 2);
        assert!(s.retry.enabled, "unspecified fields keep defaults");
        assert!(s.compaction.enabled);
    }

    #[test]
    fn enum_fields_use_kebab_and_lower_case() {
        let s: Settings = serde_yaml::from_str(
            "steering:\n  steering_mode: one-at-a-time\n  interrupt_mode: wait\n\
             ttsr:\n  repeat_mode: after-gap\n  context_mode: discard\n",
        )
        .unwrap();
        assert_eq!(s.steering.steering_mode, SteeringMode::OneAtATime);
        assert_eq!(s.steering.interrupt_mode, InterruptMode::Wait);
        assert_eq!(s.ttsr.repeat_mode, RepeatMode::AfterGap);
        assert_eq!(s.ttsr.context_mode, ContextMode::Discard);
    }

    #[test]
    fn settings_round_trip_through_yaml() {
        let s = Settings::default();
        let yaml = serde_yaml::to_string(&s).unwrap();
        let back: Settings = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, s);
    }
}
