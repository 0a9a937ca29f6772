// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};

/// Requested reasoning effort for the next completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThinkingLevel {
    #[default]
    Off,
    Low,
    Medium,
    High,
    Xhigh,
}

/// What a given model can actually do with thinking requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThinkingSupport {
    /// No reasoning output at all; every level clamps to `Off`.
    None,
    /// Reasoning up to `High`; `Xhigh` clamps down.
    ToHigh,
    /// Full range including `Xhigh`.
    ToXhigh,
}

impl ThinkingLevel {
    pub const ALL: [ThinkingLevel; 5] = [
        ThinkingLevel::Off,
        ThinkingLevel::Low,
        ThinkingLevel::Medium,
        ThinkingLevel::High,
        ThinkingLevel::Xhigh,
    ];

    /// Clamp the requested level to what the model supports.
    pub fn clamp_to(self, support: ThinkingSupport) -> ThinkingLevel {
        match support {
            ThinkingSupport::None => ThinkingLevel::Off,
            ThinkingSupport::ToHigh => {
                if self == ThinkingLevel::Xhigh {
                    ThinkingLevel::High
                } else {
                    self
                }
            }
            ThinkingSupport::ToXhigh => self,
        }
    }

    /// The next level in cycling order, wrapping at the end.
    pub fn next(self) -> ThinkingLevel {
        let idx = Self::ALL.iter().position(|l| *l == self).unwrap_or(0);
        Self::ALL[(idx + 1) % Self::ALL.len()]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ThinkingLevel::Off => "off",
            ThinkingLevel::Low => "low",
            ThinkingLevel::Medium => "medium",
            ThinkingLevel::High => "high",
            ThinkingLevel::Xhigh => "xhigh",
        }
    }

    pub fn parse(s: &str) -> Option<ThinkingLevel> {
        match s {
            "off" => Some(ThinkingLevel::Off),
            "low" => Some(ThinkingLevel::Low),
            "medium" => Some(ThinkingLevel::Medium),
            "high" => Some(ThinkingLevel::High),
            "xhigh" => Some(ThinkingLevel::Xhigh),
            _ => None,
        }
    }
}

impl std::fmt::Display for ThinkingLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_to_none_is_always_off() {
        for level in ThinkingLevel::ALL {
            assert_eq!(level.clamp_to(ThinkingSupport::None), ThinkingLevel::Off);
        }
    }

    #[test]
    fn clamp_xhigh_to_high_when_unsupported() {
        assert_eq!(
            ThinkingLevel::Xhigh.clamp_to(ThinkingSupport::ToHigh),
            ThinkingLevel::High
        );
        assert_eq!(
            ThinkingLevel::Medium.clamp_to(ThinkingSupport::ToHigh),
            ThinkingLevel::Medium
        );
    }

    #[test]
    fn clamp_to_xhigh_is_identity() {
        for level in ThinkingLevel::ALL {
            assert_eq!(level.clamp_to(ThinkingSupport::ToXhigh), level);
        }
    }

    #[test]
    fn next_cycles_through_all_levels_and_wraps() {
        let mut level = ThinkingLevel::Off;
        for expected in [
            ThinkingLevel::Low,
            ThinkingLevel::Medium,
            ThinkingLevel::High,
            ThinkingLevel::Xhigh,
            ThinkingLevel::Off,
        ] {
            level = level.next();
            assert_eq!(level, expected);
        }
    }

    #[test]
    fn parse_round_trips_as_str() {
        for level in ThinkingLevel::ALL {
            assert_eq!(ThinkingLevel::parse(level.as_str()), Some(level));
        }
        assert_eq!(ThinkingLevel::parse("bogus"), None);
    }
}
