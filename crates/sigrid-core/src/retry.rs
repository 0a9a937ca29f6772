// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Classification of an error-terminated assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying with backoff: overload, rate limit, 429/5xx,
    /// connection trouble.
    Transient,
    /// The request was too large; routed to the compactor, not the
    /// retry supervisor.
    Overflow,
    /// Anything else; surfaced to the user.
    Fatal,
}

/// Provider-agnostic error classifier over the assistant `error_message`.
///
/// Overflow patterns are checked first: several providers phrase context
/// overflows with wording that would otherwise match the transient set.
pub fn classify_error(message: &str) -> ErrorClass {
    // Compiled on first use; patterns are fixed at build time.
    use std::sync::OnceLock;
    static OVERFLOW: OnceLock<regex::Regex> = OnceLock::new();
    static TRANSIENT: OnceLock<regex::Regex> = OnceLock::new();

    let overflow = OVERFLOW.get_or_init(|| {
        regex::Regex::new(concat!(
            r"(?i)(context window|context[_ ]length|maximum context|prompt is too long",
            r"|exceeds? (the )?(context|token)|too many (total )?tokens|input is too long",
            r"|exceed_context_size|request too large)",
        ))
        .expect("overflow regex")
    });
    let transient = TRANSIENT.get_or_init(|| {
        regex::Regex::new(concat!(
            r"(?i)(overloaded|rate.?limit|too many requests|\b429\b|\b5\d\d\b",
            r"|internal server error|service unavailable|bad gateway|gateway timeout",
            r"|connection (reset|refused|closed|error|aborted)|timed? ?out",
            r"|temporarily unavailable|network error|broken pipe|eof while|stream disconnected)",
        ))
        .expect("transient regex")
    });

    if overflow.is_match(message) {
        ErrorClass::Overflow
    } else if transient.is_match(message) {
        ErrorClass::Transient
    } else {
        ErrorClass::Fatal
    }
}

/// Exponential backoff: `base · 2^(attempt-1)`, attempt counted from 1.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let factor = 1u64 << (attempt.saturating_sub(1)).min(16);
    Duration::from_millis(base_ms.saturating_mul(factor))
}

/// Tracks one retry cycle: attempt counter, abortable backoff sleep, and a
/// wait handle for callers that must block until the cycle resolves.
///
/// Exactly one retry cycle is outstanding per session; the controller
/// drives the state machine and emits the lifecycle events.
pub struct RetrySupervisor {
    attempt: AtomicU32,
    active: AtomicBool,
    cancel: Mutex<CancellationToken>,
    settled: Notify,
}

impl RetrySupervisor {
    pub fn new() -> Self {
        Self {
            attempt: AtomicU32::new(0),
            active: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            settled: Notify::new(),
        }
    }

    /// Begin the next attempt; returns its 1-based number.
    pub fn begin_attempt(&self) -> u32 {
        self.active.store(true, Ordering::SeqCst);
        self.attempt.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn attempt(&self) -> u32 {
        self.attempt.load(Ordering::SeqCst)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Abortable backoff sleep.  Returns false when aborted.
    pub async fn backoff(&self, delay: Duration) -> bool {
        let token = {
            let mut cancel = self.cancel.lock().unwrap();
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
            cancel.clone()
        };
        tokio::select! {
            _ = token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Cancel the in-flight backoff sleep, if any.
    pub fn abort(&self) {
        self.cancel.lock().unwrap().cancel();
    }

    /// Resolve the cycle (success or give-up) and wake waiters.
    pub fn settle(&self) {
        self.attempt.store(0, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        self.settled.notify_waiters();
    }

    /// Block until the outstanding retry cycle resolves.  Returns
    /// immediately when none is active.
    pub async fn wait_for_retry(&self) {
        while self.is_active() {
            self.settled.notified().await;
        }
    }
}

impl Default for RetrySupervisor {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
