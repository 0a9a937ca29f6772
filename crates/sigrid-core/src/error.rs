// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use sigrid_session::SessionError;

/// Errors surfaced synchronously from the session controller.
///
/// Transient provider errors never appear here — they become
/// error-terminated assistant messages handled by the retry supervisor.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("no model configured")]
    NoModel,
    #[error("no API key configured for provider {0}")]
    MissingApiKey(String),
    #[error("unknown model: {0}")]
    UnknownModel(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("Already compacted")]
    AlreadyCompacted,
    #[error("compaction failed: {0}")]
    Compaction(String),
    #[error("{0} is already in progress")]
    Busy(&'static str),
    #[error("cancelled by extension hook")]
    HookCancelled,
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
