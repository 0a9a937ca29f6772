// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod context;
mod entry;
mod manager;
mod store;

pub use context::{build_session_context, entry_to_message, SessionContext};
pub use entry::{CustomDelivery, Entry, EntryPayload};
pub use manager::{SessionHeader, SessionInfo, SessionManager};
pub use store::LogStore;

/// Errors from the session log layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("unknown entry id: {0}")]
    UnknownEntry(String),
    #[error("session io: {0}")]
    Io(#[from] std::io::Error),
    #[error("session record: {0}")]
    Record(#[from] serde_json::Error),
    #[error("log writer unavailable")]
    WriterGone,
    #[error("{0}")]
    Other(String),
}
