// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod resolver;
mod schema;

pub use resolver::SettingsResolver;
pub use schema::{
    BashSettings, CompactionSettings, ContextMode, InterruptMode, ModelSettings, RepeatMode,
    RetrySettings, Settings, SshSettings, SteeringMode, SteeringSettings, TtsrSettings,
};

use std::path::PathBuf;

/// Root of the agent's data directory (`~/.sigrid` unless overridden via
/// `SIGRID_DATA_DIR`).  Sessions, SSH sockets and mounts live under it.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("SIGRID_DATA_DIR") {
        return PathBuf::from(shellexpand::tilde(&dir).into_owned());
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".sigrid")
}
