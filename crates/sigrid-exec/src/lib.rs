// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod bash;
mod sanitize;
mod ssh;

pub use bash::{run_bash, ExecLimits, ExecRequest, ExecResult};
pub use sanitize::Sanitizer;
pub use ssh::SshManager;

/// Errors from subprocess management.
#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("spawn failed: {0}")]
    Spawn(std::io::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("private key {0} is group/world-readable; run `chmod 600` on it")]
    KeyPermissions(std::path::PathBuf),
    #[error("ssh master connection to {host} failed: {detail}")]
    SshConnect { host: String, detail: String },
}
