// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::Parser;
use std::path::PathBuf;

/// sigrid — session core for an interactive LLM coding agent.
///
/// The binary is deliberately thin: it builds a session controller, feeds
/// it prompts, prints streamed output, and tears everything down on exit.
/// Front-ends with real UIs embed `sigrid-core` directly.
#[derive(Parser, Debug)]
#[command(name = "sigrid", version, about)]
pub struct Cli {
    /// Path to an explicit settings file (merged over global + project).
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,

    /// Resume an existing session file instead of starting fresh.
    #[arg(long, short = 's')]
    pub session: Option<PathBuf>,

    /// Run one prompt in batch mode and exit; otherwise read lines from
    /// stdin.
    #[arg(long, short = 'p')]
    pub prompt: Option<String>,

    /// Working directory for the session.
    #[arg(long)]
    pub cwd: Option<PathBuf>,

    /// Do not persist the session to disk.
    #[arg(long)]
    pub ephemeral: bool,

    /// List persisted sessions for this directory and exit.
    #[arg(long)]
    pub list_sessions: bool,

    /// Write tracing output to stderr.
    #[arg(long, short = 'v')]
    pub verbose: bool,
}
