// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::io::Write;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::Cli;
use sigrid_config::SettingsResolver;
use sigrid_core::{
    AgentEvent, ControllerConfig, MessageDelta, PromptOptions, SessionController, SessionEvent,
};
use sigrid_session::SessionManager;
use sigrid_tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let cwd = match &cli.cwd {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("resolving working directory")?,
    };
    let data_dir = sigrid_config::data_dir();

    if cli.list_sessions {
        let sessions_dir = SessionManager::sessions_dir_for(&data_dir, &cwd);
        for info in SessionManager::list_sessions(&sessions_dir) {
            println!(
                "{}  {}  {}",
                info.created_at.format("%Y-%m-%d %H:%M"),
                info.id,
                info.title.as_deref().unwrap_or("(untitled)")
            );
        }
        return Ok(());
    }

    let settings = Arc::new(load_settings(&cwd, cli.config.as_deref())?);
    let controller = Arc::new(
        SessionController::new(
            ControllerConfig {
                cwd,
                data_dir,
                persist: !cli.ephemeral,
                system_prompt_override: None,
            },
            settings,
            Arc::new(ToolRegistry::new()),
            Vec::new(),
        )
        .await?,
    );

    // Provider drivers are supplied by embedding front-ends via
    // `register_provider`; without one, prompts fail with a configuration
    // error rather than entering the turn loop.

    if let Some(session) = &cli.session {
        controller.switch_session(session).await?;
    }

    controller.add_listener(print_events);
    spawn_signal_handler(controller.clone());

    let result = match &cli.prompt {
        Some(prompt) => run_once(&controller, prompt).await,
        None => run_repl(&controller).await,
    };

    controller.dispose().await?;
    result
}

async fn run_once(controller: &SessionController, prompt: &str) -> anyhow::Result<()> {
    controller
        .prompt(prompt, PromptOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!(e))
}

async fn run_repl(controller: &Arc<SessionController>) -> anyhow::Result<()> {
    use tokio::io::{AsyncBufReadExt, BufReader};
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "exit" || line == "quit" {
            break;
        }
        if let Err(e) = controller.prompt(&line, PromptOptions::default()).await {
            eprintln!("error: {e}");
        }
    }
    Ok(())
}

fn print_events(event: &SessionEvent) {
    match event {
        SessionEvent::Agent(AgentEvent::MessageUpdate {
            delta: MessageDelta::Text { text },
        }) => {
            print!("{text}");
            let _ = std::io::stdout().flush();
        }
        SessionEvent::Agent(AgentEvent::AgentEnd { .. }) => {
            println!();
        }
        SessionEvent::AutoRetryStart {
            attempt,
            max_attempts,
            delay_ms,
            ..
        } => {
            eprintln!("retrying ({attempt}/{max_attempts}) in {delay_ms} ms…");
        }
        SessionEvent::AutoCompactionStart { .. } => {
            eprintln!("compacting…");
        }
        _ => {}
    }
}

/// Route termination signals through flush + dispose so SSH sockets and
/// the session log are left in a clean state.
fn spawn_signal_handler(controller: Arc<SessionController>) {
    tokio::spawn(async move {
        wait_for_termination().await;
        eprintln!();
        let _ = controller.flush().await;
        let _ = controller.dispose().await;
        std::process::exit(130);
    });
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = signal(SignalKind::interrupt()).expect("SIGINT handler");
    let mut terminate = signal(SignalKind::terminate()).expect("SIGTERM handler");
    let mut hangup = signal(SignalKind::hangup()).expect("SIGHUP handler");
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = hangup.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}

fn load_settings(
    cwd: &std::path::Path,
    explicit: Option<&std::path::Path>,
) -> anyhow::Result<SettingsResolver> {
    let resolver = SettingsResolver::standard(cwd)?;
    if let Some(path) = explicit {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let value: serde_yaml::Value = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        if let serde_yaml::Value::Mapping(mapping) = value {
            for (key, val) in mapping {
                if let Some(key) = key.as_str() {
                    resolver.set_override(key, val)?;
                }
            }
        }
    }
    Ok(resolver)
}

fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::try_from_env("SIGRID_LOG").unwrap_or_else(|_| EnvFilter::new("info"))
    } else {
        EnvFilter::try_from_env("SIGRID_LOG").unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}
