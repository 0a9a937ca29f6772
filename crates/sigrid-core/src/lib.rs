// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod bus;
mod compact;
mod controller;
mod engine;
mod error;
mod events;
mod export;
mod prompts;
mod queues;
mod retry;
mod ttsr;

pub use bus::{BusEvent, EventBus, ExtensionHook, HookOutcome};
pub use compact::{prepare_compaction, CompactionPlan};
pub use controller::{ControllerConfig, PromptOptions, SessionController, StreamingBehavior};
pub use engine::{RunOutcome, TurnEngine};
pub use error::CoreError;
pub use events::{AgentEvent, CompactionReason, MessageDelta, SessionEvent};
pub use export::write_html_transcript;
pub use queues::MessageQueues;
pub use retry::{backoff_delay, classify_error, ErrorClass, RetrySupervisor};
pub use ttsr::{TtsrEngine, TtsrRule};
