// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod mock;
mod provider;
mod thinking;
mod types;

pub use mock::ScriptedProvider;
pub use provider::{ModelProvider, ResponseStream};
pub use thinking::{ThinkingLevel, ThinkingSupport};
pub use types::{
    AssistantMessage, CompletionRequest, ContentBlock, Message, Role, StopReason, StreamEvent,
    ToolResultPart, ToolSchema, Usage, UserPart,
};
