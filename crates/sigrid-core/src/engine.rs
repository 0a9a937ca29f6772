// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sigrid_config::{InterruptMode, SteeringSettings};
use sigrid_model::{
    AssistantMessage, CompletionRequest, ContentBlock, Message, ModelProvider, Role, StopReason,
    StreamEvent, ThinkingLevel, Usage,
};
use sigrid_tools::{ToolCtx, ToolRegistry, ToolResult, ToolUpdate};

use crate::events::{AgentEvent, MessageDelta};
use crate::queues::MessageQueues;

/// How one engine run ended.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Stop reason of the final assistant message, `None` when the run was
    /// cancelled before any message started.
    pub last_stop: Option<StopReason>,
    /// True when an external abort ended the run.
    pub aborted: bool,
    /// Error text of the final assistant message when it error-terminated.
    pub error_message: Option<String>,
}

/// Why a single stream ended.
enum StreamEnd {
    /// The provider finished the message.
    Natural,
    /// External cancellation.
    Cancelled,
    /// A steering message arrived under `interrupt_mode = immediate`.
    SteeringInterrupt,
}

/// Drives one end-to-end model conversation: stream, dispatch tools, feed
/// results back, loop until the stop reason is terminal.
///
/// The engine owns a *copy* of the LLM-visible message list; the session
/// log remains the canonical history and the controller rebuilds this copy
/// from it at well-defined points (episode start, after compaction and
/// retries).
pub struct TurnEngine {
    provider: Arc<dyn ModelProvider>,
    tools: Arc<ToolRegistry>,
    queues: Arc<MessageQueues>,
    tool_ctx: ToolCtx,
    system_prompt: String,
    thinking_level: ThinkingLevel,
    steering: SteeringSettings,
    messages: Vec<Message>,
}

impl TurnEngine {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        tools: Arc<ToolRegistry>,
        queues: Arc<MessageQueues>,
        tool_ctx: ToolCtx,
    ) -> Self {
        Self {
            provider,
            tools,
            queues,
            tool_ctx,
            system_prompt: String::new(),
            thinking_level: ThinkingLevel::Off,
            steering: SteeringSettings::default(),
            messages: Vec::new(),
        }
    }

    // ── State shared with the controller ─────────────────────────────────────

    pub fn set_provider(&mut self, provider: Arc<dyn ModelProvider>) {
        self.provider = provider;
    }

    pub fn provider(&self) -> &Arc<dyn ModelProvider> {
        &self.provider
    }

    pub fn set_system_prompt(&mut self, prompt: String) {
        self.system_prompt = prompt;
    }

    pub fn set_thinking_level(&mut self, level: ThinkingLevel) {
        self.thinking_level = level;
    }

    pub fn set_steering(&mut self, steering: SteeringSettings) {
        self.steering = steering;
    }

    pub fn set_tool_ctx(&mut self, ctx: ToolCtx) {
        self.tool_ctx = ctx;
    }

    /// Keep the narrow tool view's model id in step with provider swaps.
    pub fn set_ctx_model(&mut self, model_id: &str) {
        self.tool_ctx.model_id = model_id.to_string();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Replace the LLM-visible copy (rebuild after compaction / retry).
    pub fn replace_messages(&mut self, messages: Vec<Message>) {
        self.messages = messages;
    }

    /// Remove the trailing assistant message, if any (TTSR `discard` mode).
    pub fn remove_last_assistant(&mut self) -> bool {
        if matches!(self.messages.last(), Some(Message::Assistant { .. })) {
            self.messages.pop();
            return true;
        }
        false
    }

    /// Usage of the most recent successful assistant message.
    pub fn last_usage(&self) -> Option<Usage> {
        self.messages.iter().rev().find_map(|m| match m {
            Message::Assistant { message } if message.stop_reason != StopReason::Error => {
                Some(message.usage)
            }
            _ => None,
        })
    }

    // ── The loop ─────────────────────────────────────────────────────────────

    /// Run until the model stops with a terminal reason, the run is
    /// cancelled, or an error-terminated message ends it.
    ///
    /// `pending_user` are user messages delivered at the first turn
    /// boundary (the prompt itself, TTSR injections, steering carried over
    /// from a previous segment).  Steering drained mid-run loops back here.
    pub async fn run(
        &mut self,
        pending_user: Vec<Message>,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> RunOutcome {
        let mut pending_user = pending_user;
        loop {
            if cancel.is_cancelled() {
                return RunOutcome {
                    last_stop: None,
                    aborted: true,
                    error_message: None,
                };
            }

            let _ = tx.send(AgentEvent::TurnStart).await;

            for message in pending_user.drain(..) {
                let _ = tx
                    .send(AgentEvent::MessageStart { role: Role::User })
                    .await;
                self.messages.push(message.clone());
                let _ = tx.send(AgentEvent::MessageEnd { message }).await;
            }

            let (assistant, end) = self.stream_once(tx, cancel).await;
            self.messages.push(Message::assistant(assistant.clone()));
            let _ = tx
                .send(AgentEvent::MessageEnd {
                    message: Message::assistant(assistant.clone()),
                })
                .await;

            match assistant.stop_reason {
                StopReason::ToolUse => {
                    let tool_results = self.execute_tools(&assistant, tx, cancel).await;
                    let _ = tx
                        .send(AgentEvent::TurnEnd {
                            message: assistant,
                            tool_results,
                        })
                        .await;
                    if cancel.is_cancelled() {
                        return RunOutcome {
                            last_stop: Some(StopReason::Aborted),
                            aborted: true,
                            error_message: None,
                        };
                    }
                    // `wait` interrupt mode delivers steering here, after
                    // the tool batch; `immediate` already interrupted.
                    pending_user.extend(self.drain_steering());
                }
                StopReason::Aborted => {
                    let _ = tx
                        .send(AgentEvent::TurnEnd {
                            message: assistant,
                            tool_results: Vec::new(),
                        })
                        .await;
                    match end {
                        StreamEnd::SteeringInterrupt => {
                            pending_user.extend(self.drain_steering());
                            // An interrupted stream without a steer to show
                            // for it would spin; treat as a plain abort.
                            if pending_user.is_empty() {
                                return RunOutcome {
                                    last_stop: Some(StopReason::Aborted),
                                    aborted: true,
                                    error_message: None,
                                };
                            }
                        }
                        _ => {
                            return RunOutcome {
                                last_stop: Some(StopReason::Aborted),
                                aborted: true,
                                error_message: None,
                            }
                        }
                    }
                }
                StopReason::Error => {
                    let _ = tx
                        .send(AgentEvent::TurnEnd {
                            message: assistant.clone(),
                            tool_results: Vec::new(),
                        })
                        .await;
                    return RunOutcome {
                        last_stop: Some(StopReason::Error),
                        aborted: false,
                        error_message: assistant.error_message,
                    };
                }
                StopReason::EndTurn | StopReason::Length => {
                    let stop = assistant.stop_reason;
                    let _ = tx
                        .send(AgentEvent::TurnEnd {
                            message: assistant,
                            tool_results: Vec::new(),
                        })
                        .await;
                    let steer = self.drain_steering();
                    if steer.is_empty() {
                        return RunOutcome {
                            last_stop: Some(stop),
                            aborted: false,
                            error_message: None,
                        };
                    }
                    pending_user.extend(steer);
                }
            }
        }
    }

    fn drain_steering(&self) -> Vec<Message> {
        self.queues
            .take_steering(self.steering.steering_mode)
            .into_iter()
            .map(Message::user)
            .collect()
    }

    /// Stream a single assistant message, emitting deltas as events.
    async fn stream_once(
        &mut self,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> (AssistantMessage, StreamEnd) {
        let request = CompletionRequest {
            system: self.system_prompt.clone(),
            messages: self.messages.clone(),
            tools: self.tools.active_schemas(),
            thinking_level: self.thinking_level.clamp_to(self.provider.thinking()),
        };

        let _ = tx
            .send(AgentEvent::MessageStart {
                role: Role::Assistant,
            })
            .await;

        let mut thinking_buf = String::new();
        let mut text_buf = String::new();
        let mut pending_calls: BTreeMap<u32, PendingToolCall> = BTreeMap::new();
        let mut usage = Usage::default();
        let mut stop: Option<StopReason> = None;
        let mut error_message: Option<String> = None;

        let mut stream = match self.provider.stream(request, cancel.child_token()).await {
            Ok(stream) => Some(stream),
            Err(e) => {
                // Surfaced exactly like a streamed error: an
                // error-terminated assistant message for the supervisor.
                warn!(error = %e, "provider stream failed to open");
                error_message = Some(e.to_string());
                stop = Some(StopReason::Error);
                None
            }
        };

        let end = if let Some(stream) = stream.as_mut() {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break StreamEnd::Cancelled,
                    event = stream.next() => event,
                };
                let Some(event) = event else {
                    break StreamEnd::Natural;
                };
                let event = match event {
                    Ok(ev) => ev,
                    Err(e) => {
                        error_message = Some(e.to_string());
                        stop = Some(StopReason::Error);
                        break StreamEnd::Natural;
                    }
                };
                match event {
                    StreamEvent::TextDelta { text } => {
                        text_buf.push_str(&text);
                        let _ = tx
                            .send(AgentEvent::MessageUpdate {
                                delta: MessageDelta::Text { text },
                            })
                            .await;
                    }
                    StreamEvent::ThinkingDelta { text } => {
                        thinking_buf.push_str(&text);
                        let _ = tx
                            .send(AgentEvent::MessageUpdate {
                                delta: MessageDelta::Thinking { text },
                            })
                            .await;
                    }
                    StreamEvent::ToolCallDelta {
                        index,
                        id,
                        name,
                        arguments,
                    } => {
                        let pending = pending_calls.entry(index).or_default();
                        if !id.is_empty() {
                            pending.id = id;
                        }
                        if !name.is_empty() {
                            pending.name = name;
                        }
                        pending.args_buf.push_str(&arguments);
                        let _ = tx
                            .send(AgentEvent::MessageUpdate {
                                delta: MessageDelta::ToolCallArguments {
                                    index,
                                    name: pending.name.clone(),
                                    arguments,
                                },
                            })
                            .await;
                    }
                    StreamEvent::Usage(u) => usage = u,
                    StreamEvent::Stop { reason } => {
                        stop = Some(reason);
                        break StreamEnd::Natural;
                    }
                    StreamEvent::Error { message } => {
                        error_message = Some(message);
                        stop = Some(StopReason::Error);
                        break StreamEnd::Natural;
                    }
                }
                if self.steering.interrupt_mode == InterruptMode::Immediate
                    && self.queues.has_steering()
                {
                    break StreamEnd::SteeringInterrupt;
                }
            }
        } else {
            StreamEnd::Natural
        };

        // Assemble blocks: thinking, then text, then tool calls by index.
        let mut blocks = Vec::new();
        if !thinking_buf.is_empty() {
            blocks.push(ContentBlock::Thinking {
                thinking: thinking_buf,
            });
        }
        if !text_buf.is_empty() {
            blocks.push(ContentBlock::Text { text: text_buf });
        }
        let mut synthetic = 0usize;
        for (_, pending) in std::mem::take(&mut pending_calls) {
            if pending.name.is_empty() {
                warn!(call_id = %pending.id, "dropping tool call with empty name");
                continue;
            }
            blocks.push(pending.finish(&mut synthetic));
        }
        let has_tool_calls = blocks
            .iter()
            .any(|b| matches!(b, ContentBlock::ToolCall { .. }));

        let stop_reason = match end {
            StreamEnd::Cancelled | StreamEnd::SteeringInterrupt => StopReason::Aborted,
            StreamEnd::Natural => stop.unwrap_or({
                if has_tool_calls {
                    StopReason::ToolUse
                } else {
                    StopReason::EndTurn
                }
            }),
        };
        debug!(?stop_reason, blocks = blocks.len(), "assistant message complete");

        (
            AssistantMessage {
                blocks,
                stop_reason,
                error_message,
                usage,
            },
            end,
        )
    }

    /// Execute every tool call of `assistant` in parallel, emit tool
    /// events in call order, and append one tool-result message per call.
    async fn execute_tools(
        &mut self,
        assistant: &AssistantMessage,
        tx: &mpsc::Sender<AgentEvent>,
        cancel: &CancellationToken,
    ) -> Vec<(String, ToolResult)> {
        let calls: Vec<(String, String, serde_json::Value)> = assistant
            .tool_calls()
            .into_iter()
            .map(|(id, name, args)| (id.to_string(), name.to_string(), args.clone()))
            .collect();

        for (call_id, name, args) in &calls {
            let _ = tx
                .send(AgentEvent::ToolCallStart {
                    call_id: call_id.clone(),
                    name: name.clone(),
                    arguments: args.clone(),
                })
                .await;
        }

        let mut tasks = Vec::with_capacity(calls.len());
        for (call_id, name, args) in calls.clone() {
            let tool = self.tools.get(&name);
            let ctx = self.tool_ctx.clone();
            let tool_cancel = cancel.child_token();
            let event_tx = tx.clone();
            tasks.push(tokio::spawn(async move {
                let Some(tool) = tool else {
                    return ToolResult::err(format!("unknown tool: {name}"));
                };
                let (update_tx, mut update_rx) = mpsc::channel::<ToolUpdate>(8);
                let forward_id = call_id.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(update) = update_rx.recv().await {
                        let _ = event_tx
                            .send(AgentEvent::ToolCallUpdate {
                                call_id: forward_id.clone(),
                                parts: update.parts,
                            })
                            .await;
                    }
                });
                let result = tool
                    .execute(&call_id, &args, update_tx, &ctx, tool_cancel)
                    .await;
                let _ = forwarder.await;
                result
            }));
        }

        let mut results = Vec::with_capacity(calls.len());
        for ((call_id, name, _), task) in calls.into_iter().zip(tasks) {
            let mut result = match task.await {
                Ok(result) => result,
                Err(e) => ToolResult::err(format!("tool panicked: {e}")),
            };
            // A cancelled tool must surface as an error to the model.
            if cancel.is_cancelled() {
                result.is_error = true;
            }
            let _ = tx
                .send(AgentEvent::ToolCallEnd {
                    call_id: call_id.clone(),
                    name,
                    result: result.clone(),
                })
                .await;
            self.messages.push(Message::tool_result(
                call_id.clone(),
                result.parts.clone(),
                result.is_error,
            ));
            results.push((call_id, result));
        }
        results
    }
}

/// Accumulates parallel tool-call fragments keyed by provider index.
#[derive(Default)]
struct PendingToolCall {
    id: String,
    name: String,
    args_buf: String,
}

impl PendingToolCall {
    fn finish(self, synthetic: &mut usize) -> ContentBlock {
        let arguments = if self.args_buf.is_empty() {
            serde_json::Value::Object(Default::default())
        } else {
            match serde_json::from_str(&self.args_buf) {
                Ok(v) => v,
                Err(e) => {
                    warn!(
                        tool = %self.name,
                        error = %e,
                        "tool call arguments are not valid JSON; substituting {{}}"
                    );
                    serde_json::Value::Object(Default::default())
                }
            }
        };
        let id = if self.id.is_empty() {
            *synthetic += 1;
            format!("call_synthetic_{synthetic}")
        } else {
            self.id
        };
        ContentBlock::ToolCall {
            id,
            name: self.name,
            arguments,
        }
    }
}
