// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio_util::sync::CancellationToken;

use crate::{
    provider::ResponseStream, thinking::ThinkingSupport, CompletionRequest, ModelProvider,
    StopReason, StreamEvent, Usage,
};

/// A pre-scripted provider.  Each `stream()` call pops the next script from
/// the front of the queue and replays its events.  Tests use this to specify
/// exact event sequences — tool calls, errors, overflow — without network
/// access.
pub struct ScriptedProvider {
    scripts: Arc<Mutex<Vec<Vec<StreamEvent>>>>,
    /// Every request seen, in call order, for test inspection.
    pub requests: Arc<Mutex<Vec<CompletionRequest>>>,
    context_window: u64,
    thinking: ThinkingSupport,
    credentials: bool,
    /// Optional pause before each event, so tests can abort mid-stream.
    event_delay: Option<Duration>,
}

impl ScriptedProvider {
    pub fn new(scripts: Vec<Vec<StreamEvent>>) -> Self {
        Self {
            scripts: Arc::new(Mutex::new(scripts)),
            requests: Arc::new(Mutex::new(Vec::new())),
            context_window: 200_000,
            thinking: ThinkingSupport::ToHigh,
            credentials: true,
            event_delay: None,
        }
    }

    /// Convenience: provider that replies with one text message per call,
    /// forever repeating the final script once the queue is exhausted.
    pub fn always_text(reply: impl Into<String>) -> Self {
        let r = reply.into();
        Self::new(vec![vec![
            StreamEvent::TextDelta { text: r },
            StreamEvent::Usage(Usage {
                input: 5,
                output: 5,
                ..Default::default()
            }),
            StreamEvent::Stop {
                reason: StopReason::EndTurn,
            },
        ]])
    }

    /// Convenience: a tool call in round one, a text reply in round two.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            vec![
                StreamEvent::ToolCallDelta {
                    index: 0,
                    id: tool_id.into(),
                    name: tool_name.into(),
                    arguments: args_json.into(),
                },
                StreamEvent::Stop {
                    reason: StopReason::ToolUse,
                },
            ],
            vec![
                StreamEvent::TextDelta {
                    text: final_text.into(),
                },
                StreamEvent::Stop {
                    reason: StopReason::EndTurn,
                },
            ],
        ])
    }

    /// Convenience: an error-terminated round followed by a text reply —
    /// the standard retry-supervisor fixture.
    pub fn error_then_text(error: impl Into<String>, final_text: impl Into<String>) -> Self {
        Self::new(vec![
            vec![StreamEvent::Error {
                message: error.into(),
            }],
            vec![
                StreamEvent::TextDelta {
                    text: final_text.into(),
                },
                StreamEvent::Stop {
                    reason: StopReason::EndTurn,
                },
            ],
        ])
    }

    /// A script fragment for a plain text completion.
    pub fn text_script(deltas: &[&str]) -> Vec<StreamEvent> {
        let mut events: Vec<StreamEvent> = deltas
            .iter()
            .map(|d| StreamEvent::TextDelta {
                text: (*d).to_string(),
            })
            .collect();
        events.push(StreamEvent::Usage(Usage {
            input: 5,
            output: 5,
            ..Default::default()
        }));
        events.push(StreamEvent::Stop {
            reason: StopReason::EndTurn,
        });
        events
    }

    pub fn with_context_window(mut self, tokens: u64) -> Self {
        self.context_window = tokens;
        self
    }

    pub fn with_thinking(mut self, support: ThinkingSupport) -> Self {
        self.thinking = support;
        self
    }

    pub fn without_credentials(mut self) -> Self {
        self.credentials = false;
        self
    }

    /// Pause before each streamed event.  Combined with an abort this lets
    /// tests cancel mid-message deterministically.
    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = Some(delay);
        self
    }

    /// The most recent request, if any.
    pub fn last_request(&self) -> Option<CompletionRequest> {
        self.requests.lock().unwrap().last().cloned()
    }

    /// Number of `stream()` calls made so far.
    pub fn call_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    fn model_id(&self) -> &str {
        "scripted-model"
    }

    fn context_window(&self) -> u64 {
        self.context_window
    }

    fn thinking(&self) -> ThinkingSupport {
        self.thinking
    }

    fn has_credentials(&self) -> bool {
        self.credentials
    }

    async fn stream(
        &self,
        req: CompletionRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ResponseStream> {
        self.requests.lock().unwrap().push(req);
        let events = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.is_empty() {
                vec![
                    StreamEvent::TextDelta {
                        text: "[no more scripts]".into(),
                    },
                    StreamEvent::Stop {
                        reason: StopReason::EndTurn,
                    },
                ]
            } else if scripts.len() == 1 {
                // Keep replaying the final script so long-running tests
                // (follow-ups, steering) never starve.
                scripts[0].clone()
            } else {
                scripts.remove(0)
            }
        };

        let delay = self.event_delay;
        let stream = stream::unfold(
            (events.into_iter(), cancel, delay),
            |(mut iter, cancel, delay)| async move {
                let event = iter.next()?;
                if let Some(d) = delay {
                    tokio::select! {
                        _ = cancel.cancelled() => return None,
                        _ = tokio::time::sleep(d) => {}
                    }
                }
                Some((Ok(event), (iter, cancel, delay)))
            },
        );
        Ok(Box::pin(stream))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::Message;

    fn req() -> CompletionRequest {
        CompletionRequest {
            messages: vec![Message::user("hi")],
            ..Default::default()
        }
    }

    async fn collect(provider: &ScriptedProvider) -> Vec<StreamEvent> {
        let mut s = provider
            .stream(req(), CancellationToken::new())
            .await
            .unwrap();
        let mut out = Vec::new();
        while let Some(ev) = s.next().await {
            out.push(ev.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn always_text_replays_single_script() {
        let p = ScriptedProvider::always_text("hello");
        let events = collect(&p).await;
        assert!(matches!(&events[0], StreamEvent::TextDelta { text } if text == "hello"));
        assert!(matches!(
            events.last(),
            Some(StreamEvent::Stop {
                reason: StopReason::EndTurn
            })
        ));
        // Replays rather than exhausting.
        let again = collect(&p).await;
        assert!(matches!(&again[0], StreamEvent::TextDelta { text } if text == "hello"));
    }

    #[tokio::test]
    async fn tool_then_text_pops_scripts_in_order() {
        let p = ScriptedProvider::tool_then_text("c1", "read", r#"{"path":"f"}"#, "done");
        let first = collect(&p).await;
        assert!(first
            .iter()
            .any(|e| matches!(e, StreamEvent::ToolCallDelta { name, .. } if name == "read")));
        let second = collect(&p).await;
        assert!(second
            .iter()
            .any(|e| matches!(e, StreamEvent::TextDelta { text } if text == "done")));
    }

    #[tokio::test]
    async fn requests_are_captured_in_order() {
        let p = ScriptedProvider::always_text("x");
        let _ = collect(&p).await;
        let _ = collect(&p).await;
        assert_eq!(p.call_count(), 2);
        assert!(p.last_request().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn event_delay_yields_to_cancellation() {
        let p = ScriptedProvider::always_text("slow").with_event_delay(Duration::from_secs(5));
        let cancel = CancellationToken::new();
        let mut s = p.stream(req(), cancel.clone()).await.unwrap();
        cancel.cancel();
        assert!(s.next().await.is_none(), "cancelled stream must end");
    }
}
