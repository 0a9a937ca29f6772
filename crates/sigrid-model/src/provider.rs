// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use tokio_util::sync::CancellationToken;

use crate::{thinking::ThinkingSupport, CompletionRequest, StreamEvent};

pub type ResponseStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamEvent>> + Send>>;

/// Contract a provider driver implements for the session core.
///
/// The driver owns the wire format; the core only sees [`StreamEvent`]s.
/// `cancel` must be honored at every await point inside the stream so that
/// an abort collapses the in-flight request promptly.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Provider name for status display (`"anthropic"`, `"openai"`, …).
    fn name(&self) -> &str;

    /// Model identifier as reported to users.
    fn model_id(&self) -> &str;

    /// Context window of the model, in tokens.
    fn context_window(&self) -> u64;

    /// Reasoning capability of the model.
    fn thinking(&self) -> ThinkingSupport {
        ThinkingSupport::None
    }

    /// Whether usable credentials are configured for this provider.
    ///
    /// Checked synchronously before a turn starts; a `false` here is a
    /// configuration error, not a stream error.
    fn has_credentials(&self) -> bool {
        true
    }

    /// Open one streaming completion.
    async fn stream(
        &self,
        req: CompletionRequest,
        cancel: CancellationToken,
    ) -> anyhow::Result<ResponseStream>;
}
