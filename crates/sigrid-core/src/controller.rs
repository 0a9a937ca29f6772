// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sigrid_config::{ContextMode, Settings, SettingsResolver};
use sigrid_exec::{ExecRequest, ExecResult, SshManager};
use sigrid_model::{
    CompletionRequest, Message, ModelProvider, StopReason, StreamEvent, ThinkingLevel,
    ThinkingSupport, UserPart,
};
use sigrid_session::{CustomDelivery, Entry, SessionManager};
use sigrid_tools::{ToolCtx, ToolRegistry};

use crate::bus::{BusEvent, EventBus, ExtensionHook, HookOutcome};
use crate::compact::{build_summary_request, prepare_compaction};
use crate::engine::TurnEngine;
use crate::error::CoreError;
use crate::events::{AgentEvent, CompactionReason, SessionEvent};
use crate::export::write_html_transcript;
use crate::prompts::system_prompt;
use crate::queues::MessageQueues;
use crate::retry::{backoff_delay, classify_error, ErrorClass, RetrySupervisor};
use crate::ttsr::{TtsrEngine, TtsrRule};

/// Delay before a TTSR injection continues the turn.
const TTSR_CONTINUE_DELAY: Duration = Duration::from_millis(50);
/// Delay before an overflow compaction resumes the turn.
const OVERFLOW_CONTINUE_DELAY: Duration = Duration::from_millis(100);
/// Cap on file-mention expansion content.
const FILE_MENTION_MAX_BYTES: usize = 32 * 1024;

/// Where a prompt goes when a turn is already streaming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StreamingBehavior {
    #[default]
    Steer,
    FollowUp,
}

#[derive(Debug, Clone, Default)]
pub struct PromptOptions {
    pub images: Vec<UserPart>,
    pub streaming_behavior: StreamingBehavior,
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub cwd: PathBuf,
    pub data_dir: PathBuf,
    /// Persist the session to a JSONL file under the data dir.
    pub persist: bool,
    pub system_prompt_override: Option<String>,
}

/// The single public façade over the session core.
///
/// Owns the session log, turn engine, compactor, retry supervisor, TTSR
/// engine, executors and event bus; serializes every state-mutating
/// operation against the turn lifecycle.
pub struct SessionController {
    inner: Arc<Inner>,
}

struct Inner {
    config: ControllerConfig,
    settings: Arc<SettingsResolver>,
    tools: Arc<ToolRegistry>,
    queues: Arc<MessageQueues>,
    bus: EventBus,
    retry: RetrySupervisor,
    ssh: SshManager,
    providers: StdMutex<Vec<Arc<dyn ModelProvider>>>,
    current_provider: StdMutex<Option<Arc<dyn ModelProvider>>>,
    manager: TokioMutex<SessionManager>,
    engine: TokioMutex<TurnEngine>,
    ttsr: StdMutex<TtsrEngine>,
    thinking: StdMutex<ThinkingLevel>,
    streaming: watch::Sender<bool>,
    compacting: AtomicBool,
    turn_cancel: StdMutex<CancellationToken>,
    compact_cancel: StdMutex<CancellationToken>,
    bash_cancel: StdMutex<CancellationToken>,
    branch_summary_cancel: StdMutex<CancellationToken>,
    /// Bash executions that completed mid-stream, flushed at idle.
    pending_bash: StdMutex<Vec<PendingBash>>,
}

struct PendingBash {
    command: String,
    output: String,
    exit_code: Option<i32>,
    excluded_from_context: bool,
}

/// Placeholder provider before a model is configured; never reached
/// because `validate_model` rejects first.
struct NoProvider;

#[async_trait]
impl ModelProvider for NoProvider {
    fn name(&self) -> &str {
        "none"
    }
    fn model_id(&self) -> &str {
        "none"
    }
    fn context_window(&self) -> u64 {
        0
    }
    fn has_credentials(&self) -> bool {
        false
    }
    async fn stream(
        &self,
        _req: CompletionRequest,
        _cancel: CancellationToken,
    ) -> anyhow::Result<sigrid_model::ResponseStream> {
        anyhow::bail!("no model configured")
    }
}

impl SessionController {
    pub async fn new(
        config: ControllerConfig,
        settings: Arc<SettingsResolver>,
        tools: Arc<ToolRegistry>,
        rules: Vec<TtsrRule>,
    ) -> Result<Self, CoreError> {
        let sessions_dir = SessionManager::sessions_dir_for(&config.data_dir, &config.cwd);
        let manager = if config.persist {
            SessionManager::create(&sessions_dir, &config.cwd)?
        } else {
            SessionManager::in_memory(&config.cwd)
        };
        let session_id = manager.id().to_string();

        let queues = Arc::new(MessageQueues::new());
        let ctx_queues = queues.clone();
        let mut tool_ctx = ToolCtx::new("none", config.cwd.clone());
        tool_ctx.session_file = manager.file().map(Path::to_path_buf);
        tool_ctx.queued_messages = Arc::new(move || ctx_queues.queued_count());

        let ttsr_settings = settings.current().ttsr;
        let ssh_settings = settings.current().ssh;
        let engine = TurnEngine::new(
            Arc::new(NoProvider),
            tools.clone(),
            queues.clone(),
            tool_ctx,
        );

        let (streaming, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            ssh: SshManager::new(config.data_dir.clone(), ssh_settings.mount_remote),
            config,
            settings,
            tools,
            queues,
            bus: EventBus::new(),
            retry: RetrySupervisor::new(),
            providers: StdMutex::new(Vec::new()),
            current_provider: StdMutex::new(None),
            manager: TokioMutex::new(manager),
            engine: TokioMutex::new(engine),
            ttsr: StdMutex::new(TtsrEngine::new(ttsr_settings, rules)),
            thinking: StdMutex::new(ThinkingLevel::Off),
            streaming,
            compacting: AtomicBool::new(false),
            turn_cancel: StdMutex::new(CancellationToken::new()),
            compact_cancel: StdMutex::new(CancellationToken::new()),
            bash_cancel: StdMutex::new(CancellationToken::new()),
            branch_summary_cancel: StdMutex::new(CancellationToken::new()),
            pending_bash: StdMutex::new(Vec::new()),
        });

        inner
            .bus
            .dispatch(BusEvent::SessionStart {
                session_id: session_id.clone(),
            })
            .await;
        inner.bus.notify(&SessionEvent::SessionStart { session_id });
        Ok(Self { inner })
    }

    // ── Subscriptions & providers ────────────────────────────────────────────

    pub fn add_listener(
        &self,
        listener: impl Fn(&SessionEvent) + Send + Sync + 'static,
    ) -> usize {
        self.inner.bus.add_listener(listener)
    }

    pub fn add_hook(&self, hook: Arc<dyn ExtensionHook>) {
        self.inner.bus.add_hook(hook);
    }

    /// Register a provider; the first one registered becomes current.
    pub fn register_provider(&self, provider: Arc<dyn ModelProvider>) {
        self.inner.providers.lock().unwrap().push(provider.clone());
        let mut current = self.inner.current_provider.lock().unwrap();
        if current.is_none() {
            *current = Some(provider);
        }
    }

    pub fn model_id(&self) -> Option<String> {
        self.inner
            .current_provider
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.model_id().to_string())
    }

    // ── State probes ─────────────────────────────────────────────────────────

    pub fn is_streaming(&self) -> bool {
        *self.inner.streaming.borrow()
    }

    pub async fn wait_for_idle(&self) {
        let mut rx = self.inner.streaming.subscribe();
        while *rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    pub async fn wait_for_retry(&self) {
        self.inner.retry.wait_for_retry().await;
    }

    pub async fn session_id(&self) -> String {
        self.inner.manager.lock().await.id().to_string()
    }

    pub async fn session_file(&self) -> Option<PathBuf> {
        self.inner.manager.lock().await.file().map(Path::to_path_buf)
    }

    pub async fn branch_entries(&self) -> Vec<Entry> {
        let manager = self.inner.manager.lock().await;
        manager.get_branch().into_iter().cloned().collect()
    }

    pub async fn get_entry(&self, id: &str) -> Option<Entry> {
        self.inner.manager.lock().await.get_entry(id).cloned()
    }

    pub async fn flush(&self) -> Result<(), CoreError> {
        Ok(self.inner.manager.lock().await.flush().await?)
    }

    // ── Prompting & queues ───────────────────────────────────────────────────

    /// Submit user input.  Idle: a normal turn.  Streaming: routed into the
    /// steering or follow-up queue per `streaming_behavior`.
    pub async fn prompt(&self, text: &str, opts: PromptOptions) -> Result<(), CoreError> {
        if self.is_streaming() {
            return match opts.streaming_behavior {
                StreamingBehavior::Steer => self.steer(text),
                StreamingBehavior::FollowUp => self.follow_up(text),
            };
        }
        self.run_user_turn(text, opts.images).await
    }

    pub fn steer(&self, text: &str) -> Result<(), CoreError> {
        reject_extension_command(text)?;
        self.inner.queues.push_steering(text);
        Ok(())
    }

    pub fn follow_up(&self, text: &str) -> Result<(), CoreError> {
        reject_extension_command(text)?;
        self.inner.queues.push_follow_up(text);
        Ok(())
    }

    /// Attach out-of-band context to the next prompt.
    pub fn queue_next_turn_context(&self, custom_type: &str, content: &str) {
        self.inner.queues.push_next_turn_context(custom_type, content);
    }

    /// Insert a custom message entry; optionally run a turn on it.
    pub async fn send_custom_message(
        &self,
        custom_type: &str,
        content: &str,
        deliver_as: CustomDelivery,
        trigger_turn: bool,
    ) -> Result<(), CoreError> {
        {
            let mut manager = self.inner.manager.lock().await;
            manager.append_custom_message_entry(custom_type, content, deliver_as, None);
        }
        if trigger_turn {
            if self.is_streaming() {
                return Err(CoreError::Busy("a turn"));
            }
            self.validate_model()?;
            let _guard = StreamingGuard::engage(&self.inner);
            reset_token(&self.inner.turn_cancel);
            run_episode(&self.inner, Vec::new()).await?;
            self.idle_housekeeping().await?;
        }
        Ok(())
    }

    async fn run_user_turn(&self, text: &str, images: Vec<UserPart>) -> Result<(), CoreError> {
        self.validate_model()?;
        let _guard = StreamingGuard::engage(&self.inner);
        reset_token(&self.inner.turn_cancel);
        self.inner.retry.settle();

        // Out-of-band context rides ahead of the user entry in the log.
        {
            let mut manager = self.inner.manager.lock().await;
            for (path, content) in expand_file_mentions(text, &self.inner.config.cwd) {
                manager.append_file_mention(path, content);
            }
            for (custom_type, content) in self.inner.queues.take_next_turn_context() {
                manager.append_custom_message_entry(
                    custom_type,
                    content,
                    CustomDelivery::User,
                    None,
                );
            }
        }

        let mut parts = vec![UserPart::Text {
            text: text.to_string(),
        }];
        parts.extend(images);
        run_episode(&self.inner, vec![Message::user_parts(parts)]).await?;

        // Follow-ups run after the turn, before idle — unless aborted.
        let mode = self.inner.settings.current().steering.steering_mode;
        while !current_token(&self.inner.turn_cancel).is_cancelled() {
            let follow_ups = self.inner.queues.take_follow_up(mode);
            if follow_ups.is_empty() {
                break;
            }
            for text in follow_ups {
                run_episode(&self.inner, vec![Message::user(text)]).await?;
            }
        }
        self.idle_housekeeping().await?;
        Ok(())
    }

    /// Deferred bash entries and the durability point at the idle boundary.
    async fn idle_housekeeping(&self) -> Result<(), CoreError> {
        let pending: Vec<PendingBash> =
            std::mem::take(&mut *self.inner.pending_bash.lock().unwrap());
        let mut manager = self.inner.manager.lock().await;
        for bash in pending {
            manager.append_bash_execution(
                bash.command,
                bash.output,
                bash.exit_code,
                bash.excluded_from_context,
            );
        }
        manager.flush().await?;
        Ok(())
    }

    fn validate_model(&self) -> Result<(), CoreError> {
        let provider = self.inner.current_provider.lock().unwrap();
        let provider = provider.as_ref().ok_or(CoreError::NoModel)?;
        if !provider.has_credentials() {
            return Err(CoreError::MissingApiKey(provider.name().to_string()));
        }
        Ok(())
    }

    // ── Aborts ───────────────────────────────────────────────────────────────

    /// Cancel the in-flight turn, its tools, and any auto recovery.
    pub fn abort(&self) {
        current_token(&self.inner.turn_cancel).cancel();
        current_token(&self.inner.compact_cancel).cancel();
        current_token(&self.inner.branch_summary_cancel).cancel();
        self.inner.retry.abort();
    }

    pub fn abort_compaction(&self) {
        current_token(&self.inner.compact_cancel).cancel();
    }

    pub fn abort_retry(&self) {
        self.inner.retry.abort();
    }

    pub fn abort_bash(&self) {
        current_token(&self.inner.bash_cancel).cancel();
    }

    pub fn abort_branch_summary(&self) {
        current_token(&self.inner.branch_summary_cancel).cancel();
    }

    // ── Model & thinking management ──────────────────────────────────────────

    pub async fn set_model(&self, model_id: &str) -> Result<(), CoreError> {
        self.switch_model(model_id, false).await
    }

    /// Switch models without recording a `ModelChange` entry; a resumed
    /// session falls back to the last persisted selection.
    pub async fn set_model_temporary(&self, model_id: &str) -> Result<(), CoreError> {
        self.switch_model(model_id, true).await
    }

    async fn switch_model(&self, model_id: &str, temporary: bool) -> Result<(), CoreError> {
        let provider = self
            .inner
            .providers
            .lock()
            .unwrap()
            .iter()
            .find(|p| p.model_id() == model_id)
            .cloned()
            .ok_or_else(|| CoreError::UnknownModel(model_id.to_string()))?;
        *self.inner.current_provider.lock().unwrap() = Some(provider.clone());
        {
            let mut engine = self.inner.engine.lock().await;
            engine.set_provider(provider.clone());
        }
        if !temporary {
            let mut manager = self.inner.manager.lock().await;
            manager.append_model_change(provider.name(), provider.model_id());
        }
        debug!(model = model_id, temporary, "model switched");
        Ok(())
    }

    /// Step through registered models; `dir` is +1 / -1.
    pub async fn cycle_model(&self, dir: i64) -> Result<String, CoreError> {
        let providers: Vec<Arc<dyn ModelProvider>> =
            self.inner.providers.lock().unwrap().clone();
        if providers.is_empty() {
            return Err(CoreError::NoModel);
        }
        let current = self
            .inner
            .current_provider
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.model_id().to_string());
        let index = providers
            .iter()
            .position(|p| Some(p.model_id().to_string()) == current)
            .unwrap_or(0);
        let len = providers.len() as i64;
        let next = providers[(index as i64 + dir).rem_euclid(len) as usize]
            .model_id()
            .to_string();
        self.set_model(&next).await?;
        Ok(next)
    }

    /// Cycle through an ordered shortlist of models (e.g. the user's
    /// favourite chat/review pair).  Unknown ids in `order` are skipped;
    /// when the current model is not in the list, the first entry wins.
    pub async fn cycle_role_models(
        &self,
        order: &[String],
        temporary: bool,
    ) -> Result<String, CoreError> {
        let known: Vec<String> = {
            let providers = self.inner.providers.lock().unwrap();
            order
                .iter()
                .filter(|id| providers.iter().any(|p| p.model_id() == id.as_str()))
                .cloned()
                .collect()
        };
        if known.is_empty() {
            return Err(CoreError::NoModel);
        }
        let current = self.model_id();
        let next = match current.and_then(|c| known.iter().position(|id| *id == c)) {
            Some(index) => known[(index + 1) % known.len()].clone(),
            None => known[0].clone(),
        };
        self.switch_model(&next, temporary).await?;
        Ok(next)
    }

    /// Set the thinking level, clamped to the current model's capability.
    pub async fn set_thinking_level(&self, level: ThinkingLevel) -> Result<ThinkingLevel, CoreError> {
        let support = self
            .inner
            .current_provider
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.thinking())
            .unwrap_or(ThinkingSupport::None);
        let clamped = level.clamp_to(support);
        *self.inner.thinking.lock().unwrap() = clamped;
        self.inner
            .manager
            .lock()
            .await
            .append_thinking_level_change(clamped);
        Ok(clamped)
    }

    pub fn thinking_level(&self) -> ThinkingLevel {
        *self.inner.thinking.lock().unwrap()
    }

    /// Advance to the next supported level, wrapping to `Off`.
    pub async fn cycle_thinking_level(&self) -> Result<ThinkingLevel, CoreError> {
        let support = self
            .inner
            .current_provider
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.thinking())
            .unwrap_or(ThinkingSupport::None);
        let mut next = self.thinking_level().next();
        for _ in 0..ThinkingLevel::ALL.len() {
            if next.clamp_to(support) == next {
                break;
            }
            next = next.next();
        }
        self.set_thinking_level(next).await
    }

    // ── Tools ────────────────────────────────────────────────────────────────

    /// Replace the active tool set; the system prompt is rebuilt for the
    /// next turn.  Unknown names are a configuration error.
    pub fn set_active_tools_by_name(&self, names: &[String]) -> Result<(), CoreError> {
        self.inner
            .tools
            .set_active(names)
            .map_err(|e| match e {
                sigrid_tools::RegistryError::UnknownTool(name) => CoreError::UnknownTool(name),
            })
    }

    // ── Compaction ───────────────────────────────────────────────────────────

    /// Manual compaction.  Aborts a running turn first; fails with
    /// `AlreadyCompacted` when the branch tail is already a compaction.
    pub async fn compact(&self, custom_instructions: Option<&str>) -> Result<(), CoreError> {
        if self.is_streaming() {
            self.abort();
            self.wait_for_idle().await;
        }
        if self.inner.compacting.swap(true, Ordering::SeqCst) {
            return Err(CoreError::Busy("compaction"));
        }
        reset_token(&self.inner.compact_cancel);
        let result = run_compaction(&self.inner, custom_instructions).await;
        self.inner.compacting.store(false, Ordering::SeqCst);
        result.map(|_| ())
    }

    // ── Bash / SSH ───────────────────────────────────────────────────────────

    /// Run a user-level shell command and record it as a `BashExecution`
    /// entry.  When a turn is streaming, the entry is deferred to the next
    /// idle boundary so it cannot split a tool-call/result pair.
    pub async fn run_bash(
        &self,
        command: &str,
        excluded_from_context: bool,
    ) -> Result<ExecResult, CoreError> {
        let bash = self.inner.settings.current().bash;
        reset_token(&self.inner.bash_cancel);
        let cancel = current_token(&self.inner.bash_cancel);
        let mut req = ExecRequest::new(command);
        req.cwd = Some(self.inner.config.cwd.clone());
        req.timeout = Some(Duration::from_secs(bash.default_timeout_secs));
        req.limits = sigrid_exec::ExecLimits {
            max_output_bytes: bash.max_output_bytes,
            spill_threshold_bytes: bash.spill_threshold_bytes,
        };
        req.spill_dir = Some(self.inner.config.data_dir.join("spill"));
        let result = sigrid_exec::run_bash(&req, cancel)
            .await
            .map_err(|e| CoreError::Other(e.into()))?;

        let record = PendingBash {
            command: command.to_string(),
            output: result.output.clone(),
            exit_code: result.exit_code,
            excluded_from_context,
        };
        if self.is_streaming() {
            self.inner.pending_bash.lock().unwrap().push(record);
        } else {
            let mut manager = self.inner.manager.lock().await;
            manager.append_bash_execution(
                record.command,
                record.output,
                record.exit_code,
                record.excluded_from_context,
            );
        }
        Ok(result)
    }

    pub fn ssh(&self) -> &SshManager {
        &self.inner.ssh
    }

    // ── Session tree & lifecycle ─────────────────────────────────────────────

    /// Rewind so the next prompt becomes a sibling of `entry_id`.
    pub async fn branch(&self, entry_id: &str) -> Result<(), CoreError> {
        let outcome = self
            .inner
            .bus
            .dispatch(BusEvent::SessionBeforeBranch {
                entry_id: entry_id.to_string(),
            })
            .await;
        if matches!(outcome, HookOutcome::Cancel) {
            return Err(CoreError::HookCancelled);
        }
        self.pause_for_mutation().await;
        self.inner
            .manager
            .lock()
            .await
            .branch_from_entry(entry_id)?;
        rebuild_engine(&self.inner).await;
        self.inner
            .bus
            .dispatch(BusEvent::SessionBranch {
                entry_id: entry_id.to_string(),
            })
            .await;
        self.inner.bus.notify(&SessionEvent::SessionBranch {
            entry_id: entry_id.to_string(),
        });
        Ok(())
    }

    /// Jump to an arbitrary entry, optionally summarizing the branch being
    /// abandoned.
    pub async fn navigate_tree(
        &self,
        target_id: &str,
        summarize: bool,
        custom_instructions: Option<&str>,
    ) -> Result<(), CoreError> {
        let outcome = self
            .inner
            .bus
            .dispatch(BusEvent::SessionBeforeTree {
                target_id: target_id.to_string(),
            })
            .await;
        if matches!(outcome, HookOutcome::Cancel) {
            return Err(CoreError::HookCancelled);
        }
        self.pause_for_mutation().await;

        if summarize {
            reset_token(&self.inner.branch_summary_cancel);
            let cancel = current_token(&self.inner.branch_summary_cancel);
            let summary = self
                .summarize_abandoned_branch(custom_instructions, cancel)
                .await
                .unwrap_or_else(|e| {
                    warn!(error = %e, "branch summary generation failed; using placeholder");
                    "Abandoned an unsummarized branch.".to_string()
                });
            self.inner
                .manager
                .lock()
                .await
                .branch_with_summary(target_id, summary, None, false)?;
        } else {
            self.inner.manager.lock().await.branch_to(Some(target_id))?;
        }
        rebuild_engine(&self.inner).await;
        self.inner
            .bus
            .dispatch(BusEvent::SessionTree {
                target_id: target_id.to_string(),
            })
            .await;
        self.inner.bus.notify(&SessionEvent::SessionTree {
            target_id: target_id.to_string(),
        });
        Ok(())
    }

    async fn summarize_abandoned_branch(
        &self,
        custom_instructions: Option<&str>,
        cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        let messages = {
            let manager = self.inner.manager.lock().await;
            manager.build_context().messages
        };
        if messages.is_empty() {
            return Ok("Abandoned an empty branch.".to_string());
        }
        let provider = self
            .inner
            .current_provider
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no model configured"))?;
        let mut prompt = String::from(
            "Summarise what the following abandoned conversation branch did, \
             in a few dense sentences.",
        );
        if let Some(extra) = custom_instructions {
            prompt.push_str("\nAdditional instructions: ");
            prompt.push_str(extra);
        }
        prompt.push_str("\n\n---\n\n");
        prompt.push_str(&crate::compact::serialize_messages(&messages));
        run_completion_text(&provider, vec![Message::user(prompt)], cancel).await
    }

    /// Switch to another persisted session.  Switching to the current
    /// session file is a no-op.
    pub async fn switch_session(&self, path: &Path) -> Result<(), CoreError> {
        {
            let manager = self.inner.manager.lock().await;
            if manager.file() == Some(path) {
                return Ok(());
            }
        }
        let outcome = self
            .inner
            .bus
            .dispatch(BusEvent::SessionBeforeSwitch {
                path: path.to_path_buf(),
            })
            .await;
        if matches!(outcome, HookOutcome::Cancel) {
            return Err(CoreError::HookCancelled);
        }
        self.pause_for_mutation().await;
        {
            let mut manager = self.inner.manager.lock().await;
            manager.flush().await?;
            *manager = SessionManager::open(path)?;
        }
        rebuild_engine(&self.inner).await;
        self.restore_persisted_selections().await;
        self.inner
            .bus
            .dispatch(BusEvent::SessionSwitch {
                path: path.to_path_buf(),
            })
            .await;
        self.inner.bus.notify(&SessionEvent::SessionSwitch {
            path: path.to_path_buf(),
        });
        Ok(())
    }

    /// Start a fresh session (new id, new file).
    pub async fn new_session(&self) -> Result<String, CoreError> {
        self.pause_for_mutation().await;
        let session_id = {
            let mut manager = self.inner.manager.lock().await;
            manager.flush().await?;
            let sessions_dir = SessionManager::sessions_dir_for(
                &self.inner.config.data_dir,
                &self.inner.config.cwd,
            );
            *manager = if self.inner.config.persist {
                SessionManager::create(&sessions_dir, &self.inner.config.cwd)?
            } else {
                SessionManager::in_memory(&self.inner.config.cwd)
            };
            manager.id().to_string()
        };
        rebuild_engine(&self.inner).await;
        self.inner
            .bus
            .dispatch(BusEvent::SessionStart {
                session_id: session_id.clone(),
            })
            .await;
        self.inner.bus.notify(&SessionEvent::SessionStart {
            session_id: session_id.clone(),
        });
        Ok(session_id)
    }

    /// Re-apply the model / thinking level recorded in the loaded branch.
    async fn restore_persisted_selections(&self) {
        let ctx = self.inner.manager.lock().await.build_context();
        if let Some((_, model_id)) = ctx.model {
            if let Err(e) = self.set_model_temporary(&model_id).await {
                warn!(model = %model_id, error = %e, "persisted model unavailable");
            }
        }
        if let Some(level) = ctx.thinking_level {
            *self.inner.thinking.lock().unwrap() = level;
        }
    }

    /// Export the current branch as a standalone HTML transcript.
    pub async fn export_to_html(&self, output: Option<&Path>) -> Result<PathBuf, CoreError> {
        let manager = self.inner.manager.lock().await;
        let path = match output {
            Some(p) => p.to_path_buf(),
            None => self
                .inner
                .config
                .data_dir
                .join("exports")
                .join(format!("{}.html", manager.id())),
        };
        let title = manager.title().unwrap_or_else(|| manager.id().to_string());
        write_html_transcript(&path, &title, &manager.get_branch())?;
        Ok(path)
    }

    /// Flush the log, tear down SSH state, detach listeners.
    pub async fn dispose(&self) -> Result<(), CoreError> {
        self.abort();
        self.wait_for_idle().await;
        self.inner.manager.lock().await.flush().await?;
        self.inner.ssh.close_all_connections().await;
        self.inner.ssh.unmount_all().await;
        self.inner.bus.dispatch(BusEvent::SessionShutdown).await;
        self.inner.bus.notify(&SessionEvent::SessionShutdown);
        self.inner.bus.clear_listeners();
        Ok(())
    }

    /// Abort any in-flight turn and wait for idle before a state mutation.
    async fn pause_for_mutation(&self) {
        if self.is_streaming() {
            self.abort();
            self.wait_for_idle().await;
        }
    }
}

// ─── Episode driver ───────────────────────────────────────────────────────────

#[derive(Default)]
struct PumpState {
    ttsr_abort: bool,
    messages: Vec<Message>,
}

/// Sets the streaming flag for the duration of a user turn.
struct StreamingGuard<'a>(&'a watch::Sender<bool>);

impl<'a> StreamingGuard<'a> {
    fn engage(inner: &'a Inner) -> Self {
        // send_replace updates the value even with no subscribers.
        inner.streaming.send_replace(true);
        Self(&inner.streaming)
    }
}

impl Drop for StreamingGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(false);
    }
}

fn current_token(slot: &StdMutex<CancellationToken>) -> CancellationToken {
    slot.lock().unwrap().clone()
}

fn reset_token(slot: &StdMutex<CancellationToken>) {
    *slot.lock().unwrap() = CancellationToken::new();
}

fn reject_extension_command(text: &str) -> Result<(), CoreError> {
    if text.trim_start().starts_with('/') {
        return Err(CoreError::Other(anyhow::anyhow!(
            "extension commands cannot be queued as messages"
        )));
    }
    Ok(())
}

/// Rebuild the engine's LLM-visible copy from the canonical log.
async fn rebuild_engine(inner: &Arc<Inner>) {
    let ctx = inner.manager.lock().await.build_context();
    inner.engine.lock().await.replace_messages(ctx.messages);
}

/// One agent episode: engine segments chained by TTSR injections, retries
/// and overflow compactions, ending at a terminal stop or abort.
async fn run_episode(inner: &Arc<Inner>, mut pending: Vec<Message>) -> Result<(), CoreError> {
    inner.bus.dispatch(BusEvent::AgentStart).await;
    inner
        .bus
        .notify(&SessionEvent::Agent(AgentEvent::AgentStart));
    rebuild_engine(inner).await;

    let mut episode_messages: Vec<Message> = Vec::new();
    loop {
        let settings = inner.settings.current();
        prepare_engine(inner, &settings).await;

        let cancel = current_token(&inner.turn_cancel);
        let (tx, rx) = mpsc::channel(256);
        let state = Arc::new(StdMutex::new(PumpState::default()));
        let pump = tokio::spawn(pump_events(
            inner.clone(),
            rx,
            cancel.clone(),
            state.clone(),
        ));

        let outcome = {
            let mut engine = inner.engine.lock().await;
            engine.run(std::mem::take(&mut pending), &tx, &cancel).await
        };
        drop(tx);
        let _ = pump.await;
        let pump_state = std::mem::take(&mut *state.lock().unwrap());
        episode_messages.extend(pump_state.messages);

        // TTSR: abort happened mid-stream; inject and continue.
        if pump_state.ttsr_abort {
            let injection = {
                let mut ttsr = inner.ttsr.lock().unwrap();
                ttsr.take_pending_message()
            };
            if let Some(text) = injection {
                tokio::time::sleep(TTSR_CONTINUE_DELAY).await;
                if settings.ttsr.context_mode == ContextMode::Discard {
                    inner.engine.lock().await.remove_last_assistant();
                }
                reset_token(&inner.turn_cancel);
                pending = vec![Message::user(text)];
                continue;
            }
        }

        if outcome.aborted {
            if inner.retry.is_active() {
                emit_retry_end(inner, false, Some("Retry cancelled".to_string()));
            }
            break;
        }

        match outcome.last_stop {
            Some(StopReason::Error) => {
                let error = outcome.error_message.unwrap_or_default();
                match classify_error(&error) {
                    ErrorClass::Overflow => {
                        if handle_overflow(inner, &settings).await {
                            tokio::time::sleep(OVERFLOW_CONTINUE_DELAY).await;
                            rebuild_engine(inner).await;
                            reset_token(&inner.turn_cancel);
                            pending = Vec::new();
                            continue;
                        }
                        break;
                    }
                    ErrorClass::Transient => {
                        let retry_settings = &settings.retry;
                        if !retry_settings.enabled
                            || inner.retry.attempt() >= retry_settings.max_retries
                        {
                            emit_retry_end(inner, false, Some(error));
                            break;
                        }
                        let attempt = inner.retry.begin_attempt();
                        let delay = backoff_delay(retry_settings.base_delay_ms, attempt);
                        inner.bus.notify(&SessionEvent::AutoRetryStart {
                            attempt,
                            max_attempts: retry_settings.max_retries,
                            delay_ms: delay.as_millis() as u64,
                            error_message: error.clone(),
                        });
                        if !inner.retry.backoff(delay).await {
                            emit_retry_end(inner, false, Some("Retry cancelled".to_string()));
                            break;
                        }
                        // The error-terminated message stays in the log but
                        // is dropped from the context by the rebuild.
                        rebuild_engine(inner).await;
                        continue;
                    }
                    ErrorClass::Fatal => {
                        if inner.retry.is_active() {
                            emit_retry_end(inner, false, Some(error));
                        }
                        break;
                    }
                }
            }
            _ => {
                if inner.retry.is_active() {
                    emit_retry_end(inner, true, None);
                }
                maybe_threshold_compact(inner, &settings).await;
                break;
            }
        }
    }

    inner.bus.dispatch(BusEvent::AgentEnd).await;
    inner
        .bus
        .notify(&SessionEvent::Agent(AgentEvent::AgentEnd {
            messages: episode_messages,
        }));
    Ok(())
}

async fn prepare_engine(inner: &Arc<Inner>, settings: &Settings) {
    let provider = inner.current_provider.lock().unwrap().clone();
    let thinking = *inner.thinking.lock().unwrap();
    let prompt = system_prompt(
        inner.config.system_prompt_override.as_deref(),
        &inner.tools.active_names(),
        &inner.config.cwd,
    );
    let mut engine = inner.engine.lock().await;
    if let Some(provider) = provider {
        engine.set_ctx_model(provider.model_id());
        engine.set_provider(provider);
    }
    engine.set_thinking_level(thinking);
    engine.set_steering(settings.steering.clone());
    engine.set_system_prompt(prompt);
}

fn emit_retry_end(inner: &Arc<Inner>, success: bool, final_error: Option<String>) {
    let attempt = inner.retry.attempt();
    inner.bus.notify(&SessionEvent::AutoRetryEnd {
        success,
        attempt,
        final_error,
    });
    inner.retry.settle();
}

/// Overflow-triggered auto-compaction.  Returns true when the turn should
/// continue after the compaction.
async fn handle_overflow(inner: &Arc<Inner>, settings: &Settings) -> bool {
    if !settings.compaction.enabled {
        return false;
    }
    if inner.compacting.swap(true, Ordering::SeqCst) {
        return false;
    }
    inner.bus.notify(&SessionEvent::AutoCompactionStart {
        reason: CompactionReason::Overflow,
    });
    reset_token(&inner.compact_cancel);
    let result = run_compaction(inner, None).await;
    inner.compacting.store(false, Ordering::SeqCst);
    let aborted = current_token(&inner.compact_cancel).is_cancelled();
    match result {
        Ok(_) => {
            inner.bus.notify(&SessionEvent::AutoCompactionEnd {
                success: true,
                aborted: false,
                will_retry: true,
            });
            true
        }
        Err(e) => {
            // Overflow compaction failure is fatal for the turn.
            warn!(error = %e, "overflow compaction failed");
            inner.bus.notify(&SessionEvent::AutoCompactionEnd {
                success: false,
                aborted,
                will_retry: false,
            });
            false
        }
    }
}

/// Threshold-triggered auto-compaction after a successful turn; failure is
/// logged and the session stays usable.
async fn maybe_threshold_compact(inner: &Arc<Inner>, settings: &Settings) {
    if !settings.compaction.enabled {
        return;
    }
    let Some(provider) = inner.current_provider.lock().unwrap().clone() else {
        return;
    };
    let window = provider.context_window();
    let Some(usage) = inner.engine.lock().await.last_usage() else {
        return;
    };
    // Strictly greater: exactly at the trigger point does not compact.
    if usage.context_tokens() <= window.saturating_sub(settings.compaction.reserve_tokens) {
        return;
    }
    if inner.compacting.swap(true, Ordering::SeqCst) {
        return;
    }
    inner.bus.notify(&SessionEvent::AutoCompactionStart {
        reason: CompactionReason::Threshold,
    });
    reset_token(&inner.compact_cancel);
    let result = run_compaction(inner, None).await;
    inner.compacting.store(false, Ordering::SeqCst);
    let aborted = current_token(&inner.compact_cancel).is_cancelled();
    match result {
        Ok(_) => inner.bus.notify(&SessionEvent::AutoCompactionEnd {
            success: true,
            aborted: false,
            will_retry: false,
        }),
        Err(e) => {
            warn!(error = %e, "threshold compaction failed; continuing uncompacted");
            inner.bus.notify(&SessionEvent::AutoCompactionEnd {
                success: false,
                aborted,
                will_retry: false,
            });
        }
    }
}

/// Prepare, summarize, persist and apply one compaction.
async fn run_compaction(
    inner: &Arc<Inner>,
    custom_instructions: Option<&str>,
) -> Result<String, CoreError> {
    let settings = inner.settings.current();
    let plan = {
        let manager = inner.manager.lock().await;
        prepare_compaction(&manager.get_branch(), &settings.compaction)
    };
    let Some(plan) = plan else {
        return Err(CoreError::AlreadyCompacted);
    };

    let outcome = inner
        .bus
        .dispatch(BusEvent::SessionBeforeCompact {
            entries_to_summarize: plan.summarize_messages.len(),
        })
        .await;
    let (summary, details, from_extension) = match outcome {
        HookOutcome::Cancel => return Err(CoreError::HookCancelled),
        HookOutcome::Compaction { summary, details } => (summary, details, true),
        HookOutcome::Continue => {
            let provider = inner
                .current_provider
                .lock()
                .unwrap()
                .clone()
                .ok_or(CoreError::NoModel)?;
            let cancel = current_token(&inner.compact_cancel);
            let request = build_summary_request(&plan, custom_instructions);
            let summary = run_completion_text(&provider, request, cancel)
                .await
                .map_err(|e| CoreError::Compaction(e.to_string()))?;
            (summary, None, false)
        }
    };

    let summary_entry_id = {
        let mut manager = inner.manager.lock().await;
        manager.append_compaction(
            summary,
            plan.first_kept_entry_id.clone(),
            plan.tokens_before,
            details,
            from_extension,
        )
    };
    rebuild_engine(inner).await;
    inner.bus.dispatch(BusEvent::SessionCompact).await;
    inner.bus.notify(&SessionEvent::SessionCompact {
        tokens_before: plan.tokens_before,
        summary_entry_id: summary_entry_id.clone(),
    });
    Ok(summary_entry_id)
}

/// Tool-free completion used for compaction and branch summaries.
async fn run_completion_text(
    provider: &Arc<dyn ModelProvider>,
    messages: Vec<Message>,
    cancel: CancellationToken,
) -> anyhow::Result<String> {
    let request = CompletionRequest {
        system: String::new(),
        messages,
        tools: Vec::new(),
        thinking_level: ThinkingLevel::Off,
    };
    let mut stream = provider.stream(request, cancel.clone()).await?;
    let mut text = String::new();
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => anyhow::bail!("cancelled"),
            event = stream.next() => event,
        };
        let Some(event) = event else { break };
        match event? {
            StreamEvent::TextDelta { text: delta } => text.push_str(&delta),
            StreamEvent::Error { message } => anyhow::bail!(message),
            StreamEvent::Stop { .. } => break,
            _ => {}
        }
    }
    if text.is_empty() {
        anyhow::bail!("model returned an empty summary");
    }
    Ok(text)
}

/// Forwards engine events to persistence, TTSR, hooks and listeners — in
/// emission order, one at a time.
async fn pump_events(
    inner: Arc<Inner>,
    mut rx: mpsc::Receiver<AgentEvent>,
    cancel: CancellationToken,
    state: Arc<StdMutex<PumpState>>,
) {
    while let Some(event) = rx.recv().await {
        match &event {
            AgentEvent::TurnStart => {
                inner.ttsr.lock().unwrap().on_turn_start();
                inner.bus.dispatch(BusEvent::TurnStart).await;
            }
            AgentEvent::TurnEnd { .. } => {
                inner.ttsr.lock().unwrap().on_turn_end();
                inner.bus.dispatch(BusEvent::TurnEnd).await;
            }
            AgentEvent::MessageUpdate { delta } => {
                if let Some(text) = delta.rule_text() {
                    let fired = inner.ttsr.lock().unwrap().feed(text);
                    if !fired.is_empty() {
                        state.lock().unwrap().ttsr_abort = true;
                        inner
                            .bus
                            .dispatch(BusEvent::TtsrTriggered {
                                rules: fired.clone(),
                            })
                            .await;
                        inner
                            .bus
                            .notify(&SessionEvent::TtsrTriggered { rules: fired });
                        cancel.cancel();
                    }
                }
            }
            AgentEvent::MessageEnd { message } => {
                {
                    let mut manager = inner.manager.lock().await;
                    match message {
                        Message::User { parts } => {
                            manager.append_user(parts.clone());
                        }
                        Message::Assistant { message } => {
                            manager.append_assistant(message.clone());
                        }
                        _ => {}
                    }
                }
                state.lock().unwrap().messages.push(message.clone());
            }
            AgentEvent::ToolCallEnd {
                call_id, result, ..
            } => {
                let mut manager = inner.manager.lock().await;
                manager.append_tool_result(
                    call_id.clone(),
                    result.parts.clone(),
                    result.is_error,
                    result.details.clone(),
                    result.usage,
                );
            }
            _ => {}
        }
        inner.bus.notify(&SessionEvent::Agent(event));
    }
}

/// Expand `@path` mentions into `(path, content)` pairs for readable files.
fn expand_file_mentions(text: &str, cwd: &Path) -> Vec<(String, String)> {
    use std::sync::OnceLock;
    static MENTION: OnceLock<regex::Regex> = OnceLock::new();
    let mention =
        MENTION.get_or_init(|| regex::Regex::new(r"@([A-Za-z0-9_./-]+)").expect("mention regex"));

    let mut out = Vec::new();
    for caps in mention.captures_iter(text) {
        let raw = &caps[1];
        let path = cwd.join(raw);
        if !path.is_file() {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(mut content) => {
                if content.len() > FILE_MENTION_MAX_BYTES {
                    content.truncate(FILE_MENTION_MAX_BYTES);
                    content.push_str("\n[truncated]");
                }
                out.push((raw.to_string(), content));
            }
            Err(e) => debug!(path = %path.display(), error = %e, "unreadable file mention"),
        }
    }
    out
}
