// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::events::SessionEvent;

/// Events delivered to extension hooks.  `*Before*` events are cancellable;
/// `SessionBeforeCompact` may additionally supply a precomputed compaction.
#[derive(Debug, Clone)]
pub enum BusEvent {
    AgentStart,
    AgentEnd,
    TurnStart,
    TurnEnd,
    SessionStart { session_id: String },
    SessionBeforeSwitch { path: PathBuf },
    SessionSwitch { path: PathBuf },
    SessionBeforeBranch { entry_id: String },
    SessionBranch { entry_id: String },
    SessionBeforeTree { target_id: String },
    SessionTree { target_id: String },
    SessionBeforeCompact { entries_to_summarize: usize },
    SessionCompact,
    SessionShutdown,
    TtsrTriggered { rules: Vec<String> },
}

/// A hook's verdict on an event.
#[derive(Debug, Clone)]
pub enum HookOutcome {
    Continue,
    /// Cancel the operation (only honored for `*Before*` events).
    Cancel,
    /// Supply a compaction instead of the default LLM summarization
    /// (only honored for `SessionBeforeCompact`).
    Compaction {
        summary: String,
        details: Option<serde_json::Value>,
    },
}

/// An extension hook.  Handlers run synchronously with the emitting
/// operation and are awaited in registration order.
#[async_trait]
pub trait ExtensionHook: Send + Sync {
    async fn handle(&self, event: BusEvent) -> HookOutcome;
}

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

/// Fan-out point for extension hooks and UI listeners.
///
/// Both collections are copied before iteration, so a handler may add or
/// remove subscribers without invalidating the current dispatch — and a
/// listener added during emission does not receive the current event.
#[derive(Default)]
pub struct EventBus {
    hooks: Mutex<Vec<Arc<dyn ExtensionHook>>>,
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_hook(&self, hook: Arc<dyn ExtensionHook>) {
        self.hooks.lock().unwrap().push(hook);
    }

    /// Register a UI listener; returns its id for removal.
    pub fn add_listener(&self, listener: impl Fn(&SessionEvent) + Send + Sync + 'static) -> usize {
        let mut listeners = self.listeners.lock().unwrap();
        listeners.push(Arc::new(listener));
        listeners.len() - 1
    }

    pub fn clear_listeners(&self) {
        self.listeners.lock().unwrap().clear();
    }

    /// Notify UI listeners, in order, over a snapshot.
    pub fn notify(&self, event: &SessionEvent) {
        let snapshot: Vec<Listener> = self.listeners.lock().unwrap().clone();
        for listener in snapshot {
            listener(event);
        }
    }

    /// Dispatch to hooks in order; the first non-`Continue` outcome wins.
    pub async fn dispatch(&self, event: BusEvent) -> HookOutcome {
        let snapshot: Vec<Arc<dyn ExtensionHook>> = self.hooks.lock().unwrap().clone();
        for hook in snapshot {
            match hook.handle(event.clone()).await {
                HookOutcome::Continue => continue,
                other => return other,
            }
        }
        HookOutcome::Continue
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    struct CancellingHook;

    #[async_trait]
    impl ExtensionHook for CancellingHook {
        async fn handle(&self, event: BusEvent) -> HookOutcome {
            match event {
                BusEvent::SessionBeforeSwitch { .. } => HookOutcome::Cancel,
                _ => HookOutcome::Continue,
            }
        }
    }

    struct CountingHook(Arc<AtomicUsize>);

    #[async_trait]
    impl ExtensionHook for CountingHook {
        async fn handle(&self, _event: BusEvent) -> HookOutcome {
            self.0.fetch_add(1, Ordering::SeqCst);
            HookOutcome::Continue
        }
    }

    #[tokio::test]
    async fn dispatch_returns_first_non_continue_outcome() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.add_hook(Arc::new(CountingHook(count.clone())));
        bus.add_hook(Arc::new(CancellingHook));
        bus.add_hook(Arc::new(CountingHook(count.clone())));

        let outcome = bus
            .dispatch(BusEvent::SessionBeforeSwitch {
                path: PathBuf::from("/x"),
            })
            .await;
        assert!(matches!(outcome, HookOutcome::Cancel));
        // The hook after the cancelling one never ran.
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dispatch_with_no_hooks_continues() {
        let bus = EventBus::new();
        assert!(matches!(
            bus.dispatch(BusEvent::TurnStart).await,
            HookOutcome::Continue
        ));
    }

    #[test]
    fn listeners_receive_events_in_order() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        bus.add_listener(move |event| {
            if let SessionEvent::SessionStart { session_id } = event {
                s.lock().unwrap().push(session_id.clone());
            }
        });
        bus.notify(&SessionEvent::SessionStart {
            session_id: "a".into(),
        });
        bus.notify(&SessionEvent::SessionStart {
            session_id: "b".into(),
        });
        assert_eq!(*seen.lock().unwrap(), vec!["a", "b"]);
    }

    #[test]
    fn listener_added_during_emission_misses_current_event() {
        let bus = Arc::new(EventBus::new());
        let late_calls = Arc::new(AtomicUsize::new(0));
        let bus2 = bus.clone();
        let late = late_calls.clone();
        bus.add_listener(move |_| {
            let late = late.clone();
            bus2.add_listener(move |_| {
                late.fetch_add(1, Ordering::SeqCst);
            });
        });
        bus.notify(&SessionEvent::SessionShutdown);
        assert_eq!(
            late_calls.load(Ordering::SeqCst),
            0,
            "snapshot iteration excludes the newcomer"
        );
        bus.notify(&SessionEvent::SessionShutdown);
        assert!(late_calls.load(Ordering::SeqCst) >= 1);
    }
}
