// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, RwLock,
};

use sigrid_model::ToolSchema;

use crate::Tool;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),
}

/// Central registry holding all available tools plus the active subset.
///
/// The active set is what the next turn advertises to the model; mutating
/// it bumps a generation counter so the session controller knows to rebuild
/// the system prompt.  Changes take effect on the next turn — a running
/// turn keeps the schema snapshot it started with.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    active: RwLock<Vec<String>>,
    generation: AtomicU64,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            active: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// Register a tool and add it to the active set.
    pub fn register(&self, tool: impl Tool + 'static) {
        let name = tool.name().to_string();
        self.tools.write().unwrap().insert(name.clone(), Arc::new(tool));
        let mut active = self.active.write().unwrap();
        if !active.contains(&name) {
            active.push(name);
            active.sort();
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().unwrap().get(name).cloned()
    }

    /// Replace the active set.  Every name must refer to a registered tool;
    /// unknown names are a configuration error and nothing is changed.
    pub fn set_active(&self, names: &[String]) -> Result<(), RegistryError> {
        {
            let tools = self.tools.read().unwrap();
            for name in names {
                if !tools.contains_key(name) {
                    return Err(RegistryError::UnknownTool(name.clone()));
                }
            }
        }
        let mut sorted = names.to_vec();
        sorted.sort();
        sorted.dedup();
        *self.active.write().unwrap() = sorted;
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    /// Names of the active tools, sorted.
    pub fn active_names(&self) -> Vec<String> {
        self.active.read().unwrap().clone()
    }

    /// All registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Schemas for the active tools, sorted by name.
    pub fn active_schemas(&self) -> Vec<ToolSchema> {
        let tools = self.tools.read().unwrap();
        self.active
            .read()
            .unwrap()
            .iter()
            .filter_map(|name| tools.get(name))
            .map(|t| ToolSchema {
                name: t.name().to_string(),
                description: t.description().to_string(),
                parameters: t.parameters_schema(),
            })
            .collect()
    }

    /// Monotonic counter bumped on every registration / active-set change.
    /// The controller compares it against the value captured at the last
    /// system-prompt build.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
