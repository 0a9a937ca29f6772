// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::path::{Path, PathBuf};
use std::sync::{Mutex, RwLock};

use anyhow::Context;
use tracing::debug;

use crate::Settings;

type ChangeListener = std::sync::Arc<dyn Fn(&Settings) + Send + Sync>;

/// Layered settings: global file → project file → runtime overrides.
///
/// Later layers win on scalar conflicts; mappings deep-merge.  The merged
/// value is cached; `reload()` re-reads the files, `set_override()` mutates
/// the runtime layer.  Both notify registered change listeners with the new
/// merged settings.
pub struct SettingsResolver {
    global_path: Option<PathBuf>,
    project_path: Option<PathBuf>,
    overrides: Mutex<serde_yaml::Value>,
    merged: RwLock<Settings>,
    listeners: Mutex<Vec<ChangeListener>>,
}

impl SettingsResolver {
    /// Standard file locations: `~/.config/sigrid/settings.yaml` (global)
    /// and `<cwd>/.sigrid/settings.yaml` (project).
    pub fn standard(cwd: &Path) -> anyhow::Result<Self> {
        let global = dirs::config_dir().map(|d| d.join("sigrid/settings.yaml"));
        let project = Some(cwd.join(".sigrid/settings.yaml"));
        Self::from_paths(global, project)
    }

    pub fn from_paths(
        global_path: Option<PathBuf>,
        project_path: Option<PathBuf>,
    ) -> anyhow::Result<Self> {
        let resolver = Self {
            global_path,
            project_path,
            overrides: Mutex::new(empty_mapping()),
            merged: RwLock::new(Settings::default()),
            listeners: Mutex::new(Vec::new()),
        };
        let merged = resolver.merge_all()?;
        *resolver.merged.write().unwrap() = merged;
        Ok(resolver)
    }

    /// In-memory resolver with no backing files (tests, sub-agents).
    pub fn in_memory() -> Self {
        Self {
            global_path: None,
            project_path: None,
            overrides: Mutex::new(empty_mapping()),
            merged: RwLock::new(Settings::default()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the current merged settings.
    pub fn current(&self) -> Settings {
        self.merged.read().unwrap().clone()
    }

    /// Register a listener invoked after every successful reload/override.
    pub fn on_change(&self, listener: impl Fn(&Settings) + Send + Sync + 'static) {
        self.listeners
            .lock()
            .unwrap()
            .push(std::sync::Arc::new(listener));
    }

    /// Re-read the file layers and re-merge.
    pub fn reload(&self) -> anyhow::Result<()> {
        let merged = self.merge_all()?;
        *self.merged.write().unwrap() = merged;
        self.notify();
        Ok(())
    }

    /// Set one runtime override, expressed as a YAML path fragment
    /// (e.g. `set_override("retry", value)` replaces the retry mapping).
    pub fn set_override(&self, key: &str, value: serde_yaml::Value) -> anyhow::Result<()> {
        {
            let mut overrides = self.overrides.lock().unwrap();
            let mut layer = serde_yaml::Mapping::new();
            layer.insert(serde_yaml::Value::String(key.to_string()), value);
            merge_yaml(&mut overrides, serde_yaml::Value::Mapping(layer));
        }
        let merged = self.merge_all()?;
        *self.merged.write().unwrap() = merged;
        self.notify();
        Ok(())
    }

    fn notify(&self) {
        let settings = self.current();
        // Snapshot under the lock, call outside it, so a listener may
        // register further listeners without deadlocking.
        let listeners: Vec<ChangeListener> = self.listeners.lock().unwrap().clone();
        for listener in listeners {
            listener(&settings);
        }
    }

    fn merge_all(&self) -> anyhow::Result<Settings> {
        let mut merged = empty_mapping();
        for path in [self.global_path.as_ref(), self.project_path.as_ref()]
            .into_iter()
            .flatten()
        {
            if path.is_file() {
                debug!(path = %path.display(), "loading settings layer");
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                let layer: serde_yaml::Value = serde_yaml::from_str(&text)
                    .with_context(|| format!("parsing {}", path.display()))?;
                merge_yaml(&mut merged, layer);
            }
        }
        merge_yaml(&mut merged, self.overrides.lock().unwrap().clone());

        let settings = if matches!(merged, serde_yaml::Value::Mapping(ref m) if m.is_empty()) {
            Settings::default()
        } else {
            serde_yaml::from_value(merged).unwrap_or_default()
        };
        Ok(settings)
    }
}

fn empty_mapping() -> serde_yaml::Value {
    serde_yaml::Value::Mapping(serde_yaml::Mapping::new())
}

/// Deep-merge `src` into `dst`; src wins on scalar conflicts.
fn merge_yaml(dst: &mut serde_yaml::Value, src: serde_yaml::Value) {
    match (dst, src) {
        (serde_yaml::Value::Mapping(d), serde_yaml::Value::Mapping(s)) => {
            for (k, v) in s {
                let entry = d.entry(k).or_insert(empty_mapping());
                merge_yaml(entry, v);
            }
        }
        (dst, src) => *dst = src,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
