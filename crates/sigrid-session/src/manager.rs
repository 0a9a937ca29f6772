// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use sigrid_model::{AssistantMessage, ThinkingLevel, ToolResultPart, Usage, UserPart};

use crate::{
    build_session_context, CustomDelivery, Entry, EntryPayload, LogStore, SessionContext,
    SessionError,
};

/// First record of every session file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHeader {
    #[serde(rename = "type")]
    pub record_type: String,
    pub version: u32,
    pub id: String,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl SessionHeader {
    fn new(cwd: &Path) -> Self {
        Self {
            record_type: "session".into(),
            version: 1,
            id: uuid::Uuid::new_v4().to_string(),
            cwd: cwd.to_path_buf(),
            created_at: Utc::now(),
        }
    }
}

/// One row of a resume picker.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub title: Option<String>,
    pub entry_count: usize,
}

/// Owns the log store, the current leaf, and the session identity.
///
/// All mutations of the canonical history go through this type; the turn
/// engine only ever holds a rebuilt copy of the LLM-visible subset.
pub struct SessionManager {
    store: LogStore,
    header: SessionHeader,
    file: Option<PathBuf>,
}

impl SessionManager {
    /// Unpersisted session (tests, sub-agents).
    pub fn in_memory(cwd: &Path) -> Self {
        Self {
            store: LogStore::in_memory(),
            header: SessionHeader::new(cwd),
            file: None,
        }
    }

    /// Create a fresh persisted session under `sessions_dir`.
    pub fn create(sessions_dir: &Path, cwd: &Path) -> Result<Self, SessionError> {
        let header = SessionHeader::new(cwd);
        let path = sessions_dir.join(format!("{}.jsonl", header.id));
        let store = LogStore::create(&path, serde_json::to_value(&header)?)?;
        debug!(session = %header.id, path = %path.display(), "created session");
        Ok(Self {
            store,
            header,
            file: Some(path),
        })
    }

    /// Resume a persisted session from its file.
    pub fn open(path: &Path) -> Result<Self, SessionError> {
        let (store, header) = LogStore::load(path)?;
        let header = match header {
            Some(value) => serde_json::from_value(value)?,
            None => SessionHeader::new(Path::new(".")),
        };
        Ok(Self {
            store,
            header,
            file: Some(path.to_path_buf()),
        })
    }

    /// Sessions directory for a working directory, rooted at `data_dir`.
    /// The cwd is flattened into a single path component.
    pub fn sessions_dir_for(data_dir: &Path, cwd: &Path) -> PathBuf {
        let slug: String = cwd
            .to_string_lossy()
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == ':' { '-' } else { c })
            .collect();
        let slug = slug.trim_matches('-').to_string();
        data_dir.join("sessions").join(if slug.is_empty() {
            "root".to_string()
        } else {
            slug
        })
    }

    /// Enumerate persisted sessions under `sessions_dir`, newest first.
    pub fn list_sessions(sessions_dir: &Path) -> Vec<SessionInfo> {
        let mut infos = Vec::new();
        let Ok(read) = std::fs::read_dir(sessions_dir) else {
            return infos;
        };
        for dent in read.flatten() {
            let path = dent.path();
            if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
                continue;
            }
            if let Ok(manager) = Self::open(&path) {
                let ctx = manager.build_context();
                infos.push(SessionInfo {
                    id: manager.header.id.clone(),
                    path,
                    created_at: manager.header.created_at,
                    title: ctx.title,
                    entry_count: manager.store.entries().len(),
                });
            }
        }
        infos.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        infos
    }

    // ── Identity ──────────────────────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.header.id
    }

    pub fn cwd(&self) -> &Path {
        &self.header.cwd
    }

    pub fn file(&self) -> Option<&Path> {
        self.file.as_deref()
    }

    pub fn title(&self) -> Option<String> {
        self.build_context().title
    }

    // ── Log access ────────────────────────────────────────────────────────────

    pub fn leaf_id(&self) -> Option<&str> {
        self.store.leaf_id()
    }

    pub fn get_entry(&self, id: &str) -> Option<&Entry> {
        self.store.get_entry(id)
    }

    pub fn get_branch(&self) -> Vec<&Entry> {
        self.store.get_branch()
    }

    pub fn entries(&self) -> &[Entry] {
        self.store.entries()
    }

    pub fn children_of(&self, parent_id: Option<&str>) -> Vec<&Entry> {
        self.store.children_of(parent_id)
    }

    /// LLM-facing projection of the current branch.
    pub fn build_context(&self) -> SessionContext {
        build_session_context(&self.store.get_branch())
    }

    pub async fn flush(&self) -> Result<(), SessionError> {
        self.store.flush().await
    }

    // ── Appends ───────────────────────────────────────────────────────────────

    pub fn append_user(&mut self, content: Vec<UserPart>) -> String {
        self.store.append(EntryPayload::UserMessage { content })
    }

    pub fn append_assistant(&mut self, message: AssistantMessage) -> String {
        self.store
            .append(EntryPayload::AssistantMessage { message })
    }

    pub fn append_tool_result(
        &mut self,
        tool_call_id: impl Into<String>,
        parts: Vec<ToolResultPart>,
        is_error: bool,
        details: Option<Value>,
        usage: Option<Usage>,
    ) -> String {
        self.store.append(EntryPayload::ToolResult {
            tool_call_id: tool_call_id.into(),
            parts,
            is_error,
            details,
            usage,
        })
    }

    pub fn append_file_mention(
        &mut self,
        path: impl Into<String>,
        content: impl Into<String>,
    ) -> String {
        self.store.append(EntryPayload::FileMention {
            path: path.into(),
            content: content.into(),
        })
    }

    pub fn append_bash_execution(
        &mut self,
        command: impl Into<String>,
        output: impl Into<String>,
        exit_code: Option<i32>,
        excluded_from_context: bool,
    ) -> String {
        self.store.append(EntryPayload::BashExecution {
            command: command.into(),
            output: output.into(),
            exit_code,
            excluded_from_context,
        })
    }

    pub fn append_custom_message_entry(
        &mut self,
        custom_type: impl Into<String>,
        content: impl Into<String>,
        deliver_as: CustomDelivery,
        details: Option<Value>,
    ) -> String {
        self.store.append(EntryPayload::CustomMessage {
            custom_type: custom_type.into(),
            content: content.into(),
            deliver_as,
            details,
        })
    }

    pub fn append_compaction(
        &mut self,
        summary: impl Into<String>,
        first_kept_entry_id: Option<String>,
        tokens_before: u64,
        details: Option<Value>,
        from_extension: bool,
    ) -> String {
        self.store.append(EntryPayload::Compaction {
            summary: summary.into(),
            first_kept_entry_id,
            tokens_before,
            details,
            from_extension,
        })
    }

    pub fn append_model_change(
        &mut self,
        provider: impl Into<String>,
        model_id: impl Into<String>,
    ) -> String {
        self.store.append(EntryPayload::ModelChange {
            provider: provider.into(),
            model_id: model_id.into(),
        })
    }

    pub fn append_thinking_level_change(&mut self, level: ThinkingLevel) -> String {
        self.store
            .append(EntryPayload::ThinkingLevelChange { level })
    }

    // ── Branching / navigation ────────────────────────────────────────────────

    /// Rewind the leaf to the parent of `entry_id`, so the next append
    /// becomes a sibling of `entry_id` (redo-from-here semantics).
    pub fn branch_from_entry(&mut self, entry_id: &str) -> Result<(), SessionError> {
        let parent = self
            .store
            .get_entry(entry_id)
            .ok_or_else(|| SessionError::UnknownEntry(entry_id.to_string()))?
            .parent_id
            .clone();
        self.store.branch(parent.as_deref())
    }

    /// Set the leaf to an arbitrary existing entry (tree navigation).
    pub fn branch_to(&mut self, leaf_id: Option<&str>) -> Result<(), SessionError> {
        self.store.branch(leaf_id)
    }

    /// Navigate to `target_leaf_id` and record what the abandoned branch
    /// did.  Returns the id of the appended `BranchSummary`.
    pub fn branch_with_summary(
        &mut self,
        target_leaf_id: &str,
        summary: impl Into<String>,
        details: Option<Value>,
        from_extension: bool,
    ) -> Result<String, SessionError> {
        let abandoned = self
            .store
            .leaf_id()
            .map(str::to_string)
            .unwrap_or_default();
        self.store.branch(Some(target_leaf_id))?;
        Ok(self.store.append(EntryPayload::BranchSummary {
            summary: summary.into(),
            abandoned_leaf_id: abandoned,
            details,
            from_extension,
        }))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use sigrid_model::{ContentBlock, StopReason};

    use super::*;

    fn text(t: &str) -> Vec<UserPart> {
        vec![UserPart::Text { text: t.into() }]
    }

    fn assistant(t: &str) -> AssistantMessage {
        AssistantMessage {
            blocks: vec![ContentBlock::Text { text: t.into() }],
            stop_reason: StopReason::EndTurn,
            error_message: None,
            usage: Usage::default(),
        }
    }

    // ── Branch semantics ──────────────────────────────────────────────────────

    #[test]
    fn branch_from_entry_rewinds_to_its_parent() {
        let mut m = SessionManager::in_memory(Path::new("/tmp"));
        let u1 = m.append_user(text("u1"));
        let _a1 = m.append_assistant(assistant("a1"));
        let u2 = m.append_user(text("u2"));
        let a2 = m.append_assistant(assistant("a2"));

        // Redo from u2: leaf moves to a1 (u2's parent).
        m.branch_from_entry(&u2).unwrap();
        let u3 = m.append_user(text("alternate"));

        let ids: Vec<_> = m.get_branch().iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids.last().unwrap(), &u3);
        assert!(!ids.contains(&u2), "old child not on the new branch");
        assert!(ids.contains(&u1));
        // Old chain still reachable.
        assert!(m.get_entry(&a2).is_some());
        m.branch_to(Some(&a2)).unwrap();
        let ids: Vec<_> = m.get_branch().iter().map(|e| e.id.clone()).collect();
        assert!(ids.contains(&u2));
    }

    #[test]
    fn branch_with_summary_lands_at_target_and_records_abandoned_leaf() {
        let mut m = SessionManager::in_memory(Path::new("/tmp"));
        let u1 = m.append_user(text("u1"));
        let a1 = m.append_assistant(assistant("a1"));
        let _u2 = m.append_user(text("dead end"));
        let abandoned = m.leaf_id().unwrap().to_string();

        let sid = m
            .branch_with_summary(&a1, "explored a dead end", None, false)
            .unwrap();
        assert_eq!(m.leaf_id(), Some(sid.as_str()));
        match &m.get_entry(&sid).unwrap().payload {
            EntryPayload::BranchSummary {
                summary,
                abandoned_leaf_id,
                ..
            } => {
                assert_eq!(summary, "explored a dead end");
                assert_eq!(abandoned_leaf_id, &abandoned);
            }
            other => panic!("unexpected {other:?}"),
        }
        let ids: Vec<_> = m.get_branch().iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, vec![u1, a1, sid]);
    }

    #[test]
    fn branch_summary_never_enters_llm_context() {
        let mut m = SessionManager::in_memory(Path::new("/tmp"));
        let u1 = m.append_user(text("u1"));
        m.branch_with_summary(&u1, "s", None, false).unwrap();
        let ctx = m.build_context();
        assert_eq!(ctx.messages.len(), 1);
    }

    // ── Persistence round-trip ────────────────────────────────────────────────

    #[tokio::test]
    async fn create_append_flush_reopen_yields_same_branch() {
        let dir = tempfile::tempdir().unwrap();
        let (id, path, entry_id) = {
            let mut m = SessionManager::create(dir.path(), Path::new("/tmp/proj")).unwrap();
            let e = m.append_user(text("persist me"));
            m.flush().await.unwrap();
            (m.id().to_string(), m.file().unwrap().to_path_buf(), e)
        };
        let m = SessionManager::open(&path).unwrap();
        assert_eq!(m.id(), id);
        let branch: Vec<_> = m.get_branch().iter().map(|e| e.id.clone()).collect();
        assert_eq!(branch, vec![entry_id]);
        assert_eq!(m.title().as_deref(), Some("persist me"));
    }

    #[tokio::test]
    async fn list_sessions_returns_created_sessions_with_titles() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut m = SessionManager::create(dir.path(), Path::new("/x")).unwrap();
            m.append_user(text("first session"));
            m.flush().await.unwrap();
        }
        {
            let mut m = SessionManager::create(dir.path(), Path::new("/x")).unwrap();
            m.append_user(text("second session"));
            m.flush().await.unwrap();
        }
        let infos = SessionManager::list_sessions(dir.path());
        assert_eq!(infos.len(), 2);
        assert!(infos.iter().any(|i| i.title.as_deref() == Some("first session")));
    }

    #[test]
    fn sessions_dir_flattens_cwd() {
        let dir = SessionManager::sessions_dir_for(Path::new("/data"), Path::new("/home/u/proj"));
        assert_eq!(dir, PathBuf::from("/data/sessions/home-u-proj"));
    }

    #[test]
    fn unknown_branch_target_is_an_error() {
        let mut m = SessionManager::in_memory(Path::new("/tmp"));
        assert!(m.branch_from_entry("nope").is_err());
        assert!(m.branch_to(Some("nope")).is_err());
    }
}
