// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::io::{BufRead, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::{Entry, EntryPayload, SessionError};

/// Control record written when the leaf pointer moves without an append
/// (branching / navigation), so a resumed session restores the same head.
const LEAF_RECORD_TYPE: &str = "leaf";

enum WriteCmd {
    Record(Value),
    Flush(oneshot::Sender<Result<(), String>>),
}

/// Append-only, branching session log.
///
/// Entries form a tree through `parent_id`; `leaf_id` names the current
/// head.  Appending sets the new entry's parent to the current leaf and
/// advances the leaf.  Existing entries are never mutated.
///
/// Persistence is a JSONL stream handled by a background writer; reads are
/// always served from memory.  Losing unflushed tail records can never
/// corrupt earlier ones.
pub struct LogStore {
    entries: Vec<Entry>,
    index: HashMap<String, usize>,
    leaf_id: Option<String>,
    writer: Option<mpsc::UnboundedSender<WriteCmd>>,
}

impl LogStore {
    /// Store with no persistence (tests, sub-agent scratch sessions).
    pub fn in_memory() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
            leaf_id: None,
            writer: None,
        }
    }

    /// Store persisting to `path`, created if absent.  `header` is written
    /// as the first record of a fresh file.
    pub fn create(path: &Path, header: Value) -> Result<Self, SessionError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let fresh = !path.exists();
        let mut store = Self::in_memory();
        store.writer = Some(spawn_writer(path.to_path_buf()));
        if fresh {
            store.persist(header);
        }
        Ok(store)
    }

    /// Load an existing JSONL log.  Returns the store plus the header
    /// record (first `"type": "session"` line), if present.
    ///
    /// Torn or unparseable lines are skipped with a warning — a crash mid
    /// append must not lose the whole session.
    pub fn load(path: &Path) -> Result<(Self, Option<Value>), SessionError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);

        let mut store = Self::in_memory();
        let mut header = None;
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let value: Value = match serde_json::from_str(&line) {
                Ok(v) => v,
                Err(e) => {
                    warn!(lineno, error = %e, "skipping unparseable session record");
                    continue;
                }
            };
            match value.get("type").and_then(Value::as_str) {
                Some("session") => header = Some(value),
                Some(LEAF_RECORD_TYPE) => {
                    store.leaf_id = value
                        .get("leaf_id")
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
                _ => match serde_json::from_value::<Entry>(value) {
                    Ok(entry) => {
                        store.leaf_id = Some(entry.id.clone());
                        store.index.insert(entry.id.clone(), store.entries.len());
                        store.entries.push(entry);
                    }
                    Err(e) => {
                        warn!(lineno, error = %e, "skipping malformed entry record");
                    }
                },
            }
        }
        debug!(
            entries = store.entries.len(),
            path = %path.display(),
            "loaded session log"
        );
        store.writer = Some(spawn_writer(path.to_path_buf()));
        Ok((store, header))
    }

    /// Append a new entry under the current leaf and advance the leaf.
    /// Returns the assigned entry id.
    pub fn append(&mut self, payload: EntryPayload) -> String {
        let mut entry = Entry::new(payload);
        entry.parent_id = self.leaf_id.clone();
        let id = entry.id.clone();
        if let Ok(record) = serde_json::to_value(&entry) {
            self.persist(record);
        }
        self.index.insert(id.clone(), self.entries.len());
        self.entries.push(entry);
        self.leaf_id = Some(id.clone());
        id
    }

    /// Move the leaf to `parent_id` without removing anything; subsequent
    /// appends become siblings of the old child chain.  `None` rewinds to
    /// pre-root.
    pub fn branch(&mut self, parent_id: Option<&str>) -> Result<(), SessionError> {
        if let Some(id) = parent_id {
            if !self.index.contains_key(id) {
                return Err(SessionError::UnknownEntry(id.to_string()));
            }
        }
        self.leaf_id = parent_id.map(str::to_string);
        self.persist(serde_json::json!({
            "type": LEAF_RECORD_TYPE,
            "leaf_id": self.leaf_id,
        }));
        Ok(())
    }

    /// `branch(None)` — kept as its own verb to match the public contract.
    pub fn reset_leaf(&mut self) {
        // Unwrap is fine: branch(None) cannot fail.
        self.branch(None).expect("reset_leaf");
    }

    pub fn leaf_id(&self) -> Option<&str> {
        self.leaf_id.as_deref()
    }

    pub fn get_entry(&self, id: &str) -> Option<&Entry> {
        self.index.get(id).map(|&i| &self.entries[i])
    }

    /// Ordered entries from root to the current leaf.
    pub fn get_branch(&self) -> Vec<&Entry> {
        let mut chain = Vec::new();
        let mut cursor = self.leaf_id.as_deref();
        while let Some(id) = cursor {
            match self.get_entry(id) {
                Some(entry) => {
                    chain.push(entry);
                    cursor = entry.parent_id.as_deref();
                }
                None => break,
            }
        }
        chain.reverse();
        chain
    }

    /// Children of `parent_id` (or roots for `None`), in append order.
    pub fn children_of(&self, parent_id: Option<&str>) -> Vec<&Entry> {
        self.entries
            .iter()
            .filter(|e| e.parent_id.as_deref() == parent_id)
            .collect()
    }

    /// All entries in append order.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Await durability of everything appended so far.
    pub async fn flush(&self) -> Result<(), SessionError> {
        let Some(writer) = &self.writer else {
            return Ok(());
        };
        let (tx, rx) = oneshot::channel();
        writer
            .send(WriteCmd::Flush(tx))
            .map_err(|_| SessionError::WriterGone)?;
        match rx.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::Other(e)),
            Err(_) => Err(SessionError::WriterGone),
        }
    }

    fn persist(&self, record: Value) {
        if let Some(writer) = &self.writer {
            // Failure means the writer task died; the error was already
            // logged there and will surface from the next flush().
            let _ = writer.send(WriteCmd::Record(record));
        }
    }
}

/// Background writer: serializes appends, flushes on demand.  Runs on the
/// blocking pool because it does small synchronous file writes.
fn spawn_writer(path: PathBuf) -> mpsc::UnboundedSender<WriteCmd> {
    let (tx, mut rx) = mpsc::unbounded_channel::<WriteCmd>();
    tokio::task::spawn_blocking(move || {
        let file = match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
        {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot open session log");
                // Drain so senders do not error; report failure on flush.
                while let Some(cmd) = rx.blocking_recv() {
                    if let WriteCmd::Flush(ack) = cmd {
                        let _ = ack.send(Err(format!("log file unavailable: {e}")));
                    }
                }
                return;
            }
        };
        let mut out = BufWriter::new(file);
        let mut write_error: Option<String> = None;
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                WriteCmd::Record(value) => {
                    let line = value.to_string();
                    if let Err(e) = out
                        .write_all(line.as_bytes())
                        .and_then(|_| out.write_all(b"\n"))
                    {
                        warn!(error = %e, "session log write failed");
                        write_error = Some(e.to_string());
                    }
                }
                WriteCmd::Flush(ack) => {
                    let result = match write_error.take() {
                        Some(e) => Err(e),
                        None => out
                            .flush()
                            .and_then(|_| out.get_ref().sync_all())
                            .map_err(|e| e.to_string()),
                    };
                    let _ = ack.send(result);
                }
            }
        }
        let _ = out.flush();
    });
    tx
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use sigrid_model::UserPart;

    use super::*;

    fn user(text: &str) -> EntryPayload {
        EntryPayload::UserMessage {
            content: vec![UserPart::Text { text: text.into() }],
        }
    }

    // ── Tree mechanics ────────────────────────────────────────────────────────

    #[test]
    fn append_advances_leaf_and_links_parent() {
        let mut store = LogStore::in_memory();
        let a = store.append(user("one"));
        let b = store.append(user("two"));
        assert_eq!(store.leaf_id(), Some(b.as_str()));
        assert_eq!(store.get_entry(&b).unwrap().parent_id.as_deref(), Some(a.as_str()));
        assert_eq!(store.get_entry(&a).unwrap().parent_id, None);
    }

    #[test]
    fn get_entry_returns_appended_entry() {
        let mut store = LogStore::in_memory();
        let id = store.append(user("x"));
        let entry = store.get_entry(&id).unwrap();
        assert_eq!(entry.id, id);
        let branch = store.get_branch();
        assert_eq!(branch.last().unwrap().id, id);
    }

    #[test]
    fn branch_reparents_without_removing_siblings() {
        let mut store = LogStore::in_memory();
        let a = store.append(user("a"));
        let b = store.append(user("b"));
        store.branch(Some(&a)).unwrap();
        let c = store.append(user("c"));

        let branch: Vec<_> = store.get_branch().iter().map(|e| e.id.clone()).collect();
        assert_eq!(branch, vec![a.clone(), c.clone()]);
        // Sibling chain is still reachable.
        assert!(store.get_entry(&b).is_some());
        store.branch(Some(&b)).unwrap();
        let other: Vec<_> = store.get_branch().iter().map(|e| e.id.clone()).collect();
        assert_eq!(other, vec![a.clone(), b]);
        // Children of `a` in append order.
        let kids: Vec<_> = store
            .children_of(Some(&a))
            .iter()
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(kids.len(), 2);
        assert_eq!(kids[1], c);
    }

    #[test]
    fn branch_to_unknown_entry_fails() {
        let mut store = LogStore::in_memory();
        assert!(matches!(
            store.branch(Some("missing")),
            Err(SessionError::UnknownEntry(_))
        ));
    }

    #[test]
    fn reset_leaf_rewinds_to_pre_root() {
        let mut store = LogStore::in_memory();
        store.append(user("a"));
        store.reset_leaf();
        assert_eq!(store.leaf_id(), None);
        assert!(store.get_branch().is_empty());
        let b = store.append(user("b"));
        assert_eq!(store.get_entry(&b).unwrap().parent_id, None);
        assert_eq!(store.children_of(None).len(), 2, "two roots now");
    }

    #[test]
    fn get_branch_twice_is_identical() {
        let mut store = LogStore::in_memory();
        store.append(user("a"));
        store.append(user("b"));
        let one: Vec<_> = store.get_branch().iter().map(|e| e.id.clone()).collect();
        let two: Vec<_> = store.get_branch().iter().map(|e| e.id.clone()).collect();
        assert_eq!(one, two);
    }

    // ── Persistence ───────────────────────────────────────────────────────────

    #[tokio::test]
    async fn create_flush_reload_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        let header = serde_json::json!({"type": "session", "id": "s1", "version": 1});

        let (a, b) = {
            let mut store = LogStore::create(&path, header).unwrap();
            let a = store.append(user("first"));
            let b = store.append(user("second"));
            store.flush().await.unwrap();
            (a, b)
        };

        let (loaded, header) = LogStore::load(&path).unwrap();
        assert_eq!(header.unwrap()["id"], "s1");
        assert_eq!(loaded.entries().len(), 2);
        assert_eq!(loaded.leaf_id(), Some(b.as_str()));
        assert_eq!(
            loaded.get_entry(&b).unwrap().parent_id.as_deref(),
            Some(a.as_str())
        );
    }

    #[tokio::test]
    async fn leaf_record_restores_branch_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        let a = {
            let mut store =
                LogStore::create(&path, serde_json::json!({"type": "session", "id": "s"}))
                    .unwrap();
            let a = store.append(user("a"));
            let _b = store.append(user("b"));
            store.branch(Some(&a)).unwrap();
            store.flush().await.unwrap();
            a
        };
        let (loaded, _) = LogStore::load(&path).unwrap();
        assert_eq!(loaded.leaf_id(), Some(a.as_str()), "leaf restored from control record");
    }

    #[tokio::test]
    async fn corrupt_tail_line_is_skipped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        {
            let mut store =
                LogStore::create(&path, serde_json::json!({"type": "session", "id": "s"}))
                    .unwrap();
            store.append(user("kept"));
            store.flush().await.unwrap();
        }
        // Simulate a crash mid-append.
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            write!(f, "{{\"id\":\"torn").unwrap();
        }
        let (loaded, _) = LogStore::load(&path).unwrap();
        assert_eq!(loaded.entries().len(), 1, "torn record skipped, earlier intact");
    }

    #[tokio::test]
    async fn in_memory_flush_is_a_no_op() {
        let store = LogStore::in_memory();
        store.flush().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_record_survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("s.jsonl");
        {
            use std::io::Write;
            let mut f = std::fs::File::create(&path).unwrap();
            writeln!(f, r#"{{"type":"session","id":"s"}}"#).unwrap();
            writeln!(
                f,
                r#"{{"id":"f1","parent_id":null,"timestamp":"2026-01-01T00:00:00Z","type":"from_the_future","x":1}}"#
            )
            .unwrap();
        }
        let (loaded, _) = LogStore::load(&path).unwrap();
        assert_eq!(loaded.entries().len(), 1);
        assert!(matches!(
            loaded.entries()[0].payload,
            EntryPayload::Unknown { .. }
        ));
        assert_eq!(loaded.leaf_id(), Some("f1"));
    }
}
