// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{ExecError, Sanitizer};

/// Default in-memory tail retained for the caller.
pub const DEFAULT_MAX_BYTES: usize = 200_000;

/// Output retention limits for one execution.
#[derive(Debug, Clone, Copy)]
pub struct ExecLimits {
    /// Bytes of sanitized output kept in memory (the tail).
    pub max_output_bytes: usize,
    /// Total sanitized bytes beyond which a spill file is created.  Clamped
    /// to `max_output_bytes` so the retained prefix is still in memory at
    /// creation time — the spill must receive every sanitized byte.
    pub spill_threshold_bytes: usize,
}

impl Default for ExecLimits {
    fn default() -> Self {
        Self {
            max_output_bytes: DEFAULT_MAX_BYTES,
            spill_threshold_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

/// One bash invocation.
#[derive(Debug, Clone)]
pub struct ExecRequest {
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub limits: ExecLimits,
    /// Directory for spill files; `None` uses the system temp dir.
    pub spill_dir: Option<PathBuf>,
}

impl ExecRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            cwd: None,
            timeout: None,
            limits: ExecLimits::default(),
            spill_dir: None,
        }
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: Option<i32>,
    /// True when the process was killed by abort or timeout.
    pub cancelled: bool,
    /// Sanitized output; only the tail when `truncated` is set.
    pub output: String,
    pub truncated: bool,
    /// Complete sanitized output on disk, present only when the total
    /// exceeded the spill threshold.
    pub full_output_path: Option<PathBuf>,
}

/// Run a shell command with streaming capture, spill-to-disk, timeout and
/// cancellation.  Cancellation and timeout kill the whole process tree.
pub async fn run_bash(req: &ExecRequest, cancel: CancellationToken) -> Result<ExecResult, ExecError> {
    let mut cmd = Command::new("bash");
    cmd.arg("-c").arg(&req.command);
    if let Some(cwd) = &req.cwd {
        cmd.current_dir(cwd);
    }
    debug!(command = %req.command, "spawning bash");
    run_command(cmd, req, cancel).await
}

/// Shared pipeline for bash and ssh commands.
pub(crate) async fn run_command(
    mut cmd: Command,
    req: &ExecRequest,
    cancel: CancellationToken,
) -> Result<ExecResult, ExecError> {
    // Detach from any controlling terminal: stdin on /dev/null defeats
    // isatty probes, and setsid() puts the child in its own process group
    // so a kill of -pid reaps the whole tree.
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(ExecError::Spawn)?;
    let pid = child.id();

    let sink = Arc::new(Mutex::new(OutputSink::new(
        req.limits,
        req.spill_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir),
    )));

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let mut readers = Vec::new();
    for stream in [stdout.map(ReadHalf::Out), stderr.map(ReadHalf::Err)]
        .into_iter()
        .flatten()
    {
        let sink = Arc::clone(&sink);
        readers.push(tokio::spawn(read_into_sink(stream, sink)));
    }

    let deadline = async {
        match req.timeout {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    let mut cancelled = false;
    let mut timed_out = false;
    let exit_code = tokio::select! {
        status = child.wait() => status?.code(),
        _ = cancel.cancelled() => {
            cancelled = true;
            kill_tree(&mut child, pid).await;
            None
        }
        _ = deadline => {
            cancelled = true;
            timed_out = true;
            kill_tree(&mut child, pid).await;
            None
        }
    };

    for reader in readers {
        let _ = reader.await;
    }

    let mut sink = Arc::try_unwrap(sink)
        .map_err(|_| ())
        .expect("readers joined")
        .into_inner()
        .expect("sink lock");
    if timed_out {
        let secs = req.timeout.map(|d| d.as_secs()).unwrap_or_default();
        let note = format!("\n[command timed out after {secs}s and was killed]");
        sink.push(note.as_bytes());
    }
    Ok(sink.finish(exit_code, cancelled))
}

enum ReadHalf {
    Out(tokio::process::ChildStdout),
    Err(tokio::process::ChildStderr),
}

async fn read_into_sink(stream: ReadHalf, sink: Arc<Mutex<OutputSink>>) {
    let mut sanitizer = Sanitizer::new();
    let mut buf = [0u8; 8192];
    macro_rules! pump {
        ($reader:expr) => {
            loop {
                match $reader.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        let clean = sanitizer.feed(&buf[..n]);
                        if !clean.is_empty() {
                            sink.lock().unwrap().push(&clean);
                        }
                    }
                }
            }
        };
    }
    match stream {
        ReadHalf::Out(mut r) => pump!(r),
        ReadHalf::Err(mut r) => pump!(r),
    }
    let tail = sanitizer.finish();
    if !tail.is_empty() {
        sink.lock().unwrap().push(&tail);
    }
}

async fn kill_tree(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // Negative pid addresses the process group created by setsid().
        unsafe {
            libc::kill(-(pid as i32), libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
    if let Err(e) = child.kill().await {
        warn!(error = %e, "kill after group signal failed");
    }
}

/// Bounded in-memory tail plus a lazily created spill file.
struct OutputSink {
    limits: ExecLimits,
    spill_dir: PathBuf,
    ring: Vec<u8>,
    /// Bytes dropped from the front of `ring`.
    dropped: usize,
    total: usize,
    spill: Option<(PathBuf, std::fs::File)>,
}

impl OutputSink {
    fn new(mut limits: ExecLimits, spill_dir: PathBuf) -> Self {
        limits.spill_threshold_bytes = limits.spill_threshold_bytes.min(limits.max_output_bytes);
        Self {
            limits,
            spill_dir,
            ring: Vec::new(),
            dropped: 0,
            total: 0,
            spill: None,
        }
    }

    fn push(&mut self, bytes: &[u8]) {
        if self.spill.is_none() && self.total + bytes.len() > self.limits.spill_threshold_bytes {
            // The ring still holds everything so far (threshold ≤ cap), so
            // the spill starts complete from byte zero.
            match self.create_spill() {
                Ok(()) => {
                    let ring = self.ring.clone();
                    self.write_spill(&ring);
                }
                Err(e) => warn!(error = %e, "cannot create spill file"),
            }
        }
        if self.spill.is_some() {
            self.write_spill(bytes);
        }

        self.ring.extend_from_slice(bytes);
        if self.ring.len() > self.limits.max_output_bytes {
            let excess = self.ring.len() - self.limits.max_output_bytes;
            self.ring.drain(..excess);
            self.dropped += excess;
        }
        self.total += bytes.len();
    }

    fn create_spill(&mut self) -> std::io::Result<()> {
        use std::sync::atomic::{AtomicU64, Ordering};
        static SPILL_SEQ: AtomicU64 = AtomicU64::new(0);
        std::fs::create_dir_all(&self.spill_dir)?;
        let seq = SPILL_SEQ.fetch_add(1, Ordering::Relaxed);
        let path = self.spill_dir.join(format!(
            "sigrid-exec-{}-{}.log",
            std::process::id(),
            seq
        ));
        let file = std::fs::File::create(&path)?;
        self.spill = Some((path, file));
        Ok(())
    }

    fn write_spill(&mut self, bytes: &[u8]) {
        if let Some((_, file)) = &mut self.spill {
            if let Err(e) = file.write_all(bytes) {
                warn!(error = %e, "spill write failed");
            }
        }
    }

    fn finish(mut self, exit_code: Option<i32>, cancelled: bool) -> ExecResult {
        if let Some((_, file)) = &mut self.spill {
            let _ = file.flush();
        }
        ExecResult {
            exit_code,
            cancelled,
            output: String::from_utf8_lossy(&self.ring).into_owned(),
            truncated: self.dropped > 0,
            full_output_path: self.spill.map(|(path, _)| path),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn req(command: &str) -> ExecRequest {
        ExecRequest::new(command)
    }

    // ── Basic capture ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn captures_stdout() {
        let out = run_bash(&req("echo hello"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert!(!out.cancelled);
        assert_eq!(out.output.trim(), "hello");
    }

    #[tokio::test]
    async fn captures_stderr_too() {
        let out = run_bash(&req("echo out && echo err >&2"), CancellationToken::new())
            .await
            .unwrap();
        assert!(out.output.contains("out"));
        assert!(out.output.contains("err"));
    }

    #[tokio::test]
    async fn nonzero_exit_code_is_reported() {
        let out = run_bash(&req("exit 3"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(3));
    }

    #[tokio::test]
    async fn cwd_is_honored() {
        let mut r = req("pwd");
        r.cwd = Some(PathBuf::from("/tmp"));
        let out = run_bash(&r, CancellationToken::new()).await.unwrap();
        assert!(out.output.contains("/tmp"));
    }

    // ── Boundary: zero output ─────────────────────────────────────────────────

    #[tokio::test]
    async fn zero_output_command() {
        let out = run_bash(&req("true"), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.output, "");
        assert!(!out.truncated);
        assert!(out.full_output_path.is_none());
    }

    // ── Sanitizing ────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn ansi_escapes_are_stripped_from_output() {
        let out = run_bash(
            &req(r"printf '\033[31mred\033[0m\n'"),
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(out.output.trim(), "red");
    }

    // ── Spill & truncation ────────────────────────────────────────────────────

    #[tokio::test]
    async fn large_output_spills_and_truncates_tail() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = req("for i in $(seq 1 2000); do echo line$i; done");
        r.limits = ExecLimits {
            max_output_bytes: 1000,
            spill_threshold_bytes: 1000,
        };
        r.spill_dir = Some(dir.path().to_path_buf());
        let out = run_bash(&r, CancellationToken::new()).await.unwrap();

        assert!(out.truncated, "tail must be marked truncated");
        assert!(out.output.len() <= 1000);
        assert!(out.output.contains("line2000"), "tail keeps the end");
        assert!(!out.output.contains("line1\n"), "head fell out of the ring");

        let spill = out.full_output_path.expect("spill file");
        let full = std::fs::read_to_string(spill).unwrap();
        assert!(full.starts_with("line1\n"), "spill has every byte");
        assert!(full.contains("line2000"));
    }

    #[tokio::test]
    async fn small_output_never_creates_spill() {
        let dir = tempfile::tempdir().unwrap();
        let mut r = req("echo tiny");
        r.spill_dir = Some(dir.path().to_path_buf());
        let out = run_bash(&r, CancellationToken::new()).await.unwrap();
        assert!(out.full_output_path.is_none());
        assert!(!out.truncated);
    }

    // ── Cancellation & timeout ────────────────────────────────────────────────

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            c.cancel();
        });
        let start = std::time::Instant::now();
        let out = run_bash(&req("sleep 30"), cancel).await.unwrap();
        assert!(out.cancelled);
        assert!(out.exit_code.is_none());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn timeout_annotates_output_and_sets_cancelled() {
        let mut r = req("echo started; sleep 30");
        r.timeout = Some(Duration::from_millis(300));
        let out = run_bash(&r, CancellationToken::new()).await.unwrap();
        assert!(out.cancelled);
        assert!(out.output.contains("started"));
        assert!(out.output.contains("timed out"), "{}", out.output);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_kills_the_whole_tree() {
        // The child spawns a grandchild; killing the group must take both.
        let cancel = CancellationToken::new();
        let c = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            c.cancel();
        });
        let out = run_bash(
            &req("bash -c 'sleep 30' & echo spawned; wait"),
            cancel,
        )
        .await
        .unwrap();
        assert!(out.cancelled);
        assert!(out.output.contains("spawned"));
    }

    // ── Limits clamping ───────────────────────────────────────────────────────

    #[test]
    fn spill_threshold_is_clamped_to_memory_cap() {
        let sink = OutputSink::new(
            ExecLimits {
                max_output_bytes: 100,
                spill_threshold_bytes: 5000,
            },
            std::env::temp_dir(),
        );
        assert_eq!(sink.limits.spill_threshold_bytes, 100);
    }
}
