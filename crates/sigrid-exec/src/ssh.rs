// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Command;
use tokio::sync::{Mutex, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bash::{run_command, ExecRequest, ExecResult};
use crate::ExecError;

/// Process-wide SSH multiplexing state.
///
/// One control socket per host, shared by every command to that host.
/// `ensure_connection` is idempotent and concurrent-safe: a per-host
/// `OnceCell` serializes the master connect so two racing callers never
/// spawn two masters.  `close_all`/`unmount_all` run at session disposal.
pub struct SshManager {
    base_dir: PathBuf,
    connections: Mutex<HashMap<String, Arc<OnceCell<()>>>>,
    mounts: std::sync::Mutex<Vec<(String, PathBuf)>>,
    mount_remote: bool,
}

impl SshManager {
    /// `base_dir` holds control sockets (`ssh/`) and mounts (`mounts/`).
    pub fn new(base_dir: PathBuf, mount_remote: bool) -> Self {
        Self {
            base_dir,
            connections: Mutex::new(HashMap::new()),
            mounts: std::sync::Mutex::new(Vec::new()),
            mount_remote,
        }
    }

    /// Control socket path for a host — deterministic, host-derived.
    pub fn socket_path(&self, host: &str) -> PathBuf {
        self.base_dir
            .join("ssh")
            .join(format!("{}.sock", sanitize_host(host)))
    }

    /// Mount point for a host's remote filesystem — deterministic, so a
    /// restarted session finds the same mount.
    pub fn mount_path(&self, host: &str) -> PathBuf {
        self.base_dir.join("mounts").join(sanitize_host(host))
    }

    /// Reject private keys readable by group or world.
    #[cfg(unix)]
    pub fn validate_key_permissions(path: &Path) -> Result<(), ExecError> {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(path)?.permissions().mode();
        if mode & 0o077 != 0 {
            return Err(ExecError::KeyPermissions(path.to_path_buf()));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn validate_key_permissions(_path: &Path) -> Result<(), ExecError> {
        Ok(())
    }

    /// Establish (or reuse) the master connection to `host`.
    ///
    /// Safe to call concurrently: the first caller connects, the rest await
    /// the same cell.  A failed connect clears the cell so the next call
    /// retries.
    pub async fn ensure_connection(
        &self,
        host: &str,
        identity: Option<&Path>,
    ) -> Result<(), ExecError> {
        if let Some(key) = identity {
            Self::validate_key_permissions(key)?;
        }
        let cell = {
            let mut map = self.connections.lock().await;
            map.entry(host.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let result = cell
            .get_or_try_init(|| self.master_connect(host, identity))
            .await
            .map(|_| ());
        if result.is_err() {
            // Drop the poisoned cell so the next ensure retries cleanly.
            self.connections.lock().await.remove(host);
        }
        result
    }

    async fn master_connect(&self, host: &str, identity: Option<&Path>) -> Result<(), ExecError> {
        let socket = self.socket_path(host);
        if let Some(parent) = socket.parent() {
            std::fs::create_dir_all(parent)?;
        }
        debug!(host, socket = %socket.display(), "opening ssh master connection");
        let mut cmd = Command::new("ssh");
        cmd.arg("-M")
            .arg("-N")
            .arg("-f")
            .arg("-o")
            .arg(format!("ControlPath={}", socket.display()))
            .arg("-o")
            .arg("ControlPersist=yes")
            .arg("-o")
            .arg("BatchMode=yes");
        if let Some(key) = identity {
            cmd.arg("-i").arg(key);
        }
        cmd.arg(host);
        let status = cmd.status().await.map_err(ExecError::Spawn)?;
        if !status.success() {
            return Err(ExecError::SshConnect {
                host: host.to_string(),
                detail: format!("ssh -M exited with {status}"),
            });
        }
        if self.mount_remote {
            self.try_mount(host).await;
        }
        Ok(())
    }

    /// Best-effort sshfs mount; missing sshfs is not an error.
    async fn try_mount(&self, host: &str) {
        let mount = self.mount_path(host);
        if std::fs::create_dir_all(&mount).is_err() {
            return;
        }
        let socket = self.socket_path(host);
        let status = Command::new("sshfs")
            .arg(format!("{host}:/"))
            .arg(&mount)
            .arg("-o")
            .arg(format!("ssh_command=ssh -S {}", socket.display()))
            .status()
            .await;
        match status {
            Ok(s) if s.success() => {
                self.mounts
                    .lock()
                    .unwrap()
                    .push((host.to_string(), mount));
            }
            Ok(s) => warn!(host, status = %s, "sshfs mount failed"),
            Err(_) => debug!(host, "sshfs unavailable; skipping mount"),
        }
    }

    /// Run a command on `host` through the multiplexed channel, with the
    /// same capture/spill/cancel pipeline as local bash.
    pub async fn run(
        &self,
        host: &str,
        req: &ExecRequest,
        cancel: CancellationToken,
    ) -> Result<ExecResult, ExecError> {
        self.ensure_connection(host, None).await?;
        let socket = self.socket_path(host);
        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&socket)
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(host)
            .arg("--")
            .arg(&req.command);
        run_command(cmd, req, cancel).await
    }

    /// Unmount every sshfs mount created by this manager.
    pub async fn unmount_all(&self) {
        let mounts: Vec<(String, PathBuf)> = self.mounts.lock().unwrap().drain(..).collect();
        for (host, mount) in mounts {
            let ok = Command::new("fusermount")
                .arg("-u")
                .arg(&mount)
                .status()
                .await
                .map(|s| s.success())
                .unwrap_or(false);
            if !ok {
                let _ = Command::new("umount").arg(&mount).status().await;
            }
            debug!(host, mount = %mount.display(), "unmounted remote filesystem");
        }
    }

    /// Close every master connection.
    pub async fn close_all_connections(&self) {
        let hosts: Vec<String> = {
            let mut map = self.connections.lock().await;
            map.drain().map(|(host, _)| host).collect()
        };
        for host in hosts {
            let socket = self.socket_path(&host);
            let _ = Command::new("ssh")
                .arg("-S")
                .arg(&socket)
                .arg("-O")
                .arg("exit")
                .arg(&host)
                .status()
                .await;
            debug!(host, "closed ssh master connection");
        }
    }
}

fn sanitize_host(host: &str) -> String {
    host.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
