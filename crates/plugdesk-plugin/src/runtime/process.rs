// SPDX-FileCopyrightText: 2026 Plugdesk Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Out-of-process guest runtime.
//!
//! The plugin binary is spawned with piped stdio and exchanges one JSON
//! object per line:
//!
//! ```text
//! host  -> {"id": 7, "fn": "widget", "args": {...}}
//! guest -> {"id": 7, "result": {...}}   or   {"id": 7, "error": "message"}
//! ```
//!
//! Registration uses the function name `gk_register`, shutdown `gk_shutdown`.
//! Responses with a stale id (left over from a cancelled call) are skipped.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use plugdesk_core::{GuestInstance, PlugdeskError, PluginSource, RuntimeKind};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

const REGISTER_FN: &str = "gk_register";
const SHUTDOWN_FN: &str = "gk_shutdown";

/// Spawns process plugins.
#[derive(Debug, Clone)]
pub struct ProcessRuntime {
    /// How long a plugin gets to exit after the shutdown request.
    shutdown_grace: Duration,
}

impl Default for ProcessRuntime {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_secs(2),
        }
    }
}

impl ProcessRuntime {
    pub fn new(shutdown_grace: Duration) -> Self {
        Self { shutdown_grace }
    }

    /// Start the plugin executable with its bundle root as working directory.
    pub async fn spawn(&self, source: &PluginSource) -> Result<ProcessGuest, PlugdeskError> {
        let load_err = |message: String| PlugdeskError::Load {
            plugin: source.name.clone(),
            message,
        };

        let mut child = Command::new(&source.binary_path)
            .current_dir(&source.root)
            .env("PLUGDESK_PLUGIN_NAME", &source.name)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| load_err(format!("cannot start {}: {e}", source.binary_path.display())))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| load_err("child stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| load_err("child stdout unavailable".to_string()))?;

        if let Some(stderr) = child.stderr.take() {
            let plugin = source.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(plugin = %plugin, stderr = %line, "plugin process output");
                }
            });
        }

        debug!(plugin = %source.name, pid = ?child.id(), "plugin process started");
        Ok(ProcessGuest {
            name: source.name.clone(),
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
            next_id: 1,
            shutdown_grace: self.shutdown_grace,
        })
    }
}

#[derive(Serialize)]
struct Request<'a> {
    id: u64,
    #[serde(rename = "fn")]
    function: &'a str,
    args: &'a RawValue,
}

#[derive(Deserialize)]
struct Response {
    id: u64,
    #[serde(default)]
    result: Option<Box<RawValue>>,
    #[serde(default)]
    error: Option<String>,
}

/// A running plugin process.
pub struct ProcessGuest {
    name: String,
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
    next_id: u64,
    shutdown_grace: Duration,
}

impl ProcessGuest {
    fn failure(&self, message: impl Into<String>) -> PlugdeskError {
        PlugdeskError::Runtime {
            plugin: self.name.clone(),
            message: message.into(),
        }
    }

    async fn request(&mut self, function: &str, args: &[u8]) -> Result<Vec<u8>, PlugdeskError> {
        let text = std::str::from_utf8(args)
            .map_err(|e| PlugdeskError::Validation(format!("arguments are not UTF-8: {e}")))?;
        let raw: &RawValue = serde_json::from_str(text)
            .map_err(|e| PlugdeskError::Validation(format!("arguments are not JSON: {e}")))?;

        let id = self.next_id;
        self.next_id += 1;
        let mut line = serde_json::to_vec(&Request {
            id,
            function,
            args: raw,
        })
        .map_err(|e| PlugdeskError::Internal(e.to_string()))?;
        line.push(b'\n');

        self.stdin
            .write_all(&line)
            .await
            .map_err(|e| self.failure(format!("write to plugin failed: {e}")))?;
        self.stdin
            .flush()
            .await
            .map_err(|e| self.failure(format!("write to plugin failed: {e}")))?;

        loop {
            let next = self
                .stdout
                .next_line()
                .await
                .map_err(|e| self.failure(format!("read from plugin failed: {e}")))?;
            let Some(line) = next else {
                return Err(self.failure("plugin process exited"));
            };
            if line.trim().is_empty() {
                continue;
            }
            let response: Response = match serde_json::from_str(&line) {
                Ok(r) => r,
                Err(e) => {
                    warn!(plugin = %self.name, error = %e, "ignoring malformed line from plugin");
                    continue;
                }
            };
            if response.id != id {
                debug!(plugin = %self.name, expected = id, got = response.id, "skipping stale response");
                continue;
            }
            if let Some(error) = response.error {
                return Err(self.failure(error));
            }
            return Ok(response
                .result
                .map(|r| r.get().as_bytes().to_vec())
                .unwrap_or_default());
        }
    }
}

#[async_trait]
impl GuestInstance for ProcessGuest {
    fn runtime(&self) -> RuntimeKind {
        RuntimeKind::Process
    }

    async fn register(&mut self) -> Result<Vec<u8>, PlugdeskError> {
        self.request(REGISTER_FN, b"{}").await
    }

    async fn call(&mut self, function: &str, args: &[u8]) -> Result<Vec<u8>, PlugdeskError> {
        self.request(function, args).await
    }

    async fn shutdown(&mut self) -> Result<(), PlugdeskError> {
        let grace = self.shutdown_grace;
        let polite = tokio::time::timeout(grace, async {
            // The process may already be gone; only the exit matters.
            let _ = self.request(SHUTDOWN_FN, b"{}").await;
            self.child.wait().await
        })
        .await;

        match polite {
            Ok(Ok(status)) => {
                debug!(plugin = %self.name, %status, "plugin process exited");
                Ok(())
            }
            _ => {
                warn!(plugin = %self.name, "plugin process did not exit in time, killing");
                self.child.kill().await.map_err(PlugdeskError::Io)
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    /// Shell guest answering every request with a fixed manifest or an echo.
    const SCRIPT: &str = r#"#!/bin/sh
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed 's/.*"id":\([0-9]*\).*/\1/')
  case "$line" in
    *'"fn":"gk_register"'*) printf '{"id":%s,"result":{"name":"sh","version":"0.1.0"}}\n' "$id" ;;
    *'"fn":"gk_shutdown"'*) printf '{"id":%s,"result":{}}\n' "$id"; exit 0 ;;
    *'"fn":"fail"'*) printf '{"id":%s,"error":"boom"}\n' "$id" ;;
    *) printf '{"id":%s,"result":{"ok":true}}\n' "$id" ;;
  esac
done
"#;

    fn write_script(dir: &std::path::Path) -> PluginSource {
        let path = dir.join("guest.sh");
        std::fs::write(&path, SCRIPT).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        PluginSource {
            name: "sh".into(),
            runtime: RuntimeKind::Process,
            binary_path: path,
            root: dir.to_path_buf(),
        }
    }

    #[tokio::test]
    async fn speaks_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let mut guest = ProcessRuntime::default()
            .spawn(&write_script(dir.path()))
            .await
            .unwrap();

        let manifest = guest.register().await.unwrap();
        assert_eq!(manifest, br#"{"name":"sh","version":"0.1.0"}"#);
        assert_eq!(guest.call("anything", b"{}").await.unwrap(), br#"{"ok":true}"#);

        let err = guest.call("fail", b"{}").await.unwrap_err();
        assert!(err.to_string().contains("boom"));

        guest.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_non_json_args() {
        let dir = tempfile::tempdir().unwrap();
        let mut guest = ProcessRuntime::default()
            .spawn(&write_script(dir.path()))
            .await
            .unwrap();
        assert!(matches!(
            guest.call("x", b"not json").await,
            Err(PlugdeskError::Validation(_))
        ));
        guest.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn missing_binary_is_a_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = PluginSource {
            name: "ghost".into(),
            runtime: RuntimeKind::Process,
            binary_path: dir.path().join("nope"),
            root: dir.path().to_path_buf(),
        };
        let err = ProcessRuntime::default().spawn(&source).await.err().unwrap();
        assert!(matches!(err, PlugdeskError::Load { .. }));
    }
}
