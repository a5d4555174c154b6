//! Starting tool-server processes.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, BufReader};
use tokio::process::{Child, Command};
use tracing::debug;

use crate::error::ConnectError;
use crate::transport::{BoxReader, BoxWriter};

/// How to start a tool server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    pub command: String,
    pub args: Vec<String>,
    /// Variables set on top of the inherited environment.
    pub env: HashMap<String, String>,
}

/// An open byte channel to a tool server, plus the process behind it if any.
pub struct Transport {
    pub(crate) reader: BoxReader,
    pub(crate) writer: BoxWriter,
    pub(crate) child: Option<Child>,
}

impl Transport {
    /// Wrap an arbitrary pair of streams (no backing process).
    pub fn from_streams(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            child: None,
        }
    }
}

/// Produces a fresh transport each time a connection is (re)established.
pub trait Connector: Send + Sync {
    fn open(&self, server: &str) -> Result<Transport, ConnectError>;
}

/// Launches the server as a child process speaking over stdio.
#[derive(Debug, Clone)]
pub struct ProcessConnector {
    spec: LaunchSpec,
}

impl ProcessConnector {
    pub fn new(spec: LaunchSpec) -> Self {
        Self { spec }
    }
}

impl Connector for ProcessConnector {
    fn open(&self, server: &str) -> Result<Transport, ConnectError> {
        let search_path = self
            .spec
            .env
            .get("PATH")
            .map(OsString::from)
            .or_else(|| std::env::var_os("PATH"));
        let program = resolve_executable(&self.spec.command, search_path.as_deref())?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.spec.args)
            .envs(&self.spec.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ConnectError::LaunchFailed(format!("failed to start {}: {e}", program.display()))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConnectError::LaunchFailed("failed to capture stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ConnectError::LaunchFailed("failed to capture stdout".into()))?;

        if let Some(stderr) = child.stderr.take() {
            let server = server.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(server = %server, "stderr: {line}");
                }
            });
        }

        debug!(server, program = %program.display(), "tool server launched");
        Ok(Transport {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            child: Some(child),
        })
    }
}

/// Find the executable for `command`.
///
/// Commands containing a path separator are taken as paths; bare names are
/// searched for along `search_path`.
pub fn resolve_executable(
    command: &str,
    search_path: Option<&std::ffi::OsStr>,
) -> Result<PathBuf, ConnectError> {
    if command.trim().is_empty() {
        return Err(ConnectError::LaunchFailed("no command configured".into()));
    }

    let as_path = Path::new(command);
    if as_path.components().count() > 1 || as_path.is_absolute() {
        return if is_executable(as_path) {
            Ok(as_path.to_path_buf())
        } else {
            Err(ConnectError::LaunchFailed(format!(
                "executable not found: {command}"
            )))
        };
    }

    if let Some(paths) = search_path {
        for dir in std::env::split_paths(paths) {
            for candidate in candidates(&dir, command) {
                if is_executable(&candidate) {
                    return Ok(candidate);
                }
            }
        }
    }

    Err(ConnectError::LaunchFailed(format!(
        "{command} not found on PATH"
    )))
}

#[cfg(windows)]
fn candidates(dir: &Path, command: &str) -> Vec<PathBuf> {
    let mut out = vec![dir.join(command)];
    for ext in ["exe", "cmd", "bat", "com"] {
        out.push(dir.join(format!("{command}.{ext}")));
    }
    out
}

#[cfg(not(windows))]
fn candidates(dir: &Path, command: &str) -> Vec<PathBuf> {
    vec![dir.join(command)]
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}
