//! Child process spawning and diagnostics.
//!
//! The bridge treats the child as a black box that reads command lines on
//! stdin and writes response lines on stdout. This module owns how such a
//! process is started: the spawner seam, per-platform executable
//! resolution, and the stderr drain that forwards child diagnostics to
//! the logging sink.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn child process: {0}")]
    Spawn(#[from] io::Error),
    #[error("spawn failed: {0}")]
    Other(String),
}

/// Extension point for different child spawn strategies.
///
/// Production uses [`ProgramSpawner`]; tests substitute spawners that run
/// shell one-liners standing in for the real executable.
pub trait ChildSpawner: Send + Sync {
    fn spawn(&self) -> Result<Child, SpawnError>;
}

/// Spawns a configured executable with all three stdio streams piped.
pub struct ProgramSpawner {
    program: PathBuf,
}

impl ProgramSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }
}

impl ChildSpawner for ProgramSpawner {
    fn spawn(&self) -> Result<Child, SpawnError> {
        let child = Command::new(&self.program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        Ok(child)
    }
}

/// Resolve the platform-specific filename of the child executable.
///
/// Deployment helper only; the bridge itself just needs a path to an
/// executable that speaks the line protocol.
pub fn resolve_program(dir: &Path, name: &str) -> PathBuf {
    if cfg!(windows) {
        dir.join(format!("{name}.exe"))
    } else {
        dir.join(name)
    }
}

/// Forward child stderr to the logging sink, line by line.
///
/// Diagnostics only: stderr never affects control flow and is never part
/// of a response.
pub(crate) async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                tracing::warn!(target: "bridgelet::child", "{}", line);
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(target: "bridgelet::child", error = %e, "error reading child stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_program_joins_dir_and_name() {
        let path = resolve_program(Path::new("/opt/app"), "worker");
        if cfg!(windows) {
            assert_eq!(path, Path::new("/opt/app").join("worker.exe"));
        } else {
            assert_eq!(path, Path::new("/opt/app/worker"));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn program_spawner_pipes_all_streams() {
        let spawner = ProgramSpawner::new("/bin/cat");
        let mut child = spawner.spawn().unwrap();

        assert!(child.stdin.is_some());
        assert!(child.stdout.is_some());
        assert!(child.stderr.is_some());

        child.kill().await.unwrap();
        child.wait().await.unwrap();
    }

    #[test]
    fn program_spawner_missing_executable_fails() {
        let spawner = ProgramSpawner::new("/nonexistent/bridgelet-test-binary");
        assert!(matches!(spawner.spawn(), Err(SpawnError::Spawn(_))));
    }
}
