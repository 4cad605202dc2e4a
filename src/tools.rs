//! External binaries: resolution on PATH, version probing and bounded runs

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

/// How much of a failing tool's stderr is kept for error messages
const STDERR_TAIL_BYTES: usize = 2000;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("{tool} not found (looked for '{program}')")]
    NotFound { tool: &'static str, program: String },
    #[error("failed to run {tool}: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("{tool} exited with {status}: {stderr}")]
    Failed {
        tool: &'static str,
        status: String,
        stderr: String,
    },
    #[error("{tool} timed out after {}s", .timeout.as_secs())]
    Timeout { tool: &'static str, timeout: Duration },
}

/// A resolved external binary
#[derive(Debug, Clone)]
pub struct Tool {
    /// Role name used in logs and errors ("extractor", "transcoder")
    pub name: &'static str,
    /// Absolute or relative path that will be executed
    pub path: PathBuf,
}

/// Captured output of a successful run
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

impl Tool {
    /// Resolve `program` using the process PATH
    pub fn resolve(name: &'static str, program: &str) -> Result<Self, ToolError> {
        let path_var = std::env::var_os("PATH");
        Self::resolve_in(name, program, path_var.as_deref())
    }

    /// Resolve `program` against an explicit PATH value
    ///
    /// Programs containing a path separator are used as-is.
    pub fn resolve_in(
        name: &'static str,
        program: &str,
        path_var: Option<&OsStr>,
    ) -> Result<Self, ToolError> {
        let not_found = || ToolError::NotFound {
            tool: name,
            program: program.to_string(),
        };

        if program.contains(std::path::MAIN_SEPARATOR) || program.contains('/') {
            let candidate = PathBuf::from(program);
            return if is_executable(&candidate) {
                Ok(Self { name, path: candidate })
            } else {
                Err(not_found())
            };
        }

        let path_var = path_var.ok_or_else(not_found)?;
        std::env::split_paths(path_var)
            .map(|dir| dir.join(program))
            .find(|candidate| is_executable(candidate))
            .map(|path| Self { name, path })
            .ok_or_else(not_found)
    }

    /// First line the tool prints for its version flag
    pub async fn version(&self, flag: &str) -> Option<String> {
        let output = Command::new(&self.path)
            .arg(flag)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(Duration::from_secs(10), output)
            .await
            .ok()?
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
    }

    /// Run the tool to completion within `timeout`
    ///
    /// The child is killed if the timeout fires.
    pub async fn run<I, S>(&self, args: I, timeout: Duration) -> Result<ToolOutput, ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.path);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        debug!(tool = self.name, command = ?cmd.as_std(), "Running external tool");

        let child = cmd.spawn().map_err(|source| ToolError::Spawn {
            tool: self.name,
            source,
        })?;

        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|source| ToolError::Spawn {
                tool: self.name,
                source,
            })?,
            Err(_) => {
                return Err(ToolError::Timeout {
                    tool: self.name,
                    timeout,
                })
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(ToolError::Failed {
                tool: self.name,
                status: output.status.to_string(),
                stderr: stderr_tail(&stderr),
            });
        }

        Ok(ToolOutput { stdout, stderr })
    }
}

fn stderr_tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - STDERR_TAIL_BYTES;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_missing_program() {
        let dir = tempfile::tempdir().unwrap();
        let err = Tool::resolve_in("extractor", "yt-dlp", Some(dir.path().as_os_str())).unwrap_err();
        assert!(matches!(err, ToolError::NotFound { tool: "extractor", .. }));

        assert!(Tool::resolve_in("extractor", "yt-dlp", None).is_err());
    }

    #[test]
    fn test_stderr_tail_keeps_end() {
        let long = format!("{}ERROR: the end", "x".repeat(5000));
        let tail = stderr_tail(&long);
        assert_eq!(tail.len(), STDERR_TAIL_BYTES);
        assert!(tail.ends_with("ERROR: the end"));
        assert_eq!(stderr_tail("  short  "), "short");
    }

    #[cfg(unix)]
    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn test_resolve_on_path_and_explicit() {
        let dir = tempfile::tempdir().unwrap();
        let script = write_script(dir.path(), "fake-tool", "exit 0");
        std::fs::write(dir.path().join("not-executable"), "data").unwrap();

        let tool = Tool::resolve_in("extractor", "fake-tool", Some(dir.path().as_os_str())).unwrap();
        assert_eq!(tool.path, script);

        let tool = Tool::resolve_in("extractor", script.to_str().unwrap(), None).unwrap();
        assert_eq!(tool.path, script);

        assert!(Tool::resolve_in("extractor", "not-executable", Some(dir.path().as_os_str())).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_output_and_failures() {
        let dir = tempfile::tempdir().unwrap();
        let ok = write_script(dir.path(), "ok", "echo \"hello $1\"; echo warn >&2");
        let bad = write_script(dir.path(), "bad", "echo 'ERROR: boom' >&2; exit 3");
        let slow = write_script(dir.path(), "slow", "sleep 5");

        let tool = Tool { name: "extractor", path: ok };
        let output = tool.run(["world"], Duration::from_secs(5)).await.unwrap();
        assert_eq!(output.stdout.trim(), "hello world");
        assert_eq!(output.stderr.trim(), "warn");

        let tool = Tool { name: "transcoder", path: bad };
        match tool.run(Vec::<String>::new(), Duration::from_secs(5)).await {
            Err(ToolError::Failed { tool, stderr, .. }) => {
                assert_eq!(tool, "transcoder");
                assert_eq!(stderr, "ERROR: boom");
            }
            other => panic!("expected failure, got {:?}", other),
        }

        let tool = Tool { name: "extractor", path: slow };
        let err = tool.run(Vec::<String>::new(), Duration::from_millis(100)).await.unwrap_err();
        assert!(matches!(err, ToolError::Timeout { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_version_first_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "ffmpeg", "echo 'ffmpeg version 6.1'; echo 'built with gcc'");
        let tool = Tool { name: "transcoder", path };
        assert_eq!(tool.version("-version").await.as_deref(), Some("ffmpeg version 6.1"));
    }
}
