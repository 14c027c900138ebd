//! Agent subprocess invocation: launches a configured command with the
//! step's workspace as CWD, tees stdout/stderr to log files (spec Section 4.5).

use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

#[derive(Debug, Error)]
pub enum InvokerError {
    #[error("failed to spawn agent: {0}")]
    SpawnFailure(String),
    #[error("context cancelled")]
    Cancelled,
    #[error("io error writing log file: {0}")]
    Io(#[from] std::io::Error),
}

pub struct InvocationResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// Runs `cmd` with `workspace_dir` as CWD, feeding `prompt` on stdin, teeing
/// stdout/stderr to `logs_dir/{stdout,stderr}.txt`. When `debug` is set, the
/// child's streams are additionally mirrored to this process's own
/// stdout/stderr.
pub async fn invoke_agent(
    cmd: &[String],
    workspace_dir: &Path,
    logs_dir: &Path,
    prompt: &str,
    debug: bool,
) -> Result<InvocationResult, InvokerError> {
    let Some((program, args)) = cmd.split_first() else {
        return Err(InvokerError::SpawnFailure("empty agent command".to_string()));
    };

    std::fs::write(logs_dir.join("prompt.txt"), prompt)?;

    let mut child = Command::new(program)
        .args(args)
        .current_dir(workspace_dir)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| InvokerError::SpawnFailure(e.to_string()))?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(prompt.as_bytes()).await;
        drop(stdin);
    }

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();

    let read_stdout = async {
        if let Some(stdout) = stdout.as_mut() {
            stdout.read_to_end(&mut stdout_buf).await
        } else {
            Ok(0)
        }
    };
    let read_stderr = async {
        if let Some(stderr) = stderr.as_mut() {
            stderr.read_to_end(&mut stderr_buf).await
        } else {
            Ok(0)
        }
    };
    tokio::try_join!(read_stdout, read_stderr).map_err(InvokerError::Io)?;

    let status = child
        .wait()
        .await
        .map_err(|e| InvokerError::SpawnFailure(e.to_string()))?;

    tokio::fs::write(logs_dir.join("stdout.txt"), &stdout_buf).await?;
    tokio::fs::write(logs_dir.join("stderr.txt"), &stderr_buf).await?;

    if debug {
        use std::io::Write as _;
        let _ = std::io::stdout().write_all(&stdout_buf);
        let _ = std::io::stderr().write_all(&stderr_buf);
    }

    Ok(InvocationResult {
        stdout: stdout_buf,
        stderr: stderr_buf,
        exit_code: status.code().unwrap_or(-1),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn invokes_command_and_tees_output() {
        let workspace = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let cmd = vec![
            "sh".to_string(),
            "-c".to_string(),
            "cat; echo err 1>&2".to_string(),
        ];

        let result = invoke_agent(&cmd, workspace.path(), logs.path(), "hello", false)
            .await
            .unwrap();

        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, b"hello");
        assert_eq!(result.stderr, b"err\n");
        assert_eq!(std::fs::read(logs.path().join("stdout.txt")).unwrap(), b"hello");
        assert_eq!(std::fs::read(logs.path().join("stderr.txt")).unwrap(), b"err\n");
        assert_eq!(std::fs::read_to_string(logs.path().join("prompt.txt")).unwrap(), "hello");
    }

    #[tokio::test]
    async fn reports_non_zero_exit_code() {
        let workspace = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let cmd = vec!["sh".to_string(), "-c".to_string(), "exit 7".to_string()];

        let result = invoke_agent(&cmd, workspace.path(), logs.path(), "", false)
            .await
            .unwrap();
        assert_eq!(result.exit_code, 7);
    }

    #[tokio::test]
    async fn rejects_empty_command() {
        let workspace = TempDir::new().unwrap();
        let logs = TempDir::new().unwrap();
        let err = invoke_agent(&[], workspace.path(), logs.path(), "", false)
            .await
            .unwrap_err();
        assert!(matches!(err, InvokerError::SpawnFailure(_)));
    }
}
