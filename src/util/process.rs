use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::error::ProcessError;

/// Bytes of stderr kept for the failure log line.
const STDERR_TAIL: usize = 2_048;

/// One external program invocation with a hard deadline.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub deadline: Duration,
    /// File the program must leave behind on success.
    pub expect_output: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>, deadline: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            deadline,
            expect_output: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn expect_output(mut self, path: impl AsRef<Path>) -> Self {
        self.expect_output = Some(path.as_ref().to_path_buf());
        self
    }
}

/// Run to completion. Exit code zero is success; anything else, a missing
/// output file or the deadline passing is an error. On timeout the child is
/// killed: the wait future owns it and `kill_on_drop` fires when the timeout
/// drops that future.
pub async fn run(inv: &Invocation) -> Result<Duration, ProcessError> {
    let started = Instant::now();
    debug!(program = %inv.program, args = ?inv.args, deadline_secs = inv.deadline.as_secs(), "spawning");

    let child = Command::new(&inv.program)
        .args(&inv.args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            program: inv.program.clone(),
            source,
        })?;

    let output = match tokio::time::timeout(inv.deadline, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(ProcessError::Spawn {
                program: inv.program.clone(),
                source,
            })
        }
        Err(_) => {
            warn!(program = %inv.program, deadline_secs = inv.deadline.as_secs(), "deadline passed; killed");
            return Err(ProcessError::TimedOut {
                program: inv.program.clone(),
                deadline: inv.deadline,
            });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail = tail_chars(&stderr, STDERR_TAIL);
        warn!(program = %inv.program, status = %output.status, stderr = %tail, "non-zero exit");
        return Err(ProcessError::ExitStatus {
            program: inv.program.clone(),
            status: output.status.to_string(),
        });
    }

    if let Some(path) = &inv.expect_output {
        if tokio::fs::metadata(path).await.is_err() {
            return Err(ProcessError::MissingOutput {
                program: inv.program.clone(),
                path: path.clone(),
            });
        }
    }

    let elapsed = started.elapsed();
    info!(program = %inv.program, elapsed_ms = elapsed.as_millis() as u64, "subprocess finished");
    Ok(elapsed)
}

fn tail_chars(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s.trim();
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    s[start..].trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, deadline: Duration) -> Invocation {
        Invocation::new("sh", deadline).arg("-c").arg(script)
    }

    #[tokio::test]
    async fn zero_exit_with_output_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.json");
        let inv = sh(&format!("echo '[]' > {}", out.display()), Duration::from_secs(5))
            .expect_output(&out);
        run(&inv).await.unwrap();
        assert!(out.exists());
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_error() {
        let err = run(&sh("echo boom >&2; exit 3", Duration::from_secs(5)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::ExitStatus { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn missing_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let inv = sh("true", Duration::from_secs(5)).expect_output(dir.path().join("never"));
        let err = run(&inv).await.unwrap_err();
        assert!(matches!(err, ProcessError::MissingOutput { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn deadline_kills_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("late");
        let inv = sh(
            &format!("sleep 1; touch {}", marker.display()),
            Duration::from_millis(150),
        );
        let started = Instant::now();
        let err = run(&inv).await.unwrap_err();
        assert!(matches!(err, ProcessError::TimedOut { .. }), "{err:?}");
        assert!(started.elapsed() < Duration::from_millis(900));

        tokio::time::sleep(Duration::from_millis(1_300)).await;
        assert!(!marker.exists(), "killed shell must not reach the touch");
    }

    #[tokio::test]
    async fn unknown_program_fails_to_spawn() {
        let err = run(&Invocation::new("/nonexistent/grabber", Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[test]
    fn tail_keeps_the_end() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars(" ab ", 10), "ab");
    }
}
