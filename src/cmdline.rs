use std::{io, path::Path, process::Stdio, time::Duration};

use serde::Serialize;
use thiserror::Error;
use tokio::{process::Command, time::timeout};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to launch '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("'{program}' did not finish within {}s", after.as_secs())]
    Timeout { program: String, after: Duration },
}

/// How the last output line of a check command is judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sentinel {
    LastLineEquals(&'static str),
    LastLineLacks(&'static str),
}

impl Sentinel {
    pub fn accepts(&self, lines: &[String]) -> bool {
        let last = lines.last().map(|line| line.trim()).unwrap_or_default();
        match self {
            Sentinel::LastLineEquals(expected) => last == *expected,
            Sentinel::LastLineLacks(marker) => !lines.is_empty() && !last.contains(marker),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandReport {
    pub command: String,
    pub lines: Vec<String>,
    pub exit_ok: bool,
    pub passed: bool,
}

/// Run `program args..`, collecting stdout then stderr lines. Killed when
/// `limit` elapses.
pub async fn run_capture(
    program: &Path,
    args: &[&str],
    limit: Duration,
) -> Result<(bool, Vec<String>), CommandError> {
    let display = program.display().to_string();
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| CommandError::Spawn {
            program: display.clone(),
            source,
        })?;

    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(source)) => {
            return Err(CommandError::Spawn {
                program: display,
                source,
            });
        }
        Err(_) => {
            return Err(CommandError::Timeout {
                program: display,
                after: limit,
            });
        }
    };

    let lines = String::from_utf8_lossy(&output.stdout)
        .lines()
        .chain(String::from_utf8_lossy(&output.stderr).lines())
        .map(|line| line.trim_end().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>();
    Ok((output.status.success(), lines))
}

/// Run a check and judge it. A missing sentinel means "exit status decides".
pub async fn check(
    program: &Path,
    args: &[&str],
    sentinel: Option<Sentinel>,
    limit: Duration,
) -> Result<CommandReport, CommandError> {
    let (exit_ok, lines) = run_capture(program, args, limit).await?;
    let passed = match sentinel {
        Some(sentinel) => sentinel.accepts(&lines),
        None => exit_ok && !lines.is_empty(),
    };
    Ok(CommandReport {
        command: std::iter::once(program.display().to_string())
            .chain(args.iter().map(|arg| arg.to_string()))
            .collect::<Vec<_>>()
            .join(" "),
        lines,
        exit_ok,
        passed,
    })
}
