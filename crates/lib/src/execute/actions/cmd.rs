//! Command execution for `run_command` and the package manager steps.
//!
//! Commands run on the host with a scrubbed environment: nothing from the
//! caller's environment leaks in except what the build Environment carries.
//! The working directory and `HOME`/`TMPDIR` point into the output rootfs.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::execute::types::ExecuteError;

/// `PATH` used when the Environment does not set one.
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Variable carrying the host path of the environment's root filesystem.
pub const ROOT_ENV: &str = "STRATA_ROOT";

/// Number of stderr lines kept in a failure message.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for a killed command's pipes to close.
const REAP_GRACE: Duration = Duration::from_secs(5);

/// Where and how a command runs.
#[derive(Debug, Clone, Copy)]
pub struct CmdContext<'a> {
  /// Host directory the command starts in. Created if missing.
  pub cwd: &'a Path,
  /// Host directory of the environment's filesystem.
  pub rootfs: &'a Path,
  /// Environment variables of the build, applied over the defaults.
  pub variables: &'a BTreeMap<String, String>,
  pub shell: Option<&'a str>,
  /// Kill the command and fail once this elapses.
  pub timeout: Option<Duration>,
}

/// Run `cmd` through the shell.
///
/// The process environment is cleared and rebuilt from:
/// - `PATH` (a standard search path), `HOME` and `TMPDIR` under the rootfs
/// - `LANG=C` and `SOURCE_DATE_EPOCH` for reproducible output
/// - the build's variables, which may override any of the above
/// - `STRATA_ROOT`, the host path of the rootfs
///
/// Returns the trimmed stdout on success.
pub async fn execute_cmd(cmd: &str, ctx: &CmdContext<'_>) -> Result<String, ExecuteError> {
  info!(cmd = %cmd, "executing command");

  let tmp_dir = ctx.rootfs.join("tmp");
  tokio::fs::create_dir_all(&tmp_dir).await?;
  tokio::fs::create_dir_all(ctx.cwd).await?;

  let (shell_cmd, shell_args) = get_shell(ctx.shell);

  let mut command = Command::new(&shell_cmd);
  command
    .args(&shell_args)
    .arg(cmd)
    .current_dir(ctx.cwd)
    .env_clear()
    .env("PATH", DEFAULT_PATH)
    .env("HOME", ctx.rootfs.join("root"))
    .env("TMPDIR", &tmp_dir)
    .env("LANG", "C")
    // 315532800 = January 1, 1980 00:00:00 UTC (ZIP epoch)
    .env("SOURCE_DATE_EPOCH", "315532800")
    .envs(ctx.variables)
    .env(ROOT_ENV, ctx.rootfs)
    .stdin(Stdio::null())
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

  // own process group, so a timeout can kill everything the shell started
  #[cfg(unix)]
  command.process_group(0);

  #[cfg(windows)]
  if let Ok(system_root) = std::env::var("SystemRoot") {
    command.env("SystemRoot", system_root);
  }

  debug!(shell = %shell_cmd, cwd = ?ctx.cwd, "spawning process");

  let child = command.spawn()?;
  let pid = child.id();
  let wait = child.wait_with_output();
  tokio::pin!(wait);

  let output = match ctx.timeout {
    Some(limit) => match tokio::time::timeout(limit, &mut wait).await {
      Ok(output) => output?,
      Err(_) => {
        warn!(cmd = %cmd, ?limit, "command timed out, killing it");
        kill_tree(pid);
        if tokio::time::timeout(REAP_GRACE, wait).await.is_err() {
          warn!(cmd = %cmd, "killed command still holds its output open");
        }
        return Err(ExecuteError::Timeout { limit });
      }
    },
    None => wait.await?,
  };

  let stdout = String::from_utf8_lossy(&output.stdout);
  let stderr = String::from_utf8_lossy(&output.stderr);

  if !output.status.success() {
    if !stdout.is_empty() {
      debug!(stdout = %stdout, "command stdout");
    }
    if !stderr.is_empty() {
      debug!(stderr = %stderr, "command stderr");
    }

    return Err(ExecuteError::CmdFailed {
      cmd: cmd.to_string(),
      code: output.status.code(),
      stderr: tail(&stderr, STDERR_TAIL_LINES),
    });
  }

  let stdout = stdout.trim().to_string();
  if !stdout.is_empty() {
    debug!(stdout = %stdout, "command output");
  }

  Ok(stdout)
}

/// Kill the process group led by `pid`: the shell and every command it
/// started.
#[cfg(unix)]
fn kill_tree(pid: Option<u32>) {
  use rustix::process::{Pid, Signal, kill_process_group};

  let Some(pgid) = pid.and_then(|p| i32::try_from(p).ok()).and_then(Pid::from_raw) else {
    return;
  };
  if let Err(e) = kill_process_group(pgid, Signal::KILL) {
    debug!(pid = ?pid, error = %e, "failed to kill process group");
  }
}

/// Windows has no process groups here; dropping the child kills the shell.
#[cfg(windows)]
fn kill_tree(_pid: Option<u32>) {}

/// Quote `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
  format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Append shell-quoted arguments to a command template.
pub fn with_args<'a>(template: &str, args: impl IntoIterator<Item = &'a str>) -> String {
  let mut cmd = template.to_string();
  for arg in args {
    cmd.push(' ');
    cmd.push_str(&shell_quote(arg));
  }
  cmd
}

fn tail(text: &str, lines: usize) -> String {
  let all: Vec<&str> = text.trim_end().lines().collect();
  all[all.len().saturating_sub(lines)..].join("\n")
}

/// Get the shell command and arguments for the current platform.
///
/// Defaults to `/bin/sh` rather than `$SHELL`: interactive shells may source
/// profile files that reintroduce the caller's environment.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-c".to_string()])
  }

  #[cfg(windows)]
  {
    (
      "powershell.exe".to_string(),
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ],
    )
  }
}
