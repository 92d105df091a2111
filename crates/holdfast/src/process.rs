//! Cross-platform process execution with bounded timeouts and cancellation.
//!
//! Used by the Apply stage to invoke `docker compose` (or whatever the
//! configured container runtime is) and by the Verify stage's health-check
//! probes. A command is considered [`Cancelled`](RunResult::Cancelled)
//! rather than [`TimedOut`](RunResult::TimedOut) when the caller's
//! cancellation flag trips before the deadline — the two are surfaced
//! distinctly so the Pipeline can tell a slow command from an operator
//! abort.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

/// Byte cap applied to each captured stream before truncation.
const MAX_CAPTURED_BYTES: usize = 1 << 20;

/// How long `terminate` waits for a graceful exit after SIGTERM before
/// escalating to SIGKILL.
const TERMINATION_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub cancelled: bool,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.cancelled
    }
}

fn cap(bytes: Vec<u8>) -> String {
    if bytes.len() <= MAX_CAPTURED_BYTES {
        return String::from_utf8_lossy(&bytes).to_string();
    }
    let mut s = String::from_utf8_lossy(&bytes[..MAX_CAPTURED_BYTES]).to_string();
    s.push_str("\n...output truncated...");
    s
}

/// Run `program` with `args` in `working_dir`, honoring an optional timeout
/// and an optional shared cancellation flag. Polls every 100ms rather than
/// blocking on `wait()` so cancellation and timeout can both preempt a
/// running child.
pub fn run_command(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
    cancel: Option<Arc<AtomicBool>>,
) -> Result<CommandOutput> {
    let start = Instant::now();
    let mut command = Command::new(program);
    command
        .args(args)
        .current_dir(working_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().context("failed to spawn command")?;
    let deadline = timeout.map(|d| Instant::now() + d);

    let (exit_code, mut stdout_bytes, mut stderr_bytes, timed_out, cancelled) = loop {
        match child.try_wait().context("failed to poll command")? {
            Some(status) => break (status.code().unwrap_or(-1), Vec::new(), Vec::new(), false, false),
            None => {
                if cancel.as_ref().is_some_and(|c| c.load(Ordering::SeqCst)) {
                    let code = terminate(&mut child, TERMINATION_GRACE);
                    break (code, Vec::new(), Vec::new(), false, true);
                }
                if let Some(deadline) = deadline {
                    if Instant::now() >= deadline {
                        let code = terminate(&mut child, TERMINATION_GRACE);
                        break (code, Vec::new(), Vec::new(), true, false);
                    }
                }
                std::thread::sleep(Duration::from_millis(100));
            }
        }
    };

    if let Some(mut out) = child.stdout.take() {
        let _ = out.read_to_end(&mut stdout_bytes);
    }
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_end(&mut stderr_bytes);
    }

    let mut stderr = cap(stderr_bytes);
    if timed_out {
        stderr.push_str(&format!(
            "\ncommand timed out after {}",
            humantime::format_duration(timeout.unwrap_or_default())
        ));
    }
    if cancelled {
        stderr.push_str("\ncommand cancelled");
    }

    Ok(CommandOutput {
        exit_code,
        stdout: cap(stdout_bytes),
        stderr,
        timed_out,
        cancelled,
        duration: start.elapsed(),
    })
}

/// Ask `child` to exit via SIGTERM, giving it `grace` to do so before
/// escalating to SIGKILL. Returns the exit code, or -1 if it had to be
/// force-killed. On non-Unix targets there is no graceful signal to send,
/// so this falls straight through to a hard kill.
#[cfg(unix)]
fn terminate(child: &mut Child, grace: Duration) -> i32 {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    let pid = Pid::from_raw(child.id() as i32);
    if kill(pid, Signal::SIGTERM).is_ok() {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if let Ok(Some(status)) = child.try_wait() {
                return status.code().unwrap_or(-1);
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
    let _ = child.kill();
    child.wait().ok().and_then(|s| s.code()).unwrap_or(-1)
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, _grace: Duration) -> i32 {
    let _ = child.kill();
    child.wait().ok().and_then(|s| s.code()).unwrap_or(-1)
}

pub fn run_command_with_timeout(
    program: &str,
    args: &[&str],
    working_dir: &Path,
    timeout: Option<Duration>,
) -> Result<CommandOutput> {
    run_command(program, args, working_dir, timeout, None)
}
