use std::io::Read;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::harness::models::{CommandResult, CommandStatus};

/// Run one subprocess with a hard deadline, capturing stdout and stderr.
///
/// Failure surface follows the executor contract: a spawn/poll error is
/// `Exception`, deadline expiry kills the child and yields `TimedOut`, a
/// non-zero exit is `Failed`. Callers decide whether `Failed` is retryable.
pub fn run_command_with_timeout(
    program: &str,
    args: &[String],
    timeout: Duration,
    trace_id: &str,
) -> CommandResult {
    let mut child = match Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
    {
        Ok(child) => child,
        Err(err) => {
            warn!(trace_id = %trace_id, program = %program, error = %err, "failed to spawn command");
            return CommandResult::exception(format!("failed to spawn {program}: {err}"));
        }
    };

    // Drain stdout/stderr in parallel; otherwise, a chatty child process can
    // block once the pipe buffer fills, and we will incorrectly hit the
    // timeout.
    let Some(stdout) = child.stdout.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return CommandResult::exception("failed to capture stdout");
    };
    let Some(stderr) = child.stderr.take() else {
        let _ = child.kill();
        let _ = child.wait();
        return CommandResult::exception("failed to capture stderr");
    };

    let stdout_handle = std::thread::spawn(move || drain(stdout));
    let stderr_handle = std::thread::spawn(move || drain(stderr));

    let start = Instant::now();
    let exit_code = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {
                if start.elapsed() > timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    let stdout_bytes = stdout_handle.join().unwrap_or_default();
                    let stderr_bytes = stderr_handle.join().unwrap_or_default();
                    return CommandResult {
                        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
                        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
                        exit_code: None,
                        status: CommandStatus::TimedOut,
                    };
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                let _ = stdout_handle.join();
                let _ = stderr_handle.join();
                return CommandResult::exception(format!("failed to poll command: {err}"));
            }
        }
    };

    let stdout_bytes = stdout_handle.join().unwrap_or_default();
    let stderr_bytes = stderr_handle.join().unwrap_or_default();

    let status = if exit_code == Some(0) {
        CommandStatus::Success
    } else {
        CommandStatus::Failed
    };
    CommandResult {
        stdout: String::from_utf8_lossy(&stdout_bytes).to_string(),
        stderr: String::from_utf8_lossy(&stderr_bytes).to_string(),
        exit_code,
        status,
    }
}

fn drain(mut reader: impl Read) -> Vec<u8> {
    let mut buffer = Vec::<u8>::new();
    let mut temp = [0u8; 4096];
    loop {
        match reader.read(&mut temp) {
            Ok(0) => break,
            Ok(count) => buffer.extend_from_slice(&temp[..count]),
            Err(_) => break,
        }
    }
    buffer
}
