use std::time::Duration;

use uuid::Uuid;

use crate::harness::models::{CommandResult, CommandStatus};
use crate::harness::transport::runner;

/// The secondary (bootloader-mode) command channel. Argv-style, synchronous,
/// with captured stdout/stderr. A device is in exactly one mode at a time, so
/// this channel and the shell channel are never usable concurrently.
pub trait BootloaderChannel: Send + Sync {
    fn serial(&self) -> &str;

    fn execute(&self, args: &[&str], timeout: Duration) -> CommandResult;
}

/// `BootloaderChannel` over a local `fastboot` binary, commands prefixed with
/// `[-s, <serial>]`.
pub struct FastbootChannel {
    program: String,
    serial: String,
    trace_id: String,
}

impl FastbootChannel {
    pub fn new(program: impl Into<String>, serial: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            serial: serial.into(),
            trace_id: Uuid::new_v4().to_string(),
        }
    }
}

impl BootloaderChannel for FastbootChannel {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn execute(&self, args: &[&str], timeout: Duration) -> CommandResult {
        let mut full: Vec<String> = vec!["-s".to_string(), self.serial.clone()];
        full.extend(args.iter().map(|arg| arg.to_string()));
        runner::run_command_with_timeout(&self.program, &full, timeout, &self.trace_id)
    }
}

/// Decide whether a bootloader command result indicates lost communication.
///
/// Fastboot commands always time out when the device is gone; otherwise only
/// specific stderr patterns indicate bad device communication. Everything
/// else is a command-level failure the caller handles.
pub fn is_recovery_needed(result: &CommandResult) -> bool {
    if result.status == CommandStatus::TimedOut {
        return true;
    }
    result.stderr.contains("data transfer failure (Protocol error)")
        || result.stderr.contains("status read failed (No such device)")
}
