pub mod fastboot;
pub mod runner;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use uuid::Uuid;

use crate::harness::error::{SyncErrorCode, TransportError};
use crate::harness::models::{CommandStatus, RemoteFileEntry};

/// The primary (online-mode) command channel to one device.
///
/// Implementations wrap a concrete adb endpoint; tests script one. All calls
/// are synchronous with a caller-supplied deadline, and every failure maps
/// into the closed `TransportError` set so the retry engine never has to
/// string-match.
pub trait Transport: Send + Sync {
    fn serial(&self) -> &str;

    fn is_emulator(&self) -> bool {
        false
    }

    /// Run a remote shell command and return its combined output.
    fn shell(&self, command: &str, timeout: Duration) -> Result<String, TransportError>;

    /// Run a raw `adb` subcommand (argv style, without the transport prefix).
    fn adb(&self, args: &[&str], timeout: Duration) -> Result<String, TransportError>;

    /// Push a batch of local files into one remote directory. Batched per
    /// directory level to amortize channel setup cost.
    fn push(
        &self,
        local_paths: &[PathBuf],
        remote_dir: &str,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    fn pull(
        &self,
        remote_path: &str,
        local_path: &Path,
        timeout: Duration,
    ) -> Result<(), TransportError>;

    /// List a remote directory, one entry per child.
    fn list_dir(
        &self,
        remote_dir: &str,
        timeout: Duration,
    ) -> Result<Vec<RemoteFileEntry>, TransportError>;
}

/// Replaceable holder for the active transport of one device identity.
///
/// Reconnection swaps the channel object while the `DeviceHandle` stays put.
/// In-flight commands keep their own `Arc` clone, so they complete (or fail)
/// against the old channel; the swap is only observed by callers that fetch
/// `current()` afterwards.
pub struct TransportSlot {
    inner: Mutex<Arc<dyn Transport>>,
}

impl TransportSlot {
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(transport),
        })
    }

    pub fn current(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.inner.lock().expect("transport slot poisoned"))
    }

    pub fn replace(&self, transport: Arc<dyn Transport>) {
        let mut guard = self.inner.lock().expect("transport slot poisoned");
        *guard = transport;
    }
}

/// `Transport` over a local `adb` binary, commands prefixed with
/// `[-s, <serial>]`.
pub struct AdbTransport {
    program: String,
    serial: String,
    emulator: bool,
    trace_id: String,
}

impl AdbTransport {
    pub fn new(program: impl Into<String>, serial: impl Into<String>, emulator: bool) -> Self {
        Self {
            program: program.into(),
            serial: serial.into(),
            emulator,
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    fn run(&self, args: &[&str], timeout: Duration) -> Result<String, TransportError> {
        let mut full: Vec<String> = vec!["-s".to_string(), self.serial.clone()];
        full.extend(args.iter().map(|arg| arg.to_string()));
        let result = runner::run_command_with_timeout(&self.program, &full, timeout, &self.trace_id);
        match result.status {
            CommandStatus::Success => Ok(result.stdout),
            CommandStatus::TimedOut => Err(TransportError::Timeout),
            CommandStatus::Exception => Err(TransportError::Io(result.stderr)),
            CommandStatus::Failed => Err(classify_adb_failure(&result.stderr)),
        }
    }
}

/// Map a failed adb invocation's stderr onto the transport taxonomy.
fn classify_adb_failure(stderr: &str) -> TransportError {
    let lower = stderr.to_lowercase();
    if lower.contains("not found") || lower.contains("device offline") || lower.contains("closed")
    {
        return TransportError::Rejected(stderr.trim().to_string());
    }
    TransportError::Io(stderr.trim().to_string())
}

/// Map a failed `adb push`'s stderr onto a sync error code.
fn classify_push_failure(stderr: &str) -> TransportError {
    let lower = stderr.to_lowercase();
    let code = if lower.contains("protocol fault") || lower.contains("protocol failure") {
        SyncErrorCode::TransferProtocolError
    } else if lower.contains("couldn't create file") || lower.contains("read-only") {
        SyncErrorCode::FileWriteError
    } else if lower.contains("no such file") {
        SyncErrorCode::FileReadError
    } else if lower.contains("not a directory") {
        SyncErrorCode::RemoteNoDirectory
    } else {
        SyncErrorCode::Unknown
    };
    TransportError::Sync(code, stderr.trim().to_string())
}

impl Transport for AdbTransport {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn is_emulator(&self) -> bool {
        self.emulator
    }

    fn shell(&self, command: &str, timeout: Duration) -> Result<String, TransportError> {
        self.run(&["shell", command], timeout)
    }

    fn adb(&self, args: &[&str], timeout: Duration) -> Result<String, TransportError> {
        self.run(args, timeout)
    }

    fn push(
        &self,
        local_paths: &[PathBuf],
        remote_dir: &str,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let mut args: Vec<&str> = vec!["push"];
        let rendered: Vec<String> = local_paths
            .iter()
            .map(|path| path.to_string_lossy().to_string())
            .collect();
        args.extend(rendered.iter().map(String::as_str));
        args.push(remote_dir);
        match self.run(&args, timeout) {
            Ok(_) => Ok(()),
            Err(TransportError::Io(stderr)) => Err(classify_push_failure(&stderr)),
            Err(err) => Err(err),
        }
    }

    fn pull(
        &self,
        remote_path: &str,
        local_path: &Path,
        timeout: Duration,
    ) -> Result<(), TransportError> {
        let local = local_path.to_string_lossy().to_string();
        self.run(&["pull", remote_path, &local], timeout).map(|_| ())
    }

    fn list_dir(
        &self,
        remote_dir: &str,
        timeout: Duration,
    ) -> Result<Vec<RemoteFileEntry>, TransportError> {
        let output = self.shell(&format!("ls -la {remote_dir}"), timeout)?;
        Ok(parse_ls_la(remote_dir, &output))
    }
}

/// Parse `ls -la` output into remote file entries. Lines that do not look
/// like listing rows (totals, blanks) are skipped.
pub fn parse_ls_la(path: &str, output: &str) -> Vec<RemoteFileEntry> {
    output
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter(|line| !line.trim_start().starts_with("total"))
        .filter_map(|line| {
            let tokens: Vec<&str> = line.trim().split_whitespace().collect();
            if tokens.len() < 8 {
                return None;
            }
            let perm = tokens[0];
            let is_dir = perm.starts_with('d');
            let size_bytes = tokens.get(4).and_then(|value| value.parse::<u64>().ok());
            // toybox prints "2024-01-01 12:00"; toolbox adds a seconds field.
            let (modified_at, name_start_index) = if tokens.len() >= 9 {
                (format!("{} {}", tokens[5], tokens[6]), 8usize)
            } else {
                (format!("{} {}", tokens[5], tokens[6]), 7usize)
            };
            let modified_at = Some(modified_at).filter(|value| !value.trim().is_empty());
            let name = if tokens.len() > name_start_index {
                tokens[name_start_index..].join(" ")
            } else {
                String::new()
            };
            if name.is_empty() || name == "." || name == ".." {
                return None;
            }
            Some(RemoteFileEntry {
                name: name.clone(),
                path: format!("{}/{}", path.trim_end_matches('/'), name),
                is_dir,
                size_bytes,
                modified_at,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_rejected_commands() {
        assert_eq!(
            classify_adb_failure("error: device 'ABC' not found"),
            TransportError::Rejected("error: device 'ABC' not found".to_string())
        );
        assert!(matches!(
            classify_adb_failure("something exploded"),
            TransportError::Io(_)
        ));
    }

    #[test]
    fn classifies_push_failures() {
        assert!(matches!(
            classify_push_failure("adb: error: protocol fault (couldn't read status)"),
            TransportError::Sync(SyncErrorCode::TransferProtocolError, _)
        ));
        assert!(matches!(
            classify_push_failure("adb: error: remote couldn't create file: Read-only file system"),
            TransportError::Sync(SyncErrorCode::FileWriteError, _)
        ));
        assert!(matches!(
            classify_push_failure("wat"),
            TransportError::Sync(SyncErrorCode::Unknown, _)
        ));
    }

    #[test]
    fn parses_ls_la_rows() {
        let output = "total 16\n\
                      drwxr-xr-x 2 root root 4096 2024-01-01 12:00 Download\n\
                      -rw-r--r-- 1 root root  123 2024-01-01 12:00 file.txt\n";
        let entries = parse_ls_la("/sdcard", output);
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_dir);
        assert_eq!(entries[1].path, "/sdcard/file.txt");
        assert_eq!(entries[1].modified_at.as_deref(), Some("2024-01-01 12:00"));
    }

    #[test]
    fn skips_dot_entries() {
        let output = "drwxr-xr-x 2 root root 4096 2024-01-01 12:00 .\n\
                      drwxr-xr-x 2 root root 4096 2024-01-01 12:00 ..\n";
        assert!(parse_ls_la("/sdcard", output).is_empty());
    }

    #[test]
    fn slot_replacement_is_observed_by_later_fetches() {
        let first: Arc<dyn Transport> = Arc::new(AdbTransport::new("adb", "SER-1", false));
        let second: Arc<dyn Transport> = Arc::new(AdbTransport::new("adb", "SER-1", false));
        let slot = TransportSlot::new(Arc::clone(&first));

        let in_flight = slot.current();
        slot.replace(Arc::clone(&second));

        assert!(Arc::ptr_eq(&in_flight, &first));
        assert!(Arc::ptr_eq(&slot.current(), &second));
    }
}
