//! Scriptable doubles for the device layer. Test-only.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::harness::device::recovery::DeviceRecovery;
use crate::harness::device::state::DeviceStateMonitor;
use crate::harness::error::{DeviceError, TransportError};
use crate::harness::models::{CommandResult, CommandStatus, RemoteFileEntry};
use crate::harness::transport::fastboot::BootloaderChannel;
use crate::harness::transport::Transport;

type Script = Mutex<HashMap<String, VecDeque<Result<String, TransportError>>>>;

/// In-memory `Transport` driven by scripted responses.
///
/// Commands are matched by exact string (`shell` by the command text, `adb`
/// by the space-joined argv). A queue of responses can be scripted per
/// command; the last response repeats once the queue drains. Unscripted
/// commands succeed with empty output. Every call is recorded in order, so
/// tests can assert on command sequencing.
pub struct ScriptedTransport {
    serial: String,
    emulator: bool,
    shell_scripts: Script,
    adb_scripts: Script,
    push_results: Mutex<VecDeque<Result<(), TransportError>>>,
    list_dirs: Mutex<HashMap<String, Vec<RemoteFileEntry>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedTransport {
    pub fn new(serial: impl Into<String>) -> Arc<Self> {
        Self::build(serial, false)
    }

    pub fn emulator(serial: impl Into<String>) -> Arc<Self> {
        Self::build(serial, true)
    }

    fn build(serial: impl Into<String>, emulator: bool) -> Arc<Self> {
        Arc::new(Self {
            serial: serial.into(),
            emulator,
            shell_scripts: Mutex::new(HashMap::new()),
            adb_scripts: Mutex::new(HashMap::new()),
            push_results: Mutex::new(VecDeque::new()),
            list_dirs: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn on_shell(&self, command: &str, response: &str) {
        self.shell_scripts
            .lock()
            .expect("script lock")
            .entry(command.to_string())
            .or_default()
            .push_back(Ok(response.to_string()));
    }

    pub fn on_shell_error(&self, command: &str, error: TransportError) {
        self.shell_scripts
            .lock()
            .expect("script lock")
            .entry(command.to_string())
            .or_default()
            .push_back(Err(error));
    }

    pub fn on_adb(&self, joined_args: &str, response: &str) {
        self.adb_scripts
            .lock()
            .expect("script lock")
            .entry(joined_args.to_string())
            .or_default()
            .push_back(Ok(response.to_string()));
    }

    pub fn on_adb_error(&self, joined_args: &str, error: TransportError) {
        self.adb_scripts
            .lock()
            .expect("script lock")
            .entry(joined_args.to_string())
            .or_default()
            .push_back(Err(error));
    }

    pub fn on_push_result(&self, result: Result<(), TransportError>) {
        self.push_results.lock().expect("script lock").push_back(result);
    }

    pub fn on_list_dir(&self, remote_dir: &str, entries: Vec<RemoteFileEntry>) {
        self.list_dirs
            .lock()
            .expect("script lock")
            .insert(remote_dir.to_string(), entries);
    }

    /// Every transport call so far, in invocation order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("call log lock").clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("call log lock").push(call);
    }

    fn next_scripted(script: &Script, key: &str) -> Option<Result<String, TransportError>> {
        let mut guard = script.lock().expect("script lock");
        let queue = guard.get_mut(key)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

impl Transport for ScriptedTransport {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn is_emulator(&self) -> bool {
        self.emulator
    }

    fn shell(&self, command: &str, _timeout: Duration) -> Result<String, TransportError> {
        self.record(format!("shell {command}"));
        Self::next_scripted(&self.shell_scripts, command).unwrap_or_else(|| Ok(String::new()))
    }

    fn adb(&self, args: &[&str], _timeout: Duration) -> Result<String, TransportError> {
        let joined = args.join(" ");
        self.record(format!("adb {joined}"));
        Self::next_scripted(&self.adb_scripts, &joined).unwrap_or_else(|| Ok(String::new()))
    }

    fn push(
        &self,
        local_paths: &[PathBuf],
        remote_dir: &str,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        let names: Vec<String> = local_paths
            .iter()
            .filter_map(|path| path.file_name())
            .map(|name| name.to_string_lossy().to_string())
            .collect();
        self.record(format!("push [{}] {remote_dir}", names.join(",")));
        self.push_results
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(Ok(()))
    }

    fn pull(
        &self,
        remote_path: &str,
        local_path: &Path,
        _timeout: Duration,
    ) -> Result<(), TransportError> {
        self.record(format!(
            "pull {remote_path} {}",
            local_path.to_string_lossy()
        ));
        Ok(())
    }

    fn list_dir(
        &self,
        remote_dir: &str,
        _timeout: Duration,
    ) -> Result<Vec<RemoteFileEntry>, TransportError> {
        self.record(format!("list_dir {remote_dir}"));
        Ok(self
            .list_dirs
            .lock()
            .expect("script lock")
            .get(remote_dir)
            .cloned()
            .unwrap_or_default())
    }
}

/// In-memory `BootloaderChannel` with a queue of scripted results. Unscripted
/// calls succeed with empty output. Calls are recorded like the transport's.
pub struct ScriptedBootloader {
    serial: String,
    results: Mutex<VecDeque<CommandResult>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedBootloader {
    pub fn new(serial: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            serial: serial.into(),
            results: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn on_result(&self, result: CommandResult) {
        self.results.lock().expect("script lock").push_back(result);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("call log lock").clone()
    }
}

impl BootloaderChannel for ScriptedBootloader {
    fn serial(&self) -> &str {
        &self.serial
    }

    fn execute(&self, args: &[&str], _timeout: Duration) -> CommandResult {
        self.calls
            .lock()
            .expect("call log lock")
            .push(args.join(" "));
        self.results
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or(CommandResult {
                stdout: String::new(),
                stderr: String::new(),
                exit_code: Some(0),
                status: CommandStatus::Success,
            })
    }
}

/// `DeviceRecovery` double that counts invocations and returns a scripted
/// result (success by default).
pub struct RecoveryProbe {
    pub recover_calls: AtomicUsize,
    pub bootloader_calls: AtomicUsize,
    pub recovery_mode_calls: AtomicUsize,
    result: Mutex<Result<(), DeviceError>>,
}

impl RecoveryProbe {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            recover_calls: AtomicUsize::new(0),
            bootloader_calls: AtomicUsize::new(0),
            recovery_mode_calls: AtomicUsize::new(0),
            result: Mutex::new(Ok(())),
        })
    }

    pub fn failing(error: DeviceError) -> Arc<Self> {
        let probe = Self::new();
        *probe.result.lock().expect("result lock") = Err(error);
        probe
    }

    pub fn recover_count(&self) -> usize {
        self.recover_calls.load(Ordering::SeqCst)
    }
}

impl DeviceRecovery for RecoveryProbe {
    fn recover_device(
        &self,
        _monitor: &DeviceStateMonitor,
        _online_only: bool,
    ) -> Result<(), DeviceError> {
        self.recover_calls.fetch_add(1, Ordering::SeqCst);
        self.result.lock().expect("result lock").clone()
    }

    fn recover_device_bootloader(&self, _monitor: &DeviceStateMonitor) -> Result<(), DeviceError> {
        self.bootloader_calls.fetch_add(1, Ordering::SeqCst);
        self.result.lock().expect("result lock").clone()
    }

    fn recover_device_recovery(&self, _monitor: &DeviceStateMonitor) -> Result<(), DeviceError> {
        self.recovery_mode_calls.fetch_add(1, Ordering::SeqCst);
        self.result.lock().expect("result lock").clone()
    }
}
