pub mod action;
pub mod allocation;
pub mod crypto;
pub mod lifecycle;
pub mod parse;
pub mod recovery;
pub mod state;
pub mod sync;

use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::harness::config::HarnessOptions;
use crate::harness::device::allocation::{
    AllocationEventResponse, AllocationMonitor, AllocationState, AllocationTracker, DeviceEvent,
};
use crate::harness::device::recovery::{DeviceRecovery, RecoveryMode, WaitRecovery};
use crate::harness::device::state::{ConnectivityState, DeviceStateMonitor};
use crate::harness::error::{DeviceError, TransportError};
use crate::harness::models::{CommandResult, DeviceHandle, MountPointInfo};
use crate::harness::transport::fastboot::{self, BootloaderChannel, FastbootChannel};
use crate::harness::transport::{AdbTransport, Transport, TransportSlot};

/// One controlled device: stable identity, the two command channels, the
/// connectivity monitor, and the allocation tracker, glued together by the
/// retry engine in `action`.
///
/// Thread safety: the transport slot, connectivity state, allocation state,
/// recovery configuration, and the fastboot serialization lock each have
/// their own lock; none is ever held while waiting on another.
pub struct ManagedDevice {
    handle: DeviceHandle,
    options: HarnessOptions,
    slot: Arc<TransportSlot>,
    bootloader: Arc<dyn BootloaderChannel>,
    monitor: Arc<DeviceStateMonitor>,
    allocation: AllocationTracker,
    recovery: Mutex<Arc<dyn DeviceRecovery>>,
    recovery_mode: Mutex<RecoveryMode>,
    /// Cached result of the disk-crypto support probe; cleared whenever the
    /// device could have changed builds underneath us.
    encryption_supported: Mutex<Option<bool>>,
    /// Serializes bootloader commands. `set_device_state` consults this to
    /// ignore stale "left fastboot" observations mid-command.
    fastboot_lock: Mutex<()>,
}

impl ManagedDevice {
    /// Build a device over the local `adb`/`fastboot` binaries named in the
    /// options.
    pub fn new(handle: DeviceHandle, options: HarnessOptions) -> Self {
        let transport: Arc<dyn Transport> = Arc::new(AdbTransport::new(
            options.adb_path.clone(),
            handle.serial.clone(),
            handle.is_emulator(),
        ));
        let bootloader: Arc<dyn BootloaderChannel> = Arc::new(FastbootChannel::new(
            options.fastboot_path.clone(),
            handle.serial.clone(),
        ));
        Self::with_channels(handle, options, transport, bootloader, None)
    }

    /// Build a device over caller-supplied channels. Tests use this with
    /// scripted channels.
    pub fn with_channels(
        handle: DeviceHandle,
        options: HarnessOptions,
        transport: Arc<dyn Transport>,
        bootloader: Arc<dyn BootloaderChannel>,
        allocation_monitor: Option<Arc<dyn AllocationMonitor>>,
    ) -> Self {
        let slot = TransportSlot::new(transport);
        let monitor = DeviceStateMonitor::new(handle.serial.clone(), Arc::clone(&slot));
        monitor.set_default_online_timeout(Duration::from_millis(
            options.timeouts.online_timeout_ms,
        ));
        monitor.set_default_available_timeout(Duration::from_millis(
            options.timeouts.available_timeout_ms,
        ));
        let recovery: Arc<dyn DeviceRecovery> = Arc::new(WaitRecovery::new(
            handle.serial.clone(),
            Duration::from_millis(options.timeouts.fastboot_timeout_ms),
            Duration::from_millis(options.timeouts.recovery_mode_timeout_ms),
        ));
        let allocation = AllocationTracker::new(handle.serial.clone(), allocation_monitor);
        Self {
            handle,
            options,
            slot,
            bootloader,
            monitor,
            allocation,
            recovery: Mutex::new(recovery),
            recovery_mode: Mutex::new(RecoveryMode::Available),
            encryption_supported: Mutex::new(None),
            fastboot_lock: Mutex::new(()),
        }
    }

    pub fn serial(&self) -> &str {
        &self.handle.serial
    }

    pub fn handle(&self) -> &DeviceHandle {
        &self.handle
    }

    pub fn options(&self) -> &HarnessOptions {
        &self.options
    }

    pub fn state_monitor(&self) -> &Arc<DeviceStateMonitor> {
        &self.monitor
    }

    pub fn recovery(&self) -> Arc<dyn DeviceRecovery> {
        Arc::clone(&self.recovery.lock().expect("recovery lock poisoned"))
    }

    pub fn set_recovery(&self, recovery: Arc<dyn DeviceRecovery>) {
        *self.recovery.lock().expect("recovery lock poisoned") = recovery;
    }

    pub fn recovery_mode(&self) -> RecoveryMode {
        *self.recovery_mode.lock().expect("recovery mode lock poisoned")
    }

    pub fn set_recovery_mode(&self, mode: RecoveryMode) {
        *self.recovery_mode.lock().expect("recovery mode lock poisoned") = mode;
    }

    /// Swap in a fresh transport for the same serial after a reconnect. The
    /// handle and all device state survive; only the channel changes.
    /// In-flight commands settle against the old channel.
    pub fn set_transport(&self, transport: Arc<dyn Transport>) {
        debug!(serial = %self.serial(), "transport replaced");
        self.slot.replace(transport);
        self.invalidate_capability_cache();
    }

    /// Drop cached capability probes. Called after reboots and transport
    /// swaps, when the answers could legitimately change.
    pub fn invalidate_capability_cache(&self) {
        *self
            .encryption_supported
            .lock()
            .expect("capability cache lock poisoned") = None;
    }

    pub(crate) fn cached_encryption_support(&self) -> Option<bool> {
        *self
            .encryption_supported
            .lock()
            .expect("capability cache lock poisoned")
    }

    pub(crate) fn cache_encryption_support(&self, supported: bool) {
        *self
            .encryption_supported
            .lock()
            .expect("capability cache lock poisoned") = Some(supported);
    }

    // ---- connectivity ----

    pub fn connectivity_state(&self) -> ConnectivityState {
        self.monitor.current_state()
    }

    /// Apply an observed connectivity change. While a bootloader command is
    /// mid-flight the device transiently drops off the fastboot bus, so
    /// observations that would move us out of `Fastboot` are ignored unless
    /// the fastboot lock is free.
    pub fn set_device_state(&self, new_state: ConnectivityState) {
        let current = self.monitor.current_state();
        if new_state == current {
            return;
        }
        if current == ConnectivityState::Fastboot
            && new_state != ConnectivityState::Fastboot
            && self.fastboot_lock.try_lock().is_err()
        {
            debug!(
                serial = %self.serial(),
                state = ?new_state,
                "ignoring state observation during fastboot command"
            );
            return;
        }
        self.monitor.set_state(new_state);
    }

    // ---- allocation ----

    pub fn allocation_state(&self) -> AllocationState {
        self.allocation.current_state()
    }

    pub fn handle_allocation_event(&self, event: DeviceEvent) -> AllocationEventResponse {
        self.allocation.handle_event(event)
    }

    // ---- shell channel ----

    fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.options.timeouts.command_timeout_ms)
    }

    /// Run a shell command with the default timeout and retry budget.
    pub fn execute_shell_command(&self, command: &str) -> Result<String, DeviceError> {
        self.execute_shell_command_with(
            command,
            self.command_timeout(),
            self.options.max_retry_attempts,
        )
    }

    pub fn execute_shell_command_with(
        &self,
        command: &str,
        timeout: Duration,
        retry_attempts: usize,
    ) -> Result<String, DeviceError> {
        let description = format!("shell {command}");
        let slot = Arc::clone(&self.slot);
        let mut output: Option<String> = None;
        let mut action = || -> Result<bool, TransportError> {
            let transport = slot.current();
            output = Some(transport.shell(command, timeout)?);
            Ok(true)
        };
        if self.perform_device_action_with_retries(&description, &mut action, retry_attempts)? {
            Ok(output.unwrap_or_default())
        } else {
            Err(DeviceError::unresponsive(self.serial(), description))
        }
    }

    /// Run a raw adb subcommand (argv style, no transport prefix) with the
    /// default retry budget.
    pub fn execute_adb_command(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> Result<String, DeviceError> {
        let description = format!("adb {}", args.join(" "));
        let slot = Arc::clone(&self.slot);
        let mut output: Option<String> = None;
        let mut action = || -> Result<bool, TransportError> {
            let transport = slot.current();
            output = Some(transport.adb(args, timeout)?);
            Ok(true)
        };
        if self.perform_device_action_with_retries(
            &description,
            &mut action,
            self.options.max_retry_attempts,
        )? {
            Ok(output.unwrap_or_default())
        } else {
            Err(DeviceError::unresponsive(self.serial(), description))
        }
    }

    // ---- bootloader channel ----

    pub fn execute_fastboot_command(&self, args: &[&str]) -> Result<CommandResult, DeviceError> {
        self.do_fastboot_command(
            args,
            Duration::from_millis(self.options.timeouts.fastboot_timeout_ms),
        )
    }

    /// Fastboot command with the long-operation budget (flash, format).
    pub fn execute_long_fastboot_command(
        &self,
        args: &[&str],
    ) -> Result<CommandResult, DeviceError> {
        self.do_fastboot_command(
            args,
            Duration::from_millis(self.options.timeouts.long_command_timeout_ms),
        )
    }

    fn do_fastboot_command(
        &self,
        args: &[&str],
        timeout: Duration,
    ) -> Result<CommandResult, DeviceError> {
        if !self.handle.fastboot_available {
            return Err(DeviceError::unsupported(self.serial(), "fastboot"));
        }
        let description = format!("fastboot {}", args.join(" "));
        for _ in 0..=self.options.max_retry_attempts {
            let result = {
                let _guard = self.fastboot_lock.lock().expect("fastboot lock poisoned");
                self.bootloader.execute(args, timeout)
            };
            if !fastboot::is_recovery_needed(&result) {
                return Ok(result);
            }
            warn!(
                serial = %self.serial(),
                command = %description,
                stderr = %result.stderr,
                "bootloader channel lost, attempting recovery"
            );
            self.recover_device_from_bootloader()?;
        }
        Err(DeviceError::unresponsive(self.serial(), description))
    }

    pub fn recover_device_from_bootloader(&self) -> Result<(), DeviceError> {
        self.recovery().recover_device_bootloader(&self.monitor)
    }

    pub fn recover_device_from_recovery_mode(&self) -> Result<(), DeviceError> {
        self.recovery().recover_device_recovery(&self.monitor)
    }

    /// Wipe a partition from the bootloader. `fastboot format` recreates the
    /// filesystem; `fastboot erase` is faster but leaves it unformatted, some
    /// builds recreate it on next boot.
    pub fn fastboot_wipe_partition(&self, partition: &str) -> Result<CommandResult, DeviceError> {
        let verb = if self.options.use_fastboot_erase {
            "erase"
        } else {
            "format"
        };
        self.execute_long_fastboot_command(&[verb, partition])
    }

    // ---- queries over the shell channel ----

    /// Free space on the given store, in kilobytes. The reply format differs
    /// across platform generations, so three parsers are tried in order; an
    /// unparseable reply is retried as a whole.
    pub fn external_store_free_space(
        &self,
        external_store_path: &str,
    ) -> Result<u64, DeviceError> {
        let command = format!("df {external_store_path}");
        for _ in 0..=self.options.max_retry_attempts {
            let output = self.execute_shell_command(&command)?;
            let parsed = parse::parse_free_space_from_modern_output(&output)
                .or_else(|| parse::parse_free_space_from_available(&output))
                .or_else(|| parse::parse_free_space_from_free(external_store_path, &output));
            if let Some(kbytes) = parsed {
                return Ok(kbytes);
            }
            warn!(
                serial = %self.serial(),
                output = %output.trim(),
                "unparseable df output, retrying"
            );
        }
        Err(DeviceError::unresponsive(self.serial(), command))
    }

    pub fn mount_point_info(&self) -> Result<Vec<MountPointInfo>, DeviceError> {
        let output = self.execute_shell_command("cat /proc/mounts")?;
        Ok(parse::parse_mount_points(&output))
    }

    pub fn installed_package_names(&self) -> Result<HashSet<String>, DeviceError> {
        let output = self.execute_shell_command("pm list packages -f")?;
        Ok(parse::parse_installed_packages(&output))
    }

    pub fn does_file_exist(&self, remote_path: &str) -> Result<bool, DeviceError> {
        let output = self.execute_shell_command(&format!("ls {remote_path}"))?;
        Ok(!output.contains("No such file"))
    }

    // ---- package management ----

    /// Install an apk. `Ok(None)` on success, `Ok(Some(reason))` when the
    /// device rejected the package; a rejection is a logical failure and is
    /// never retried.
    pub fn install_package(&self, apk_path: &Path) -> Result<Option<String>, DeviceError> {
        let rendered = apk_path.to_string_lossy().to_string();
        let output = self.execute_adb_command(
            &["install", "-r", &rendered],
            Duration::from_millis(self.options.timeouts.long_command_timeout_ms),
        )?;
        Ok(parse_install_response(&output))
    }

    pub fn uninstall_package(&self, package_name: &str) -> Result<Option<String>, DeviceError> {
        let output = self.execute_adb_command(
            &["uninstall", package_name],
            self.command_timeout(),
        )?;
        Ok(parse_install_response(&output))
    }

    // ---- single-file transfer ----

    pub fn push_file(&self, local_path: &Path, remote_path: &str) -> Result<bool, DeviceError> {
        let description = format!("push {remote_path}");
        let slot = Arc::clone(&self.slot);
        let timeout = self.command_timeout();
        let local = local_path.to_path_buf();
        let mut action = || -> Result<bool, TransportError> {
            let transport = slot.current();
            transport.push(std::slice::from_ref(&local), remote_path, timeout)?;
            Ok(true)
        };
        self.perform_device_action(&description, &mut action)
    }

    pub fn pull_file(&self, remote_path: &str, local_path: &Path) -> Result<bool, DeviceError> {
        let description = format!("pull {remote_path}");
        let slot = Arc::clone(&self.slot);
        let timeout = self.command_timeout();
        let mut action = || -> Result<bool, TransportError> {
            let transport = slot.current();
            transport.pull(remote_path, local_path, timeout)?;
            Ok(true)
        };
        self.perform_device_action(&description, &mut action)
    }

    pub(crate) fn transport_slot(&self) -> &Arc<TransportSlot> {
        &self.slot
    }
}

/// `Success` anywhere in an install/uninstall reply means the operation went
/// through; otherwise the reply itself is the failure reason.
fn parse_install_response(output: &str) -> Option<String> {
    if output.contains("Success") {
        None
    } else {
        let reason = output
            .lines()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("unknown install failure")
            .to_string();
        Some(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::models::{CommandStatus, DeviceKind};
    use crate::harness::testkit::{ScriptedBootloader, ScriptedTransport};

    pub(crate) fn test_device(
        transport: Arc<ScriptedTransport>,
        bootloader: Arc<ScriptedBootloader>,
    ) -> ManagedDevice {
        let handle = DeviceHandle::new("TEST-1", DeviceKind::Native);
        ManagedDevice::with_channels(handle, HarnessOptions::default(), transport, bootloader, None)
    }

    fn failed_result(stderr: &str) -> CommandResult {
        CommandResult {
            stdout: String::new(),
            stderr: stderr.to_string(),
            exit_code: Some(1),
            status: CommandStatus::Failed,
        }
    }

    #[test]
    fn shell_command_returns_output() {
        let transport = ScriptedTransport::new("TEST-1");
        transport.on_shell("id", "uid=2000(shell)\n");
        let device = test_device(Arc::clone(&transport), ScriptedBootloader::new("TEST-1"));
        assert_eq!(
            device.execute_shell_command("id").expect("shell"),
            "uid=2000(shell)\n"
        );
    }

    #[test]
    fn fastboot_refused_without_bootloader_support() {
        let handle = DeviceHandle::new("emulator-5554", DeviceKind::Emulator);
        let device = ManagedDevice::with_channels(
            handle,
            HarnessOptions::default(),
            ScriptedTransport::emulator("emulator-5554"),
            ScriptedBootloader::new("emulator-5554"),
            None,
        );
        assert_eq!(
            device.execute_fastboot_command(&["getvar", "product"]),
            Err(DeviceError::unsupported("emulator-5554", "fastboot"))
        );
    }

    #[test]
    fn fastboot_protocol_error_triggers_recovery_then_retry() {
        let transport = ScriptedTransport::new("TEST-1");
        let bootloader = ScriptedBootloader::new("TEST-1");
        bootloader.on_result(failed_result(
            "FAILED (data transfer failure (Protocol error))",
        ));
        let device = test_device(transport, Arc::clone(&bootloader));
        let probe = crate::harness::testkit::RecoveryProbe::new();
        device.set_recovery(Arc::clone(&probe) as Arc<dyn DeviceRecovery>);

        let result = device
            .execute_fastboot_command(&["getvar", "product"])
            .expect("fastboot");
        assert_eq!(result.status, CommandStatus::Success);
        assert_eq!(probe.bootloader_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(bootloader.calls().len(), 2);
    }

    #[test]
    fn fastboot_plain_failure_is_returned_not_retried() {
        let transport = ScriptedTransport::new("TEST-1");
        let bootloader = ScriptedBootloader::new("TEST-1");
        bootloader.on_result(failed_result("FAILED (remote: partition does not exist)"));
        let device = test_device(transport, Arc::clone(&bootloader));

        let result = device
            .execute_fastboot_command(&["erase", "nope"])
            .expect("fastboot");
        assert_eq!(result.status, CommandStatus::Failed);
        assert_eq!(bootloader.calls().len(), 1);
    }

    #[test]
    fn wipe_partition_honors_erase_option() {
        let bootloader = ScriptedBootloader::new("TEST-1");
        let handle = DeviceHandle::new("TEST-1", DeviceKind::Native);
        let mut options = HarnessOptions::default();
        options.use_fastboot_erase = true;
        let device = ManagedDevice::with_channels(
            handle,
            options,
            ScriptedTransport::new("TEST-1"),
            bootloader.clone(),
            None,
        );
        device.fastboot_wipe_partition("userdata").expect("wipe");
        assert_eq!(bootloader.calls(), vec!["erase userdata".to_string()]);
    }

    #[test]
    fn free_space_tries_all_three_formats() {
        let transport = ScriptedTransport::new("TEST-1");
        transport.on_shell(
            "df /sdcard",
            "Filesystem             Size   Used   Free   Blksize\n\
             /sdcard                   3G   790M  2G     4096\n",
        );
        let device = test_device(transport, ScriptedBootloader::new("TEST-1"));
        assert_eq!(
            device.external_store_free_space("/sdcard").expect("df"),
            2097152
        );
    }

    #[test]
    fn unparseable_df_output_is_retried_then_fails() {
        let transport = ScriptedTransport::new("TEST-1");
        transport.on_shell("df /sdcard", "garbage\n");
        let device = test_device(Arc::clone(&transport), ScriptedBootloader::new("TEST-1"));
        assert!(matches!(
            device.external_store_free_space("/sdcard"),
            Err(DeviceError::Unresponsive { .. })
        ));
        // Default retry budget of two means three whole-command attempts.
        assert_eq!(transport.calls().len(), 3);
    }

    #[test]
    fn install_success_and_failure_parse() {
        assert_eq!(parse_install_response("Success\n"), None);
        assert_eq!(
            parse_install_response("Failure [INSTALL_FAILED_OLDER_SDK]\n"),
            Some("Failure [INSTALL_FAILED_OLDER_SDK]".to_string())
        );
    }

    #[test]
    fn state_observation_ignored_while_fastboot_command_runs() {
        let device = test_device(
            ScriptedTransport::new("TEST-1"),
            ScriptedBootloader::new("TEST-1"),
        );
        device.set_device_state(ConnectivityState::Fastboot);
        {
            let _guard = device.fastboot_lock.lock().expect("fastboot lock");
            device.set_device_state(ConnectivityState::NotAvailable);
            assert_eq!(device.connectivity_state(), ConnectivityState::Fastboot);
        }
        device.set_device_state(ConnectivityState::NotAvailable);
        assert_eq!(device.connectivity_state(), ConnectivityState::NotAvailable);
    }

    #[test]
    fn file_existence_check() {
        let transport = ScriptedTransport::new("TEST-1");
        transport.on_shell("ls /sdcard/present.txt", "/sdcard/present.txt\n");
        transport.on_shell(
            "ls /sdcard/absent.txt",
            "ls: /sdcard/absent.txt: No such file or directory\n",
        );
        let device = test_device(transport, ScriptedBootloader::new("TEST-1"));
        assert!(device.does_file_exist("/sdcard/present.txt").expect("ls"));
        assert!(!device.does_file_exist("/sdcard/absent.txt").expect("ls"));
    }
}
