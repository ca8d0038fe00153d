//! Userdata encryption control over the disk-crypto shell service.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::harness::device::parse;
use crate::harness::device::recovery::RecoveryMode;
use crate::harness::device::ManagedDevice;
use crate::harness::error::DeviceError;

/// Default password the harness encrypts and unlocks with.
const ENCRYPTION_PASSWORD: &str = "android";
/// Bare `enablecrypto` makes the service print its usage line; a `500` usage
/// reply proves the service exists without changing any state.
const ENCRYPTION_PROBE: &str = "vdc cryptfs enablecrypto";
const CHECKPW_ATTEMPTS: usize = 3;
const CHECKPW_RETRY_PAUSE: Duration = Duration::from_millis(500);

impl ManagedDevice {
    /// Whether the device build supports userdata encryption. Probed once and
    /// cached until the cache is invalidated by a reboot or transport swap.
    pub fn is_encryption_supported(&self) -> Result<bool, DeviceError> {
        if let Some(supported) = self.cached_encryption_support() {
            return Ok(supported);
        }
        let output = self.execute_shell_command(ENCRYPTION_PROBE)?;
        let supported = output.contains("500") && output.contains("Usage:");
        debug!(serial = %self.serial(), supported, "encryption support probed");
        self.cache_encryption_support(supported);
        Ok(supported)
    }

    pub fn is_device_encrypted(&self) -> Result<bool, DeviceError> {
        let output = self.execute_shell_command("getprop ro.crypto.state")?;
        Ok(output.trim() == "encrypted")
    }

    fn require_encryption_support(&self, operation: &str) -> Result<(), DeviceError> {
        if !self.is_encryption_supported()? {
            return Err(DeviceError::unsupported(self.serial(), operation));
        }
        Ok(())
    }

    /// Encrypt userdata. `inplace` preserves existing data; otherwise the
    /// partition is wiped as part of encryption. The device reboots itself
    /// mid-operation.
    pub fn encrypt_device(&self, inplace: bool) -> Result<bool, DeviceError> {
        self.require_encryption_support("encryption")?;
        if self.is_device_encrypted()? {
            debug!(serial = %self.serial(), "device is already encrypted");
            return Ok(true);
        }
        let _ = self.enable_adb_root()?;
        let verb = if inplace { "inplace" } else { "wipe" };
        info!(serial = %self.serial(), verb, "encrypting device");
        let command = format!("vdc cryptfs enablecrypto {verb} \"{ENCRYPTION_PASSWORD}\"");
        self.execute_shell_command_with(
            &command,
            Duration::from_millis(self.options().timeouts.long_command_timeout_ms),
            0,
        )?;
        let unavailable = Duration::from_millis(self.options().timeouts.unavailable_timeout_ms);
        if !self.wait_for_device_not_available(unavailable) {
            warn!(serial = %self.serial(), "device did not reboot for encryption");
        }
        self.wait_for_device_available()?;
        self.is_device_encrypted()
    }

    /// Unlock encrypted userdata so the framework can mount it.
    ///
    /// The crypto service may still be coming up right after boot, so an
    /// empty reply is retried a few times. A reply rejecting the password is
    /// a logical failure, not a communication one.
    pub fn unlock_device(&self) -> Result<bool, DeviceError> {
        self.require_encryption_support("encryption")?;
        if !self.is_device_encrypted()? {
            return Ok(true);
        }
        let _ = self.enable_adb_root()?;
        let checkpw = format!("vdc cryptfs checkpw \"{ENCRYPTION_PASSWORD}\"");
        for attempt in 0..CHECKPW_ATTEMPTS {
            let output = self.execute_shell_command(&checkpw)?;
            if output.trim().is_empty() {
                debug!(serial = %self.serial(), attempt, "crypto service not answering yet");
                std::thread::sleep(CHECKPW_RETRY_PAUSE);
                continue;
            }
            if parse::vdc_reply_already_accepted(&output) {
                debug!(serial = %self.serial(), "userdata already unlocked");
                return Ok(true);
            }
            if parse::vdc_reply_success(&output) {
                let restart = self.execute_shell_command("vdc cryptfs restart")?;
                if !parse::vdc_reply_success(&restart) {
                    warn!(
                        serial = %self.serial(),
                        reply = %restart.trim(),
                        "framework restart after unlock failed"
                    );
                    return Ok(false);
                }
                self.wait_for_device_available()?;
                return Ok(true);
            }
            warn!(
                serial = %self.serial(),
                reply = %output.trim(),
                "crypto service rejected the password"
            );
            return Ok(false);
        }
        Ok(false)
    }

    /// Remove encryption by wiping userdata from the bootloader. Destroys all
    /// user data. Recovery is capped at online-only for the duration, since
    /// full availability checks would fight the wipe.
    pub fn unencrypt_device(&self) -> Result<bool, DeviceError> {
        self.require_encryption_support("encryption")?;
        if !self.is_device_encrypted()? {
            return Ok(true);
        }
        info!(serial = %self.serial(), "removing encryption by wiping userdata");
        let cached = self.recovery_mode();
        self.set_recovery_mode(RecoveryMode::Online);
        let result = (|| {
            self.reboot_into_bootloader()?;
            self.fastboot_wipe_partition("userdata")?;
            let second_boot_ms = self.options().reboot.unencrypt_reboot_timeout_ms;
            if second_boot_ms > 0 {
                // Some storage layouts recreate userdata on a second boot.
                self.reboot_until_online()?;
                if !self.wait_for_device_not_available(Duration::from_millis(second_boot_ms)) {
                    warn!(serial = %self.serial(), "no second reboot observed after wipe");
                }
            }
            self.reboot_until_online()?;
            if self.options().use_fastboot_erase {
                // erase leaves the filesystem unformatted
                self.execute_shell_command("vdc volume format sdcard")?;
            }
            Ok(())
        })();
        self.set_recovery_mode(cached);
        result?;
        self.invalidate_capability_cache();
        Ok(!self.is_device_encrypted()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::harness::config::HarnessOptions;
    use crate::harness::models::{DeviceHandle, DeviceKind};
    use crate::harness::testkit::{ScriptedBootloader, ScriptedTransport};

    const USAGE_REPLY: &str = "500 8674 Usage: cryptfs enablecrypto <wipe|inplace> <passwd>\n";

    fn device_with(transport: Arc<ScriptedTransport>) -> ManagedDevice {
        let mut options = HarnessOptions::default();
        options.enable_root = false;
        options.timeouts.unavailable_timeout_ms = 30;
        ManagedDevice::with_channels(
            DeviceHandle::new("TEST-1", DeviceKind::Native),
            options,
            transport,
            ScriptedBootloader::new("TEST-1"),
            None,
        )
    }

    #[test]
    fn support_probe_is_cached() {
        let transport = ScriptedTransport::new("TEST-1");
        transport.on_shell(ENCRYPTION_PROBE, USAGE_REPLY);
        let device = device_with(Arc::clone(&transport));
        assert!(device.is_encryption_supported().expect("probe"));
        assert!(device.is_encryption_supported().expect("cached"));
        assert_eq!(transport.calls().len(), 1);
    }

    #[test]
    fn cache_cleared_on_invalidation() {
        let transport = ScriptedTransport::new("TEST-1");
        transport.on_shell(ENCRYPTION_PROBE, USAGE_REPLY);
        let device = device_with(Arc::clone(&transport));
        assert!(device.is_encryption_supported().expect("probe"));
        device.invalidate_capability_cache();
        assert!(device.is_encryption_supported().expect("reprobe"));
        assert_eq!(transport.calls().len(), 2);
    }

    #[test]
    fn operations_refused_eagerly_without_support() {
        let transport = ScriptedTransport::new("TEST-1");
        // Unscripted probe answers empty: no usage line, no support.
        let device = device_with(Arc::clone(&transport));
        assert_eq!(
            device.encrypt_device(true),
            Err(DeviceError::unsupported("TEST-1", "encryption"))
        );
        assert_eq!(
            device.unlock_device(),
            Err(DeviceError::unsupported("TEST-1", "encryption"))
        );
        // Only the probe itself reached the device.
        assert_eq!(transport.calls().len(), 1);
    }

    #[test]
    fn unlock_is_a_noop_when_already_accepted() {
        let transport = ScriptedTransport::new("TEST-1");
        transport.on_shell(ENCRYPTION_PROBE, USAGE_REPLY);
        transport.on_shell("getprop ro.crypto.state", "encrypted\n");
        transport.on_shell("vdc cryptfs checkpw \"android\"", "200 4 -1\n");
        let device = device_with(Arc::clone(&transport));
        assert!(device.unlock_device().expect("unlock"));
        assert!(!transport
            .calls()
            .iter()
            .any(|call| call.contains("restart")));
    }

    #[test]
    fn unlock_restarts_the_framework_on_success() {
        let transport = ScriptedTransport::new("TEST-1");
        transport.on_shell(ENCRYPTION_PROBE, USAGE_REPLY);
        transport.on_shell("getprop ro.crypto.state", "encrypted\n");
        transport.on_shell("vdc cryptfs checkpw \"android\"", "200 4 0\n");
        transport.on_shell("vdc cryptfs restart", "200 4 0\n");
        transport.on_shell("getprop sys.boot_completed", "1\n");
        transport.on_shell("echo ready", "ready\n");
        let device = device_with(Arc::clone(&transport));
        assert!(device.unlock_device().expect("unlock"));
        assert!(transport
            .calls()
            .iter()
            .any(|call| call.contains("vdc cryptfs restart")));
    }

    #[test]
    fn unlock_reports_rejected_password_as_logical_failure() {
        let transport = ScriptedTransport::new("TEST-1");
        transport.on_shell(ENCRYPTION_PROBE, USAGE_REPLY);
        transport.on_shell("getprop ro.crypto.state", "encrypted\n");
        transport.on_shell("vdc cryptfs checkpw \"android\"", "200 4 5\n");
        let device = device_with(transport);
        assert_eq!(device.unlock_device(), Ok(false));
    }

    #[test]
    fn unlock_skipped_on_unencrypted_device() {
        let transport = ScriptedTransport::new("TEST-1");
        transport.on_shell(ENCRYPTION_PROBE, USAGE_REPLY);
        transport.on_shell("getprop ro.crypto.state", "unencrypted\n");
        let device = device_with(Arc::clone(&transport));
        assert!(device.unlock_device().expect("unlock"));
        assert!(!transport
            .calls()
            .iter()
            .any(|call| call.contains("checkpw")));
    }
}
