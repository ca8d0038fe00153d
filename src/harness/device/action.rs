//! The retry/recovery engine every device operation funnels through.

use std::time::Duration;

use tracing::{debug, info, warn};

use crate::harness::device::recovery::RecoveryMode;
use crate::harness::device::ManagedDevice;
use crate::harness::error::{DeviceError, TransportError};

/// Pause taken instead of recovering when recovery is disabled, so a tight
/// failure loop still backs off.
const DISABLED_RECOVERY_PAUSE: Duration = Duration::from_millis(1000);

impl ManagedDevice {
    /// Run `action` with the configured retry budget. See
    /// [`Self::perform_device_action_with_retries`].
    pub fn perform_device_action(
        &self,
        description: &str,
        action: &mut dyn FnMut() -> Result<bool, TransportError>,
    ) -> Result<bool, DeviceError> {
        self.perform_device_action_with_retries(
            description,
            action,
            self.options().max_retry_attempts,
        )
    }

    /// Run `action` up to `retry_attempts + 1` times, recovering the device
    /// between attempts.
    ///
    /// The action's `Ok` value is returned from the first attempt that
    /// completes: `Ok(false)` is a logical failure and is never retried, only
    /// raised errors are retry candidates. Sync errors get a second look:
    /// codes outside the configured transient set are logical failures too.
    /// An exhausted budget is `DeviceError::Unresponsive` when retries were
    /// requested, and a plain `Ok(false)` when `retry_attempts` is zero.
    pub fn perform_device_action_with_retries(
        &self,
        description: &str,
        action: &mut dyn FnMut() -> Result<bool, TransportError>,
        retry_attempts: usize,
    ) -> Result<bool, DeviceError> {
        for attempt in 0..=retry_attempts {
            match action() {
                Ok(value) => return Ok(value),
                Err(TransportError::Sync(code, message)) => {
                    if self.options().is_transient_sync_error(code) {
                        warn!(
                            serial = %self.serial(),
                            action = description,
                            attempt,
                            code = %code,
                            message = %message,
                            "transient sync failure"
                        );
                    } else {
                        warn!(
                            serial = %self.serial(),
                            action = description,
                            code = %code,
                            message = %message,
                            "non-transient sync failure, not retrying"
                        );
                        return Ok(false);
                    }
                }
                Err(err) => {
                    warn!(
                        serial = %self.serial(),
                        action = description,
                        attempt,
                        error = %err,
                        "device action failed"
                    );
                }
            }
            self.recover_device()?;
        }
        if retry_attempts > 0 {
            Err(DeviceError::unresponsive(self.serial(), description))
        } else {
            Ok(false)
        }
    }

    /// Restore communication with the device per the current recovery mode.
    ///
    /// While recovery (including its post-recovery setup) is running, the
    /// mode is forced to `None` so that setup commands failing cannot start
    /// a second recovery underneath the first; the previous mode is restored
    /// on the way out, success or not.
    pub fn recover_device(&self) -> Result<(), DeviceError> {
        let mode = self.recovery_mode();
        if mode == RecoveryMode::None {
            debug!(serial = %self.serial(), "recovery disabled, pausing instead");
            std::thread::sleep(DISABLED_RECOVERY_PAUSE);
            return Ok(());
        }
        info!(serial = %self.serial(), mode = ?mode, "attempting device recovery");
        self.set_recovery_mode(RecoveryMode::None);
        let result = self.run_recovery(mode);
        self.set_recovery_mode(mode);
        result?;
        info!(serial = %self.serial(), "device recovered");
        Ok(())
    }

    fn run_recovery(&self, mode: RecoveryMode) -> Result<(), DeviceError> {
        self.recovery()
            .recover_device(&self.monitor, mode == RecoveryMode::Online)?;
        match mode {
            RecoveryMode::Available => {
                if self.is_encryption_supported()? && self.is_device_encrypted()? {
                    self.unlock_device()?;
                }
                self.post_boot_setup()?;
            }
            RecoveryMode::Online => {
                if self.options().enable_root {
                    self.enable_adb_root()?;
                }
            }
            RecoveryMode::None => {}
        }
        Ok(())
    }
}
