use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::harness::device::state::DeviceStateMonitor;
use crate::harness::error::DeviceError;

/// Policy controlling how aggressively connectivity recovery intervenes.
/// Not a connectivity state: `None` is also used as the reentrancy guard
/// while a recovery operation is itself driving the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryMode {
    /// Skip recovery entirely.
    None,
    /// Recover only until the device answers adb again.
    Online,
    /// Recover until the device is fully usable for tests.
    Available,
}

/// Collaborator that tries to restore communication with a lost device.
/// Parameterized by whether "back online" suffices or full availability is
/// required. Failure means the device is gone for good as far as this layer
/// is concerned.
pub trait DeviceRecovery: Send + Sync {
    fn recover_device(
        &self,
        monitor: &DeviceStateMonitor,
        online_only: bool,
    ) -> Result<(), DeviceError>;

    fn recover_device_bootloader(&self, monitor: &DeviceStateMonitor) -> Result<(), DeviceError>;

    fn recover_device_recovery(&self, monitor: &DeviceStateMonitor) -> Result<(), DeviceError>;
}

/// Default recovery: wait for the device to come back on its own, bounded by
/// the monitor's configured timeouts.
pub struct WaitRecovery {
    serial: String,
    bootloader_timeout: Duration,
    recovery_mode_timeout: Duration,
}

impl WaitRecovery {
    pub fn new(
        serial: impl Into<String>,
        bootloader_timeout: Duration,
        recovery_mode_timeout: Duration,
    ) -> Self {
        Self {
            serial: serial.into(),
            bootloader_timeout,
            recovery_mode_timeout,
        }
    }
}

impl DeviceRecovery for WaitRecovery {
    fn recover_device(
        &self,
        monitor: &DeviceStateMonitor,
        online_only: bool,
    ) -> Result<(), DeviceError> {
        info!(serial = %self.serial, online_only, "waiting for device to recover");
        if !monitor.wait_for_online_default() {
            return Err(DeviceError::not_available(&self.serial));
        }
        if !online_only && !monitor.wait_for_available_default() {
            return Err(DeviceError::not_available(&self.serial));
        }
        Ok(())
    }

    fn recover_device_bootloader(&self, monitor: &DeviceStateMonitor) -> Result<(), DeviceError> {
        info!(serial = %self.serial, "waiting for device to return to bootloader");
        if !monitor.wait_for_bootloader(self.bootloader_timeout) {
            return Err(DeviceError::not_available(&self.serial));
        }
        Ok(())
    }

    fn recover_device_recovery(&self, monitor: &DeviceStateMonitor) -> Result<(), DeviceError> {
        info!(serial = %self.serial, "waiting for device to enter recovery mode");
        if !monitor.wait_for_recovery_mode(self.recovery_mode_timeout) {
            return Err(DeviceError::not_available(&self.serial));
        }
        Ok(())
    }
}
