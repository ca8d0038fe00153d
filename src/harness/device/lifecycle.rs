//! Reboot, root, keyguard, user, and wifi lifecycle operations.

use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::harness::device::parse;
use crate::harness::device::recovery::RecoveryMode;
use crate::harness::device::ManagedDevice;
use crate::harness::error::DeviceError;
use crate::harness::models::UserInfo;

const INPUT_DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);
const INPUT_DISPATCH_POLL: Duration = Duration::from_millis(200);

impl ManagedDevice {
    // ---- post-boot ----

    /// Bring a freshly booted device to the harness baseline: root the shell,
    /// dismiss the keyguard, then run the configured post-boot commands in
    /// order.
    pub fn post_boot_setup(&self) -> Result<(), DeviceError> {
        if self.options().enable_root {
            let _ = self.enable_adb_root()?;
        }
        if self.options().reboot.disable_keyguard {
            self.disable_keyguard()?;
        }
        for command in &self.options().reboot.post_boot_commands {
            self.execute_shell_command(command)?;
        }
        Ok(())
    }

    pub fn is_adb_root(&self) -> Result<bool, DeviceError> {
        let output = self.execute_shell_command("id")?;
        Ok(output.contains("uid=0(root)"))
    }

    /// Restart adbd as root. Returns whether the shell ended up rooted; a
    /// production build refusing root is a normal outcome, not an error.
    pub fn enable_adb_root(&self) -> Result<bool, DeviceError> {
        if !self.options().enable_root {
            debug!(serial = %self.serial(), "root disabled by options");
            return Ok(false);
        }
        if self.is_adb_root()? {
            return Ok(true);
        }
        let output = self.execute_adb_command(&["root"], self.command_timeout())?;
        debug!(serial = %self.serial(), output = %output.trim(), "adb root");
        // adbd restarts; the device briefly drops off the bus.
        if !self.state_monitor().wait_for_online_default() {
            self.recover_device()?;
        }
        self.is_adb_root()
    }

    /// Whether the input dispatcher is accepting events. `None` when the
    /// platform does not report it.
    pub fn is_device_input_ready(&self) -> Result<Option<bool>, DeviceError> {
        let output = self.execute_shell_command("dumpsys input")?;
        Ok(parse::parse_input_dispatch_ready(&output))
    }

    /// Dismiss the keyguard with the configured key event, once input
    /// dispatch is ready. An expired readiness deadline is logged and the
    /// dismissal is attempted anyway.
    pub fn disable_keyguard(&self) -> Result<(), DeviceError> {
        let deadline = Instant::now() + INPUT_DISPATCH_TIMEOUT;
        loop {
            match self.is_device_input_ready()? {
                Some(true) | None => break,
                Some(false) => {}
            }
            if Instant::now() + INPUT_DISPATCH_POLL > deadline {
                warn!(
                    serial = %self.serial(),
                    "input dispatch never became ready, dismissing keyguard anyway"
                );
                break;
            }
            std::thread::sleep(INPUT_DISPATCH_POLL);
        }
        let command = self.options().reboot.disable_keyguard_cmd.clone();
        self.execute_shell_command(&command)?;
        Ok(())
    }

    // ---- reboot ----

    /// Issue a reboot without waiting for the device to come back.
    pub fn nonblocking_reboot(&self) -> Result<(), DeviceError> {
        self.do_reboot(None)
    }

    /// Reboot and wait until the device answers adb again (not necessarily
    /// fully booted). Recovery during the wait is capped at online-only.
    pub fn reboot_until_online(&self) -> Result<(), DeviceError> {
        self.do_reboot(None)?;
        let cached = self.recovery_mode();
        self.set_recovery_mode(RecoveryMode::Online);
        let result = (|| {
            self.wait_for_device_online()?;
            if self.options().enable_root {
                let _ = self.enable_adb_root()?;
            }
            Ok(())
        })();
        self.set_recovery_mode(cached);
        result
    }

    /// Full reboot: back online, fully booted and responsive, post-boot
    /// setup applied.
    pub fn reboot(&self) -> Result<(), DeviceError> {
        self.reboot_until_online()?;
        let reboot_timeout = Duration::from_millis(self.options().reboot.reboot_timeout_ms);
        if !self.state_monitor().wait_for_available(reboot_timeout) {
            self.recover_device()?;
        }
        self.post_boot_setup()
    }

    pub fn reboot_into_bootloader(&self) -> Result<(), DeviceError> {
        if !self.handle().fastboot_available {
            return Err(DeviceError::unsupported(self.serial(), "bootloader mode"));
        }
        use crate::harness::device::state::ConnectivityState;
        if self.connectivity_state() == ConnectivityState::Fastboot {
            info!(serial = %self.serial(), "already in fastboot, rebooting bootloader");
            self.execute_fastboot_command(&["reboot-bootloader"])?;
        } else {
            self.execute_adb_command(&["reboot", "bootloader"], self.command_timeout())?;
        }
        let timeout = Duration::from_millis(self.options().timeouts.fastboot_timeout_ms);
        if !self.state_monitor().wait_for_bootloader(timeout) {
            self.recover_device_from_bootloader()?;
        }
        Ok(())
    }

    pub fn reboot_into_recovery(&self) -> Result<(), DeviceError> {
        self.execute_adb_command(&["reboot", "recovery"], self.command_timeout())?;
        let timeout = Duration::from_millis(self.options().timeouts.recovery_mode_timeout_ms);
        if !self.state_monitor().wait_for_recovery_mode(timeout) {
            self.recover_device_from_recovery_mode()?;
        }
        Ok(())
    }

    /// The raw reboot primitive. An emulator has no real bootloader path, so
    /// its framework is bounced instead of the whole image.
    pub(crate) fn do_reboot(&self, mode: Option<&str>) -> Result<(), DeviceError> {
        use crate::harness::device::state::ConnectivityState;
        if self.connectivity_state() == ConnectivityState::Fastboot {
            self.execute_fastboot_command(&["reboot"])?;
            return Ok(());
        }
        if self.handle().is_emulator() {
            info!(serial = %self.serial(), "emulator reboot, restarting framework");
            self.execute_shell_command("stop")?;
            self.execute_shell_command("setprop dev.bootcomplete 0")?;
            self.execute_shell_command("start")?;
            return Ok(());
        }
        match mode {
            Some(mode) => {
                self.execute_adb_command(&["reboot", mode], self.command_timeout())?
            }
            None => self.execute_adb_command(&["reboot"], self.command_timeout())?,
        };
        let unavailable = Duration::from_millis(self.options().timeouts.unavailable_timeout_ms);
        if !self.state_monitor().wait_for_not_available(unavailable) {
            warn!(
                serial = %self.serial(),
                "device did not go offline after reboot command"
            );
        }
        Ok(())
    }

    // ---- waits with recovery ----

    pub fn wait_for_device_online(&self) -> Result<(), DeviceError> {
        if !self.state_monitor().wait_for_online_default() {
            self.recover_device()?;
        }
        Ok(())
    }

    pub fn wait_for_device_available(&self) -> Result<(), DeviceError> {
        if !self.state_monitor().wait_for_available_default() {
            self.recover_device()?;
        }
        Ok(())
    }

    pub fn wait_for_device_not_available(&self, timeout: Duration) -> bool {
        self.state_monitor().wait_for_not_available(timeout)
    }

    // ---- users ----

    /// All users on the device. Unparseable output aborts the call rather
    /// than returning a partial list.
    pub fn list_users(&self) -> Result<Vec<UserInfo>, DeviceError> {
        let output = self.execute_shell_command("pm list users")?;
        parse::parse_list_users(&output).ok_or_else(|| {
            DeviceError::unresponsive(self.serial(), "pm list users (unparseable output)")
        })
    }

    pub fn primary_user_id(&self) -> Result<Option<i32>, DeviceError> {
        Ok(self
            .list_users()?
            .into_iter()
            .find(UserInfo::is_primary)
            .map(|user| user.id))
    }

    pub fn create_user(&self, name: &str) -> Result<i32, DeviceError> {
        let output = self.execute_shell_command(&format!("pm create-user {name}"))?;
        if output.starts_with("Success") {
            if let Some(id) = parse::parse_trailing_int(&output) {
                return Ok(id);
            }
        }
        Err(DeviceError::unresponsive(
            self.serial(),
            format!("pm create-user {name}: {}", output.trim()),
        ))
    }

    pub fn remove_user(&self, user_id: i32) -> Result<bool, DeviceError> {
        let output = self.execute_shell_command(&format!("pm remove-user {user_id}"))?;
        Ok(output.starts_with("Success"))
    }

    pub fn start_user(&self, user_id: i32) -> Result<bool, DeviceError> {
        let output = self.execute_shell_command(&format!("am start-user {user_id}"))?;
        Ok(!output.contains("Error"))
    }

    pub fn stop_user(&self, user_id: i32) -> Result<bool, DeviceError> {
        let output = self.execute_shell_command(&format!("am stop-user {user_id}"))?;
        Ok(!output.contains("Error"))
    }

    pub fn max_number_of_users(&self) -> Result<i32, DeviceError> {
        let output = self.execute_shell_command("pm get-max-users")?;
        Ok(parse::parse_trailing_int(&output).unwrap_or(0))
    }

    pub fn is_multi_user_supported(&self) -> Result<bool, DeviceError> {
        Ok(self.max_number_of_users()? > 1)
    }

    // ---- wifi ----

    /// Connect to a wifi network, retrying with exponential backoff per the
    /// configured policy. `Ok(false)` when every attempt associated but the
    /// network never came up.
    pub fn connect_to_wifi(&self, ssid: &str, psk: Option<&str>) -> Result<bool, DeviceError> {
        let attempts = self.options().wifi.retry_count.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                let backoff = self
                    .options()
                    .wifi
                    .backoff_base_ms
                    .saturating_mul(1u64 << (attempt - 1));
                debug!(serial = %self.serial(), attempt, backoff_ms = backoff, "wifi retry");
                std::thread::sleep(Duration::from_millis(backoff));
            }
            self.execute_shell_command("svc wifi enable")?;
            let connect = match psk {
                Some(psk) => format!("cmd wifi connect-network {ssid} wpa2 {psk}"),
                None => format!("cmd wifi connect-network {ssid} open"),
            };
            self.execute_shell_command(&connect)?;
            if self.is_wifi_connected(ssid)? {
                return Ok(true);
            }
            warn!(serial = %self.serial(), ssid, attempt, "wifi did not come up");
        }
        Ok(false)
    }

    fn is_wifi_connected(&self, ssid: &str) -> Result<bool, DeviceError> {
        let output = self.execute_shell_command("cmd wifi status")?;
        Ok(output.contains("Wifi is connected to") && output.contains(ssid))
    }
}
