use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::harness::transport::TransportSlot;

/// Connectivity of one device as seen by the harness. Mutated only through
/// `DeviceStateMonitor::set_state`, driven by transport notifications or by
/// lifecycle code around explicit mode switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectivityState {
    Online,
    Offline,
    Fastboot,
    Recovery,
    NotAvailable,
}

const PROBE_POLL_INTERVAL: Duration = Duration::from_millis(500);
const PROBE_SHELL_TIMEOUT: Duration = Duration::from_secs(10);
const BOOTCOMPLETE_PROP: &str = "sys.boot_completed";

/// Tracks connectivity and provides the blocking waits that are the only
/// suspension points in the device layer. Every wait takes an explicit
/// timeout; expiry means "recovery needed", never success.
pub struct DeviceStateMonitor {
    serial: String,
    slot: Arc<TransportSlot>,
    state: Mutex<ConnectivityState>,
    cv: Condvar,
    default_online_timeout: Mutex<Duration>,
    default_available_timeout: Mutex<Duration>,
}

impl DeviceStateMonitor {
    pub fn new(serial: impl Into<String>, slot: Arc<TransportSlot>) -> Arc<Self> {
        Arc::new(Self {
            serial: serial.into(),
            slot,
            state: Mutex::new(ConnectivityState::Online),
            cv: Condvar::new(),
            default_online_timeout: Mutex::new(Duration::from_secs(60)),
            default_available_timeout: Mutex::new(Duration::from_secs(6 * 60)),
        })
    }

    pub fn current_state(&self) -> ConnectivityState {
        *self.state.lock().expect("state lock poisoned")
    }

    pub fn set_state(&self, new_state: ConnectivityState) {
        let mut guard = self.state.lock().expect("state lock poisoned");
        if *guard != new_state {
            debug!(serial = %self.serial, state = ?new_state, "device state changed");
            *guard = new_state;
            self.cv.notify_all();
        }
    }

    pub fn set_default_online_timeout(&self, timeout: Duration) {
        *self.default_online_timeout.lock().expect("timeout lock poisoned") = timeout;
    }

    pub fn set_default_available_timeout(&self, timeout: Duration) {
        *self.default_available_timeout.lock().expect("timeout lock poisoned") = timeout;
    }

    pub fn default_online_timeout(&self) -> Duration {
        *self.default_online_timeout.lock().expect("timeout lock poisoned")
    }

    pub fn default_available_timeout(&self) -> Duration {
        *self.default_available_timeout.lock().expect("timeout lock poisoned")
    }

    fn wait_for_state(
        &self,
        timeout: Duration,
        pred: impl Fn(ConnectivityState) -> bool,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.state.lock().expect("state lock poisoned");
        while !pred(*guard) {
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (next, _timed_out) = self
                .cv
                .wait_timeout(guard, remaining)
                .expect("state lock poisoned");
            guard = next;
        }
        true
    }

    pub fn wait_for_online(&self, timeout: Duration) -> bool {
        self.wait_for_state(timeout, |state| state == ConnectivityState::Online)
    }

    pub fn wait_for_online_default(&self) -> bool {
        self.wait_for_online(self.default_online_timeout())
    }

    pub fn wait_for_not_available(&self, timeout: Duration) -> bool {
        self.wait_for_state(timeout, |state| state == ConnectivityState::NotAvailable)
    }

    pub fn wait_for_bootloader(&self, timeout: Duration) -> bool {
        self.wait_for_state(timeout, |state| state == ConnectivityState::Fastboot)
    }

    pub fn wait_for_recovery_mode(&self, timeout: Duration) -> bool {
        self.wait_for_state(timeout, |state| state == ConnectivityState::Recovery)
    }

    /// Poll the boot-complete property until it reports `1` or the deadline
    /// expires. Probe failures count as "not yet booted".
    pub fn wait_for_boot_complete(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let transport = self.slot.current();
            match transport.shell(&format!("getprop {BOOTCOMPLETE_PROP}"), PROBE_SHELL_TIMEOUT) {
                Ok(output) if output.trim() == "1" => return true,
                Ok(_) => {}
                Err(err) => {
                    debug!(serial = %self.serial, error = %err, "boot complete probe failed");
                }
            }
            if Instant::now() + PROBE_POLL_INTERVAL > deadline {
                warn!(serial = %self.serial, "timed out waiting for boot complete");
                return false;
            }
            std::thread::sleep(PROBE_POLL_INTERVAL);
        }
    }

    /// Wait until the device is fully usable: online, booted, and answering
    /// shell commands.
    pub fn wait_for_available(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        if !self.wait_for_online(timeout) {
            return false;
        }
        let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
            return false;
        };
        if !self.wait_for_boot_complete(remaining) {
            return false;
        }
        loop {
            let transport = self.slot.current();
            if let Ok(output) = transport.shell("echo ready", PROBE_SHELL_TIMEOUT) {
                if output.contains("ready") {
                    return true;
                }
            }
            if Instant::now() + PROBE_POLL_INTERVAL > deadline {
                warn!(serial = %self.serial, "timed out waiting for responsive shell");
                return false;
            }
            std::thread::sleep(PROBE_POLL_INTERVAL);
        }
    }

    pub fn wait_for_available_default(&self) -> bool {
        self.wait_for_available(self.default_available_timeout())
    }
}
