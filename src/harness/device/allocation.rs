use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Fleet-scheduler-facing availability of one device. Fully independent of
/// connectivity state; driven only by scheduler and connection events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllocationState {
    Unknown,
    Ignored,
    Available,
    Unavailable,
    Allocated,
    CheckingAvailability,
}

/// Events that can move a device between allocation states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceEvent {
    ConnectedOnline,
    ConnectedOffline,
    StateChangeOnline,
    StateChangeOffline,
    Disconnected,
    ForceAvailable,
    AvailableCheckPassed,
    AvailableCheckFailed,
    AvailableCheckIgnored,
    AllocateRequest,
    ForceAllocateRequest,
    FreeAvailable,
    FreeUnresponsive,
    FreeUnavailable,
    FreeUnknown,
}

/// Pure transition function: `next = f(current, event)`. Unhandled events
/// leave the state unchanged.
pub fn next_allocation_state(current: AllocationState, event: DeviceEvent) -> AllocationState {
    use AllocationState::*;
    use DeviceEvent::*;

    // Force events behave the same from every non-terminal state.
    match event {
        ForceAllocateRequest => return Allocated,
        ForceAvailable => return Available,
        _ => {}
    }

    match current {
        Unknown => match event {
            ConnectedOnline | StateChangeOnline => CheckingAvailability,
            ConnectedOffline | StateChangeOffline => Unavailable,
            _ => Unknown,
        },
        CheckingAvailability => match event {
            AvailableCheckPassed => Available,
            AvailableCheckFailed => Unavailable,
            AvailableCheckIgnored => Ignored,
            Disconnected => Unknown,
            _ => CheckingAvailability,
        },
        Available => match event {
            AllocateRequest => Allocated,
            StateChangeOffline => Unavailable,
            Disconnected => Unknown,
            _ => Available,
        },
        Allocated => match event {
            FreeAvailable => Available,
            FreeUnavailable | FreeUnresponsive => Unavailable,
            FreeUnknown => Unknown,
            // A disconnect while allocated does not free the device; the
            // owning invocation decides what to do when it gives it back.
            _ => Allocated,
        },
        Unavailable => match event {
            Disconnected => Unknown,
            _ => Unavailable,
        },
        Ignored => match event {
            Disconnected => Unknown,
            _ => Ignored,
        },
    }
}

/// Listener informed of committed allocation transitions, outside the lock.
pub trait AllocationMonitor: Send + Sync {
    fn notify_state_change(
        &self,
        serial: &str,
        old_state: AllocationState,
        new_state: AllocationState,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationEventResponse {
    pub state: AllocationState,
    pub changed: bool,
}

/// Owns the allocation state of one device under its own lock, distinct from
/// every connectivity lock: allocation events arrive from a scheduler thread
/// while connectivity events arrive from a device I/O thread.
pub struct AllocationTracker {
    serial: String,
    state: Mutex<AllocationState>,
    monitor: Option<Arc<dyn AllocationMonitor>>,
}

impl AllocationTracker {
    pub fn new(serial: impl Into<String>, monitor: Option<Arc<dyn AllocationMonitor>>) -> Self {
        Self {
            serial: serial.into(),
            state: Mutex::new(AllocationState::Unknown),
            monitor,
        }
    }

    pub fn current_state(&self) -> AllocationState {
        *self.state.lock().expect("allocation lock poisoned")
    }

    /// Process one event. The transition is computed and committed under the
    /// allocation lock; the monitor is notified strictly after commit, never
    /// inside the lock.
    pub fn handle_event(&self, event: DeviceEvent) -> AllocationEventResponse {
        let (old_state, new_state) = {
            let mut guard = self.state.lock().expect("allocation lock poisoned");
            let old_state = *guard;
            let new_state = next_allocation_state(old_state, event);
            if new_state != old_state {
                *guard = new_state;
            }
            (old_state, new_state)
        };
        let changed = old_state != new_state;
        if changed {
            debug!(
                serial = %self.serial,
                old = ?old_state,
                new = ?new_state,
                event = ?event,
                "allocation state changed"
            );
            if let Some(monitor) = &self.monitor {
                monitor.notify_state_change(&self.serial, old_state, new_state);
            }
        }
        AllocationEventResponse {
            state: new_state,
            changed,
        }
    }
}
