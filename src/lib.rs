pub mod harness;

pub use harness::artifacts::{normalize_screenshot, parse_raw_screencap, png_data_url, RawImage};
pub use harness::config::{load_config, save_config, HarnessOptions};
pub use harness::device::allocation::{
    next_allocation_state, AllocationEventResponse, AllocationMonitor, AllocationState,
    DeviceEvent,
};
pub use harness::device::recovery::{DeviceRecovery, RecoveryMode, WaitRecovery};
pub use harness::device::state::{ConnectivityState, DeviceStateMonitor};
pub use harness::device::ManagedDevice;
pub use harness::error::{DeviceError, SyncErrorCode, TransportError};
pub use harness::logging::{init_logging, init_logging_with_level};
pub use harness::models::{
    CommandResult, CommandStatus, DeviceHandle, DeviceKind, MountPointInfo, RemoteFileEntry,
    UserInfo,
};
pub use harness::transport::fastboot::{BootloaderChannel, FastbootChannel};
pub use harness::transport::{AdbTransport, Transport, TransportSlot};
