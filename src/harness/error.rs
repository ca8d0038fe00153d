use serde::Serialize;
use std::fmt;

/// Error codes reported by the file sync channel.
///
/// Only a subset of these indicate a transient channel problem worth a
/// recovery cycle; the set of transient codes is configurable policy, see
/// `HarnessOptions::sync`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
pub enum SyncErrorCode {
    BufferOverrun,
    TransferProtocolError,
    FileReadError,
    FileWriteError,
    RemoteNoDirectory,
    RemoteIsFile,
    Canceled,
    Unknown,
}

impl fmt::Display for SyncErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SyncErrorCode::BufferOverrun => "BUFFER_OVERRUN",
            SyncErrorCode::TransferProtocolError => "TRANSFER_PROTOCOL_ERROR",
            SyncErrorCode::FileReadError => "FILE_READ_ERROR",
            SyncErrorCode::FileWriteError => "FILE_WRITE_ERROR",
            SyncErrorCode::RemoteNoDirectory => "REMOTE_NO_DIRECTORY",
            SyncErrorCode::RemoteIsFile => "REMOTE_IS_FILE",
            SyncErrorCode::Canceled => "CANCELED",
            SyncErrorCode::Unknown => "UNKNOWN",
        };
        write!(f, "{label}")
    }
}

/// The closed set of failures a device action may raise.
///
/// Raising one of these marks the attempt as a retry candidate; returning
/// `Ok(false)` from the action instead marks a logical failure that must not
/// be retried. `Sync` errors get a second look: only codes in the configured
/// transient allow-list are actually retried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TransportError {
    /// Command did not complete within its deadline.
    Timeout,
    /// The command channel refused the command.
    Rejected(String),
    /// The shell stopped producing output mid-command.
    Unresponsive,
    /// Channel-level I/O failure.
    Io(String),
    /// Package install/uninstall failure string from the device.
    Install(String),
    /// File sync failure with its channel error code.
    Sync(SyncErrorCode, String),
}

impl TransportError {
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Timeout => "Timeout",
            TransportError::Rejected(_) => "Rejected",
            TransportError::Unresponsive => "Unresponsive",
            TransportError::Io(_) => "Io",
            TransportError::Install(_) => "Install",
            TransportError::Sync(..) => "Sync",
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "command timed out"),
            TransportError::Rejected(msg) => write!(f, "command rejected: {msg}"),
            TransportError::Unresponsive => write!(f, "shell stopped responding"),
            TransportError::Io(msg) => write!(f, "channel i/o failure: {msg}"),
            TransportError::Install(msg) => write!(f, "install failure: {msg}"),
            TransportError::Sync(code, msg) => write!(f, "sync failure ({code}): {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Fatal errors surfaced to the harness scheduler.
///
/// These abort the current device operation; the scheduler is expected to mark
/// the device unavailable rather than continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum DeviceError {
    /// Recovery could not restore connectivity.
    NotAvailable { serial: String },
    /// The retry budget was exhausted without communication success.
    Unresponsive { serial: String, action: String },
    /// Operation invoked on a platform that does not support it. Raised
    /// eagerly, before any device I/O.
    Unsupported { serial: String, operation: String },
    /// Invalid options or persisted configuration.
    Config(String),
}

impl DeviceError {
    pub fn not_available(serial: impl Into<String>) -> Self {
        DeviceError::NotAvailable {
            serial: serial.into(),
        }
    }

    pub fn unresponsive(serial: impl Into<String>, action: impl Into<String>) -> Self {
        DeviceError::Unresponsive {
            serial: serial.into(),
            action: action.into(),
        }
    }

    pub fn unsupported(serial: impl Into<String>, operation: impl Into<String>) -> Self {
        DeviceError::Unsupported {
            serial: serial.into(),
            operation: operation.into(),
        }
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceError::NotAvailable { serial } => {
                write!(f, "device {serial} is not available")
            }
            DeviceError::Unresponsive { serial, action } => write!(
                f,
                "attempted {action} multiple times on device {serial} without communication success"
            ),
            DeviceError::Unsupported { serial, operation } => {
                write!(f, "device {serial} does not support {operation}")
            }
            DeviceError::Config(msg) => write!(f, "configuration error: {msg}"),
        }
    }
}

impl std::error::Error for DeviceError {}
