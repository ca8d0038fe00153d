use serde::{Deserialize, Serialize};

/// How a device is realized. Lifecycle code branches on capability flags, not
/// on this tag; the tag exists for reporting and for capability defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceKind {
    Native,
    FullStack,
    Emulator,
    Stub,
}

/// Stable identity for one controlled device across reconnects.
///
/// The handle survives transport replacement: when the same serial reconnects
/// with a fresh channel, the handle stays and only the transport is swapped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceHandle {
    pub serial: String,
    pub kind: DeviceKind,
    /// Whether the bootloader channel can reach this device at all.
    pub fastboot_available: bool,
}

impl DeviceHandle {
    pub fn new(serial: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            serial: serial.into(),
            fastboot_available: !matches!(kind, DeviceKind::Emulator | DeviceKind::Stub),
            kind,
        }
    }

    pub fn is_emulator(&self) -> bool {
        matches!(self.kind, DeviceKind::Emulator)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandStatus {
    Success,
    Failed,
    TimedOut,
    Exception,
}

/// Captured outcome of one subprocess invocation on either channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub status: CommandStatus,
}

impl CommandResult {
    pub fn exception(message: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: message.into(),
            exit_code: None,
            status: CommandStatus::Exception,
        }
    }
}

/// One row of the device mount table (`/proc/mounts`), last two fields dropped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountPointInfo {
    pub filesystem: String,
    pub mountpoint: String,
    pub fs_type: String,
    pub options: String,
}

/// One user record parsed from `pm list users`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfo {
    pub id: i32,
    pub name: String,
    pub flags: u32,
    pub running: bool,
}

impl UserInfo {
    const FLAG_PRIMARY: u32 = 1;

    pub fn is_primary(&self) -> bool {
        self.flags & Self::FLAG_PRIMARY != 0
    }
}

/// A remote file entry as reported by the device file listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size_bytes: Option<u64>,
    /// `"YYYY-MM-DD HH:MM"` in device (GMT) time, minute granularity.
    pub modified_at: Option<String>,
}
