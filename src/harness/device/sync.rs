//! Incremental directory sync onto the device.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{NaiveDateTime, TimeZone, Utc};
use tracing::{debug, warn};

use crate::harness::device::ManagedDevice;
use crate::harness::error::{DeviceError, TransportError};
use crate::harness::models::RemoteFileEntry;

/// Grace window absorbing clock skew between host and device. A local file is
/// only considered up to date on the device when it is at least this much
/// older than the remote copy.
const SKEW_GRACE_SECONDS: i64 = 60;
/// Device listings carry minute-granularity GMT timestamps.
const REMOTE_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M";

/// Whether the local file should be pushed over the remote entry.
///
/// Missing or unparseable remote timestamps always push: transferring an
/// unchanged file is cheap, skipping a changed one corrupts the test run.
pub fn is_newer(local_modified: SystemTime, remote_timestamp: Option<&str>) -> bool {
    let Some(stamp) = remote_timestamp else {
        return true;
    };
    let Ok(naive) = NaiveDateTime::parse_from_str(stamp.trim(), REMOTE_TIMESTAMP_FORMAT) else {
        return true;
    };
    let remote = Utc.from_utc_datetime(&naive);
    let local: chrono::DateTime<Utc> = local_modified.into();
    local > remote - chrono::Duration::seconds(SKEW_GRACE_SECONDS)
}

impl ManagedDevice {
    /// Incrementally sync a local directory into `remote_root`.
    ///
    /// The local directory lands as `<remote_root>/<dirname>`. Only files
    /// that are new or newer than their remote counterpart are transferred;
    /// hidden files are skipped. Files are pushed in one batch per directory
    /// level, parents strictly before their contents. `Ok(false)` means a
    /// logical failure (unreadable local tree, or a non-transient transfer
    /// error).
    pub fn sync_files(&self, local_dir: &Path, remote_root: &str) -> Result<bool, DeviceError> {
        let Some(name) = local_dir.file_name() else {
            warn!(serial = %self.serial(), path = %local_dir.display(), "not a syncable directory");
            return Ok(false);
        };
        let remote_dir = format!(
            "{}/{}",
            remote_root.trim_end_matches('/'),
            name.to_string_lossy()
        );
        self.execute_shell_command(&format!("mkdir -p {remote_dir}"))?;
        self.sync_dir(local_dir, &remote_dir)
    }

    fn sync_dir(&self, local_dir: &Path, remote_dir: &str) -> Result<bool, DeviceError> {
        let remote_entries = self.list_remote_entries(remote_dir)?;

        let mut local_children: Vec<fs::DirEntry> = match fs::read_dir(local_dir) {
            Ok(reader) => match reader.collect::<Result<_, _>>() {
                Ok(children) => children,
                Err(err) => {
                    warn!(serial = %self.serial(), error = %err, "unreadable local directory");
                    return Ok(false);
                }
            },
            Err(err) => {
                warn!(serial = %self.serial(), error = %err, "unreadable local directory");
                return Ok(false);
            }
        };
        local_children.sort_by_key(fs::DirEntry::file_name);

        let mut to_push: Vec<PathBuf> = Vec::new();
        let mut subdirs: Vec<(PathBuf, String)> = Vec::new();
        for child in local_children {
            let file_name = child.file_name().to_string_lossy().to_string();
            if file_name.starts_with('.') {
                continue;
            }
            let Ok(metadata) = child.metadata() else {
                warn!(serial = %self.serial(), file = %file_name, "unreadable local entry");
                return Ok(false);
            };
            let remote_child = format!("{remote_dir}/{file_name}");
            if metadata.is_dir() {
                if !remote_entries.contains_key(&file_name) {
                    self.execute_shell_command(&format!("mkdir -p {remote_child}"))?;
                }
                subdirs.push((child.path(), remote_child));
            } else {
                let local_modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
                let remote_stamp = remote_entries
                    .get(&file_name)
                    .and_then(|entry| entry.modified_at.as_deref());
                if remote_entries.contains_key(&file_name)
                    && !is_newer(local_modified, remote_stamp)
                {
                    debug!(serial = %self.serial(), file = %file_name, "up to date, skipping");
                    continue;
                }
                to_push.push(child.path());
            }
        }

        if !to_push.is_empty() && !self.push_batch(&to_push, remote_dir)? {
            return Ok(false);
        }
        for (local_sub, remote_sub) in subdirs {
            if !self.sync_dir(&local_sub, &remote_sub)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn list_remote_entries(
        &self,
        remote_dir: &str,
    ) -> Result<BTreeMap<String, RemoteFileEntry>, DeviceError> {
        let description = format!("list {remote_dir}");
        let slot = std::sync::Arc::clone(self.transport_slot());
        let timeout = self.command_timeout();
        let mut listing: Option<Vec<RemoteFileEntry>> = None;
        let mut action = || -> Result<bool, TransportError> {
            let transport = slot.current();
            listing = Some(transport.list_dir(remote_dir, timeout)?);
            Ok(true)
        };
        if !self.perform_device_action(&description, &mut action)? {
            return Err(DeviceError::unresponsive(self.serial(), description));
        }
        Ok(listing
            .unwrap_or_default()
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect())
    }

    fn push_batch(&self, local_paths: &[PathBuf], remote_dir: &str) -> Result<bool, DeviceError> {
        let description = format!("push {} files to {remote_dir}", local_paths.len());
        let slot = std::sync::Arc::clone(self.transport_slot());
        let timeout = self.command_timeout();
        let mut action = || -> Result<bool, TransportError> {
            let transport = slot.current();
            transport.push(local_paths, remote_dir, timeout)?;
            Ok(true)
        };
        self.perform_device_action(&description, &mut action)
    }
}
