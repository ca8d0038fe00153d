use std::collections::HashSet;

use regex::Regex;

use crate::harness::models::{MountPointInfo, UserInfo};

/// Parse available space from modern coreutils/toybox `df` output:
/// `/dev/fuse 11585536 1316348 10269188 12% /mnt/shell/emulated`.
/// Returns kilobytes, or `None` if the output does not match.
pub fn parse_free_space_from_modern_output(df_output: &str) -> Option<u64> {
    let pattern = Regex::new(r"(?m)^[/a-z]+\s+\d+\s+\d+\s+(\d+)\s+\d+%\s+[/a-z]+$")
        .expect("static regex");
    pattern
        .captures(df_output)
        .and_then(|caps| caps[1].parse::<u64>().ok())
}

/// Parse available space from the pre-gingerbread toolbox format:
/// `/data: 15659168K total, 51584K used, 15607584K available (block size 32768)`.
pub fn parse_free_space_from_available(df_output: &str) -> Option<u64> {
    let pattern = Regex::new(r"(\d+)K available").expect("static regex");
    pattern
        .captures(df_output)
        .and_then(|caps| caps[1].parse::<u64>().ok())
}

/// Parse available space from the table-formatted toolbox output used between
/// gingerbread and lollipop:
/// `Filesystem  Size  Used  Free  Blksize` / `/sdcard  3G  790M  2G  4096`.
/// The unit suffix is scaled to kilobytes.
pub fn parse_free_space_from_free(external_store_path: &str, df_output: &str) -> Option<u64> {
    let pattern = Regex::new(&format!(
        r"{}\s+[\w\d\.]+\s+[\w\d\.]+\s+([\d\.]+)(\w)",
        regex::escape(external_store_path)
    ))
    .ok()?;
    let caps = pattern.captures(df_output)?;
    let value: f64 = caps[1].parse().ok()?;
    let scaled = match &caps[2] {
        "M" => value * 1024.0,
        "G" => value * 1024.0 * 1024.0,
        _ => value,
    };
    Some(scaled as u64)
}

/// Parse `cat /proc/mounts` rows, dropping the trailing dump/pass fields.
/// Short rows are skipped.
pub fn parse_mount_points(mount_output: &str) -> Vec<MountPointInfo> {
    mount_output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.splitn(5, char::is_whitespace).collect();
            if parts.len() < 4 {
                return None;
            }
            Some(MountPointInfo {
                filesystem: parts[0].to_string(),
                mountpoint: parts[1].to_string(),
                fs_type: parts[2].to_string(),
                options: parts[3].to_string(),
            })
        })
        .collect()
}

/// Tokenize `pm list users` output into user records.
///
/// Fail-closed: any malformed line (including a bad header) aborts the whole
/// parse, because a partial user list is unsafe for a scheduler to act on.
/// Expected row shape: `\tUserInfo{<id>:<name>:<flags hex>} [running]`.
pub fn parse_list_users(output: &str) -> Option<Vec<UserInfo>> {
    let mut lines = output.lines();
    if lines.next()?.trim_end() != "Users:" {
        return None;
    }
    let mut users = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let tokens: Vec<&str> = line.split(['{', '}', ':']).collect();
        if tokens.len() != 4 && tokens.len() != 5 {
            return None;
        }
        let id = tokens[1].parse::<i32>().ok()?;
        let flags = u32::from_str_radix(tokens[3].trim(), 16).ok()?;
        let running = tokens
            .get(4)
            .map(|tail| tail.contains("running"))
            .unwrap_or(false);
        users.push(UserInfo {
            id,
            name: tokens[2].to_string(),
            flags,
            running,
        });
    }
    Some(users)
}

/// Extract package names from `pm list packages -f` output
/// (`package:<apk path>=<name>` rows).
pub fn parse_installed_packages(output: &str) -> HashSet<String> {
    let pattern = Regex::new(r"package:(.*)=(.*)").expect("static regex");
    pattern
        .captures_iter(output)
        .map(|caps| caps[2].trim().to_string())
        .collect()
}

/// Whether `dumpsys input` reports the input dispatcher as ready. `None` means
/// the platform does not emit the line at all (unsupported API level).
pub fn parse_input_dispatch_ready(output: &str) -> Option<bool> {
    let pattern = Regex::new(r"DispatchEnabled:\s?([01])").expect("static regex");
    pattern.captures(output).map(|caps| &caps[1] == "1")
}

/// Parse the trailing id from a `Success: created user id 10` style reply.
pub fn parse_trailing_int(output: &str) -> Option<i32> {
    output
        .trim_end()
        .rsplit(char::is_whitespace)
        .next()?
        .parse::<i32>()
        .ok()
}

/// `"200 <token> -1"` — the disk-crypto service reports the password was
/// already accepted.
pub fn vdc_reply_already_accepted(output: &str) -> bool {
    let trimmed = output.trim();
    trimmed.starts_with("200 ") && trimmed.ends_with(" -1")
}

/// `"200 <token> 0"` — the disk-crypto service reports success.
pub fn vdc_reply_success(output: &str) -> bool {
    let trimmed = output.trim();
    trimmed.starts_with("200 ") && trimmed.ends_with(" 0")
}
