//! btrfs and df command lines, and parsers for their output.

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDateTime, Utc};

use crate::remote::quote;

/// Timestamp format used in snapshot and session directory names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S";

/// Directory under the snapshot root that holds this tool's sessions.
pub const SESSIONS_DIR: &str = "snapsync";

pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// Mount point of a top-level subvolume: `@` is `/`, `@home` is `/home`.
pub fn mount_point(subvolume: &str) -> String {
    match subvolume.strip_prefix('@') {
        Some("") => "/".to_string(),
        Some(rest) => format!("/{rest}"),
        None => format!("/{subvolume}"),
    }
}

pub fn filesystem_type(path: &str) -> String {
    format!("stat -f -c %T {}", quote(path))
}

pub fn list_subvolumes(path: &str) -> String {
    format!("sudo btrfs subvolume list {}", quote(path))
}

pub fn show_subvolume(path: &str) -> String {
    format!("sudo btrfs subvolume show {}", quote(path))
}

pub fn create_subvolume(path: &str) -> String {
    format!("sudo btrfs subvolume create {}", quote(path))
}

pub fn snapshot(source: &str, dest: &str, readonly: bool) -> String {
    let flag = if readonly { " -r" } else { "" };
    format!(
        "sudo btrfs subvolume snapshot{flag} {} {}",
        quote(source),
        quote(dest)
    )
}

pub fn delete_subvolume(path: &str) -> String {
    format!("sudo btrfs subvolume delete {}", quote(path))
}

pub fn free_space(path: &str) -> String {
    format!("df -B1 --output=size,avail {}", quote(path))
}

/// Names of subvolumes whose parent is the filesystem top level (id 5).
///
/// Input is `btrfs subvolume list` output:
/// `ID 256 gen 1234 top level 5 path @home`.
pub fn parse_top_level_subvolumes(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let (head, path) = line.split_once(" path ")?;
            let mut words = head.split_whitespace();
            let top = words.by_ref().skip_while(|w| *w != "level").nth(1)?;
            (top == "5" && !path.contains('/')).then(|| path.trim().to_string())
        })
        .collect()
}

/// `(total, available)` bytes from `df -B1 --output=size,avail`.
pub fn parse_free_space(output: &str) -> Result<(u64, u64)> {
    let line = output
        .lines()
        .filter(|l| !l.trim().is_empty())
        .nth(1)
        .context("df output has no data line")?;
    let mut fields = line.split_whitespace();
    let total = fields
        .next()
        .context("missing size column")?
        .parse()
        .context("invalid size column")?;
    let avail = fields
        .next()
        .context("missing avail column")?
        .parse()
        .context("invalid avail column")?;
    Ok((total, avail))
}

/// Block device backing `/`, from `findmnt -n -o SOURCE /` output such as
/// `/dev/nvme0n1p2[/@]`.
pub fn parse_root_device(output: &str) -> Result<String> {
    let source = output.trim();
    let device = source.split('[').next().unwrap_or_default().trim();
    if !device.starts_with('/') {
        bail!("cannot determine root device from '{source}'");
    }
    Ok(device.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn mount_points() {
        assert_eq!(mount_point("@"), "/");
        assert_eq!(mount_point("@home"), "/home");
        assert_eq!(mount_point("data"), "/data");
    }

    #[test]
    fn timestamps_round_trip() {
        let ts = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();
        let s = format_timestamp(ts);
        assert_eq!(s, "20250304T050607");
        assert_eq!(parse_timestamp(&s), Some(ts));
        assert_eq!(parse_timestamp("garbage"), None);
    }

    #[test]
    fn top_level_subvolumes_only() {
        let out = "ID 256 gen 10 top level 5 path @\n\
                   ID 257 gen 11 top level 5 path @home\n\
                   ID 300 gen 12 top level 256 path var/lib/machines\n\
                   ID 301 gen 13 top level 5 path .snapshots/snapsync/x/pre-@-1\n";
        assert_eq!(parse_top_level_subvolumes(out), vec!["@", "@home"]);
    }

    #[test]
    fn free_space_columns() {
        let out = "     1B-blocks        Avail\n 1000000000000 250000000000\n";
        assert_eq!(parse_free_space(out).unwrap(), (1_000_000_000_000, 250_000_000_000));
        assert!(parse_free_space("header only\n").is_err());
    }

    #[test]
    fn root_device() {
        assert_eq!(parse_root_device("/dev/sda2[/@]\n").unwrap(), "/dev/sda2");
        assert!(parse_root_device("overlay").is_err());
    }

    #[test]
    fn snapshot_command_quotes_paths() {
        assert_eq!(
            snapshot("/home", "/.snapshots/snapsync/a b/pre-@home-1", true),
            "sudo btrfs subvolume snapshot -r /home '/.snapshots/snapsync/a b/pre-@home-1'"
        );
    }
}
