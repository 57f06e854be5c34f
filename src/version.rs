use std::path::Path;

use anyhow::{Context, Result, bail};
use semver::Version;

use crate::error::SyncError;
use crate::remote::{Executor, run_checked};

/// Version of this build.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Install location on the target, relative to the remote home directory.
pub const REMOTE_BINARY: &str = ".local/bin/snapsync";

/// What has to happen to the target's installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionAction {
    UpToDate,
    Install,
    Upgrade { from: Version },
}

/// Parse `snapsync 1.2.3` (the `--version` output).
pub fn parse_version_output(output: &str) -> Option<Version> {
    output
        .split_whitespace()
        .find_map(|word| Version::parse(word.trim_start_matches('v')).ok())
}

/// Decide how to bring the target in line with `source`. A newer target is
/// refused outright.
pub fn decide(source: &Version, target: Option<&Version>) -> Result<VersionAction> {
    match target {
        None => Ok(VersionAction::Install),
        Some(t) if t == source => Ok(VersionAction::UpToDate),
        Some(t) if t < source => Ok(VersionAction::Upgrade { from: t.clone() }),
        Some(t) => Err(SyncError::TargetNewer {
            source_version: source.to_string(),
            target_version: t.to_string(),
        }
        .into()),
    }
}

pub async fn installed_version(target: &dyn Executor) -> Result<Option<Version>> {
    let result = target
        .run(&format!("\"$HOME/{REMOTE_BINARY}\" --version"), None)
        .await?;
    if !result.success() {
        return Ok(None);
    }
    Ok(parse_version_output(&result.stdout))
}

/// Make the target run exactly this build's version, copying `binary` over
/// when it is missing or older.
pub async fn ensure_target_version(target: &dyn Executor, binary: &Path) -> Result<VersionAction> {
    let source = Version::parse(VERSION).context("invalid crate version")?;
    let current = installed_version(target).await?;
    let action = decide(&source, current.as_ref())?;
    if action == VersionAction::UpToDate {
        return Ok(action);
    }

    tracing::info!(?action, version = VERSION, "installing snapsync on target");
    run_checked(target, "mkdir -p \"$HOME/.local/bin\"").await?;
    let staging = format!("{REMOTE_BINARY}.new");
    target
        .send_file(binary, &staging)
        .await
        .context("failed to transfer snapsync binary")?;
    run_checked(
        target,
        &format!("chmod 755 \"$HOME/{staging}\" && mv -f \"$HOME/{staging}\" \"$HOME/{REMOTE_BINARY}\""),
    )
    .await?;

    match installed_version(target).await? {
        Some(v) if v == source => Ok(action),
        other => bail!(
            "target reports version {} after install, expected {VERSION}",
            other.map(|v| v.to_string()).unwrap_or_else(|| "none".into())
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn parses_version_line() {
        assert_eq!(parse_version_output("snapsync 0.3.1\n"), Some(v("0.3.1")));
        assert_eq!(parse_version_output("snapsync v1.0.0"), Some(v("1.0.0")));
        assert_eq!(parse_version_output("command not found"), None);
    }

    #[test]
    fn decides_install_upgrade_or_refuse() {
        let source = v("1.2.0");
        assert_eq!(decide(&source, None).unwrap(), VersionAction::Install);
        assert_eq!(decide(&source, Some(&v("1.2.0"))).unwrap(), VersionAction::UpToDate);
        assert_eq!(
            decide(&source, Some(&v("1.1.9"))).unwrap(),
            VersionAction::Upgrade { from: v("1.1.9") }
        );
        let err = decide(&source, Some(&v("2.0.0"))).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<SyncError>(),
            Some(SyncError::TargetNewer { .. })
        ));
    }
}
