//! apt/dpkg package management.
//!
//! Every apt invocation is non-interactive and keeps existing conffiles, so
//! an upgrade never stops on a debconf prompt or a config-file question.

use crate::command::CommandArgs;
use crate::host::Host;
use anyhow::Context;
use std::fs::OpenOptions;
use std::path::Path;
use std::time::{Duration, SystemTime};
use tracing::info;

/// Touched after every successful `apt-get update`
pub const APT_UPDATE_STAMP: &str = "/var/lib/apt/periodic/update-success-stamp";

/// Package lists younger than this are not refreshed again
pub const LISTS_MAX_AGE: Duration = Duration::from_secs(60 * 60);

fn apt_env() -> Vec<(String, String)> {
    vec![("DEBIAN_FRONTEND".to_string(), "noninteractive".to_string())]
}

fn keep_conffiles() -> Vec<String> {
    vec![
        "-o".to_string(),
        "Dpkg::Options::=--force-confdef".to_string(),
        "-o".to_string(),
        "Dpkg::Options::=--force-confold".to_string(),
    ]
}

/// `apt-get update`
#[derive(Debug, Clone, Copy, Default)]
pub struct AptUpdate;

impl CommandArgs for AptUpdate {
    fn program(&self) -> &'static str {
        "apt-get"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["update".to_string()]
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        apt_env()
    }
}

/// `apt-get -y full-upgrade`, or `apt-get -s full-upgrade` when simulating
#[derive(Debug, Clone, Copy, Default)]
pub struct AptUpgrade {
    pub simulate: bool,
}

impl CommandArgs for AptUpgrade {
    fn program(&self) -> &'static str {
        "apt-get"
    }

    fn to_cli_args(&self) -> Vec<String> {
        if self.simulate {
            return vec!["-s".to_string(), "full-upgrade".to_string()];
        }
        let mut args = vec!["-y".to_string()];
        args.extend(keep_conffiles());
        args.push("full-upgrade".to_string());
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        apt_env()
    }

    fn is_read_only(&self) -> bool {
        self.simulate
    }
}

/// `apt-get -y install <packages..>`
#[derive(Debug, Clone, Default)]
pub struct AptInstall {
    pub packages: Vec<String>,
}

impl CommandArgs for AptInstall {
    fn program(&self) -> &'static str {
        "apt-get"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["-y".to_string()];
        args.extend(keep_conffiles());
        args.push("install".to_string());
        args.extend(self.packages.iter().cloned());
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        apt_env()
    }
}

/// `apt-get -y -f install`: repair unmet dependencies
#[derive(Debug, Clone, Copy, Default)]
pub struct AptFixBroken;

impl CommandArgs for AptFixBroken {
    fn program(&self) -> &'static str {
        "apt-get"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-y".to_string(), "-f".to_string(), "install".to_string()]
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        apt_env()
    }
}

/// `dpkg --configure -a`: finish interrupted installs
#[derive(Debug, Clone, Copy, Default)]
pub struct DpkgConfigure;

impl CommandArgs for DpkgConfigure {
    fn program(&self) -> &'static str {
        "dpkg"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["--configure".to_string(), "-a".to_string()]
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        apt_env()
    }
}

/// `dpkg-query -W -f=${Status} <package>`
#[derive(Debug, Clone)]
pub struct DpkgQuery {
    pub package: String,
}

impl CommandArgs for DpkgQuery {
    fn program(&self) -> &'static str {
        "dpkg-query"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-W".to_string(),
            "-f=${Status}".to_string(),
            self.package.clone(),
        ]
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

/// Reject names that could be mistaken for options or carry shell syntax.
pub fn is_valid_package_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '-' | ':' | '_'))
}

pub fn is_installed(host: &Host<'_>, package: &str) -> bool {
    host.output(&DpkgQuery {
        package: package.to_string(),
    })
    .map(|o| o.success && o.stdout.trim() == "install ok installed")
    .unwrap_or(false)
}

pub fn missing_packages(host: &Host<'_>, packages: &[String]) -> Vec<String> {
    packages
        .iter()
        .filter(|p| !is_installed(host, p))
        .cloned()
        .collect()
}

/// Whether `stamp` was modified within `max_age`.
pub fn updated_within(stamp: &Path, max_age: Duration) -> bool {
    std::fs::metadata(stamp)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|modified| SystemTime::now().duration_since(modified).ok())
        .is_some_and(|age| age <= max_age)
}

/// Mark the package lists as refreshed now. `apt-get update` leaves its
/// caches untouched when no list changed, so the stamp is written here.
pub fn record_update(stamp: &Path) -> std::io::Result<()> {
    if let Some(parent) = stamp.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = OpenOptions::new().create(true).append(true).open(stamp)?;
    file.set_modified(SystemTime::now())
}

/// Whether a full upgrade would install or remove anything.
pub fn upgrade_pending(host: &Host<'_>) -> anyhow::Result<bool> {
    let output = host.output(&AptUpgrade { simulate: true })?;
    output.ensure_success("apt-get -s full-upgrade")?;
    Ok(output
        .stdout
        .lines()
        .any(|l| l.starts_with("Inst ") || l.starts_with("Remv ")))
}

/// Install whatever in `packages` is not installed yet.
pub fn install_missing(host: &Host<'_>, packages: &[String]) -> anyhow::Result<()> {
    let missing = missing_packages(host, packages);
    if missing.is_empty() {
        return Ok(());
    }
    info!("Installing {} package(s): {}", missing.len(), missing.join(" "));
    host.exec(&AptInstall { packages: missing })
        .context("package installation failed")?;
    Ok(())
}

/// Bring dpkg and apt back to a consistent state after an interrupted or
/// conflicting transaction. Used as the recovery action of apt steps.
pub fn repair(host: &Host<'_>) -> anyhow::Result<()> {
    host.exec(&DpkgConfigure).context("dpkg --configure -a failed")?;
    host.exec(&AptFixBroken).context("apt-get -f install failed")?;
    Ok(())
}
