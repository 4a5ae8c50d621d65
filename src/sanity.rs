//! Pre-flight sanity checks for the runtime environment
//!
//! Verifies before any step runs:
//! - Required runtime binaries are present
//! - Whether the process is elevated (warning only: a non-root run can
//!   still refresh dotfiles, and apt steps fail as advisory)

use crate::process_guard::CommandProcessGroup;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Result of environment verification
#[derive(Debug)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    /// True when nothing required is missing. Root is not required.
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty()
    }
}

/// Required runtime binaries
const REQUIRED_BINARIES: &[&str] = &[
    "apt-get", // Package management
    "git",     // Tool checkouts
    "curl",    // Downloads
];

/// Optional binaries (warn if missing but don't fail)
const OPTIONAL_BINARIES: &[&str] = &[
    "visudo",       // Sudoers validation (sudo package)
    "runuser",      // Running as the target user (util-linux)
    "ssh-keygen",   // SSH key (openssh-client)
    "xfconf-query", // Xfce settings
    "gsettings",    // GNOME settings
    "systemctl",    // Services
];

/// Check if a binary is available in PATH
pub fn binary_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .in_new_process_group()
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Check if running as root (EUID 0)
pub fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

/// Perform all sanity checks and return the result
pub fn verify_environment() -> SanityCheckResult {
    let missing = REQUIRED_BINARIES
        .iter()
        .filter(|b| !binary_exists(b))
        .map(|b| (*b).to_string())
        .collect();

    for binary in OPTIONAL_BINARIES {
        if !binary_exists(binary) {
            debug!("Optional binary not found: {}", binary);
        }
    }

    SanityCheckResult {
        missing_binaries: missing,
        is_root: is_running_as_root(),
    }
}

/// Map binary names to their Debian package names
fn get_package_for_binary(binary: &str) -> &'static str {
    match binary {
        "apt-get" => "apt",
        "git" => "git",
        "curl" => "curl",
        _ => "unknown",
    }
}

/// Print a pre-flight failure banner to stderr
pub fn print_error(result: &SanityCheckResult) {
    eprintln!();
    eprintln!("╔══════════════════════════════════════════════════════════════════╗");
    eprintln!("║                vmsetup - Pre-flight Check Failed                 ║");
    eprintln!("╚══════════════════════════════════════════════════════════════════╝");
    eprintln!();
    eprintln!("❌ ERROR: Missing required binaries");
    eprintln!();
    for binary in &result.missing_binaries {
        eprintln!(
            "   • {} (install: apt-get install {})",
            binary,
            get_package_for_binary(binary)
        );
    }
    eprintln!();
}

/// Verify the environment; returns false when a required binary is missing.
pub fn run_preflight_checks() -> bool {
    debug!("Running pre-flight sanity checks...");

    let result = verify_environment();

    if !result.is_root {
        warn!("Not running as root: package, service and sudoers steps will fail");
    }

    if !result.is_ok() {
        print_error(&result);
        return false;
    }

    info!("Pre-flight checks passed: root={}", result.is_root);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_exists_nonexistent() {
        assert!(!binary_exists("this_binary_definitely_does_not_exist_12345"));
    }

    #[test]
    fn test_package_mapping() {
        assert_eq!(get_package_for_binary("apt-get"), "apt");
        assert_eq!(get_package_for_binary("curl"), "curl");
        assert_eq!(get_package_for_binary("frobnicate"), "unknown");
    }

    #[test]
    fn test_sanity_result_ignores_root() {
        let not_root = SanityCheckResult {
            missing_binaries: vec![],
            is_root: false,
        };
        assert!(not_root.is_ok());

        let missing = SanityCheckResult {
            missing_binaries: vec!["git".to_string()],
            is_root: true,
        };
        assert!(!missing.is_ok());
    }
}
