use clap::Parser;

use crate::catalog::GroupSelection;

/// vmsetup - Idempotent provisioning of a Kali VM
///
/// Installs packages, clones tool repositories, writes dotfiles and desktop
/// settings for the target user. Safe to re-run: completed steps are
/// detected and skipped.
#[derive(Parser, Debug, Default)]
#[command(name = "vmsetup")]
#[command(about = "Idempotent provisioning of a fresh Kali VM")]
#[command(version)]
pub struct Cli {
    /// Install mobile testing tools (adb, apktool, jadx, MobSF)
    #[arg(long)]
    pub mobile: bool,

    /// Install web testing tools (burpsuite, ffuf, nuclei, sqlmap)
    #[arg(long)]
    pub web: bool,

    /// Install internal/AD testing tools (bloodhound, netexec, responder)
    #[arg(long)]
    pub internal: bool,

    /// Install wireless testing tools (aircrack-ng, wifite, hcxtools)
    #[arg(long)]
    pub wifi: bool,

    /// Install every optional tool group
    #[arg(long)]
    pub all: bool,
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl From<&Cli> for GroupSelection {
    fn from(cli: &Cli) -> Self {
        if cli.all {
            return GroupSelection::all();
        }
        GroupSelection {
            mobile: cli.mobile,
            web: cli.web,
            internal: cli.internal,
            wifi: cli.wifi,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_no_args() {
        let cli = Cli::try_parse_from(["vmsetup"]).unwrap();
        assert_eq!(GroupSelection::from(&cli), GroupSelection::default());
    }

    #[test]
    fn test_cli_single_group() {
        let cli = Cli::try_parse_from(["vmsetup", "--web"]).unwrap();
        let groups = GroupSelection::from(&cli);
        assert!(groups.web);
        assert!(!groups.mobile && !groups.internal && !groups.wifi);
    }

    #[test]
    fn test_cli_combined_groups() {
        let cli = Cli::try_parse_from(["vmsetup", "--mobile", "--wifi"]).unwrap();
        let groups = GroupSelection::from(&cli);
        assert!(groups.mobile && groups.wifi);
        assert!(!groups.web && !groups.internal);
    }

    #[test]
    fn test_cli_all_forces_every_group() {
        let cli = Cli::try_parse_from(["vmsetup", "--all", "--web"]).unwrap();
        assert_eq!(GroupSelection::from(&cli), GroupSelection::all());
    }

    #[test]
    fn test_cli_rejects_unknown_flags() {
        assert!(Cli::try_parse_from(["vmsetup", "--dry-run"]).is_err());
        assert!(Cli::try_parse_from(["vmsetup", "install"]).is_err());
    }
}
