//! Provisioning data: what to install, clone, download and configure.
//!
//! The orchestration code never hard-codes a package or URL; everything comes
//! from a [`ProvisionConfig`], either the built-in default catalog or a JSON
//! file named by `VMSETUP_CONFIG`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use crate::collaborators::desktop::DesktopSetting;
use crate::collaborators::package::{APT_UPDATE_STAMP, is_valid_package_name};
use crate::command::DEFAULT_COMMAND_TIMEOUT;
use crate::error::ProvisionError;
use crate::types::{DesktopBackend, StepGroup};

/// Environment variable naming a JSON config file
pub const CONFIG_ENV: &str = "VMSETUP_CONFIG";

/// Placeholder replaced with the target user name in the sudoers template
pub const USER_PLACEHOLDER: &str = "{user}";

/// A git repository checked out under the tools directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    /// Checkout directory name, also used in the step name
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub depth: Option<u32>,
    #[serde(default)]
    pub branch: Option<String>,
}

impl Repository {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            depth: Some(1),
            branch: None,
        }
    }
}

/// A file fetched over HTTP into the tools directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    pub name: String,
    pub url: String,
    /// Path relative to the tools directory
    pub file: PathBuf,
    #[serde(default)]
    pub executable: bool,
}

/// Lines that must be present in one of the target user's dotfiles.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShellProfile {
    /// Path relative to the target's home
    pub file: PathBuf,
    pub lines: Vec<String>,
}

/// Passwordless sudo drop-in for the target user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SudoersDropIn {
    pub path: PathBuf,
    /// Content with `{user}` placeholders
    pub template: String,
}

impl SudoersDropIn {
    pub fn render(&self, user: &str) -> String {
        self.template.replace(USER_PLACEHOLDER, user)
    }
}

/// Packages and checkouts for one optional tool group.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolSet {
    pub packages: Vec<String>,
    pub repositories: Vec<Repository>,
}

/// Full provisioning catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionConfig {
    pub base_packages: Vec<String>,
    /// Directory (relative to the target's home) holding checkouts and downloads
    pub tools_dir: PathBuf,
    pub repositories: Vec<Repository>,
    pub downloads: Vec<Download>,
    pub ssh_key: bool,
    pub shell_profile: Option<ShellProfile>,
    pub desktop: Vec<DesktopSetting>,
    pub services: Vec<String>,
    pub sudoers: Option<SudoersDropIn>,
    pub mobile: ToolSet,
    pub web: ToolSet,
    pub internal: ToolSet,
    pub wifi: ToolSet,
    /// Extra environment for every external command
    pub environment: BTreeMap<String, String>,
    /// Per-command wall-clock limit; 0 disables it
    pub command_timeout_secs: u64,
    /// File whose mtime tells when package lists were last refreshed
    pub apt_cache_stamp: PathBuf,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_string()).collect()
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            base_packages: strings(&[
                "git",
                "curl",
                "zsh",
                "tmux",
                "vim",
                "jq",
                "python3-pip",
                "python3-venv",
                "pipx",
                "golang-go",
                "seclists",
                "gobuster",
                "feroxbuster",
                "flameshot",
            ]),
            tools_dir: PathBuf::from("tools"),
            repositories: vec![
                Repository::new("PEASS-ng", "https://github.com/peass-ng/PEASS-ng.git"),
                Repository::new(
                    "linux-exploit-suggester",
                    "https://github.com/The-Z-Labs/linux-exploit-suggester.git",
                ),
            ],
            downloads: vec![Download {
                name: "pspy64".to_string(),
                url: "https://github.com/DominicBreuker/pspy/releases/latest/download/pspy64"
                    .to_string(),
                file: PathBuf::from("bin/pspy64"),
                executable: true,
            }],
            ssh_key: true,
            shell_profile: Some(ShellProfile {
                file: PathBuf::from(".zshrc"),
                lines: strings(&[
                    "export PATH=\"$HOME/go/bin:$HOME/.local/bin:$HOME/tools/bin:$PATH\"",
                    "export HISTSIZE=100000",
                    "export SAVEHIST=100000",
                    "alias ll='ls -lah'",
                ]),
            }),
            desktop: vec![
                DesktopSetting::new(
                    DesktopBackend::Xfconf,
                    "xfce4-screensaver",
                    "/lock/enabled",
                    "false",
                ),
                DesktopSetting::new(
                    DesktopBackend::Xfconf,
                    "xfce4-screensaver",
                    "/saver/enabled",
                    "false",
                ),
                DesktopSetting::new(
                    DesktopBackend::Xfconf,
                    "xfce4-power-manager",
                    "/xfce4-power-manager/dpms-enabled",
                    "false",
                ),
            ],
            services: strings(&["postgresql"]),
            sudoers: Some(SudoersDropIn {
                path: PathBuf::from("/etc/sudoers.d/vmsetup-nopasswd"),
                template: format!("{} ALL=(ALL:ALL) NOPASSWD: ALL\n", USER_PLACEHOLDER),
            }),
            mobile: ToolSet {
                packages: strings(&["adb", "apktool", "jadx", "dex2jar"]),
                repositories: vec![Repository::new(
                    "MobSF",
                    "https://github.com/MobSF/Mobile-Security-Framework-MobSF.git",
                )],
            },
            web: ToolSet {
                packages: strings(&["burpsuite", "zaproxy", "ffuf", "nuclei", "sqlmap", "wfuzz"]),
                repositories: vec![Repository::new(
                    "PayloadsAllTheThings",
                    "https://github.com/swisskyrepo/PayloadsAllTheThings.git",
                )],
            },
            internal: ToolSet {
                packages: strings(&[
                    "bloodhound",
                    "netexec",
                    "responder",
                    "evil-winrm",
                    "impacket-scripts",
                ]),
                repositories: vec![Repository::new(
                    "BloodHound.py",
                    "https://github.com/dirkjanm/BloodHound.py.git",
                )],
            },
            wifi: ToolSet {
                packages: strings(&[
                    "aircrack-ng",
                    "wifite",
                    "hcxtools",
                    "hcxdumptool",
                    "reaver",
                    "bettercap",
                ]),
                repositories: Vec::new(),
            },
            environment: BTreeMap::new(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
            apt_cache_stamp: PathBuf::from(APT_UPDATE_STAMP),
        }
    }
}

fn is_relative_inside(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
}

fn is_valid_url(url: &str) -> bool {
    ["https://", "http://", "git@", "ssh://"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
        && !url.chars().any(char::is_whitespace)
}

fn invalid(msg: String) -> ProvisionError {
    ProvisionError::config(msg)
}

impl ProvisionConfig {
    /// Load from `VMSETUP_CONFIG` if set, else the built-in catalog.
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::load_from_file(PathBuf::from(path)),
            _ => Ok(Self::default()),
        }
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    pub fn tool_set(&self, group: StepGroup) -> Option<&ToolSet> {
        match group {
            StepGroup::Core => None,
            StepGroup::Mobile => Some(&self.mobile),
            StepGroup::Web => Some(&self.web),
            StepGroup::Internal => Some(&self.internal),
            StepGroup::Wifi => Some(&self.wifi),
        }
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        (self.command_timeout_secs > 0).then(|| Duration::from_secs(self.command_timeout_secs))
    }

    /// Check the catalog for anything that would produce a broken or
    /// ambiguous registry.
    pub fn validate(&self) -> crate::error::Result<()> {
        let all_packages = self
            .base_packages
            .iter()
            .chain([&self.mobile, &self.web, &self.internal, &self.wifi].into_iter().flat_map(|t| &t.packages));
        for package in all_packages {
            if !is_valid_package_name(package) {
                return Err(invalid(format!("invalid package name '{}'", package)));
            }
        }

        if !is_relative_inside(&self.tools_dir) {
            return Err(invalid(format!(
                "tools_dir must be a relative path inside the home directory, got {:?}",
                self.tools_dir
            )));
        }

        // Checkout directories share the tools dir across all groups
        let mut checkouts = HashSet::new();
        let repositories = self
            .repositories
            .iter()
            .chain([&self.mobile, &self.web, &self.internal, &self.wifi].into_iter().flat_map(|t| &t.repositories));
        for repo in repositories {
            if !is_valid_name(&repo.name) {
                return Err(invalid(format!("invalid repository name '{}'", repo.name)));
            }
            if !is_valid_url(&repo.url) {
                return Err(invalid(format!(
                    "repository '{}' has an unsupported url '{}'",
                    repo.name, repo.url
                )));
            }
            if !checkouts.insert(repo.name.as_str()) {
                return Err(invalid(format!("duplicate repository name '{}'", repo.name)));
            }
        }

        let mut downloads = HashSet::new();
        for download in &self.downloads {
            if !is_valid_name(&download.name) || !downloads.insert(download.name.as_str()) {
                return Err(invalid(format!(
                    "invalid or duplicate download name '{}'",
                    download.name
                )));
            }
            if !is_valid_url(&download.url) {
                return Err(invalid(format!(
                    "download '{}' has an unsupported url '{}'",
                    download.name, download.url
                )));
            }
            if !is_relative_inside(&download.file) {
                return Err(invalid(format!(
                    "download '{}' must target a relative path, got {:?}",
                    download.name, download.file
                )));
            }
        }

        if let Some(profile) = &self.shell_profile {
            if !is_relative_inside(&profile.file) {
                return Err(invalid(format!(
                    "shell profile must be relative to the home directory, got {:?}",
                    profile.file
                )));
            }
            if profile.lines.iter().any(|l| l.contains('\n')) {
                return Err(invalid("shell profile lines must be single lines".to_string()));
            }
        }

        for setting in &self.desktop {
            if setting.schema.trim().is_empty() || setting.key.trim().is_empty() {
                return Err(invalid(format!(
                    "desktop setting '{}' needs a schema and a key",
                    setting.label()
                )));
            }
        }

        let mut units = HashSet::new();
        for unit in &self.services {
            if unit.trim().is_empty() || unit.chars().any(char::is_whitespace) {
                return Err(invalid(format!("invalid service unit '{}'", unit)));
            }
            if !units.insert(unit.as_str()) {
                return Err(invalid(format!("duplicate service unit '{}'", unit)));
            }
        }

        if let Some(sudoers) = &self.sudoers {
            if !sudoers.path.is_absolute() {
                return Err(invalid(format!(
                    "sudoers drop-in path must be absolute, got {:?}",
                    sudoers.path
                )));
            }
            if !sudoers.template.contains(USER_PLACEHOLDER) {
                return Err(invalid(format!(
                    "sudoers template must mention {}",
                    USER_PLACEHOLDER
                )));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        ProvisionConfig::default().validate().unwrap();
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vmsetup.json");
        let mut config = ProvisionConfig::default();
        config.base_packages = vec!["git".to_string()];
        config.command_timeout_secs = 0;
        config.save_to_file(&path).unwrap();

        let loaded = ProvisionConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.command_timeout(), None);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ProvisionConfig =
            serde_json::from_str(r#"{ "base_packages": ["nmap"], "services": [] }"#).unwrap();
        assert_eq!(config.base_packages, vec!["nmap"]);
        assert!(config.services.is_empty());
        assert_eq!(config.tools_dir, PathBuf::from("tools"));
        assert_eq!(config.command_timeout(), Some(DEFAULT_COMMAND_TIMEOUT));
    }

    #[test]
    fn test_rejects_bad_package() {
        let mut config = ProvisionConfig::default();
        config.web.packages.push("ffuf && curl evil".to_string());
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ProvisionError::Configuration(_)));
    }

    #[test]
    fn test_rejects_duplicate_checkout_across_groups() {
        let mut config = ProvisionConfig::default();
        config
            .wifi
            .repositories
            .push(Repository::new("PEASS-ng", "https://example.org/other.git"));
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate repository name 'PEASS-ng'"));
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let mut config = ProvisionConfig::default();
        config.tools_dir = PathBuf::from("../etc");
        assert!(config.validate().is_err());

        let mut config = ProvisionConfig::default();
        config.downloads[0].file = PathBuf::from("/usr/local/bin/pspy64");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_sudoers_template() {
        let config = ProvisionConfig::default();
        let sudoers = config.sudoers.as_ref().unwrap();
        assert_eq!(sudoers.render("kali"), "kali ALL=(ALL:ALL) NOPASSWD: ALL\n");

        let mut broken = config.clone();
        broken.sudoers.as_mut().unwrap().template = "root ALL=(ALL) ALL\n".to_string();
        assert!(broken.validate().is_err());
    }

    #[test]
    fn test_tool_sets() {
        let config = ProvisionConfig::default();
        assert!(config.tool_set(StepGroup::Core).is_none());
        assert!(config
            .tool_set(StepGroup::Wifi)
            .unwrap()
            .packages
            .contains(&"aircrack-ng".to_string()));
    }
}
