//! The provisioning catalog: configuration data turned into ordered steps.
//!
//! # Order
//!
//! 1. verify the target user (fatal: everything after writes to their home)
//! 2. refresh package lists, upgrade, install base packages
//! 3. SSH key, shell profile, tools directory
//! 4. tool checkouts and downloads
//! 5. desktop settings, services, passwordless sudo
//! 6. selected optional groups (mobile, web, internal, wifi)
//!
//! # Failure Policy
//!
//! Only the target-user check is fatal. Every other step is advisory,
//! including all optional-group steps. apt steps declare package-manager
//! repair as their recovery action.

use crate::collaborators::desktop::{self, DesktopSetting};
use crate::collaborators::package::{self, AptUpdate, AptUpgrade, LISTS_MAX_AGE};
use crate::collaborators::service::Systemctl;
use crate::collaborators::system::{self, Chown, SshKeygen};
use crate::collaborators::vcs::{self, GitClone};
use crate::collaborators::CurlDownload;
use crate::config_file::{Download, ProvisionConfig, Repository};
use crate::error::Result;
use crate::files::{self, ReplaceOptions, ReplaceOutcome};
use crate::host::Host;
use crate::registry::{Step, StepBuilder, StepRegistry};
use crate::types::{DesktopBackend, StepGroup};
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use tracing::info;

/// Which optional tool groups run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GroupSelection {
    pub mobile: bool,
    pub web: bool,
    pub internal: bool,
    pub wifi: bool,
}

impl GroupSelection {
    pub fn all() -> Self {
        Self {
            mobile: true,
            web: true,
            internal: true,
            wifi: true,
        }
    }

    pub fn includes(&self, group: StepGroup) -> bool {
        match group {
            StepGroup::Core => true,
            StepGroup::Mobile => self.mobile,
            StepGroup::Web => self.web,
            StepGroup::Internal => self.internal,
            StepGroup::Wifi => self.wifi,
        }
    }

    /// Selected optional groups in execution order
    pub fn selected(&self) -> Vec<StepGroup> {
        [
            StepGroup::Mobile,
            StepGroup::Web,
            StepGroup::Internal,
            StepGroup::Wifi,
        ]
        .into_iter()
        .filter(|g| self.includes(*g))
        .collect()
    }
}

fn home(host: &Host<'_>) -> anyhow::Result<PathBuf> {
    Ok(host.ctx().target_home()?.to_path_buf())
}

fn is_executable(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Build the registry for `config` with the `groups` selection.
pub fn build_registry(config: &ProvisionConfig, groups: GroupSelection) -> Result<StepRegistry> {
    let mut registry = StepRegistry::new();

    registry.add(
        Step::builder("target-user", |host| {
            let target = host.ctx().target()?;
            if !target.home.is_dir() {
                anyhow::bail!(
                    "home directory {} of '{}' does not exist",
                    target.home.display(),
                    target.name
                );
            }
            info!("Provisioning for {} ({})", target.name, target.home.display());
            Ok(())
        })
        .fatal()
        .needs_target_user()
        .describe("Verify the target user and home directory"),
    )?;

    let (stamp, record) = (config.apt_cache_stamp.clone(), config.apt_cache_stamp.clone());
    registry.add(
        Step::builder("apt-update", move |host| {
            host.exec(&AptUpdate)?;
            if !host.is_dry_run() {
                package::record_update(&record)?;
            }
            Ok(())
        })
        .check(move |_| Ok(package::updated_within(&stamp, LISTS_MAX_AGE)))
        .recovery(package::repair)
        .describe("Refresh package lists"),
    )?;

    registry.add(
        Step::builder("apt-upgrade", |host| {
            host.exec(&AptUpgrade::default())?;
            Ok(())
        })
        .check(|host| Ok(!package::upgrade_pending(host)?))
        .recovery(package::repair)
        .describe("Upgrade installed packages"),
    )?;

    if !config.base_packages.is_empty() {
        registry.add(packages_step(
            "base-packages",
            StepGroup::Core,
            config.base_packages.clone(),
        ))?;
    }

    if config.ssh_key {
        registry.add(
            Step::builder("ssh-key", |host| {
                let target = host.ctx().target()?;
                let ssh_dir = target.home.join(".ssh");
                files::ensure_dir(&ssh_dir, host.ctx().target_owner())?;
                fs::set_permissions(&ssh_dir, fs::Permissions::from_mode(0o700))?;
                host.exec_as_target(&SshKeygen {
                    key_path: ssh_dir.join("id_ed25519"),
                    comment: target.name.clone(),
                })?;
                Ok(())
            })
            .check(|host| Ok(home(host)?.join(".ssh/id_ed25519").is_file()))
            .needs_target_user()
            .describe("Create the target user's SSH key"),
        )?;
    }

    if let Some(profile) = &config.shell_profile {
        let (file, lines) = (profile.file.clone(), profile.lines.clone());
        let (check_file, check_lines) = (file.clone(), lines.clone());
        registry.add(
            Step::builder("shell-profile", move |host| {
                let path = home(host)?.join(&file);
                let owner = host.ctx().target_owner();
                for line in &lines {
                    files::ensure_line(&path, line, owner)?;
                }
                Ok(())
            })
            .check(move |host| {
                let path = home(host)?.join(&check_file);
                Ok(check_lines.iter().all(|l| files::has_line(&path, l)))
            })
            .needs_target_user()
            .describe("Add shell profile lines"),
        )?;
    }

    let tools_dir = config.tools_dir.clone();
    let check_dir = tools_dir.clone();
    registry.add(
        Step::builder("tools-dir", move |host| {
            let dir = home(host)?.join(&tools_dir);
            files::ensure_dir(&dir, host.ctx().target_owner())?;
            if let (Some(_), Ok(target)) = (host.ctx().target_owner(), host.ctx().target()) {
                // Earlier runs may have left root-owned files behind
                host.exec(&Chown {
                    path: dir,
                    owner: target.name.clone(),
                    recursive: true,
                })?;
            }
            Ok(())
        })
        .check(move |host| {
            let dir = home(host)?.join(&check_dir);
            let owned = match host.ctx().target_owner() {
                Some((uid, _)) => fs::metadata(&dir).map(|m| m.uid() == uid).unwrap_or(false),
                None => true,
            };
            Ok(dir.is_dir() && owned)
        })
        .needs_target_user()
        .describe("Create the tools directory"),
    )?;

    for repo in &config.repositories {
        registry.add(clone_step(
            format!("clone:{}", repo.name),
            StepGroup::Core,
            &config.tools_dir,
            repo,
        ))?;
    }

    for download in &config.downloads {
        registry.add(download_step(&config.tools_dir, download))?;
    }

    for setting in &config.desktop {
        registry.add(desktop_step(setting))?;
    }

    for unit in &config.services {
        let (enable, query) = (unit.clone(), unit.clone());
        registry.add(
            Step::builder(format!("service:{}", unit), move |host| {
                host.exec(&Systemctl::enable_now(enable.as_str()))?;
                Ok(())
            })
            .check(move |host| Ok(host.probe(&Systemctl::is_enabled(query.as_str()))))
            .describe("Enable and start a service"),
        )?;
    }

    if let Some(sudoers) = &config.sudoers {
        let (apply, probe) = (sudoers.clone(), sudoers.clone());
        registry.add(
            Step::builder("sudoers-nopasswd", move |host| {
                let target = host.ctx().target()?;
                let content = apply.render(&target.name);
                let outcome = files::secure_replace(
                    &apply.path,
                    content.as_bytes(),
                    |candidate| system::validate_sudoers(host, candidate),
                    ReplaceOptions {
                        owner: host.ctx().is_elevated.then_some((0, 0)),
                        ..ReplaceOptions::default()
                    },
                )?;
                match outcome {
                    ReplaceOutcome::Replaced { .. } => Ok(()),
                    ReplaceOutcome::Restored { reason, .. } => {
                        anyhow::bail!("rolled back {}: {}", apply.path.display(), reason)
                    }
                }
            })
            .check(move |host| {
                let target = host.ctx().target()?;
                Ok(files::content_matches(
                    &probe.path,
                    probe.render(&target.name).as_bytes(),
                ))
            })
            .needs_target_user()
            .describe("Passwordless sudo for the target user"),
        )?;
    }

    for group in groups.selected() {
        let Some(tools) = config.tool_set(group) else {
            continue;
        };
        if !tools.packages.is_empty() {
            registry.add(packages_step(
                format!("{}-packages", group),
                group,
                tools.packages.clone(),
            ))?;
        }
        for repo in &tools.repositories {
            registry.add(clone_step(
                format!("{}:clone:{}", group, repo.name),
                group,
                &config.tools_dir,
                repo,
            ))?;
        }
    }

    Ok(registry)
}

fn packages_step(
    name: impl Into<String>,
    group: StepGroup,
    packages: Vec<String>,
) -> StepBuilder {
    let wanted = packages.clone();
    Step::builder(name, move |host| package::install_missing(host, &packages))
        .check(move |host| Ok(package::missing_packages(host, &wanted).is_empty()))
        .recovery(package::repair)
        .group(group)
        .describe("Install packages")
}

fn clone_step(
    name: String,
    group: StepGroup,
    tools_dir: &Path,
    repo: &Repository,
) -> StepBuilder {
    let relative = tools_dir.join(&repo.name);
    let check_relative = relative.clone();
    let repo = repo.clone();
    Step::builder(name, move |host| {
        let dest = home(host)?.join(&relative);
        host.exec_as_target(&GitClone {
            url: repo.url.clone(),
            dest,
            depth: repo.depth,
            branch: repo.branch.clone(),
        })?;
        Ok(())
    })
    .check(move |host| Ok(vcs::is_checkout(&home(host)?.join(&check_relative))))
    .group(group)
    .needs_target_user()
    .describe("Clone a tool repository")
}

fn download_step(tools_dir: &Path, download: &Download) -> StepBuilder {
    let relative = tools_dir.join(&download.file);
    let check_relative = relative.clone();
    let (url, executable) = (download.url.clone(), download.executable);
    Step::builder(format!("download:{}", download.name), move |host| {
        let dest = home(host)?.join(&relative);
        host.exec_as_target(&CurlDownload {
            url: url.clone(),
            dest: dest.clone(),
        })?;
        if executable {
            fs::set_permissions(&dest, fs::Permissions::from_mode(0o755))?;
        }
        Ok(())
    })
    .check(move |host| {
        let dest = home(host)?.join(&check_relative);
        Ok(if executable {
            is_executable(&dest)
        } else {
            dest.is_file()
        })
    })
    .needs_target_user()
    .describe("Download a file")
}

fn desktop_step(setting: &DesktopSetting) -> StepBuilder {
    let (apply, probe) = (setting.clone(), setting.clone());
    Step::builder(format!("desktop:{}", setting.label()), move |host| {
        if apply.backend == DesktopBackend::Gsettings
            && !desktop::has_key(host, &apply.schema, &apply.key)
        {
            anyhow::bail!("schema {} has no key {}", apply.schema, apply.key);
        }
        apply.apply(host)
    })
    .check(move |host| Ok(probe.is_applied(host)))
    .needs_target_user()
    .describe("Apply a desktop setting")
}
