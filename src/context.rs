//! Privilege and identity context.
//!
//! Provisioning runs elevated, but dotfiles and tool checkouts belong to the
//! human who owns the desktop session. This module resolves that *target
//! user* once, up front, into an immutable [`ExecutionContext`] that every
//! step receives explicitly.
//!
//! # Resolution order
//!
//! 1. `VMSETUP_USER` override
//! 2. The user who invoked elevation (`SUDO_USER`, `DOAS_USER`, `PKEXEC_UID`)
//! 3. The current OS identity

use crate::command::CommandSpec;
use crate::error::{ProvisionError, Result};
use nix::unistd::{Uid, User};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Environment variable that forces the target user
pub const USER_OVERRIDE_ENV: &str = "VMSETUP_USER";

/// The unprivileged human identity being provisioned for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetUser {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

impl TargetUser {
    pub fn owner(&self) -> (u32, u32) {
        (self.uid, self.gid)
    }
}

/// Where identity facts come from. The OS implementation reads the process
/// environment and the passwd database; tests supply fixed values.
pub trait IdentitySource {
    /// Explicit override, if set
    fn override_user(&self) -> Option<String>;
    /// User who invoked the elevation mechanism, if any
    fn invoking_user(&self) -> Option<String>;
    /// Name of the identity this process runs as
    fn current_user(&self) -> Option<String>;
    /// Look a user up by name
    fn lookup(&self, name: &str) -> Option<TargetUser>;
    /// Whether this process runs with root privileges
    fn is_elevated(&self) -> bool;
}

/// Reads identity from the process environment and the passwd database.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsIdentitySource;

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

impl IdentitySource for OsIdentitySource {
    fn override_user(&self) -> Option<String> {
        non_empty_env(USER_OVERRIDE_ENV)
    }

    fn invoking_user(&self) -> Option<String> {
        if let Some(name) = non_empty_env("SUDO_USER").or_else(|| non_empty_env("DOAS_USER")) {
            return Some(name);
        }
        let uid: u32 = non_empty_env("PKEXEC_UID")?.parse().ok()?;
        User::from_uid(Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|user| user.name)
    }

    fn current_user(&self) -> Option<String> {
        User::from_uid(nix::unistd::getuid())
            .ok()
            .flatten()
            .map(|user| user.name)
            .or_else(|| non_empty_env("USER"))
    }

    fn lookup(&self, name: &str) -> Option<TargetUser> {
        let user = User::from_name(name).ok().flatten()?;
        Some(TargetUser {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir,
        })
    }

    fn is_elevated(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }
}

/// Immutable per-run context handed to every step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Identity the provisioner itself runs as
    pub acting_user: String,
    pub is_elevated: bool,
    target: Option<TargetUser>,
    env_overrides: Vec<(String, String)>,
}

/// Pick the target user name by precedence. An invoking user of `root` is
/// skipped: elevating from root names no human.
fn select_name(source: &dyn IdentitySource) -> Option<String> {
    if let Some(name) = source.override_user() {
        debug!(user = %name, "target user from {}", USER_OVERRIDE_ENV);
        return Some(name);
    }
    if let Some(name) = source.invoking_user().filter(|n| n != "root") {
        debug!(user = %name, "target user from invoking identity");
        return Some(name);
    }
    let name = source.current_user()?;
    debug!(user = %name, "target user from current identity");
    Some(name)
}

/// Resolve the execution context.
///
/// Fails with [`ProvisionError::Identity`] when no usable target user exists
/// and `requires_target` is set (some registered step writes to the target's
/// files). Otherwise a missing target is tolerated.
pub fn resolve(source: &dyn IdentitySource, requires_target: bool) -> Result<ExecutionContext> {
    let acting_user = source
        .current_user()
        .unwrap_or_else(|| "unknown".to_string());
    let is_elevated = source.is_elevated();

    let target = match select_name(source) {
        Some(name) => match source.lookup(&name) {
            Some(user) => Some(user),
            None if requires_target => {
                return Err(ProvisionError::identity(format!(
                    "user '{}' does not exist on this system",
                    name
                )));
            }
            None => None,
        },
        None if requires_target => {
            return Err(ProvisionError::identity(format!(
                "cannot determine the target user; set {}",
                USER_OVERRIDE_ENV
            )));
        }
        None => None,
    };

    if let Some(user) = &target {
        info!(
            "Target user: {} (home {}), acting as {}{}",
            user.name,
            user.home.display(),
            acting_user,
            if is_elevated { " [elevated]" } else { "" }
        );
    }

    Ok(ExecutionContext {
        acting_user,
        is_elevated,
        target,
        env_overrides: Vec::new(),
    })
}

impl ExecutionContext {
    /// Build a context directly; used by tests and embedders.
    pub fn new(acting_user: impl Into<String>, is_elevated: bool, target: Option<TargetUser>) -> Self {
        Self {
            acting_user: acting_user.into(),
            is_elevated,
            target,
            env_overrides: Vec::new(),
        }
    }

    /// Environment applied to every command of the run.
    pub fn with_env_overrides<I, K, V>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_overrides = overrides
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self
    }

    pub fn env_overrides(&self) -> &[(String, String)] {
        &self.env_overrides
    }

    pub fn target(&self) -> Result<&TargetUser> {
        self.target
            .as_ref()
            .ok_or_else(|| ProvisionError::identity("no target user resolved"))
    }

    pub fn target_user(&self) -> Option<&str> {
        self.target.as_ref().map(|t| t.name.as_str())
    }

    pub fn target_home(&self) -> Result<&Path> {
        Ok(self.target()?.home.as_path())
    }

    /// Ownership to apply to files written on the target's behalf, if the
    /// process can and needs to change it.
    pub fn target_owner(&self) -> Option<(u32, u32)> {
        let target = self.target.as_ref()?;
        (self.is_elevated && target.name != self.acting_user).then(|| target.owner())
    }

    /// Rewrite a command to execute under the target user's identity and
    /// environment. When no privilege drop is needed the command runs as-is
    /// with the target's `HOME`.
    pub fn as_target(&self, spec: &CommandSpec) -> Result<CommandSpec> {
        let target = self.target()?;

        let mut wrapped = if self.is_elevated && target.name != self.acting_user {
            CommandSpec::new("runuser")
                .args(["-u", target.name.as_str(), "--", spec.program.as_str()])
                .args(spec.args.iter().cloned())
        } else {
            CommandSpec::new(spec.program.clone()).args(spec.args.iter().cloned())
        };

        wrapped.env = spec.env.clone();
        wrapped = wrapped
            .env("HOME", target.home.display().to_string())
            .env("USER", target.name.clone())
            .env("LOGNAME", target.name.clone());
        wrapped.workdir = spec.workdir.clone();
        wrapped.read_only = spec.read_only;
        Ok(wrapped)
    }
}
