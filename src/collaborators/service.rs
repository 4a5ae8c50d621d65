//! systemd service control.

use crate::command::CommandArgs;
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ServiceAction {
    Enable,
    IsEnabled,
}

impl ServiceAction {
    pub const fn is_query(self) -> bool {
        matches!(self, Self::IsEnabled)
    }
}

/// `systemctl <action> [--now] <unit>`
#[derive(Debug, Clone)]
pub struct Systemctl {
    pub action: ServiceAction,
    pub unit: String,
    /// For `enable`: also start the unit
    pub now: bool,
}

impl Systemctl {
    pub fn enable_now(unit: impl Into<String>) -> Self {
        Self {
            action: ServiceAction::Enable,
            unit: unit.into(),
            now: true,
        }
    }

    pub fn is_enabled(unit: impl Into<String>) -> Self {
        Self {
            action: ServiceAction::IsEnabled,
            unit: unit.into(),
            now: false,
        }
    }
}

impl CommandArgs for Systemctl {
    fn program(&self) -> &'static str {
        "systemctl"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![self.action.to_string()];
        if self.action.is_query() {
            args.push("--quiet".to_string());
        }
        if self.now && self.action == ServiceAction::Enable {
            args.push("--now".to_string());
        }
        args.push(self.unit.clone());
        args
    }

    fn is_read_only(&self) -> bool {
        self.action.is_query()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_now() {
        let args = Systemctl::enable_now("ssh.service");
        assert_eq!(args.to_cli_args(), vec!["enable", "--now", "ssh.service"]);
        assert!(!args.is_read_only());
    }

    #[test]
    fn test_is_enabled_query() {
        let args = Systemctl::is_enabled("postgresql");
        assert_eq!(args.to_cli_args(), vec!["is-enabled", "--quiet", "postgresql"]);
        assert!(args.to_spec().read_only);
    }
}
