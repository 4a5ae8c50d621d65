//! Ownership, SSH keys and sudoers validation.

use crate::command::CommandArgs;
use crate::error::{ProvisionError, Result};
use crate::host::Host;
use std::path::{Path, PathBuf};

/// `chown [-R] <owner>: <path>`
#[derive(Debug, Clone)]
pub struct Chown {
    pub path: PathBuf,
    pub owner: String,
    pub recursive: bool,
}

impl CommandArgs for Chown {
    fn program(&self) -> &'static str {
        "chown"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if self.recursive {
            args.push("-R".to_string());
        }
        // Trailing ':' sets the group to the owner's login group
        args.push(format!("{}:", self.owner));
        args.push("--".to_string());
        args.push(self.path.display().to_string());
        args
    }
}

/// `ssh-keygen -q -t ed25519 -N "" -C <comment> -f <key_path>`
#[derive(Debug, Clone)]
pub struct SshKeygen {
    pub key_path: PathBuf,
    pub comment: String,
}

impl CommandArgs for SshKeygen {
    fn program(&self) -> &'static str {
        "ssh-keygen"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec![
            "-q".to_string(),
            "-t".to_string(),
            "ed25519".to_string(),
            "-N".to_string(),
            String::new(),
            "-C".to_string(),
            self.comment.clone(),
            "-f".to_string(),
            self.key_path.display().to_string(),
        ]
    }
}

/// `visudo -cf <file>`: syntax-check a sudoers file without installing it
#[derive(Debug, Clone)]
pub struct Visudo {
    pub file: PathBuf,
}

impl CommandArgs for Visudo {
    fn program(&self) -> &'static str {
        "visudo"
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["-cf".to_string(), self.file.display().to_string()]
    }

    fn is_read_only(&self) -> bool {
        true
    }
}

/// Validator for [`secure_replace`](crate::files::secure_replace) on sudoers files.
pub fn validate_sudoers(host: &Host<'_>, file: &Path) -> Result<()> {
    let output = host.output(&Visudo {
        file: file.to_path_buf(),
    })?;
    if output.success {
        Ok(())
    } else {
        let detail = if output.stderr.trim().is_empty() {
            output.stdout.trim().to_string()
        } else {
            output.stderr.trim().to_string()
        };
        Err(ProvisionError::validation(format!(
            "visudo rejected {}: {}",
            file.display(),
            detail
        )))
    }
}
