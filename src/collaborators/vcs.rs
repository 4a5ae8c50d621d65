//! git checkouts of tool repositories.

use crate::command::CommandArgs;
use std::path::{Path, PathBuf};

/// `git clone [--depth N] [--branch B] <url> <dest>`
#[derive(Debug, Clone)]
pub struct GitClone {
    pub url: String,
    pub dest: PathBuf,
    pub depth: Option<u32>,
    pub branch: Option<String>,
}

impl CommandArgs for GitClone {
    fn program(&self) -> &'static str {
        "git"
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec!["clone".to_string(), "--quiet".to_string()];
        if let Some(depth) = self.depth {
            args.push("--depth".to_string());
            args.push(depth.to_string());
        }
        if let Some(branch) = &self.branch {
            args.push("--branch".to_string());
            args.push(branch.clone());
        }
        // Everything after `--` is positional, even a URL starting with '-'
        args.push("--".to_string());
        args.push(self.url.clone());
        args.push(self.dest.display().to_string());
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        // Never block on a credential prompt for a private or renamed repo
        vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())]
    }
}

/// A directory is a checkout when it has a `.git` entry.
pub fn is_checkout(path: &Path) -> bool {
    path.join(".git").exists()
}
