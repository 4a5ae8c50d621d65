//! File primitives used by steps that edit configuration directly.
//!
//! [`secure_replace`] is for files the machine depends on being well-formed
//! (sudoers drop-ins): the original is backed up, the candidate is validated
//! as a hidden sibling, and only an accepted candidate is renamed over the
//! live path. A rejected or interrupted replace leaves the original
//! byte-for-byte as it was.
//!
//! The line helpers are for dotfiles, where the only requirement is that a
//! line is present exactly once after any number of runs. Directories they
//! create on the way are owned by the same user as the file.

use crate::error::{ProvisionError, Result};
use chrono::Local;
use nix::unistd::{Gid, Uid};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Mode for sudoers drop-ins
pub const SUDOERS_MODE: u32 = 0o440;

/// Permissions and ownership applied after a successful replace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceOptions {
    pub mode: u32,
    pub owner: Option<(u32, u32)>,
}

impl Default for ReplaceOptions {
    fn default() -> Self {
        Self {
            mode: SUDOERS_MODE,
            owner: Some((0, 0)),
        }
    }
}

/// Result of [`secure_replace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplaceOutcome {
    /// New content is in place. `backup` is `None` when there was no original.
    Replaced { backup: Option<PathBuf> },
    /// Validation rejected the candidate. The original was never touched
    /// (and no file was created when there was none).
    Restored {
        backup: Option<PathBuf>,
        reason: String,
    },
}

impl ReplaceOutcome {
    pub fn is_replaced(&self) -> bool {
        matches!(self, Self::Replaced { .. })
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stamp = Local::now().format("%Y%m%d%H%M%S");
    let mut candidate = path.with_file_name(format!("{}.bak.{}", name, stamp));
    let mut n = 1;
    while candidate.exists() {
        candidate = path.with_file_name(format!("{}.bak.{}.{}", name, stamp, n));
        n += 1;
    }
    candidate
}

/// Hidden sibling used for the candidate. sudo skips drop-ins whose name
/// contains a `.`, so a leftover candidate is never live.
fn candidate_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.vmsetup-tmp", name))
}

fn apply_owner(path: &Path, owner: Option<(u32, u32)>) -> Result<()> {
    if let Some((uid, gid)) = owner {
        nix::unistd::chown(path, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid)))
            .map_err(|e| {
                ProvisionError::command(format!("chown {} failed: {}", path.display(), e))
            })?;
    }
    Ok(())
}

/// Missing directories from the outermost down to `path` itself
fn missing_dirs(path: &Path) -> Vec<PathBuf> {
    let mut missing: Vec<PathBuf> = path
        .ancestors()
        .filter(|p| !p.as_os_str().is_empty())
        .take_while(|p| !p.exists())
        .map(Path::to_path_buf)
        .collect();
    missing.reverse();
    missing
}

/// `create_dir_all` that hands every directory it creates to `owner`.
fn create_dirs_owned(path: &Path, owner: Option<(u32, u32)>) -> Result<bool> {
    let missing = missing_dirs(path);
    for dir in &missing {
        match fs::create_dir(dir) {
            Ok(()) => apply_owner(dir, owner)?,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(!missing.is_empty())
}

/// Replace `path` with `new_content`, but only if `validate` accepts it.
///
/// A timestamped backup (`<name>.bak.<YYYYmmddHHMMSS>`) is written first. The
/// candidate is written to a hidden sibling, validated there, given its mode
/// and owner, and then renamed over `path`. Validation failure never
/// propagates as an error: the candidate is deleted, `path` is untouched, and
/// [`ReplaceOutcome::Restored`] is reported. Errors are returned only for I/O
/// that prevents the procedure itself.
pub fn secure_replace<F>(
    path: &Path,
    new_content: &[u8],
    validate: F,
    options: ReplaceOptions,
) -> Result<ReplaceOutcome>
where
    F: FnOnce(&Path) -> Result<()>,
{
    let backup = if path.exists() {
        let backup = backup_path(path);
        fs::copy(path, &backup)?;
        debug!("backed up {} to {}", path.display(), backup.display());
        Some(backup)
    } else {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        None
    };

    let candidate = candidate_path(path);
    match fs::remove_file(&candidate) {
        Ok(()) => debug!("removed stale {}", candidate.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    fs::write(&candidate, new_content)?;

    if let Err(e) = validate(&candidate) {
        let reason = e.to_string();
        warn!("{} rejected ({}); keeping previous version", path.display(), reason);
        fs::remove_file(&candidate)?;
        return Ok(ReplaceOutcome::Restored { backup, reason });
    }

    let installed = fs::set_permissions(&candidate, fs::Permissions::from_mode(options.mode))
        .map_err(ProvisionError::from)
        .and_then(|()| apply_owner(&candidate, options.owner))
        .and_then(|()| fs::rename(&candidate, path).map_err(ProvisionError::from));
    if let Err(e) = installed {
        let _ = fs::remove_file(&candidate);
        return Err(e);
    }
    info!("Replaced {}", path.display());
    Ok(ReplaceOutcome::Replaced { backup })
}

/// Whether `path` contains `line` (ignoring trailing whitespace).
/// A missing file contains nothing.
pub fn has_line(path: &Path, line: &str) -> bool {
    match fs::read_to_string(path) {
        Ok(content) => content.lines().any(|l| l.trim_end() == line.trim_end()),
        Err(_) => false,
    }
}

/// Append `line` to `path` unless it is already present. Creates the file
/// (and parent directories) if needed. Returns whether the file changed.
pub fn ensure_line(path: &Path, line: &str, owner: Option<(u32, u32)>) -> Result<bool> {
    let existing = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    if existing.lines().any(|l| l.trim_end() == line.trim_end()) {
        return Ok(false);
    }

    if let Some(parent) = path.parent() {
        create_dirs_owned(parent, owner)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if !existing.is_empty() && !existing.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    writeln!(file, "{}", line.trim_end())?;
    apply_owner(path, owner)?;
    Ok(true)
}

/// Create `path` and any missing parents, each owned by `owner`.
/// Returns whether anything was created.
pub fn ensure_dir(path: &Path, owner: Option<(u32, u32)>) -> Result<bool> {
    if path.is_dir() {
        return Ok(false);
    }
    if !create_dirs_owned(path, owner)? {
        return Err(std::io::Error::new(
            ErrorKind::AlreadyExists,
            format!("{} exists and is not a directory", path.display()),
        )
        .into());
    }
    Ok(true)
}

/// Whether `path` exists with exactly `content`.
pub fn content_matches(path: &Path, content: &[u8]) -> bool {
    fs::read(path).map(|c| c == content).unwrap_or(false)
}
