//! Temp-file commit protocol.
//!
//! A mutation writes the desired next state into `<file>_tmp`, then the
//! commit sequence swaps it into place: delete a stale `<file>_old`, rename
//! the current file to `<file>_old`, copy the temp file over the original
//! name, and clean up.  A crash leaves one of three recoverable states:
//! only the temp file (ignore it), `_old` without a current file (rename it
//! back), or both (the commit finished; `_old` is discardable).
//! [`sweep`] applies that recovery on the next open.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::error::{Result, TevdError};

pub(crate) const TMP_SUFFIX: &str = "_tmp";
pub(crate) const TMP2_SUFFIX: &str = "_tmp2";
pub(crate) const OLD_SUFFIX: &str = "_old";

pub(crate) fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Swap `staged` into place over `current`.  Non-retryable on failure: the
/// caller decides whether to reopen.
pub(crate) fn commit(current: &Path, staged: &Path) -> Result<()> {
    let old = sibling(current, OLD_SUFFIX);
    let tmp2 = sibling(current, TMP2_SUFFIX);

    if old.exists() {
        fs::remove_file(&old)
            .map_err(|e| TevdError::CommitFailed(format!("removing stale backup: {e}")))?;
    }

    fs::rename(current, &old)
        .map_err(|e| TevdError::CommitFailed(format!("renaming current to backup: {e}")))?;

    if let Err(e) = fs::copy(staged, current) {
        // Best-effort rollback; the backup stays behind if this fails too.
        if let Err(undo) = fs::rename(&old, current) {
            warn!("rollback failed, archive left at {}: {undo}", old.display());
        }
        return Err(TevdError::CommitFailed(format!("copying staged file into place: {e}")));
    }

    for leftover in [staged, tmp2.as_path(), old.as_path()] {
        if leftover.exists() {
            if let Err(e) = fs::remove_file(leftover) {
                warn!("cleanup of {} failed: {e}", leftover.display());
            }
        }
    }
    debug!("committed {}", current.display());
    Ok(())
}

/// Open-time recovery: drop residual temp files and, when a crash left the
/// backup in place of the current file, rename it back.
pub(crate) fn sweep(current: &Path) {
    for suffix in [TMP_SUFFIX, TMP2_SUFFIX] {
        let stale = sibling(current, suffix);
        if stale.exists() {
            if let Err(e) = fs::remove_file(&stale) {
                warn!("could not remove stale {}: {e}", stale.display());
            }
        }
    }
    let old = sibling(current, OLD_SUFFIX);
    if !current.exists() && old.exists() {
        match fs::rename(&old, current) {
            Ok(()) => debug!("restored {} from backup", current.display()),
            Err(e) => warn!("could not restore {} from backup: {e}", current.display()),
        }
    }
}
