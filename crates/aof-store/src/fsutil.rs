//! Filesystem primitives for the store.
//!
//! Every mutation funnels through [`write_atomic`]: write to a temporary
//! sibling, then `rename(2)` into place. Renames within a directory tree are
//! atomic on POSIX filesystems, which is the store's whole concurrency
//! contract.

use std::fs;
use std::io;
use std::path::Path;

/// Write `content` to `path` atomically via a temporary sibling.
pub fn write_atomic(path: &Path, content: &str) -> io::Result<()> {
    let tmp = tmp_sibling(path);
    fs::write(&tmp, content)?;
    if let Err(e) = fs::rename(&tmp, path) {
        // Best-effort cleanup of the orphaned temp file.
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Move a file from `from` to `to` by writing the (possibly updated) content
/// at the destination first and removing the source after.
///
/// A crash between the two steps leaves the task present in both
/// directories; the linter reports the duplicate, and the task is never
/// silently lost.
pub fn move_with_content(from: &Path, to: &Path, content: &str) -> io::Result<()> {
    write_atomic(to, content)?;
    if from != to {
        fs::remove_file(from)?;
    }
    Ok(())
}

/// Create a directory and all parents, tolerating pre-existing directories.
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    fs::create_dir_all(path)
}

fn tmp_sibling(path: &Path) -> std::path::PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!(".{file_name}.tmp"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
