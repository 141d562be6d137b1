//! In-process copy engine built on walkdir

use super::{CopyEngine, ProgressCallback};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::fs;
use std::path::Path;
use tokio::task::spawn_blocking;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Copies a tree with `std::fs`, preserving directories, regular files,
/// symlinks, permission bits and (when privileged) ownership
///
/// Every entry below the source root counts as one copied entry, matching the
/// entry count reported by image listers. Existing files at the destination
/// are replaced, existing directories are merged into.
pub struct NativeCopyEngine {
    progress_interval: u64,
}

impl NativeCopyEngine {
    /// Create an engine that reports progress every `progress_interval` entries
    pub fn new(progress_interval: u64) -> Self {
        Self {
            progress_interval: progress_interval.max(1),
        }
    }
}

impl Default for NativeCopyEngine {
    fn default() -> Self {
        Self::new(1)
    }
}

#[async_trait]
impl CopyEngine for NativeCopyEngine {
    async fn copy_tree(
        &self,
        source: &Path,
        destination: &Path,
        progress: ProgressCallback,
    ) -> Result<u64> {
        let source_owned = source.to_path_buf();
        let destination_owned = destination.to_path_buf();
        let interval = self.progress_interval;

        spawn_blocking(move || {
            copy_tree_blocking(&source_owned, &destination_owned, interval, &progress)
        })
        .await
        .map_err(|e| Error::Copy {
            path: source.to_path_buf(),
            reason: format!("copy task panicked: {}", e),
        })?
    }

    fn name(&self) -> &'static str {
        "native"
    }
}

fn copy_error(path: &Path, what: &str, e: impl std::fmt::Display) -> Error {
    Error::Copy {
        path: path.to_path_buf(),
        reason: format!("{}: {}", what, e),
    }
}

fn copy_tree_blocking(
    source: &Path,
    destination: &Path,
    interval: u64,
    progress: &ProgressCallback,
) -> Result<u64> {
    let privileged = is_privileged();
    let mut copied = 0u64;
    let mut reported = 0u64;

    debug!(?source, ?destination, privileged, "native copy starting");

    for entry in WalkDir::new(source)
        .min_depth(1)
        .follow_links(false)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e
                .path()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| source.to_path_buf());
            copy_error(&path, "failed to walk tree", e)
        })?;

        let src = entry.path();
        let rel = src
            .strip_prefix(source)
            .map_err(|e| copy_error(src, "path outside source tree", e))?;
        let dst = destination.join(rel);

        copy_entry(src, &dst, entry.file_type(), privileged)?;

        copied += 1;
        if copied % interval == 0 {
            progress(copied);
            reported = copied;
        }
    }

    if reported != copied || copied == 0 {
        progress(copied);
    }

    debug!(?source, copied, "native copy finished");
    Ok(copied)
}

fn copy_entry(src: &Path, dst: &Path, file_type: fs::FileType, privileged: bool) -> Result<()> {
    let meta = fs::symlink_metadata(src).map_err(|e| copy_error(src, "failed to stat", e))?;

    if file_type.is_dir() {
        match fs::symlink_metadata(dst) {
            Ok(existing) if existing.is_dir() => {}
            Ok(_) => {
                remove_existing(dst)?;
                fs::create_dir(dst)
                    .map_err(|e| copy_error(dst, "failed to create directory", e))?;
            }
            Err(_) => {
                fs::create_dir_all(dst)
                    .map_err(|e| copy_error(dst, "failed to create directory", e))?;
            }
        }
        fs::set_permissions(dst, meta.permissions())
            .map_err(|e| copy_error(dst, "failed to set permissions", e))?;
    } else if file_type.is_symlink() {
        let target =
            fs::read_link(src).map_err(|e| copy_error(src, "failed to read symlink", e))?;
        remove_existing(dst)?;
        make_symlink(&target, dst)?;
    } else if file_type.is_file() {
        // Never write through a symlink already present at the destination
        remove_existing(dst)?;
        fs::copy(src, dst).map_err(|e| copy_error(src, "failed to copy file", e))?;
        fs::set_permissions(dst, meta.permissions())
            .map_err(|e| copy_error(dst, "failed to set permissions", e))?;
    } else {
        remove_existing(dst)?;
        make_special(src, dst, &meta)?;
    }

    if privileged {
        copy_ownership(dst, &meta)?;
    }
    Ok(())
}

/// Remove a non-directory entry at `path`, if any
fn remove_existing(path: &Path) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)
            .map_err(|e| copy_error(path, "failed to replace directory", e)),
        Ok(_) => {
            fs::remove_file(path).map_err(|e| copy_error(path, "failed to replace file", e))
        }
        Err(_) => Ok(()),
    }
}

#[cfg(unix)]
fn make_symlink(target: &Path, dst: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, dst)
        .map_err(|e| copy_error(dst, "failed to create symlink", e))
}

#[cfg(not(unix))]
fn make_symlink(_target: &Path, dst: &Path) -> Result<()> {
    Err(copy_error(dst, "failed to create symlink", "symlinks not supported"))
}

#[cfg(unix)]
fn make_special(src: &Path, dst: &Path, meta: &fs::Metadata) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let c_path = path_to_cstring(dst)?;
    let ret = unsafe {
        libc::mknod(
            c_path.as_ptr(),
            meta.mode() as libc::mode_t,
            meta.rdev() as libc::dev_t,
        )
    };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        // Device nodes need privileges; an unprivileged copy skips them
        if err.raw_os_error() == Some(libc::EPERM) {
            warn!(?src, "skipping special file (insufficient privileges)");
            return Ok(());
        }
        return Err(copy_error(dst, "mknod failed", err));
    }
    Ok(())
}

#[cfg(not(unix))]
fn make_special(src: &Path, _dst: &Path, _meta: &fs::Metadata) -> Result<()> {
    warn!(?src, "skipping special file");
    Ok(())
}

#[cfg(unix)]
fn path_to_cstring(path: &Path) -> Result<std::ffi::CString> {
    use std::os::unix::ffi::OsStrExt;

    std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| copy_error(path, "path contains a NUL byte", e))
}

#[cfg(unix)]
fn copy_ownership(dst: &Path, meta: &fs::Metadata) -> Result<()> {
    use std::os::unix::fs::MetadataExt;

    let c_path = path_to_cstring(dst)?;
    let ret = unsafe { libc::lchown(c_path.as_ptr(), meta.uid(), meta.gid()) };
    if ret != 0 {
        return Err(copy_error(
            dst,
            "failed to set ownership",
            std::io::Error::last_os_error(),
        ));
    }
    Ok(())
}

#[cfg(not(unix))]
fn copy_ownership(_dst: &Path, _meta: &fs::Metadata) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn is_privileged() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_privileged() -> bool {
    false
}

/// Collect every path below `root`, relative to it, in walk order
#[cfg(test)]
pub(crate) fn relative_paths(root: &Path) -> Vec<std::path::PathBuf> {
    WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.path().strip_prefix(root).ok().map(Path::to_path_buf))
        .collect()
}
