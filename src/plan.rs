//! Builds the validated, ordered entry list from configuration
//!
//! The orchestrator trusts its input; every existence check happens here.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::types::UnpackEntry;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Resolve and validate the configured unpack list against the root mount point
///
/// Sources are made absolute, destinations are joined onto the root mount
/// point. The first entry whose source is not a regular file or whose
/// destination is not a directory aborts planning with
/// [`Error::InvalidEntry`].
pub fn build_plan(config: &Config) -> Result<Vec<UnpackEntry>> {
    let root = config
        .root_mount_point
        .as_deref()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or(Error::NoRootMountPoint)?;

    if !root.exists() {
        return Err(Error::BadRootMountPoint(root.to_path_buf()));
    }

    let mut seen = HashSet::new();
    let mut entries = Vec::with_capacity(config.unpack.len());

    for item in &config.unpack {
        let source = absolute(&item.source)?;
        let destination = absolute(&root.join(&item.destination))?;

        debug!(?source, ?destination, "checking unpack entry");

        if !source.is_file() || !destination.is_dir() {
            return Err(Error::InvalidEntry {
                source_path: source,
                destination,
            });
        }

        // Sources key the progress map, so they must be unique within a run
        if !seen.insert(source.clone()) {
            return Err(Error::Config {
                message: format!("image {} is listed more than once", source.display()),
                key: Some("unpack".into()),
            });
        }

        entries.push(UnpackEntry::new(source, destination));
    }

    info!(entries = entries.len(), root = ?root, "unpack plan ready");
    Ok(entries)
}

/// Make a path absolute and lexically normalized without touching the filesystem
fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };

    let mut out = PathBuf::new();
    for component in joined.components() {
        match component {
            std::path::Component::CurDir => {}
            std::path::Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    Ok(out)
}
