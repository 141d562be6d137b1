//! Configuration types for unpackfs

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One configured image and where its contents go
///
/// `destination` is relative to the root mount point; an empty destination
/// means the root mount point itself.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnpackSource {
    /// Path to the filesystem image
    pub source: PathBuf,

    /// Destination directory relative to the root mount point
    #[serde(default)]
    pub destination: PathBuf,
}

/// External tool paths (unsquashfs, mount, umount, rsync)
///
/// Explicit paths win; otherwise binaries are looked up in PATH when
/// `search_path` is set.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to unsquashfs executable (auto-detected if None)
    #[serde(default)]
    pub unsquashfs_path: Option<PathBuf>,

    /// Path to mount executable (auto-detected if None)
    #[serde(default)]
    pub mount_path: Option<PathBuf>,

    /// Path to umount executable (auto-detected if None)
    #[serde(default)]
    pub umount_path: Option<PathBuf>,

    /// Path to rsync executable (auto-detected if None, only used by the rsync engine)
    #[serde(default)]
    pub rsync_path: Option<PathBuf>,

    /// Whether to search PATH for external binaries if explicit paths not set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            unsquashfs_path: None,
            mount_path: None,
            umount_path: None,
            rsync_path: None,
            search_path: true,
        }
    }
}

impl ToolsConfig {
    /// Resolve a tool from its explicit path or from PATH
    pub fn resolve(&self, explicit: Option<&Path>, name: &str) -> Result<PathBuf> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        if !self.search_path {
            return Err(Error::NotSupported(format!(
                "{} path not configured and PATH search is disabled",
                name
            )));
        }
        which::which(name)
            .map_err(|e| Error::NotSupported(format!("{} not found in PATH: {}", name, e)))
    }
}

/// Which copy engine moves files out of a mounted image
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CopyEngineKind {
    /// In-process tree walk (default)
    #[default]
    Native,
    /// External rsync with progress parsing
    Rsync,
}

/// How images are mounted, copied, and where scratch space lives
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UnpackOptions {
    /// Filesystem type passed to mount (default: "squashfs")
    #[serde(default = "default_filesystem_type")]
    pub filesystem_type: String,

    /// Mount options (default: ["loop", "ro"])
    #[serde(default = "default_mount_options")]
    pub mount_options: Vec<String>,

    /// Detach lazily so a briefly busy mount point does not fail the run (default: true)
    #[serde(default = "default_true")]
    pub lazy_unmount: bool,

    /// Directory in which the scratch directory is created (default: system temp dir)
    #[serde(default)]
    pub scratch_parent: Option<PathBuf>,

    /// Name prefix of the scratch directory (default: "unpackfs-")
    #[serde(default = "default_scratch_prefix")]
    pub scratch_prefix: String,

    /// Copy engine to use
    #[serde(default)]
    pub copy_engine: CopyEngineKind,

    /// Report copy progress every N files (default: 1)
    #[serde(default = "default_progress_interval")]
    pub progress_interval: u64,
}

impl Default for UnpackOptions {
    fn default() -> Self {
        Self {
            filesystem_type: default_filesystem_type(),
            mount_options: default_mount_options(),
            lazy_unmount: true,
            scratch_parent: None,
            scratch_prefix: default_scratch_prefix(),
            copy_engine: CopyEngineKind::default(),
            progress_interval: default_progress_interval(),
        }
    }
}

/// Main configuration for an unpack job
///
/// Replaces any host-global lookups: the root mount point and the unpack list
/// are passed in explicitly.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Mount point of the target root partition
    #[serde(default)]
    pub root_mount_point: Option<PathBuf>,

    /// Ordered list of images to unpack
    #[serde(default)]
    pub unpack: Vec<UnpackSource>,

    /// External tool paths
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Mount, copy, and scratch space behavior
    #[serde(default)]
    pub options: UnpackOptions,
}

impl Config {
    /// Parse a configuration from a JSON string
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Config = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read {}: {}", path.display(), e),
            key: None,
        })?;
        Self::from_json_str(&content)
    }

    /// Check option values that serde cannot enforce
    pub fn validate(&self) -> Result<()> {
        if self.options.filesystem_type.trim().is_empty() {
            return Err(Error::Config {
                message: "filesystem type must not be empty".into(),
                key: Some("options.filesystem_type".into()),
            });
        }
        if self.options.progress_interval == 0 {
            return Err(Error::Config {
                message: "progress interval must be at least 1".into(),
                key: Some("options.progress_interval".into()),
            });
        }
        if self.options.scratch_prefix.contains('/') {
            return Err(Error::Config {
                message: "scratch prefix must not contain a path separator".into(),
                key: Some("options.scratch_prefix".into()),
            });
        }
        Ok(())
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_filesystem_type() -> String {
    "squashfs".into()
}

fn default_mount_options() -> Vec<String> {
    vec!["loop".into(), "ro".into()]
}

fn default_scratch_prefix() -> String {
    "unpackfs-".into()
}

fn default_progress_interval() -> u64 {
    1
}
