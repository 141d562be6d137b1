//! Core types for unpackfs

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// One planned unit of work: an image and the directory receiving its contents
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnpackEntry {
    source: PathBuf,
    destination: PathBuf,
    source_dir: Option<PathBuf>,
}

impl UnpackEntry {
    /// Create an entry from an absolute image path and an absolute destination directory
    pub fn new(source: impl Into<PathBuf>, destination: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            source_dir: None,
        }
    }

    /// Path to the compressed filesystem image
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Directory that receives the image's contents
    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Mount point for this image, set once the orchestrator creates it
    pub fn source_dir(&self) -> Option<&Path> {
        self.source_dir.as_deref()
    }

    pub(crate) fn set_source_dir(&mut self, dir: PathBuf) {
        self.source_dir = Some(dir);
    }

    /// Base file name of the image without its extension
    ///
    /// Used as the mount point name, so it never resolves to "." or "..".
    /// Falls back to the full file name, then to "image".
    pub fn image_base_name(&self) -> String {
        let usable = |s: &std::ffi::OsStr| {
            let s = s.to_string_lossy().into_owned();
            (!matches!(s.as_str(), "" | "." | "..")).then_some(s)
        };

        self.source
            .file_stem()
            .and_then(usable)
            .or_else(|| self.source.file_name().and_then(usable))
            .unwrap_or_else(|| "image".to_string())
    }
}

/// Unpacking progress of a single entry
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStatus {
    /// Number of files inside the image (0 until listed)
    pub total: u64,
    /// Number of files copied so far
    pub copied: u64,
}

impl ProgressStatus {
    /// Weighted completion of this entry
    ///
    /// An undiscovered entry (`total == 0`) contributes nothing. Otherwise 5%
    /// is credited for being listed and mounted, and the remaining 95% scales
    /// with the copied fraction.
    pub fn contribution(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        let copied = self.copied.min(self.total) as f64;
        0.05 + 0.95 * (copied / self.total as f64)
    }
}

/// Step of the per-entry unpack sequence
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Scratch directory creation
    Prepare,
    /// Counting files in the image
    List,
    /// Loop-mounting the image
    Mount,
    /// Copying the mounted tree
    Copy,
    /// Detaching the mount
    Unmount,
    /// Removing the scratch directory
    Cleanup,
}

/// Event emitted during an unpack run
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Scratch directory created
    ScratchCreated {
        /// Scratch directory path
        path: PathBuf,
    },

    /// Image contents counted
    Listed {
        /// Image path
        source: PathBuf,
        /// Number of files in the image
        files: u64,
    },

    /// Image mounted
    Mounted {
        /// Image path
        source: PathBuf,
        /// Mount point
        mount_point: PathBuf,
    },

    /// Image contents copied to its destination
    Copied {
        /// Image path
        source: PathBuf,
        /// Number of files the copy engine reported
        files: u64,
    },

    /// Mount point detached
    Unmounted {
        /// Mount point
        mount_point: PathBuf,
    },

    /// Aggregate progress update
    Progress {
        /// Overall completion in [0, 1]
        fraction: f64,
    },

    /// All entries unpacked and the scratch directory removed
    Complete,

    /// The run failed
    Failed {
        /// Stage where failure occurred
        stage: Stage,
        /// Error message
        error: String,
    },
}
