//! Error types for unpackfs
//!
//! This module provides error handling for the library, including:
//! - Per-step error variants for listing, mounting, copying, and unmounting
//! - A combined variant for unmount failures that happen while unwinding another error
//! - Mapping to a short title plus a human-readable detail for the host to display

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for unpackfs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for unpackfs
///
/// Each step of the unpack sequence has its own variant carrying the offending
/// path and the diagnostic text reported by the underlying tool.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "unpack")
        key: Option<String>,
    },

    /// No root mount point was supplied
    #[error("no root mount point configured")]
    NoRootMountPoint,

    /// The root mount point does not exist
    #[error("root mount point {0} does not exist")]
    BadRootMountPoint(PathBuf),

    /// An unpack entry failed validation
    #[error("bad source {source_path} or destination {destination}")]
    InvalidEntry {
        /// The image file that was expected to exist
        source_path: PathBuf,
        /// The directory that was expected to exist
        destination: PathBuf,
    },

    /// Listing the contents of an image failed
    #[error("failed to list {image}: {reason}")]
    Listing {
        /// The image that could not be listed
        image: PathBuf,
        /// Diagnostic text from the lister
        reason: String,
    },

    /// Mounting an image failed
    #[error("failed to mount {image} at {target}: {reason}")]
    Mount {
        /// The image that could not be mounted
        image: PathBuf,
        /// The mount point
        target: PathBuf,
        /// Diagnostic text from the mount tool
        reason: String,
    },

    /// Copying a mounted tree failed
    #[error("failed to copy {path}: {reason}")]
    Copy {
        /// The path being copied when the failure occurred
        path: PathBuf,
        /// Diagnostic text from the copy engine
        reason: String,
    },

    /// Unmounting a mount point failed
    #[error("failed to unmount {target}: {reason}")]
    Unmount {
        /// The mount point that could not be detached
        target: PathBuf,
        /// Diagnostic text from the unmount tool
        reason: String,
    },

    /// Unmounting failed while another error was already being propagated
    #[error("{unmount} (while handling: {original})")]
    UnmountAfterFailure {
        /// The error that triggered the unmount
        original: Box<Error>,
        /// The unmount failure itself
        unmount: Box<Error>,
    },

    /// Removing the scratch directory failed
    #[error("failed to remove scratch directory {path}: {reason}")]
    Cleanup {
        /// The scratch directory
        path: PathBuf,
        /// The reason removal failed
        reason: String,
    },

    /// Removing the scratch directory failed after an earlier fatal error
    #[error("{cleanup} (while handling: {original})")]
    CleanupAfterFailure {
        /// The error that ended the run
        original: Box<Error>,
        /// The removal failure itself
        cleanup: Box<Error>,
    },

    /// Operation not supported (missing binary, etc.)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Pair an error that triggered an unmount with the unmount's own failure.
    ///
    /// If the unmount succeeded the original error is returned unchanged.
    pub fn with_unmount_result(self, unmount: Result<()>) -> Self {
        match unmount {
            Ok(()) => self,
            Err(unmount) => Error::UnmountAfterFailure {
                original: Box::new(self),
                unmount: Box::new(unmount),
            },
        }
    }
}

/// User-visible outcome of a failed run
///
/// A short title plus a longer detail string, suitable for display by the host
/// without further interpretation. A successful run has no `Failure`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    /// Short summary (e.g. "Bad source or destination")
    pub title: String,
    /// Detailed human-readable message
    pub detail: String,
}

impl Failure {
    /// Create a new failure from a title and detail
    pub fn new(title: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for Failure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.title, self.detail)
    }
}

/// Convert errors into the host-facing failure pair
pub trait ToFailure {
    /// Short title describing the failure
    fn title(&self) -> &'static str;

    /// Machine-readable error code
    fn error_code(&self) -> &'static str;

    /// Build the full title/detail pair
    fn to_failure(&self) -> Failure;
}

impl ToFailure for Error {
    fn title(&self) -> &'static str {
        match self {
            Error::Config { .. } => "Bad unpack configuration",
            Error::NoRootMountPoint => "No mount point for root partition",
            Error::BadRootMountPoint(_) => "Bad mount point for root partition",
            Error::InvalidEntry { .. } => "Bad source or destination",
            Error::Listing { .. } => "Failed to read filesystem image",
            Error::Mount { .. } => "Failed to mount filesystem image",
            Error::Copy { .. } => "Failed to copy files",
            Error::Unmount { .. } => "Failed to unmount filesystem image",
            // The unmount failure is the newest fatal condition; the original
            // error is kept in the detail.
            Error::UnmountAfterFailure { .. } => "Failed to unmount filesystem image",
            Error::Cleanup { .. } => "Failed to remove temporary directory",
            Error::CleanupAfterFailure { .. } => "Failed to remove temporary directory",
            Error::NotSupported(_) => "Required tool not available",
            Error::Io(_) => "I/O error",
            Error::Serialization(_) => "Bad unpack configuration",
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            Error::Config { .. } => "config_error",
            Error::NoRootMountPoint => "no_root_mount_point",
            Error::BadRootMountPoint(_) => "bad_root_mount_point",
            Error::InvalidEntry { .. } => "invalid_entry",
            Error::Listing { .. } => "listing_failed",
            Error::Mount { .. } => "mount_failed",
            Error::Copy { .. } => "copy_failed",
            Error::Unmount { .. } => "unmount_failed",
            Error::UnmountAfterFailure { .. } => "unmount_after_failure",
            Error::Cleanup { .. } => "cleanup_failed",
            Error::CleanupAfterFailure { .. } => "cleanup_after_failure",
            Error::NotSupported(_) => "not_supported",
            Error::Io(_) => "io_error",
            Error::Serialization(_) => "serialization_error",
        }
    }

    fn to_failure(&self) -> Failure {
        let detail = match self {
            Error::NoRootMountPoint => {
                "No root mount point was configured, doing nothing".to_string()
            }
            Error::BadRootMountPoint(path) => format!(
                "Root mount point is \"{}\", which does not exist, doing nothing",
                path.display()
            ),
            Error::InvalidEntry {
                source_path,
                destination,
            } => format!(
                "source=\"{}\"\ndestination=\"{}\"",
                source_path.display(),
                destination.display()
            ),
            Error::UnmountAfterFailure { original, unmount } => {
                format!("{}\nwhile handling: {}", unmount, original)
            }
            Error::CleanupAfterFailure { original, cleanup } => {
                format!("{}\nwhile handling: {}", cleanup, original)
            }
            other => other.to_string(),
        };

        Failure::new(self.title(), detail)
    }
}
