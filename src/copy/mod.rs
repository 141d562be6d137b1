//! Recursive copy of a mounted tree into its destination
//!
//! The [`CopyEngine`] trait is the seam for the copy step. Two engines are
//! provided:
//!
//! - [`NativeCopyEngine`]: walks the tree in-process on a blocking thread
//! - [`RsyncCopyEngine`]: runs `rsync` and parses its progress output
//!
//! Both report a running count of copied entries through a
//! [`ProgressCallback`]. Copying is not transactional: on failure, whatever was
//! already copied stays in place.

mod native;
mod rsync;

pub use native::NativeCopyEngine;
pub use rsync::{RsyncCopyEngine, parse_rsync_progress};

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

/// Callback receiving the number of entries copied so far
///
/// May be invoked from a blocking worker thread.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Copies a directory tree, reporting progress as it goes
///
/// Failures are reported as [`crate::Error::Copy`] carrying the offending path.
#[async_trait]
pub trait CopyEngine: Send + Sync {
    /// Copy everything under `source` into `destination`
    ///
    /// Returns the number of entries copied.
    async fn copy_tree(
        &self,
        source: &Path,
        destination: &Path,
        progress: ProgressCallback,
    ) -> crate::Result<u64>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}
