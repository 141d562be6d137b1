//! Counting the entries inside a filesystem image
//!
//! The [`ArchiveLister`] trait is the seam between the orchestrator and the
//! tool that reads an image's table of contents. [`UnsquashfsLister`] shells
//! out to `unsquashfs -l`.

mod parser;
mod unsquashfs;

pub use parser::count_listed_entries;
pub use unsquashfs::UnsquashfsLister;

use async_trait::async_trait;
use std::path::Path;

/// Reports how many entries a filesystem image contains
///
/// Implementations return [`crate::Error::Listing`] when the image cannot be
/// read or is corrupt.
#[async_trait]
pub trait ArchiveLister: Send + Sync {
    /// Count the entries inside `image`
    async fn count_files(&self, image: &Path) -> crate::Result<u64>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}
