//! Lister backed by the external unsquashfs binary

use super::ArchiveLister;
use super::parser::count_listed_entries;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Lists squashfs images with `unsquashfs -l`
///
/// # Examples
///
/// ```no_run
/// use unpackfs::lister::{ArchiveLister, UnsquashfsLister};
/// use std::path::Path;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let lister = UnsquashfsLister::from_path()
///     .expect("unsquashfs not found in PATH");
///
/// let files = lister.count_files(Path::new("/cdrom/base.sqfs")).await?;
/// println!("{files} entries");
/// # Ok(())
/// # }
/// ```
pub struct UnsquashfsLister {
    binary_path: PathBuf,
}

impl UnsquashfsLister {
    /// Create a lister with an explicit binary path
    pub fn new(binary_path: PathBuf) -> Self {
        Self { binary_path }
    }

    /// Attempt to find unsquashfs in PATH
    pub fn from_path() -> Option<Self> {
        which::which("unsquashfs").ok().map(Self::new)
    }

    /// Path of the binary this lister runs
    pub fn binary_path(&self) -> &Path {
        &self.binary_path
    }
}

#[async_trait]
impl ArchiveLister for UnsquashfsLister {
    async fn count_files(&self, image: &Path) -> crate::Result<u64> {
        debug!(binary = ?self.binary_path, ?image, "listing image contents");

        let output = Command::new(&self.binary_path)
            .arg("-l")
            .arg(image)
            .output()
            .await
            .map_err(|e| crate::Error::Listing {
                image: image.to_path_buf(),
                reason: format!("failed to execute unsquashfs: {}", e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(crate::Error::Listing {
                image: image.to_path_buf(),
                reason: if stderr.is_empty() {
                    format!("unsquashfs exited with {}", output.status)
                } else {
                    stderr
                },
            });
        }

        Ok(count_listed_entries(&output.stdout))
    }

    fn name(&self) -> &'static str {
        "unsquashfs"
    }
}
