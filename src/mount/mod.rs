//! Loop-mounting filesystem images
//!
//! The [`Mounter`] trait is the seam for the mount/unmount primitive.
//! [`CliMounter`] runs the system `mount` and `umount` binaries.

mod cli;

pub use cli::{CliMounter, mount_args, umount_args};

use async_trait::async_trait;
use std::path::Path;

/// How an image is attached
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountSpec {
    /// Filesystem type hint (e.g. "squashfs")
    pub filesystem_type: String,
    /// Mount options (e.g. "loop", "ro")
    pub options: Vec<String>,
}

impl MountSpec {
    /// Read-only loop mount of the given filesystem type
    pub fn read_only_loop(filesystem_type: impl Into<String>) -> Self {
        Self {
            filesystem_type: filesystem_type.into(),
            options: vec!["loop".into(), "ro".into()],
        }
    }
}

/// Mount/unmount primitive
///
/// `mount` fails with [`crate::Error::Mount`], `unmount` with
/// [`crate::Error::Unmount`].
#[async_trait]
pub trait Mounter: Send + Sync {
    /// Attach `image` at `target`
    async fn mount(&self, image: &Path, target: &Path, spec: &MountSpec) -> crate::Result<()>;

    /// Detach whatever is mounted at `target`
    ///
    /// With `lazy` set the mount point is detached even if briefly busy.
    async fn unmount(&self, target: &Path, lazy: bool) -> crate::Result<()>;

    /// Human-readable name for logging
    fn name(&self) -> &'static str;
}
