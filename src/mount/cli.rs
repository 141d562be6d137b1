//! Mounter backed by the system mount/umount binaries

use super::{MountSpec, Mounter};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::debug;

/// Runs `mount` and `umount` to attach and detach images
///
/// # Examples
///
/// ```no_run
/// use unpackfs::mount::{CliMounter, MountSpec, Mounter};
/// use std::path::Path;
///
/// # #[tokio::main]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mounter = CliMounter::from_path().expect("mount/umount not found in PATH");
/// let target = Path::new("/tmp/unpackfs-demo/base");
///
/// mounter
///     .mount(Path::new("/cdrom/base.sqfs"), target, &MountSpec::read_only_loop("squashfs"))
///     .await?;
/// mounter.unmount(target, true).await?;
/// # Ok(())
/// # }
/// ```
pub struct CliMounter {
    mount_path: PathBuf,
    umount_path: PathBuf,
}

impl CliMounter {
    /// Create a mounter with explicit binary paths
    pub fn new(mount_path: PathBuf, umount_path: PathBuf) -> Self {
        Self {
            mount_path,
            umount_path,
        }
    }

    /// Attempt to find mount and umount in PATH
    pub fn from_path() -> Option<Self> {
        let mount_path = which::which("mount").ok()?;
        let umount_path = which::which("umount").ok()?;
        Some(Self::new(mount_path, umount_path))
    }
}

/// Arguments for `mount <image> <target> [-t <type>] [-o <opts>]`
pub fn mount_args(image: &Path, target: &Path, spec: &MountSpec) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![image.into(), target.into()];

    if !spec.filesystem_type.is_empty() {
        args.push("-t".into());
        args.push(spec.filesystem_type.as_str().into());
    }

    let options: Vec<&str> = spec
        .options
        .iter()
        .map(String::as_str)
        .filter(|o| !o.is_empty())
        .collect();
    if !options.is_empty() {
        args.push("-o".into());
        args.push(options.join(",").into());
    }

    args
}

/// Arguments for `umount [-l] <target>`
pub fn umount_args(target: &Path, lazy: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = Vec::with_capacity(2);
    if lazy {
        args.push("-l".into());
    }
    args.push(target.into());
    args
}

fn stderr_reason(tool: &str, output: &std::process::Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
    if stderr.is_empty() {
        format!("{} exited with {}", tool, output.status)
    } else {
        stderr
    }
}

#[async_trait]
impl Mounter for CliMounter {
    async fn mount(&self, image: &Path, target: &Path, spec: &MountSpec) -> crate::Result<()> {
        let mount_error = |reason: String| crate::Error::Mount {
            image: image.to_path_buf(),
            target: target.to_path_buf(),
            reason,
        };

        // Mount points are created on demand
        tokio::fs::create_dir_all(target)
            .await
            .map_err(|e| mount_error(format!("failed to create mount point: {}", e)))?;

        let args = mount_args(image, target, spec);
        debug!(binary = ?self.mount_path, ?args, "mounting image");

        let output = Command::new(&self.mount_path)
            .args(&args)
            .output()
            .await
            .map_err(|e| mount_error(format!("failed to execute mount: {}", e)))?;

        if !output.status.success() {
            return Err(mount_error(stderr_reason("mount", &output)));
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path, lazy: bool) -> crate::Result<()> {
        let unmount_error = |reason: String| crate::Error::Unmount {
            target: target.to_path_buf(),
            reason,
        };

        let args = umount_args(target, lazy);
        debug!(binary = ?self.umount_path, ?args, "unmounting");

        let output = Command::new(&self.umount_path)
            .args(&args)
            .output()
            .await
            .map_err(|e| unmount_error(format!("failed to execute umount: {}", e)))?;

        if !output.status.success() {
            return Err(unmount_error(stderr_reason("umount", &output)));
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "cli-mount"
    }
}
