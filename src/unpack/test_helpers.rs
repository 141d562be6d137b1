//! Fake collaborators and filesystem fixtures for orchestrator tests.
//!
//! The fake mounter "mounts" an image by copying a prepared fixture tree into
//! the mount point and "unmounts" by emptying it again, so the real native
//! copy engine can run against it.

use crate::config::UnpackOptions;
use crate::copy::{CopyEngine, NativeCopyEngine, ProgressCallback};
use crate::error::{Error, Result};
use crate::lister::ArchiveLister;
use crate::mount::{MountSpec, Mounter};
use crate::progress::ProgressSink;
use crate::types::{Event, UnpackEntry};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tempfile::TempDir;
use tokio::sync::broadcast;
use walkdir::WalkDir;

/// One image prepared on disk
pub(crate) struct FixtureImage {
    /// Path of the (dummy) image file
    pub(crate) image: PathBuf,
    /// Tree the fake mounter exposes for this image
    pub(crate) tree: PathBuf,
    /// Destination directory for its contents
    pub(crate) destination: PathBuf,
    /// Number of entries in `tree`, directories included
    pub(crate) files: u64,
}

/// Temporary directory holding images, fixture trees, destinations, and scratch space
pub(crate) struct Fixture {
    pub(crate) temp: TempDir,
    pub(crate) images: Vec<FixtureImage>,
}

impl Fixture {
    pub(crate) fn new() -> Self {
        let temp = tempfile::tempdir().unwrap();
        fs::create_dir_all(temp.path().join("scratch")).unwrap();
        Self {
            temp,
            images: Vec::new(),
        }
    }

    /// Add `/cdrom/<name>.sqfs` exposing `files` (paths ending in '/' are directories)
    pub(crate) fn add_image(&mut self, name: &str, files: &[&str]) -> &FixtureImage {
        self.add_image_at("cdrom", name, files)
    }

    /// Add `<dir>/<name>.sqfs`; lets two images share a base name
    pub(crate) fn add_image_at(&mut self, dir: &str, name: &str, files: &[&str]) -> &FixtureImage {
        let root = self.temp.path();
        let key = format!("{dir}-{name}");

        let image = root.join(dir).join(format!("{name}.sqfs"));
        fs::create_dir_all(image.parent().unwrap()).unwrap();
        fs::write(&image, b"hsqs").unwrap();

        let tree = root.join("trees").join(&key);
        fs::create_dir_all(&tree).unwrap();
        for file in files {
            let path = tree.join(file.trim_end_matches('/'));
            if file.ends_with('/') {
                fs::create_dir_all(&path).unwrap();
            } else {
                fs::create_dir_all(path.parent().unwrap()).unwrap();
                fs::write(&path, format!("contents of {file}\n")).unwrap();
            }
        }

        let destination = root.join("target").join(&key);
        fs::create_dir_all(&destination).unwrap();

        let files = count_entries(&tree);
        self.images.push(FixtureImage {
            image,
            tree,
            destination,
            files,
        });
        self.images.last().unwrap()
    }

    /// Directory in which the run's scratch directory is created
    pub(crate) fn scratch_parent(&self) -> PathBuf {
        self.temp.path().join("scratch")
    }

    /// Names currently present under the scratch parent
    pub(crate) fn scratch_contents(&self) -> Vec<PathBuf> {
        fs::read_dir(self.scratch_parent())
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect()
    }

    pub(crate) fn options(&self) -> UnpackOptions {
        UnpackOptions {
            scratch_parent: Some(self.scratch_parent()),
            ..Default::default()
        }
    }

    pub(crate) fn entries(&self) -> Vec<UnpackEntry> {
        self.images
            .iter()
            .map(|i| UnpackEntry::new(&i.image, &i.destination))
            .collect()
    }

    pub(crate) fn lister(&self) -> FakeLister {
        FakeLister::new(
            self.images
                .iter()
                .map(|i| (i.image.clone(), i.files))
                .collect(),
        )
    }

    pub(crate) fn mounter(&self) -> FakeMounter {
        FakeMounter::new(
            self.images
                .iter()
                .map(|i| (i.image.clone(), i.tree.clone()))
                .collect(),
        )
    }
}

/// Count every entry below `root`, the way `unsquashfs -l` would
pub(crate) fn count_entries(root: &Path) -> u64 {
    WalkDir::new(root).min_depth(1).into_iter().count() as u64
}

/// Lister returning fixed counts
pub(crate) struct FakeLister {
    counts: HashMap<PathBuf, u64>,
    pub(crate) fail_on: Option<PathBuf>,
    pub(crate) calls: Mutex<Vec<PathBuf>>,
}

impl FakeLister {
    pub(crate) fn new(counts: HashMap<PathBuf, u64>) -> Self {
        Self {
            counts,
            fail_on: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArchiveLister for FakeLister {
    async fn count_files(&self, image: &Path) -> Result<u64> {
        self.calls.lock().unwrap().push(image.to_path_buf());

        if self.fail_on.as_deref() == Some(image) {
            return Err(Error::Listing {
                image: image.to_path_buf(),
                reason: "Can't find a SQUASHFS superblock".into(),
            });
        }
        self.counts
            .get(image)
            .copied()
            .ok_or_else(|| Error::Listing {
                image: image.to_path_buf(),
                reason: "unknown image".into(),
            })
    }

    fn name(&self) -> &'static str {
        "fake-lister"
    }
}

/// A recorded mounter call
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum MountCall {
    Mount { image: PathBuf, target: PathBuf },
    Unmount { target: PathBuf, lazy: bool },
}

/// Mounter that exposes fixture trees and records every call in order
pub(crate) struct FakeMounter {
    trees: HashMap<PathBuf, PathBuf>,
    /// Zero-based index of the mount call that fails
    pub(crate) fail_mount_at: Option<usize>,
    pub(crate) fail_unmount: bool,
    /// A failed unmount leaves the image contents visible at the target
    pub(crate) leave_attached: bool,
    pub(crate) calls: Mutex<Vec<MountCall>>,
    mounts: AtomicUsize,
}

impl FakeMounter {
    pub(crate) fn new(trees: HashMap<PathBuf, PathBuf>) -> Self {
        Self {
            trees,
            fail_mount_at: None,
            fail_unmount: false,
            leave_attached: false,
            calls: Mutex::new(Vec::new()),
            mounts: AtomicUsize::new(0),
        }
    }

    pub(crate) fn calls(&self) -> Vec<MountCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Images mounted so far, in call order
    pub(crate) fn mounted_images(&self) -> Vec<PathBuf> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                MountCall::Mount { image, .. } => Some(image),
                MountCall::Unmount { .. } => None,
            })
            .collect()
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn mount(&self, image: &Path, target: &Path, spec: &MountSpec) -> Result<()> {
        assert_eq!(spec.options, vec!["loop", "ro"]);
        assert!(target.is_dir(), "mount point must exist before mounting");

        self.calls.lock().unwrap().push(MountCall::Mount {
            image: image.to_path_buf(),
            target: target.to_path_buf(),
        });

        let index = self.mounts.fetch_add(1, Ordering::SeqCst);
        if self.fail_mount_at == Some(index) {
            return Err(Error::Mount {
                image: image.to_path_buf(),
                target: target.to_path_buf(),
                reason: "failed to setup loop device".into(),
            });
        }

        let tree = self.trees.get(image).unwrap();
        copy_fixture(tree, target);
        Ok(())
    }

    async fn unmount(&self, target: &Path, lazy: bool) -> Result<()> {
        self.calls.lock().unwrap().push(MountCall::Unmount {
            target: target.to_path_buf(),
            lazy,
        });

        if self.fail_unmount {
            // umount reported an error but the mount is gone anyway
            if !self.leave_attached {
                fs::remove_dir_all(target).unwrap();
                fs::create_dir(target).unwrap();
            }
            return Err(Error::Unmount {
                target: target.to_path_buf(),
                reason: "target is busy".into(),
            });
        }

        // An unmounted mount point is an empty directory again
        fs::remove_dir_all(target).unwrap();
        fs::create_dir(target).unwrap();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "fake-mount"
    }
}

fn copy_fixture(from: &Path, to: &Path) {
    for entry in WalkDir::new(from).min_depth(1) {
        let entry = entry.unwrap();
        let dest = to.join(entry.path().strip_prefix(from).unwrap());
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).unwrap();
        } else {
            fs::copy(entry.path(), &dest).unwrap();
        }
    }
}

/// Native copy engine that fails on a chosen call after copying nothing
pub(crate) struct FailingCopyEngine {
    inner: NativeCopyEngine,
    /// Zero-based index of the copy call that fails
    fail_at: usize,
    copies: AtomicUsize,
}

impl FailingCopyEngine {
    pub(crate) fn new(fail_at: usize) -> Self {
        Self {
            inner: NativeCopyEngine::default(),
            fail_at,
            copies: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl CopyEngine for FailingCopyEngine {
    async fn copy_tree(
        &self,
        source: &Path,
        destination: &Path,
        progress: ProgressCallback,
    ) -> Result<u64> {
        let index = self.copies.fetch_add(1, Ordering::SeqCst);
        if index == self.fail_at {
            progress(1);
            return Err(Error::Copy {
                path: source.join("etc/passwd"),
                reason: "No space left on device".into(),
            });
        }
        self.inner.copy_tree(source, destination, progress).await
    }

    fn name(&self) -> &'static str {
        "failing-copy"
    }
}

/// Sink that remembers every published value
#[derive(Default)]
pub(crate) struct RecordingSink {
    values: Mutex<Vec<f64>>,
}

impl RecordingSink {
    pub(crate) fn values(&self) -> Vec<f64> {
        self.values.lock().unwrap().clone()
    }
}

impl ProgressSink for RecordingSink {
    fn set_progress(&self, fraction: f64) {
        self.values.lock().unwrap().push(fraction);
    }
}

/// Drain every event currently buffered on `rx`
pub(crate) fn drain_events(rx: &mut broadcast::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

pub(crate) fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
