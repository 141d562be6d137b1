//! Directory-backed stand-ins for the system tools
//!
//! Each "image" is a regular file next to a directory holding its contents.
//! [`DirLister`] counts that directory, [`DirMounter`] mirrors it into the
//! mount point, so runs exercise the real orchestrator and copy engine
//! without root.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;
use unpackfs::{ArchiveLister, Error, MountSpec, Mounter, Result};
use walkdir::WalkDir;

/// Images, their content trees, and a root mount point inside one temp dir
pub struct ImageSet {
    pub temp: TempDir,
    trees: HashMap<PathBuf, PathBuf>,
}

impl ImageSet {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("Failed to create temp dir");
        fs::create_dir_all(temp.path().join("root")).expect("Failed to create root");
        fs::create_dir_all(temp.path().join("scratch")).expect("Failed to create scratch");
        Self {
            temp,
            trees: HashMap::new(),
        }
    }

    pub fn root(&self) -> PathBuf {
        self.temp.path().join("root")
    }

    pub fn scratch_parent(&self) -> PathBuf {
        self.temp.path().join("scratch")
    }

    /// Create `media/<name>.sqfs` whose contents are `files` (trailing '/' marks a directory)
    pub fn add(&mut self, name: &str, files: &[&str]) -> PathBuf {
        let media = self.temp.path().join("media");
        let image = media.join(format!("{name}.sqfs"));
        let tree = media.join(format!("{name}.tree"));

        fs::create_dir_all(&tree).expect("Failed to create tree");
        fs::write(&image, b"hsqs").expect("Failed to write image");
        for file in files {
            let path = tree.join(file.trim_end_matches('/'));
            if file.ends_with('/') {
                fs::create_dir_all(&path).expect("Failed to create dir");
            } else {
                fs::create_dir_all(path.parent().expect("file has parent"))
                    .expect("Failed to create parent");
                fs::write(&path, file.as_bytes()).expect("Failed to write file");
            }
        }

        self.trees.insert(image.clone(), tree);
        image
    }

    pub fn lister(&self) -> DirLister {
        DirLister {
            trees: self.trees.clone(),
        }
    }

    pub fn mounter(&self) -> DirMounter {
        DirMounter {
            trees: self.trees.clone(),
            log: Mutex::new(Vec::new()),
        }
    }
}

/// Count every entry below `root`, directories included
pub fn count_entries(root: &Path) -> u64 {
    WalkDir::new(root).min_depth(1).into_iter().count() as u64
}

/// Lister that counts the image's content tree
pub struct DirLister {
    trees: HashMap<PathBuf, PathBuf>,
}

#[async_trait]
impl ArchiveLister for DirLister {
    async fn count_files(&self, image: &Path) -> Result<u64> {
        let tree = self.trees.get(image).ok_or_else(|| Error::Listing {
            image: image.to_path_buf(),
            reason: "not a known image".into(),
        })?;
        Ok(count_entries(tree))
    }

    fn name(&self) -> &'static str {
        "dir-lister"
    }
}

/// Mounter that mirrors the content tree into the mount point
pub struct DirMounter {
    trees: HashMap<PathBuf, PathBuf>,
    /// "mount <image>" / "umount <target>" lines in call order
    pub log: Mutex<Vec<String>>,
}

impl DirMounter {
    pub fn log(&self) -> Vec<String> {
        self.log.lock().expect("log lock").clone()
    }
}

#[async_trait]
impl Mounter for DirMounter {
    async fn mount(&self, image: &Path, target: &Path, _spec: &MountSpec) -> Result<()> {
        self.log
            .lock()
            .expect("log lock")
            .push(format!("mount {}", image.display()));

        let tree = self.trees.get(image).ok_or_else(|| Error::Mount {
            image: image.to_path_buf(),
            target: target.to_path_buf(),
            reason: "wrong fs type, bad option, bad superblock".into(),
        })?;

        for entry in WalkDir::new(tree).min_depth(1) {
            let entry = entry.map_err(|e| Error::Mount {
                image: image.to_path_buf(),
                target: target.to_path_buf(),
                reason: e.to_string(),
            })?;
            let dest = target.join(entry.path().strip_prefix(tree).expect("below tree"));
            if entry.file_type().is_dir() {
                fs::create_dir_all(&dest)?;
            } else {
                fs::copy(entry.path(), &dest)?;
            }
        }
        Ok(())
    }

    async fn unmount(&self, target: &Path, _lazy: bool) -> Result<()> {
        self.log
            .lock()
            .expect("log lock")
            .push(format!("umount {}", target.display()));

        fs::remove_dir_all(target)?;
        fs::create_dir(target)?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "dir-mount"
    }
}
