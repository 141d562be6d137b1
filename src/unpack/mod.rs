//! Unpack orchestrator
//!
//! The [`Unpacker`] owns one run end to end:
//!
//! 1. create a uniquely named scratch directory
//! 2. for every entry, in order: list, mount, copy, and always unmount
//! 3. remove the scratch directory
//!
//! Async code cannot release resources in `Drop`, so each acquisition is
//! paired with its release explicitly: the unmount runs on every exit path of
//! the copy step, and the scratch directory is removed on every exit path of
//! the entry loop. A failed release is surfaced next to the error that
//! triggered it rather than replacing it.

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;

use crate::config::{Config, CopyEngineKind, UnpackOptions};
use crate::copy::{CopyEngine, NativeCopyEngine, ProgressCallback, RsyncCopyEngine};
use crate::error::{Error, Failure, Result, ToFailure};
use crate::lister::{ArchiveLister, UnsquashfsLister};
use crate::mount::{CliMounter, MountSpec, Mounter};
use crate::plan;
use crate::progress::{BroadcastSink, ProgressModel, ProgressSink};
use crate::types::{Event, Stage, UnpackEntry};
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Error tagged with the step it came from
type StageResult<T> = std::result::Result<T, (Stage, Error)>;

/// Runs the list/mount/copy/unmount sequence over an ordered entry list
///
/// Entries are processed strictly in order, one at a time. The first failure
/// aborts the run after the current mount and the scratch directory have been
/// released.
pub struct Unpacker {
    lister: Arc<dyn ArchiveLister>,
    mounter: Arc<dyn Mounter>,
    copier: Arc<dyn CopyEngine>,
    options: UnpackOptions,
    /// Event broadcast channel sender
    event_tx: broadcast::Sender<Event>,
    /// Receiver of aggregate progress values
    sink: Arc<dyn ProgressSink>,
    /// Progress model of the current or most recent run
    current: Mutex<Option<Arc<ProgressModel>>>,
}

impl Unpacker {
    /// Create an unpacker from explicit collaborators
    ///
    /// Progress is published as [`Event::Progress`] on `event_tx` unless a
    /// different sink is set with [`Unpacker::with_progress_sink`].
    pub fn new(
        options: UnpackOptions,
        lister: Arc<dyn ArchiveLister>,
        mounter: Arc<dyn Mounter>,
        copier: Arc<dyn CopyEngine>,
        event_tx: broadcast::Sender<Event>,
    ) -> Self {
        let sink: Arc<dyn ProgressSink> = Arc::new(BroadcastSink::new(event_tx.clone()));
        Self {
            lister,
            mounter,
            copier,
            options,
            event_tx,
            sink,
            current: Mutex::new(None),
        }
    }

    /// Create an unpacker backed by the system tools named in `config`
    ///
    /// Fails with [`Error::NotSupported`] if a required binary is neither
    /// configured nor found in PATH.
    pub fn from_config(config: &Config, event_tx: broadcast::Sender<Event>) -> Result<Self> {
        let tools = &config.tools;

        let lister = UnsquashfsLister::new(
            tools.resolve(tools.unsquashfs_path.as_deref(), "unsquashfs")?,
        );
        let mounter = CliMounter::new(
            tools.resolve(tools.mount_path.as_deref(), "mount")?,
            tools.resolve(tools.umount_path.as_deref(), "umount")?,
        );
        let copier: Arc<dyn CopyEngine> = match config.options.copy_engine {
            CopyEngineKind::Native => {
                Arc::new(NativeCopyEngine::new(config.options.progress_interval))
            }
            CopyEngineKind::Rsync => Arc::new(RsyncCopyEngine::new(
                tools.resolve(tools.rsync_path.as_deref(), "rsync")?,
            )),
        };

        info!(
            lister = lister.name(),
            mounter = mounter.name(),
            copier = copier.name(),
            "unpacker initialized"
        );

        Ok(Self::new(
            config.options.clone(),
            Arc::new(lister),
            Arc::new(mounter),
            copier,
            event_tx,
        ))
    }

    /// Publish aggregate progress to `sink` instead of the event channel
    pub fn with_progress_sink(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Subscribe to events from this unpacker
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Aggregate progress of the current or most recent run (0 before any run)
    pub fn progress(&self) -> f64 {
        self.current
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|model| model.aggregate_progress())
            .unwrap_or(0.0)
    }

    fn emit_event(&self, event: Event) {
        // Send can fail if there are no subscribers, which is fine
        self.event_tx.send(event).ok();
    }

    fn fail(&self, stage: Stage, error: &Error) {
        self.emit_event(Event::Failed {
            stage,
            error: error.to_string(),
        });
    }

    /// Unpack every entry in order
    ///
    /// The entries are trusted to have been validated (see
    /// [`crate::plan::build_plan`]). Sources must be unique within a run.
    pub async fn run(&self, mut entries: Vec<UnpackEntry>) -> Result<()> {
        let model = Arc::new(ProgressModel::new(&entries, self.sink.clone()));
        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = Some(model.clone());

        let scratch = match self.create_scratch(&entries) {
            Ok(scratch) => scratch,
            Err(e) => {
                self.fail(Stage::Prepare, &e);
                return Err(e);
            }
        };
        let scratch_path = scratch.path().to_path_buf();
        info!(scratch = ?scratch_path, entries = entries.len(), "starting unpack");
        self.emit_event(Event::ScratchCreated {
            path: scratch_path.clone(),
        });

        let mut mount_names = HashSet::new();
        let mut outcome: StageResult<()> = Ok(());
        for entry in entries.iter_mut() {
            outcome = self
                .unpack_entry(entry, &scratch_path, &model, &mut mount_names)
                .await;
            if outcome.is_err() {
                break;
            }
        }

        match outcome {
            Ok(()) => {
                scratch.close().map_err(|e| {
                    let err = Error::Cleanup {
                        path: scratch_path.clone(),
                        reason: e.to_string(),
                    };
                    self.fail(Stage::Cleanup, &err);
                    err
                })?;
                info!(scratch = ?scratch_path, "scratch directory removed");

                info!(
                    entries = entries.len(),
                    progress = model.aggregate_progress(),
                    "unpack complete"
                );
                self.emit_event(Event::Complete);
                Ok(())
            }
            Err((stage, e)) => {
                let e = if is_unmount_failure(&e) {
                    // A mount may still be attached below it, so never recurse
                    match remove_scratch_shallow(&scratch.keep()) {
                        Ok(()) => {
                            info!(scratch = ?scratch_path, "scratch directory removed");
                            e
                        }
                        Err(cleanup) => {
                            warn!(
                                scratch = ?scratch_path,
                                error = %cleanup,
                                "scratch directory still in use, leaving it in place"
                            );
                            Error::CleanupAfterFailure {
                                original: Box::new(e),
                                cleanup: Box::new(cleanup),
                            }
                        }
                    }
                } else {
                    if let Err(cleanup) = scratch.close() {
                        warn!(
                            scratch = ?scratch_path,
                            error = %cleanup,
                            "failed to remove scratch directory"
                        );
                    }
                    e
                };

                self.fail(stage, &e);
                Err(e)
            }
        }
    }

    fn create_scratch(&self, entries: &[UnpackEntry]) -> Result<TempDir> {
        let parent = self
            .options
            .scratch_parent
            .clone()
            .unwrap_or_else(std::env::temp_dir);

        // Copying a tree into itself would never terminate
        if let Some(entry) = entries.iter().find(|e| parent.starts_with(e.destination())) {
            return Err(Error::Config {
                message: format!(
                    "scratch directory parent {} lies inside destination {}",
                    parent.display(),
                    entry.destination().display()
                ),
                key: Some("options.scratch_parent".into()),
            });
        }

        Ok(tempfile::Builder::new()
            .prefix(&self.options.scratch_prefix)
            .tempdir_in(&parent)?)
    }

    /// List, mount, copy, and unmount one entry
    async fn unpack_entry(
        &self,
        entry: &mut UnpackEntry,
        scratch: &Path,
        model: &Arc<ProgressModel>,
        mount_names: &mut HashSet<String>,
    ) -> StageResult<()> {
        let source = entry.source().to_path_buf();

        let files = self
            .lister
            .count_files(&source)
            .await
            .map_err(|e| (Stage::List, e))?;
        model.record_total(&source, files);
        info!(?source, files, "image listed");
        self.emit_event(Event::Listed {
            source: source.clone(),
            files,
        });

        let mount_point = scratch.join(unique_mount_name(&entry.image_base_name(), mount_names));
        tokio::fs::create_dir(&mount_point).await.map_err(|e| {
            (
                Stage::Mount,
                Error::Mount {
                    image: source.clone(),
                    target: mount_point.clone(),
                    reason: format!("failed to create mount point: {}", e),
                },
            )
        })?;
        entry.set_source_dir(mount_point.clone());

        let spec = MountSpec {
            filesystem_type: self.options.filesystem_type.clone(),
            options: self.options.mount_options.clone(),
        };
        self.mounter
            .mount(&source, &mount_point, &spec)
            .await
            .map_err(|e| (Stage::Mount, e))?;
        info!(?source, ?mount_point, "image mounted");
        self.emit_event(Event::Mounted {
            source: source.clone(),
            mount_point: mount_point.clone(),
        });

        let copied = self.copy_entry(entry, &mount_point, model).await;
        if let Ok(files) = copied {
            info!(?source, destination = ?entry.destination(), files, "image copied");
            self.emit_event(Event::Copied {
                source: source.clone(),
                files,
            });
        }

        let unmounted = self
            .mounter
            .unmount(&mount_point, self.options.lazy_unmount)
            .await;
        if unmounted.is_ok() {
            info!(?mount_point, "image unmounted");
            self.emit_event(Event::Unmounted {
                mount_point: mount_point.clone(),
            });
        }

        match (copied, unmounted) {
            (Ok(_), Ok(())) => Ok(()),
            (Ok(_), Err(e)) => Err((Stage::Unmount, e)),
            (Err(e), Ok(())) => Err((Stage::Copy, e)),
            (Err(e), unmounted) => Err((Stage::Unmount, e.with_unmount_result(unmounted))),
        }
    }

    async fn copy_entry(
        &self,
        entry: &UnpackEntry,
        mount_point: &Path,
        model: &Arc<ProgressModel>,
    ) -> Result<u64> {
        let progress_model = model.clone();
        let key = entry.source().to_path_buf();
        let callback: ProgressCallback =
            Arc::new(move |count| progress_model.record_copied(&key, count));

        debug!(
            copier = self.copier.name(),
            from = ?mount_point,
            to = ?entry.destination(),
            "copying image contents"
        );
        self.copier
            .copy_tree(mount_point, entry.destination(), callback)
            .await
    }
}

/// Mount point name for an image, suffixed with `-N` if already taken this run
fn unique_mount_name(base: &str, taken: &mut HashSet<String>) -> String {
    let mut name = base.to_string();
    let mut n = 2;
    while taken.contains(&name) {
        name = format!("{}-{}", base, n);
        n += 1;
    }
    taken.insert(name.clone());
    name
}

/// Remove the scratch directory and its empty mount points without recursing
///
/// `remove_dir` refuses a directory that is still a mount point or not empty,
/// so nothing reachable through a live mount is ever deleted.
fn remove_scratch_shallow(scratch: &Path) -> Result<()> {
    let cleanup_error = |path: &Path, e: std::io::Error| Error::Cleanup {
        path: path.to_path_buf(),
        reason: e.to_string(),
    };

    let entries = std::fs::read_dir(scratch).map_err(|e| cleanup_error(scratch, e))?;
    for entry in entries {
        let mount_point = entry.map_err(|e| cleanup_error(scratch, e))?.path();
        std::fs::remove_dir(&mount_point).map_err(|e| cleanup_error(&mount_point, e))?;
    }
    std::fs::remove_dir(scratch).map_err(|e| cleanup_error(scratch, e))
}

fn is_unmount_failure(error: &Error) -> bool {
    matches!(
        error,
        Error::Unmount { .. } | Error::UnmountAfterFailure { .. }
    )
}

/// Plan and run a complete unpack job
///
/// Validates the configuration, builds the entry list, discovers the system
/// tools, and runs them. Returns `None` on success or the title/detail pair
/// describing the first fatal error.
pub async fn run_job(config: &Config, event_tx: broadcast::Sender<Event>) -> Option<Failure> {
    let prepared = config
        .validate()
        .and_then(|()| plan::build_plan(config))
        .and_then(|entries| {
            Unpacker::from_config(config, event_tx.clone()).map(|unpacker| (unpacker, entries))
        });

    let result = match prepared {
        Ok((unpacker, entries)) => unpacker.run(entries).await,
        Err(e) => {
            event_tx
                .send(Event::Failed {
                    stage: Stage::Prepare,
                    error: e.to_string(),
                })
                .ok();
            Err(e)
        }
    };

    match result {
        Ok(()) => None,
        Err(e) => {
            error!(error = %e, code = e.error_code(), "unpack job failed");
            Some(e.to_failure())
        }
    }
}
