//! # unpackfs
//!
//! Unpacks compressed filesystem images (squashfs and friends) into a target
//! root filesystem, one image at a time.
//!
//! For every configured image the library counts its entries, loop-mounts it
//! read-only below a private scratch directory, copies the mounted tree into
//! its destination, and unmounts it again. Overall progress is reported as a
//! single fraction in [0, 1].
//!
//! ## Design Philosophy
//!
//! unpackfs is designed to be:
//! - **Library-first** - No CLI or UI, purely a Rust crate for embedding in an installer
//! - **Strictly sequential** - Entries are processed in order, never in parallel
//! - **Always cleaned up** - Every mount is released and the scratch directory removed, even on failure
//! - **Event-driven** - Consumers subscribe to events, no polling required
//! - **Pluggable** - Listing, mounting, and copying sit behind traits
//!
//! ## Quick Start
//!
//! ```no_run
//! use unpackfs::{Config, UnpackSource, run_job};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Config {
//!         root_mount_point: Some("/tmp/installer-root".into()),
//!         unpack: vec![UnpackSource {
//!             source: "/cdrom/casper/filesystem.squashfs".into(),
//!             destination: "".into(),
//!         }],
//!         ..Default::default()
//!     };
//!
//!     let (event_tx, mut events) = tokio::sync::broadcast::channel(1024);
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     if let Some(failure) = run_job(&config, event_tx).await {
//!         eprintln!("{}", failure);
//!     }
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Configuration types
pub mod config;
/// Recursive tree copy engines
pub mod copy;
/// Error types
pub mod error;
/// Image content listing
pub mod lister;
/// Loop mounting
pub mod mount;
/// Validated entry list construction
pub mod plan;
/// Aggregate progress tracking
pub mod progress;
/// Core types
pub mod types;
/// Unpack orchestrator
pub mod unpack;

// Re-export commonly used types
pub use config::{Config, CopyEngineKind, ToolsConfig, UnpackOptions, UnpackSource};
pub use copy::{CopyEngine, NativeCopyEngine, ProgressCallback, RsyncCopyEngine};
pub use error::{Error, Failure, Result, ToFailure};
pub use lister::{ArchiveLister, UnsquashfsLister};
pub use mount::{CliMounter, MountSpec, Mounter};
pub use plan::build_plan;
pub use progress::{BroadcastSink, NoOpSink, ProgressModel, ProgressSink};
pub use types::{Event, ProgressStatus, Stage, UnpackEntry};
pub use unpack::{Unpacker, run_job};
