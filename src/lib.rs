//! Launcher Core Library
//!
//! This library provides the download, update, and install engine behind a
//! game launcher: resumable rate-limited HTTP transfers, a persisted
//! download queue with fingerprint-based staleness detection, an
//! interruption-tolerant client install pipeline, and launcher
//! self-updating.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`config`] - persisted launcher state and the store interface
//! - [`download`] - resumable download engine with pause/resume/throttle
//! - [`manifest`] - remote content manifest and derived install state
//! - [`install`] - archive extraction and install pipeline
//! - [`orchestrator`] - queue-driven state machine over the above
//! - [`selfupdate`] - launcher release detection and executable swap
//!
//! The GUI shell is an external consumer: it hands the orchestrator a
//! [`ProgressSink`] for display updates and a [`LauncherControl`] wires
//! its pause/resume/cancel buttons. Nothing in here depends on an event
//! loop other than tokio.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod download;
pub mod install;
pub mod manifest;
pub mod orchestrator;
pub mod selfupdate;

// Re-export commonly used types
pub use config::{ConfigError, JsonFileStore, LauncherConfig, StateStore};
pub use download::{
    DEFAULT_MAX_RETRIES, DownloadError, DownloadTask, FailureType, Probe, ProgressSnapshot,
    RemoteMetadata, RetryDecision, RetryPolicy, TaskCommand, TaskEvent, TaskHandle, Throttle,
    classify_error, format_duration,
};
pub use install::{ClientDataFile, InstallError, InstallLayout, client_files_present, install_client};
pub use manifest::{InstallState, Manifest, derive_install_state};
pub use orchestrator::{
    ControlRequest, LauncherControl, LauncherError, LauncherState, Orchestrator, ProgressSink,
};
pub use selfupdate::{
    ReleaseAsset, ReleaseInfo, UpdateError, compare_versions, fetch_latest_release,
    finish_pending_update, select_asset, update_available,
};
