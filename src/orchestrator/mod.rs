//! Queue-driven download orchestration.
//!
//! The [`Orchestrator`] owns the persisted launcher state and drives one
//! download worker at a time through the queue: scan required files for
//! staleness, download the head, durably record its fingerprint, pop, and
//! either start the next item or hand off to the install pipeline when the
//! completed item is the client archive.
//!
//! # State machine
//!
//! ```text
//! Idle -> Downloading -> (Paused <-> Downloading)
//!                     -> Downloading   on completion, next item
//!                     -> Installing    when the archive completes
//!                     -> Failed        on exhausted retries / install error
//!                     -> UpToDate      when the queue drains
//! ```
//!
//! Restartable failures (network blips, short streams) reconstruct a fresh
//! task for the *same* queue head under a bounded backoff policy; the item
//! is never silently dropped. Fingerprint recording always persists before
//! the queue pop, so a crash between the two re-downloads a file instead
//! of silently skipping it.
//!
//! The orchestrator is the single writer of the persisted state. The
//! download worker reports the in-flight fingerprint through pause/cancel
//! events and the orchestrator does the actual persisting.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::config::{ConfigError, LauncherConfig, StateStore};
use crate::download::{
    DownloadError, DownloadTask, Probe, RetryDecision, RetryPolicy, TaskEvent, TaskHandle,
    Throttle, classify_error,
};
use crate::install::{self, InstallError, InstallLayout};
use crate::manifest::{InstallState, Manifest, derive_install_state};

/// Where the orchestrator currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LauncherState {
    /// Nothing running.
    Idle,
    /// A download worker is streaming the queue head.
    Downloading,
    /// The active download is suspended.
    Paused,
    /// The install pipeline is running.
    Installing,
    /// A download or install failed terminally.
    Failed,
    /// Queue drained; everything current.
    UpToDate,
}

/// Progress surface the core reports through.
///
/// These five callbacks are the only place the core touches presentation.
/// Implementations must be cheap and non-blocking; they are invoked from
/// the orchestration loop.
pub trait ProgressSink: Send + Sync {
    /// Overall progress of the active transfer, 0.0 to 100.0.
    fn on_progress(&self, percent: f64);
    /// Human-readable status line for the active transfer.
    fn on_progress_label(&self, label: &str);
    /// A queued file finished and its fingerprint was recorded.
    fn on_task_finished(&self, path: &Path, etag: &str);
    /// A launcher release asset finished downloading.
    fn on_self_update_finished(&self, path: &Path);
    /// The active task failed terminally.
    fn on_task_failed(&self);
}

/// Errors surfaced by the orchestrator.
#[derive(Debug, Error)]
pub enum LauncherError {
    /// The persisted state could not be read or written.
    #[error("configuration store error: {0}")]
    Config(#[from] ConfigError),

    /// A download failed terminally (retries exhausted or fatal).
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The install pipeline failed.
    #[error("install failed: {0}")]
    Install(#[from] InstallError),

    /// Filesystem error outside a download or install step.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path being prepared.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// No installation path has been configured yet.
    #[error("no installation path configured")]
    MissingInstallPath,

    /// A queued identifier has no download URL in the manifest.
    #[error("no download source for queued file {id}")]
    UnknownQueueItem {
        /// The unmatched identifier.
        id: String,
    },

    /// The download worker exited without reporting a result.
    #[error("download worker stopped unexpectedly")]
    WorkerStopped,
}

/// External control requests multiplexed into the run loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlRequest {
    /// Suspend the active download.
    Pause,
    /// Resume a suspended download.
    Resume,
    /// Stop the active download, persisting resumable state.
    Cancel,
}

/// Cloneable handle for pausing, resuming, and cancelling from another
/// task or thread (typically UI event handlers).
#[derive(Debug, Clone)]
pub struct LauncherControl {
    requests: mpsc::UnboundedSender<ControlRequest>,
}

impl LauncherControl {
    /// Requests suspension of the active download.
    pub fn pause(&self) {
        let _ = self.requests.send(ControlRequest::Pause);
    }

    /// Requests resumption of a suspended download.
    pub fn resume(&self) {
        let _ = self.requests.send(ControlRequest::Resume);
    }

    /// Requests cancellation of the active download.
    pub fn cancel(&self) {
        let _ = self.requests.send(ControlRequest::Cancel);
    }
}

/// What driving one task to its end concluded.
enum TaskOutcome {
    Finished { dest_path: PathBuf, etag: String },
    SelfUpdate { dest_path: PathBuf },
    Cancelled { etag: Option<String> },
    Failed(DownloadError),
}

/// Drives the download queue and install pipeline against the persisted
/// launcher state.
pub struct Orchestrator {
    config: LauncherConfig,
    store: Arc<dyn StateStore>,
    manifest: Manifest,
    layout: InstallLayout,
    sink: Arc<dyn ProgressSink>,
    probe: Probe,
    retry_policy: RetryPolicy,
    state: LauncherState,
    control_tx: mpsc::UnboundedSender<ControlRequest>,
    control_rx: mpsc::UnboundedReceiver<ControlRequest>,
}

impl Orchestrator {
    /// Creates an orchestrator, loading the persisted state from the store.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::Config`] if the store cannot be read.
    pub fn new(
        store: Arc<dyn StateStore>,
        manifest: Manifest,
        layout: InstallLayout,
        sink: Arc<dyn ProgressSink>,
    ) -> Result<Self, LauncherError> {
        let config = store.load()?;
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            store,
            manifest,
            layout,
            sink,
            probe: Probe::new(),
            retry_policy: RetryPolicy::default(),
            state: LauncherState::Idle,
            control_tx,
            control_rx,
        })
    }

    /// Overrides the retry policy for restartable download failures.
    #[must_use]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Overrides the metadata probe (mainly for tests).
    #[must_use]
    pub fn with_probe(mut self, probe: Probe) -> Self {
        self.probe = probe;
        self
    }

    /// A control handle usable from other tasks or threads.
    #[must_use]
    pub fn control(&self) -> LauncherControl {
        LauncherControl {
            requests: self.control_tx.clone(),
        }
    }

    /// Current state of the orchestration loop.
    #[must_use]
    pub fn state(&self) -> LauncherState {
        self.state
    }

    /// The in-memory view of the persisted configuration.
    #[must_use]
    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Sets and persists the installation path.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError::Config`] if persisting fails.
    pub fn set_installation_path(&mut self, path: impl Into<PathBuf>) -> Result<(), LauncherError> {
        self.config.installation_path = Some(path.into());
        self.store.save(&self.config)?;
        Ok(())
    }

    /// Derives the install state from disk contents and queue state.
    #[must_use]
    pub fn install_state(&self) -> InstallState {
        let Some(root) = self.config.installation_path.as_deref() else {
            return InstallState::NotInstalled;
        };
        let present = install::client_files_present(root, &self.layout.data_files);
        derive_install_state(
            present,
            self.config.download_queue.is_empty(),
            self.config.install_in_progress,
        )
    }

    fn install_root(&self) -> Result<PathBuf, LauncherError> {
        self.config
            .installation_path
            .clone()
            .ok_or(LauncherError::MissingInstallPath)
    }

    /// Scans the manifest's required files and queues every one that is
    /// missing or stale. Already-queued names are skipped, so the scan is
    /// idempotent and safe to repeat on every launch.
    ///
    /// Returns how many files were appended.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError`] if a probe fails (retryable) or the queue
    /// cannot be persisted.
    #[instrument(skip(self))]
    pub async fn scan_outdated_files(&mut self) -> Result<usize, LauncherError> {
        let root = self.install_root()?;
        let mut appended = 0;

        for id in self.manifest.required_files().to_vec() {
            if self.config.download_queue.iter().any(|queued| *queued == id) {
                continue;
            }
            let url = self
                .manifest
                .url_for(&id)
                .ok_or_else(|| LauncherError::UnknownQueueItem { id: id.clone() })?
                .to_string();
            let dest = Manifest::dest_path(&root, &id);
            let recorded = self
                .config
                .recorded_version(Manifest::file_name(&id))
                .map(str::to_string);
            if self
                .probe
                .requires_update(&url, &dest, recorded.as_deref())
                .await?
            {
                info!(file = %id, "queued outdated file");
                self.config.enqueue(&id);
                appended += 1;
            } else {
                debug!(file = %id, "file up to date");
            }
        }

        if appended > 0 {
            self.store.save(&self.config)?;
        }
        Ok(appended)
    }

    /// Front-queues the client archive when it is neither queued nor
    /// already sitting fully downloaded at its destination.
    ///
    /// Returns whether the archive was queued.
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError`] if the queue cannot be persisted.
    pub fn ensure_client_queued(&mut self) -> Result<bool, LauncherError> {
        let root = self.install_root()?;
        let archive = self.manifest.client_archive().to_string();
        let dest = Manifest::dest_path(&root, &archive);
        if dest.exists() {
            return Ok(false);
        }
        if self.config.enqueue_front(&archive) {
            self.store.save(&self.config)?;
            info!("client archive queued for download");
            return Ok(true);
        }
        Ok(false)
    }

    /// Processes the queue until it drains, a failure is terminal, or the
    /// active download is cancelled.
    ///
    /// Pause, resume, and cancel requests from [`LauncherControl`] handles
    /// are honored throughout. Returns the terminal state
    /// ([`LauncherState::UpToDate`] or [`LauncherState::Idle`] after a
    /// cancel).
    ///
    /// # Errors
    ///
    /// Returns [`LauncherError`] on exhausted download retries, install
    /// failure, or persistence problems. The queue keeps the failed item
    /// at its head so the next run retries it.
    #[instrument(skip(self))]
    pub async fn run(&mut self) -> Result<LauncherState, LauncherError> {
        let root = self.install_root()?;
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|source| LauncherError::Io {
                path: root.clone(),
                source,
            })?;

        // Interrupted install: the archive finished downloading in an
        // earlier run but the pipeline never completed.
        let archive_dest = Manifest::dest_path(&root, self.manifest.client_archive());
        if self.config.install_in_progress && archive_dest.exists() {
            info!("resuming interrupted client install");
            self.run_install(&root, &archive_dest).await?;
        }

        // The flag marks the base-install flow, not routine patch updates.
        if !self.config.install_in_progress
            && self
                .config
                .download_queue
                .iter()
                .any(|id| self.manifest.is_client_archive(id))
        {
            self.config.install_in_progress = true;
            self.store.save(&self.config)?;
        }

        let mut attempt = 1u32;
        while let Some(head) = self.config.queue_head().map(str::to_string) {
            self.state = LauncherState::Downloading;
            let url = self
                .manifest
                .url_for(&head)
                .ok_or_else(|| LauncherError::UnknownQueueItem { id: head.clone() })?
                .to_string();
            let dest = Manifest::dest_path(&root, &head);

            debug!(file = %head, attempt, "starting download task");
            let task = DownloadTask::new(&url, &dest)
                .with_paused_etag(self.config.paused_download_etag.clone())
                .with_throttle(Throttle::new(self.config.bandwidth_limit_bytes()));
            let (handle, events) = task.spawn(self.probe.clone());

            match self.drive_task(handle, events).await? {
                TaskOutcome::Finished { dest_path, etag } => {
                    attempt = 1;
                    // Record the fingerprint durably before popping: a
                    // crash between the two steps re-downloads the file
                    // instead of silently skipping it.
                    self.config
                        .record_file_version(Manifest::file_name(&head), &etag);
                    self.config.paused_download_etag = None;
                    self.store.save(&self.config)?;
                    self.config.pop_head();
                    self.store.save(&self.config)?;
                    self.sink.on_task_finished(&dest_path, &etag);

                    if self.manifest.is_client_archive(&head) {
                        self.run_install(&root, &dest_path).await?;
                    }
                }
                TaskOutcome::SelfUpdate { dest_path } => {
                    attempt = 1;
                    // A queued item the remote serves without a
                    // fingerprint: nothing to record in the version map.
                    self.config.paused_download_etag = None;
                    self.config.pop_head();
                    self.store.save(&self.config)?;
                    self.sink.on_self_update_finished(&dest_path);
                }
                TaskOutcome::Cancelled { etag } => {
                    self.config.paused_download_etag = etag;
                    self.store.save(&self.config)?;
                    self.state = LauncherState::Idle;
                    info!("download cancelled, resumable state persisted");
                    return Ok(LauncherState::Idle);
                }
                TaskOutcome::Failed(error) => {
                    match self
                        .retry_policy
                        .should_retry(classify_error(&error), attempt)
                    {
                        RetryDecision::Retry {
                            delay,
                            attempt: next_attempt,
                        } => {
                            warn!(
                                file = %head,
                                error = %error,
                                delay_ms = delay.as_millis(),
                                attempt = next_attempt,
                                "restartable failure, retrying the same file"
                            );
                            attempt = next_attempt;
                            tokio::time::sleep(delay).await;
                        }
                        RetryDecision::DoNotRetry { reason } => {
                            warn!(file = %head, error = %error, %reason, "giving up on download");
                            self.state = LauncherState::Failed;
                            self.sink.on_task_failed();
                            return Err(LauncherError::Download(error));
                        }
                    }
                }
            }
        }

        self.config.install_in_progress = false;
        self.store.save(&self.config)?;
        self.state = LauncherState::UpToDate;
        self.sink.on_progress(100.0);
        info!("all downloads complete");
        Ok(LauncherState::UpToDate)
    }

    /// Forwards control requests to the worker and folds its events until
    /// a terminal one arrives.
    async fn drive_task(
        &mut self,
        mut handle: TaskHandle,
        mut events: mpsc::UnboundedReceiver<TaskEvent>,
    ) -> Result<TaskOutcome, LauncherError> {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(TaskEvent::Progress(snapshot)) => {
                        self.sink.on_progress(snapshot.percent);
                        self.sink.on_progress_label(&snapshot.label());
                    }
                    Some(TaskEvent::Paused { etag }) => {
                        self.state = LauncherState::Paused;
                        self.config.paused_download_etag = etag;
                        if let Err(error) = self.store.save(&self.config) {
                            handle.cancel();
                            handle.wait().await;
                            return Err(error.into());
                        }
                    }
                    Some(TaskEvent::Cancelled { etag }) => {
                        handle.wait().await;
                        return Ok(TaskOutcome::Cancelled { etag });
                    }
                    Some(TaskEvent::Finished { dest_path, etag }) => {
                        handle.wait().await;
                        return Ok(TaskOutcome::Finished { dest_path, etag });
                    }
                    Some(TaskEvent::SelfUpdateAsset { dest_path }) => {
                        handle.wait().await;
                        return Ok(TaskOutcome::SelfUpdate { dest_path });
                    }
                    Some(TaskEvent::Failed(error)) => {
                        handle.wait().await;
                        return Ok(TaskOutcome::Failed(error));
                    }
                    None => {
                        handle.wait().await;
                        return Err(LauncherError::WorkerStopped);
                    }
                },
                request = self.control_rx.recv() => match request {
                    Some(ControlRequest::Pause) => handle.pause(),
                    Some(ControlRequest::Resume) => {
                        handle.resume(self.config.paused_download_etag.clone());
                        self.state = LauncherState::Downloading;
                    }
                    Some(ControlRequest::Cancel) => handle.cancel(),
                    // The orchestrator holds a sender, so the channel
                    // cannot close while it is alive.
                    None => {}
                },
            }
        }
    }

    /// Hands control to the install pipeline. The queue does not advance
    /// again until the pipeline reports back; failure is terminal (no
    /// automatic install retry).
    async fn run_install(&mut self, root: &Path, archive_path: &Path) -> Result<(), LauncherError> {
        self.state = LauncherState::Installing;
        self.sink.on_progress_label("Installing base game...");
        info!(archive = %archive_path.display(), "starting client install");

        // An interrupted earlier run may have left the archive at the
        // queue head; installing is what retires it.
        if self.config.queue_head() == Some(self.manifest.client_archive()) {
            self.config.pop_head();
            self.store.save(&self.config)?;
        }

        let layout = self.layout.clone();
        let root = root.to_path_buf();
        let archive = archive_path.to_path_buf();
        let delete_archive = self.config.delete_client_zip_after_install;
        let result = tokio::task::spawn_blocking(move || {
            install::install_client(&root, &archive, &layout, delete_archive)
        })
        .await
        .map_err(|join_error| InstallError::aborted(join_error.to_string()))?;

        match result {
            Ok(()) => {
                info!("client install finished");
                Ok(())
            }
            Err(error) => {
                warn!(error = %error, "client install failed");
                self.state = LauncherState::Failed;
                self.sink.on_progress_label("Installation failed");
                self.sink.on_task_failed();
                Err(LauncherError::Install(error))
            }
        }
    }
}
