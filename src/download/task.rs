//! Resumable, pausable, rate-limited transfer of one URL to one path.
//!
//! A [`DownloadTask`] describes the transfer; [`DownloadTask::spawn`] starts
//! a dedicated worker and hands back a [`TaskHandle`] plus an event stream.
//! Control flows to the worker as explicit [`TaskCommand`] messages — never
//! as shared mutable flags — and is honored at chunk boundaries and pause
//! poll ticks.
//!
//! # Transfer contract
//!
//! Bytes stream into `{destination}.part`; the destination path appears
//! only via an atomic rename after the byte count checks out, so a reader
//! never observes a partially written destination. A stream that ends
//! short is reported as a restartable failure and the partial file is kept:
//! the next attempt resumes with an HTTP range request. A fingerprint
//! mismatch after a pause discards the partial file and restarts the
//! transfer from zero inside the same worker, because ranged resumption
//! against bytes of the old content would silently corrupt the result.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::RANGE;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, instrument, warn};

use super::error::DownloadError;
use super::probe::Probe;
use super::progress::ProgressSnapshot;
use super::throttle::Throttle;

/// Poll interval while suspended waiting for resume or cancel.
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Suffix marking an in-flight partial file.
const PARTIAL_SUFFIX: &str = ".part";

/// Connect timeout for the transfer client.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Per-read timeout for the transfer client. There is deliberately no
/// overall request timeout: large transfers take as long as they take.
const READ_TIMEOUT_SECS: u64 = 300;

/// Control messages accepted by a running worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskCommand {
    /// Suspend the transfer at the next chunk boundary.
    Pause,
    /// Resume a suspended transfer. Carries the fingerprint that was
    /// persisted when the transfer paused, for drift detection.
    Resume {
        /// Fingerprint recorded at pause time.
        paused_etag: Option<String>,
    },
    /// Stop the transfer. The partial file is left in place.
    Cancel,
}

/// Events emitted by a worker over its event channel.
#[derive(Debug)]
pub enum TaskEvent {
    /// A chunk landed; fresh progress figures.
    Progress(ProgressSnapshot),
    /// The transfer suspended. The fingerprint must be persisted so a
    /// later resume can detect remote drift.
    Paused {
        /// Fingerprint captured when the transfer started.
        etag: Option<String>,
    },
    /// The transfer stopped on request. The in-flight fingerprint should
    /// be persisted exactly like on pause.
    Cancelled {
        /// Fingerprint captured when the transfer started.
        etag: Option<String>,
    },
    /// The destination file is complete and in place.
    Finished {
        /// Final destination path.
        dest_path: PathBuf,
        /// Fingerprint re-probed after completion, for the version map.
        etag: String,
    },
    /// A fingerprint-less asset (a launcher release binary) is complete.
    SelfUpdateAsset {
        /// Final destination path.
        dest_path: PathBuf,
    },
    /// The transfer failed. Restartable failures keep the partial file.
    Failed(DownloadError),
}

/// Description of one transfer, built then [`spawn`](DownloadTask::spawn)ed.
#[derive(Debug, Clone)]
pub struct DownloadTask {
    url: String,
    dest_path: PathBuf,
    total_size: Option<u64>,
    paused_etag: Option<String>,
    throttle: Throttle,
}

impl DownloadTask {
    /// Creates a task streaming `url` to `dest_path`.
    #[must_use]
    pub fn new(url: impl Into<String>, dest_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            dest_path: dest_path.into(),
            total_size: None,
            paused_etag: None,
            throttle: Throttle::unlimited(),
        }
    }

    /// Overrides the expected total size instead of probing for it.
    #[must_use]
    pub fn with_total_size(mut self, total_size: u64) -> Self {
        self.total_size = Some(total_size);
        self
    }

    /// Supplies the fingerprint persisted when a previous run of this
    /// transfer was paused or interrupted.
    #[must_use]
    pub fn with_paused_etag(mut self, paused_etag: Option<String>) -> Self {
        self.paused_etag = paused_etag;
        self
    }

    /// Applies a bandwidth cap.
    #[must_use]
    pub fn with_throttle(mut self, throttle: Throttle) -> Self {
        self.throttle = throttle;
        self
    }

    /// The URL this task downloads.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// The destination path of this task.
    #[must_use]
    pub fn dest_path(&self) -> &Path {
        &self.dest_path
    }

    /// The partial-file path for a destination: `{destination}.part`.
    #[must_use]
    pub fn partial_path(dest_path: &Path) -> PathBuf {
        let mut os = dest_path.as_os_str().to_os_string();
        os.push(PARTIAL_SUFFIX);
        PathBuf::from(os)
    }

    /// Starts the transfer on a background worker.
    ///
    /// Returns the control handle and the event stream. The worker owns the
    /// destination path until it emits a terminal event and exits; callers
    /// must [`TaskHandle::wait`] after cancelling before touching the path.
    #[must_use]
    pub fn spawn(self, probe: Probe) -> (TaskHandle, mpsc::UnboundedReceiver<TaskEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let worker = Worker {
            task: self,
            probe,
            client: build_transfer_client(),
            commands: command_rx,
            events: event_tx,
        };
        let join = tokio::spawn(worker.run());
        (
            TaskHandle {
                commands: command_tx,
                join: Some(join),
            },
            event_rx,
        )
    }
}

/// Control handle for a spawned transfer.
#[derive(Debug)]
pub struct TaskHandle {
    commands: mpsc::UnboundedSender<TaskCommand>,
    join: Option<JoinHandle<()>>,
}

impl TaskHandle {
    /// Requests suspension. Non-blocking; the worker acknowledges with a
    /// [`TaskEvent::Paused`] carrying the fingerprint to persist.
    pub fn pause(&self) {
        let _ = self.commands.send(TaskCommand::Pause);
    }

    /// Requests resumption, passing back the persisted pause fingerprint.
    pub fn resume(&self, paused_etag: Option<String>) {
        let _ = self.commands.send(TaskCommand::Resume { paused_etag });
    }

    /// Requests cancellation. Takes effect at the next chunk boundary or
    /// pause poll tick.
    pub fn cancel(&self) {
        let _ = self.commands.send(TaskCommand::Cancel);
    }

    /// Whether the worker has exited.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(JoinHandle::is_finished)
    }

    /// Waits for the worker to fully exit. Idempotent.
    pub async fn wait(&mut self) {
        if let Some(join) = self.join.take()
            && let Err(error) = join.await
        {
            warn!(error = %error, "download worker panicked");
        }
    }
}

/// Builds the long-lived client used for the actual transfers.
///
/// # Panics
///
/// Panics if the builder fails with the static configuration, which should
/// never happen in practice.
#[allow(clippy::expect_used)]
fn build_transfer_client() -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .read_timeout(Duration::from_secs(READ_TIMEOUT_SECS))
        .build()
        .expect("failed to build HTTP client with static configuration")
}

/// What one pass of the transfer loop concluded.
enum TransferOutcome {
    /// Terminal event already emitted.
    Done,
    /// Cancelled on request; partial file kept.
    Cancelled,
    /// Remote content drifted; partial discarded, run the transfer again.
    Restart,
}

/// Reaction to a single control command.
enum CommandOutcome {
    Continue,
    Paused,
    Resumed { drift: bool },
    Cancelled,
}

struct Worker {
    task: DownloadTask,
    probe: Probe,
    client: reqwest::Client,
    commands: mpsc::UnboundedReceiver<TaskCommand>,
    events: mpsc::UnboundedSender<TaskEvent>,
}

impl Worker {
    #[instrument(skip(self), fields(url = %self.task.url, dest = %self.task.dest_path.display()))]
    async fn run(mut self) {
        let mut paused_etag = self.task.paused_etag.take();
        loop {
            match self.transfer_once(paused_etag.take()).await {
                Ok(TransferOutcome::Restart) => {
                    info!("remote content changed, restarting transfer from zero");
                }
                Ok(TransferOutcome::Done | TransferOutcome::Cancelled) => break,
                Err(error) => {
                    warn!(error = %error, "transfer failed");
                    let _ = self.events.send(TaskEvent::Failed(error));
                    break;
                }
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn transfer_once(
        &mut self,
        paused_etag: Option<String>,
    ) -> Result<TransferOutcome, DownloadError> {
        let url = self.task.url.clone();
        let dest = self.task.dest_path.clone();
        let temp = DownloadTask::partial_path(&dest);

        if let Some(parent) = temp.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::io(parent.to_path_buf(), e))?;
        }

        // Fresh probe: captures the in-flight fingerprint and defaults the
        // total size when the caller did not supply one.
        let remote = self.probe.fetch(&url).await?;
        let etag = remote.etag.clone();
        let total = self.task.total_size.unwrap_or(remote.content_length);

        // The remote changed while this transfer sat paused: ranged
        // resumption against the old partial bytes would corrupt the file.
        if let Some(paused) = paused_etag
            && etag.as_deref() != Some(paused.as_str())
        {
            debug!("pause fingerprint no longer matches, discarding partial file");
            remove_if_exists(&temp).await?;
        }

        let existing = tokio::fs::metadata(&temp)
            .await
            .map(|meta| meta.len())
            .unwrap_or(0);
        let ranged = existing > 0;

        let mut request = self.client.get(&url);
        if ranged {
            debug!(existing, "resuming with a range request");
            request = request.header(RANGE, format!("bytes={existing}-"));
        }
        let response = request
            .send()
            .await
            .map_err(|e| DownloadError::from_reqwest(&url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(&url, status.as_u16()));
        }

        let resumed = ranged && status == StatusCode::PARTIAL_CONTENT;
        if ranged && !resumed {
            debug!("server ignored the range request, restarting from zero");
        }

        let file = if resumed {
            OpenOptions::new()
                .append(true)
                .open(&temp)
                .await
                .map_err(|e| DownloadError::io(temp.clone(), e))?
        } else {
            File::create(&temp)
                .await
                .map_err(|e| DownloadError::io(temp.clone(), e))?
        };
        let mut writer = BufWriter::new(file);

        let mut current = if resumed { existing } else { 0 };
        let mut baseline = current;
        let mut started = Instant::now();
        let mut paused = false;
        let mut stream = response.bytes_stream();

        loop {
            let mut cancelled = false;
            let mut drift = false;

            // Apply pending control commands at the chunk boundary.
            loop {
                match self.commands.try_recv() {
                    Ok(command) => {
                        match handle_command(command, &mut paused, &etag, &self.probe, &url, &self.events)
                            .await?
                        {
                            CommandOutcome::Cancelled => {
                                cancelled = true;
                                break;
                            }
                            CommandOutcome::Resumed { drift: drifted } => {
                                if drifted {
                                    drift = true;
                                    break;
                                }
                                // Restart the speed baseline so figures are
                                // not averaged over the paused gap.
                                baseline = current;
                                started = Instant::now();
                            }
                            CommandOutcome::Paused | CommandOutcome::Continue => {}
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    // Handle dropped without cancelling: finish the transfer.
                    Err(TryRecvError::Disconnected) => break,
                }
            }

            // Suspended: wait for commands at a fixed poll interval rather
            // than spinning over the stream.
            while paused && !cancelled && !drift {
                match timeout(PAUSE_POLL_INTERVAL, self.commands.recv()).await {
                    Ok(Some(command)) => {
                        match handle_command(command, &mut paused, &etag, &self.probe, &url, &self.events)
                            .await?
                        {
                            CommandOutcome::Cancelled => cancelled = true,
                            CommandOutcome::Resumed { drift: drifted } => {
                                if drifted {
                                    drift = true;
                                } else {
                                    baseline = current;
                                    started = Instant::now();
                                }
                            }
                            CommandOutcome::Paused | CommandOutcome::Continue => {}
                        }
                    }
                    Ok(None) => {
                        // Paused with every handle gone: nobody can resume.
                        let _ = self.events.send(TaskEvent::Cancelled { etag: etag.clone() });
                        cancelled = true;
                    }
                    Err(_elapsed) => {}
                }
            }

            if cancelled {
                let _ = writer.flush().await;
                info!("transfer cancelled, partial file kept for a later resume");
                return Ok(TransferOutcome::Cancelled);
            }
            if drift {
                let _ = writer.flush().await;
                drop(writer);
                remove_if_exists(&temp).await?;
                return Ok(TransferOutcome::Restart);
            }

            let chunk_started = Instant::now();
            let Some(next) = stream.next().await else {
                break;
            };
            let chunk = next.map_err(|e| DownloadError::from_reqwest(&url, e))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(temp.clone(), e))?;
            current += chunk.len() as u64;

            if let Some(delay) = self
                .task
                .throttle
                .required_delay(chunk.len(), chunk_started.elapsed())
            {
                tokio::time::sleep(delay).await;
            }

            let _ = self.events.send(TaskEvent::Progress(ProgressSnapshot::compute(
                baseline,
                current,
                total,
                started.elapsed(),
            )));
        }

        writer
            .flush()
            .await
            .map_err(|e| DownloadError::io(temp.clone(), e))?;
        drop(writer);

        let actual = tokio::fs::metadata(&temp)
            .await
            .map(|meta| meta.len())
            .unwrap_or(current);
        if actual < total {
            // Restartable: the partial bytes are real progress, a ranged
            // retry picks up from here.
            return Err(DownloadError::size_mismatch(temp, total, actual));
        }

        let _ = self.events.send(TaskEvent::Progress(ProgressSnapshot::compute(
            baseline,
            actual,
            total,
            started.elapsed(),
        )));

        tokio::fs::rename(&temp, &dest)
            .await
            .map_err(|e| DownloadError::io(dest.clone(), e))?;

        match etag {
            None => {
                info!(dest = %dest.display(), "launcher asset download finished");
                let _ = self.events.send(TaskEvent::SelfUpdateAsset { dest_path: dest });
            }
            Some(initial) => {
                // The fingerprint to persist is the one current right now.
                let final_etag = match self.probe.fetch_etag(&url).await {
                    Ok(Some(tag)) => tag,
                    Ok(None) => initial,
                    Err(error) => {
                        warn!(error = %error, "post-download fingerprint probe failed, keeping the starting one");
                        initial
                    }
                };
                info!(dest = %dest.display(), "download finished");
                let _ = self.events.send(TaskEvent::Finished {
                    dest_path: dest,
                    etag: final_etag,
                });
            }
        }

        Ok(TransferOutcome::Done)
    }
}

async fn handle_command(
    command: TaskCommand,
    paused: &mut bool,
    task_etag: &Option<String>,
    probe: &Probe,
    url: &str,
    events: &mpsc::UnboundedSender<TaskEvent>,
) -> Result<CommandOutcome, DownloadError> {
    match command {
        TaskCommand::Pause => {
            if *paused {
                return Ok(CommandOutcome::Continue);
            }
            *paused = true;
            let _ = events.send(TaskEvent::Paused {
                etag: task_etag.clone(),
            });
            Ok(CommandOutcome::Paused)
        }
        TaskCommand::Resume { paused_etag } => {
            if !*paused {
                return Ok(CommandOutcome::Continue);
            }
            // Re-validate against the remote as it is now; the content may
            // have been replaced while the transfer sat paused.
            let current = probe.fetch_etag(url).await?;
            *paused = false;
            let drift = paused_etag.is_some() && current != paused_etag;
            Ok(CommandOutcome::Resumed { drift })
        }
        TaskCommand::Cancel => {
            let _ = events.send(TaskEvent::Cancelled {
                etag: task_etag.clone(),
            });
            Ok(CommandOutcome::Cancelled)
        }
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), DownloadError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(DownloadError::io(path.to_path_buf(), error)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_path_appends_suffix() {
        let dest = Path::new("/games/wow/Data/patch-5.MPQ");
        assert_eq!(
            DownloadTask::partial_path(dest),
            PathBuf::from("/games/wow/Data/patch-5.MPQ.part")
        );
    }

    #[test]
    fn builders_accumulate() {
        let task = DownloadTask::new("https://cdn.example.com/wow.exe", "/games/wow/wow.exe")
            .with_total_size(42)
            .with_paused_etag(Some("\"v1\"".to_string()))
            .with_throttle(Throttle::new(1024));
        assert_eq!(task.url(), "https://cdn.example.com/wow.exe");
        assert_eq!(task.total_size, Some(42));
        assert_eq!(task.paused_etag.as_deref(), Some("\"v1\""));
        assert!(!task.throttle.is_unlimited());
    }
}
