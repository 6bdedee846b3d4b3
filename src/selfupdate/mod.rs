//! Launcher self-update: detect, download, swap, relaunch.
//!
//! A newer launcher release is detected by comparing semantic version
//! triples. The matching platform asset downloads to a `.new` sibling of
//! the running executable through the regular download engine (release
//! assets carry no fingerprint, so completion arrives on the self-update
//! branch). The swap is a rename dance: park the running executable under
//! a temporary name, rename the new binary into its place, persist a
//! "just updated" marker, and relaunch detached. The next clean start
//! deletes the parked binary and clears the marker.

use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

use semver::Version;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::config::{ConfigError, LauncherConfig, StateStore};
use crate::download::{DownloadError, DownloadTask, Probe, TaskEvent, TaskHandle, Throttle};
use crate::orchestrator::ProgressSink;

/// Name the running executable is parked under during the swap.
pub const REPLACED_EXECUTABLE_NAME: &str = "temp_launcher";

/// Suffix of the staging path the new binary downloads to.
const STAGED_SUFFIX: &str = ".new";

/// Errors raised by the self-update pipeline.
#[derive(Debug, Error)]
pub enum UpdateError {
    /// The releases endpoint could not be reached or returned garbage.
    #[error("release endpoint error: {0}")]
    Network(#[from] reqwest::Error),

    /// A release tag does not parse as a semantic version.
    #[error("malformed release tag {tag}: {source}")]
    BadVersion {
        /// The offending tag.
        tag: String,
        /// The underlying parse error.
        #[source]
        source: semver::Error,
    },

    /// No release asset matches the current platform suffix.
    #[error("no release asset matches platform suffix {suffix:?}")]
    NoMatchingAsset {
        /// The suffix that was searched for.
        suffix: String,
    },

    /// The replacement download failed.
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The replacement download stopped without a terminal signal.
    #[error("self-update download interrupted")]
    Interrupted,

    /// Filesystem error during the executable swap.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path the swap was working on.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Persisting the update marker failed.
    #[error("configuration store error: {0}")]
    Config(#[from] ConfigError),
}

impl UpdateError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// One downloadable artifact attached to a release.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    /// Asset file name.
    pub name: String,
    /// Direct download URL.
    pub browser_download_url: String,
    /// Asset size in bytes, when the endpoint reports one.
    #[serde(default)]
    pub size: u64,
}

/// A published launcher release.
#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseInfo {
    /// Version tag, with or without a leading `v`.
    pub tag_name: String,
    /// Downloadable artifacts.
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

/// Compares two version strings component by component.
///
/// A leading `v` is stripped from either side before parsing.
///
/// # Errors
///
/// Returns [`UpdateError::BadVersion`] if either string is not a
/// `major.minor.patch` triple.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering, UpdateError> {
    let parse = |raw: &str| {
        Version::parse(raw.strip_prefix('v').unwrap_or(raw)).map_err(|source| {
            UpdateError::BadVersion {
                tag: raw.to_string(),
                source,
            }
        })
    };
    Ok(parse(a)?.cmp(&parse(b)?))
}

/// Fetches the latest release from a GitHub-style releases endpoint.
///
/// # Errors
///
/// Returns [`UpdateError::Network`] on transport or deserialization
/// failures.
#[instrument(skip(client))]
pub async fn fetch_latest_release(
    client: &reqwest::Client,
    releases_url: &str,
) -> Result<ReleaseInfo, UpdateError> {
    let release = client
        .get(releases_url)
        .send()
        .await?
        .error_for_status()?
        .json::<ReleaseInfo>()
        .await?;
    info!(tag = %release.tag_name, assets = release.assets.len(), "fetched latest release");
    Ok(release)
}

/// Whether the given release is newer than the running version.
///
/// # Errors
///
/// Returns [`UpdateError::BadVersion`] if either version fails to parse.
pub fn update_available(current_version: &str, latest: &ReleaseInfo) -> Result<bool, UpdateError> {
    Ok(compare_versions(&latest.tag_name, current_version)? == Ordering::Greater)
}

/// Picks the release asset for this platform by file-name suffix.
///
/// Zero matches skips the self-update for this run. Multiple matches are
/// ambiguous; the first is taken deterministically and the ambiguity is
/// logged.
///
/// # Errors
///
/// Returns [`UpdateError::NoMatchingAsset`] when nothing matches.
pub fn select_asset<'a>(
    assets: &'a [ReleaseAsset],
    platform_suffix: &str,
) -> Result<&'a ReleaseAsset, UpdateError> {
    let matching: Vec<&ReleaseAsset> = assets
        .iter()
        .filter(|asset| asset.name.ends_with(platform_suffix))
        .collect();
    match matching.as_slice() {
        [] => {
            warn!(suffix = platform_suffix, "no release asset matches this platform");
            Err(UpdateError::NoMatchingAsset {
                suffix: platform_suffix.to_string(),
            })
        }
        [only] => Ok(only),
        [first, ..] => {
            warn!(
                suffix = platform_suffix,
                candidates = matching.len(),
                chosen = %first.name,
                "multiple release assets match this platform, taking the first"
            );
            Ok(first)
        }
    }
}

/// Staging path the replacement binary downloads to: `{executable}.new`.
#[must_use]
pub fn staged_download_path(current_exe: &Path) -> PathBuf {
    let mut os = current_exe.as_os_str().to_os_string();
    os.push(STAGED_SUFFIX);
    PathBuf::from(os)
}

/// Starts downloading a release asset next to the current executable.
///
/// The asset size from the release listing seeds the expected total, since
/// release storage often omits usable metadata.
#[must_use]
pub fn stage_release_asset(
    asset: &ReleaseAsset,
    current_exe: &Path,
    probe: Probe,
    throttle: Throttle,
) -> (TaskHandle, tokio::sync::mpsc::UnboundedReceiver<TaskEvent>) {
    let mut task = DownloadTask::new(&asset.browser_download_url, staged_download_path(current_exe))
        .with_throttle(throttle);
    if asset.size > 0 {
        task = task.with_total_size(asset.size);
    }
    info!(asset = %asset.name, url = %asset.browser_download_url, "downloading launcher update");
    task.spawn(probe)
}

/// Downloads the asset and swaps it into place, reporting through the sink.
///
/// On success the executable at `current_exe` is the new binary and the
/// "just updated" marker is persisted; the caller decides when to
/// [`relaunch`] and exit.
///
/// # Errors
///
/// Returns [`UpdateError`] if the download or the swap fails.
pub async fn run_self_update(
    asset: &ReleaseAsset,
    current_exe: &Path,
    probe: Probe,
    sink: &dyn ProgressSink,
    config: &mut LauncherConfig,
    store: &dyn StateStore,
) -> Result<(), UpdateError> {
    let (mut handle, mut events) = stage_release_asset(asset, current_exe, probe, Throttle::unlimited());

    while let Some(event) = events.recv().await {
        match event {
            TaskEvent::Progress(snapshot) => {
                sink.on_progress(snapshot.percent);
                sink.on_progress_label(&snapshot.label());
            }
            // Release assets have no fingerprint, but a mirror that serves
            // one still completes the same swap.
            TaskEvent::SelfUpdateAsset { dest_path }
            | TaskEvent::Finished { dest_path, .. } => {
                handle.wait().await;
                sink.on_self_update_finished(&dest_path);
                apply_update(current_exe, &dest_path, config, store)?;
                return Ok(());
            }
            TaskEvent::Failed(error) => {
                handle.wait().await;
                sink.on_task_failed();
                return Err(UpdateError::Download(error));
            }
            TaskEvent::Paused { .. } | TaskEvent::Cancelled { .. } => {}
        }
    }
    handle.wait().await;
    Err(UpdateError::Interrupted)
}

/// Swaps the downloaded binary into the executable's place.
///
/// The running executable is renamed to [`REPLACED_EXECUTABLE_NAME`] (it
/// keeps running from the renamed file), the staged binary takes its path,
/// and the "just updated" marker is persisted for cleanup on next start.
///
/// # Errors
///
/// Returns [`UpdateError::Io`] if a rename fails and
/// [`UpdateError::Config`] if the marker cannot be persisted.
#[instrument(skip(config, store), fields(exe = %current_exe.display()))]
pub fn apply_update(
    current_exe: &Path,
    staged: &Path,
    config: &mut LauncherConfig,
    store: &dyn StateStore,
) -> Result<(), UpdateError> {
    let parked = current_exe
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(REPLACED_EXECUTABLE_NAME);

    info!(parked = %parked.display(), "parking the running executable");
    fs::rename(current_exe, &parked).map_err(|e| UpdateError::io(current_exe, e))?;
    info!(staged = %staged.display(), "moving the new executable into place");
    fs::rename(staged, current_exe).map_err(|e| UpdateError::io(staged, e))?;

    config.just_updated = true;
    store.save(config)?;
    Ok(())
}

/// Spawns the (new) executable as a detached process.
///
/// # Errors
///
/// Returns [`UpdateError::Io`] if the process cannot be spawned.
pub fn relaunch(exe: &Path) -> Result<(), UpdateError> {
    info!(exe = %exe.display(), "relaunching");
    std::process::Command::new(exe)
        .spawn()
        .map(|_child| ())
        .map_err(|e| UpdateError::io(exe, e))
}

/// Cold-start cleanup after a swap: removes the parked old executable and
/// clears the marker. Returns whether anything was cleaned up.
///
/// # Errors
///
/// Returns [`UpdateError::Io`] if the parked file exists but cannot be
/// removed, and [`UpdateError::Config`] if clearing the marker fails.
pub fn finish_pending_update(
    config: &mut LauncherConfig,
    store: &dyn StateStore,
    exe_dir: &Path,
) -> Result<bool, UpdateError> {
    if !config.just_updated {
        return Ok(false);
    }
    let parked = exe_dir.join(REPLACED_EXECUTABLE_NAME);
    match fs::remove_file(&parked) {
        Ok(()) => info!(parked = %parked.display(), "removed parked executable"),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => return Err(UpdateError::io(parked, error)),
    }
    config.just_updated = false;
    store.save(config)?;
    Ok(true)
}
