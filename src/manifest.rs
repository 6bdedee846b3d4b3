//! Remote content manifest: which files make up the game client and where
//! each of them is downloaded from.
//!
//! File identifiers are install-root-relative paths with forward slashes
//! (`wow.exe`, `Data/patch-5.MPQ`). One identifier is reserved for the
//! client archive; its completion hands control to the install pipeline
//! instead of advancing the download queue.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Joins a forward-slash file identifier onto a root directory, one
/// component at a time so the result is correct on every platform.
pub(crate) fn join_relative(root: &Path, id: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for component in id.split('/').filter(|part| !part.is_empty()) {
        path.push(component);
    }
    path
}

/// Maps file identifiers to their download URLs and names the required
/// client files the orchestrator checks for staleness on every start.
#[derive(Debug, Clone)]
pub struct Manifest {
    client_archive: String,
    required_files: Vec<String>,
    urls: BTreeMap<String, String>,
}

impl Manifest {
    /// Builds a manifest.
    ///
    /// `entries` maps file identifiers to URLs and must cover both the
    /// client archive and every required file. `required_files` is the
    /// ordered set scanned on startup; download order follows it.
    #[must_use]
    pub fn new(
        client_archive: impl Into<String>,
        entries: impl IntoIterator<Item = (String, String)>,
        required_files: Vec<String>,
    ) -> Self {
        Self {
            client_archive: client_archive.into(),
            required_files,
            urls: entries.into_iter().collect(),
        }
    }

    /// The reserved identifier of the base-client archive.
    #[must_use]
    pub fn client_archive(&self) -> &str {
        &self.client_archive
    }

    /// Whether the identifier names the base-client archive.
    #[must_use]
    pub fn is_client_archive(&self, id: &str) -> bool {
        id == self.client_archive
    }

    /// The files checked for staleness on startup, in download order.
    #[must_use]
    pub fn required_files(&self) -> &[String] {
        &self.required_files
    }

    /// Download URL for a file identifier, if known.
    #[must_use]
    pub fn url_for(&self, id: &str) -> Option<&str> {
        self.urls.get(id).map(String::as_str)
    }

    /// Destination path of a file identifier under the install root.
    #[must_use]
    pub fn dest_path(install_root: &Path, id: &str) -> PathBuf {
        join_relative(install_root, id)
    }

    /// Bare file name of an identifier (the key used in the persisted
    /// version map).
    #[must_use]
    pub fn file_name(id: &str) -> &str {
        id.rsplit('/').next().unwrap_or(id)
    }
}

/// Where the installation stands, derived on demand.
///
/// Never persisted: it is a pure function of what is on disk plus the
/// download queue, so storing it would only let it drift out of sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallState {
    /// Required client files are absent.
    NotInstalled,
    /// The base-client install flow started but has not completed.
    InstallInProgress,
    /// Client present and nothing queued.
    UpToDate,
    /// Client present but outdated files are queued for download.
    UpdateAvailable,
}

/// Derives the install state from its three inputs.
#[must_use]
pub fn derive_install_state(
    client_present: bool,
    queue_empty: bool,
    install_in_progress: bool,
) -> InstallState {
    if install_in_progress {
        InstallState::InstallInProgress
    } else if !client_present {
        InstallState::NotInstalled
    } else if queue_empty {
        InstallState::UpToDate
    } else {
        InstallState::UpdateAvailable
    }
}
