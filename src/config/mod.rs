//! Persisted launcher configuration and the state store behind it.
//!
//! Everything the launcher must remember across restarts lives in a single
//! [`LauncherConfig`] value: the install location, the pending download
//! queue, the fingerprint of every file already fetched, and the handful of
//! flags that gate install and self-update recovery. Persistence goes
//! through the [`StateStore`] trait so the orchestration logic never knows
//! (or cares) where the bytes land; [`JsonFileStore`] is the standard
//! JSON-file implementation.
//!
//! The orchestrator is the only writer at runtime. [`JsonFileStore::save`]
//! still takes an exclusive advisory lock and writes through a temp file so
//! that a second launcher instance can never interleave a partial write.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

/// Errors raised while loading or saving the persisted configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Filesystem error while reading or writing the config file.
    #[error("IO error accessing {path}: {source}")]
    Io {
        /// The file that could not be accessed.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The config file exists but does not parse as valid JSON.
    #[error("malformed configuration in {path}: {source}")]
    Malformed {
        /// The file that failed to parse.
        path: PathBuf,
        /// The underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },
}

impl ConfigError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Launcher state that survives process restarts.
///
/// Serialized as a flat JSON object. Missing keys deserialize to their
/// defaults, so configs written by older launcher builds keep loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LauncherConfig {
    /// Root directory the game client is (or will be) installed into.
    pub installation_path: Option<PathBuf>,

    /// Ordered file identifiers still waiting to be downloaded.
    /// The head is the file currently (or next) in flight. No duplicates.
    pub download_queue: Vec<String>,

    /// File name -> last recorded remote fingerprint (ETag).
    pub file_versions: BTreeMap<String, String>,

    /// Fingerprint that was in flight when a download was paused or the
    /// launcher quit mid-transfer. Compared on resume to detect remote
    /// content drift.
    pub paused_download_etag: Option<String>,

    /// True while the base-client install flow has started but not finished.
    pub install_in_progress: bool,

    /// Bandwidth cap in KB/s. 0 means unlimited.
    pub bandwidth: u64,

    /// Whether the bandwidth cap is applied at all.
    pub limit_bandwidth: bool,

    /// Remove the client archive once installation succeeds.
    pub delete_client_zip_after_install: bool,

    /// Set between swapping in a new launcher executable and the first
    /// clean start of that executable.
    pub just_updated: bool,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            installation_path: None,
            download_queue: Vec::new(),
            file_versions: BTreeMap::new(),
            paused_download_etag: None,
            install_in_progress: false,
            bandwidth: 0,
            limit_bandwidth: false,
            delete_client_zip_after_install: true,
            just_updated: false,
        }
    }
}

impl LauncherConfig {
    /// Appends a file identifier to the download queue.
    ///
    /// Returns `true` if the identifier was appended, `false` if it was
    /// already queued (duplicates are forbidden).
    pub fn enqueue(&mut self, id: &str) -> bool {
        if self.download_queue.iter().any(|queued| queued == id) {
            return false;
        }
        self.download_queue.push(id.to_string());
        true
    }

    /// Inserts a file identifier at the front of the queue, unless queued.
    ///
    /// Used for the client archive, which must download before any patch.
    pub fn enqueue_front(&mut self, id: &str) -> bool {
        if self.download_queue.iter().any(|queued| queued == id) {
            return false;
        }
        self.download_queue.insert(0, id.to_string());
        true
    }

    /// The identifier currently (or next) being downloaded.
    #[must_use]
    pub fn queue_head(&self) -> Option<&str> {
        self.download_queue.first().map(String::as_str)
    }

    /// Removes and returns the queue head.
    pub fn pop_head(&mut self) -> Option<String> {
        if self.download_queue.is_empty() {
            None
        } else {
            Some(self.download_queue.remove(0))
        }
    }

    /// Records the fingerprint of a completed download under its file name.
    pub fn record_file_version(&mut self, name: &str, etag: &str) {
        self.file_versions
            .insert(name.to_string(), etag.to_string());
    }

    /// Last recorded fingerprint for a file name, if any.
    #[must_use]
    pub fn recorded_version(&self, name: &str) -> Option<&str> {
        self.file_versions.get(name).map(String::as_str)
    }

    /// Effective bandwidth cap in bytes per second (0 = unlimited).
    #[must_use]
    pub fn bandwidth_limit_bytes(&self) -> u64 {
        if self.limit_bandwidth {
            self.bandwidth.saturating_mul(1024)
        } else {
            0
        }
    }
}

/// Persistence interface for [`LauncherConfig`].
///
/// Passed by reference into the orchestrator so the persistence mechanism
/// stays swappable (JSON file in production, in-memory store in tests).
pub trait StateStore: Send + Sync {
    /// Loads the persisted configuration. A store with no prior state
    /// returns the default configuration, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if existing state cannot be read or parsed.
    fn load(&self) -> Result<LauncherConfig, ConfigError>;

    /// Durably persists the configuration. Must not leave a partially
    /// written state behind on failure.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the state cannot be written.
    fn save(&self, config: &LauncherConfig) -> Result<(), ConfigError>;
}

/// JSON-file backed [`StateStore`].
///
/// Saves go to a sibling temp file first and are renamed into place, so a
/// crash mid-save leaves the previous config intact. An exclusive advisory
/// lock on a sibling `.lock` file serializes writers across processes.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    /// Creates a store persisting to the given file path.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The file this store reads and writes.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_os_string();
        os.push(".lock");
        PathBuf::from(os)
    }

    fn temp_path(&self) -> PathBuf {
        let mut os = self.path.as_os_str().to_os_string();
        os.push(".tmp");
        PathBuf::from(os)
    }
}

impl StateStore for JsonFileStore {
    #[instrument(level = "debug", skip(self), fields(path = %self.path.display()))]
    fn load(&self) -> Result<LauncherConfig, ConfigError> {
        if !self.path.exists() {
            debug!("no configuration file yet, starting from defaults");
            return Ok(LauncherConfig::default());
        }
        let raw =
            fs::read_to_string(&self.path).map_err(|e| ConfigError::io(self.path.clone(), e))?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Malformed {
            path: self.path.clone(),
            source,
        })
    }

    #[instrument(level = "debug", skip(self, config), fields(path = %self.path.display()))]
    fn save(&self, config: &LauncherConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| ConfigError::io(parent.to_path_buf(), e))?;
        }

        let lock_path = self.lock_path();
        let lock_file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| ConfigError::io(lock_path.clone(), e))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| ConfigError::io(lock_path.clone(), e))?;

        let serialized =
            serde_json::to_string_pretty(config).map_err(|source| ConfigError::Malformed {
                path: self.path.clone(),
                source,
            })?;

        let temp_path = self.temp_path();
        let mut temp_file =
            fs::File::create(&temp_path).map_err(|e| ConfigError::io(temp_path.clone(), e))?;
        temp_file
            .write_all(serialized.as_bytes())
            .map_err(|e| ConfigError::io(temp_path.clone(), e))?;
        temp_file
            .sync_all()
            .map_err(|e| ConfigError::io(temp_path.clone(), e))?;
        drop(temp_file);

        fs::rename(&temp_path, &self.path).map_err(|e| ConfigError::io(self.path.clone(), e))?;
        debug!("configuration saved");
        Ok(())
        // lock_file drops here, releasing the advisory lock
    }
}
