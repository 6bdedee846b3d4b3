//! Resumable HTTP download engine.
//!
//! The engine streams one URL at a time to disk with byte-range resumption,
//! pause/resume, cooperative cancellation, bandwidth throttling, and
//! per-chunk progress reporting. Staleness decisions are driven by
//! lightweight metadata probes ([`Probe`]) reading `ETag`, `Content-Length`
//! and `Last-Modified`.
//!
//! # Example
//!
//! ```no_run
//! use launcher_core::download::{DownloadTask, Probe, TaskEvent};
//!
//! # async fn example() {
//! let task = DownloadTask::new(
//!     "https://cdn.example.com/Data/patch-5.MPQ",
//!     "/games/wow/Data/patch-5.MPQ",
//! );
//! let (mut handle, mut events) = task.spawn(Probe::new());
//! while let Some(event) = events.recv().await {
//!     if let TaskEvent::Finished { dest_path, etag } = event {
//!         println!("done: {} ({etag})", dest_path.display());
//!     }
//! }
//! handle.wait().await;
//! # }
//! ```

mod error;
mod probe;
mod progress;
mod retry;
mod task;
mod throttle;

pub use error::DownloadError;
pub use probe::{Probe, RemoteMetadata};
pub use progress::{ProgressSnapshot, format_duration};
pub use retry::{DEFAULT_MAX_RETRIES, FailureType, RetryDecision, RetryPolicy, classify_error};
pub use task::{DownloadTask, TaskCommand, TaskEvent, TaskHandle};
pub use throttle::Throttle;
