//! End-to-end orchestration tests: queue scan, serial downloads, install
//! handoff, bounded retry, cancellation, and state persistence.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use launcher_core::config::JsonFileStore;
use launcher_core::download::RetryPolicy;
use launcher_core::install::InstallLayout;
use launcher_core::manifest::Manifest;
use launcher_core::orchestrator::{LauncherError, LauncherState, Orchestrator, ProgressSink};
use launcher_core::StateStore;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Sink recording the callbacks it receives, in order.
#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<String>>,
}

impl RecordingSink {
    fn recorded(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl ProgressSink for RecordingSink {
    fn on_progress(&self, _percent: f64) {}

    fn on_progress_label(&self, label: &str) {
        if !label.starts_with("Progress:") {
            self.push(format!("label: {label}"));
        }
    }

    fn on_task_finished(&self, path: &Path, _etag: &str) {
        self.push(format!(
            "finished: {}",
            path.file_name().unwrap().to_string_lossy()
        ));
    }

    fn on_self_update_finished(&self, path: &Path) {
        self.push(format!(
            "self-update: {}",
            path.file_name().unwrap().to_string_lossy()
        ));
    }

    fn on_task_failed(&self) {
        self.push("failed".to_string());
    }
}

/// A minimal client archive: one data file and a stock executable inside
/// the versioned top-level folder.
fn client_archive_bytes() -> Vec<u8> {
    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        let options = zip::write::FileOptions::default();
        writer
            .start_file("WoW 3.3.5/Wow.exe", options)
            .unwrap();
        writer.write_all(b"stock binary").unwrap();
        writer
            .start_file("WoW 3.3.5/Data/common.MPQ", options)
            .unwrap();
        writer.write_all(b"base game data").unwrap();
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

async fn mount_file(server: &MockServer, route: &str, etag: &str, body: Vec<u8>) {
    Mock::given(path(route))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("etag", etag)
                .set_body_bytes(body),
        )
        .mount(server)
        .await;
}

fn manifest_for(server: &MockServer) -> Manifest {
    Manifest::new(
        "wow-client.zip",
        [
            (
                "wow-client.zip".to_string(),
                format!("{}/wow-client.zip", server.uri()),
            ),
            (
                "Data/patch-5.MPQ".to_string(),
                format!("{}/patch-5.MPQ", server.uri()),
            ),
        ],
        vec!["Data/patch-5.MPQ".to_string()],
    )
}

struct Harness {
    dir: TempDir,
    sink: Arc<RecordingSink>,
    orchestrator: Orchestrator,
}

impl Harness {
    fn game_root(&self) -> PathBuf {
        self.dir.path().join("game")
    }

    fn store(&self) -> JsonFileStore {
        JsonFileStore::new(self.dir.path().join("config.json"))
    }
}

fn build_harness(server: &MockServer, preset_queue: &[&str]) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = JsonFileStore::new(dir.path().join("config.json"));

    let mut config = store.load().unwrap();
    config.installation_path = Some(dir.path().join("game"));
    for id in preset_queue {
        config.enqueue(id);
    }
    store.save(&config).unwrap();

    let sink = Arc::new(RecordingSink::default());
    let orchestrator = Orchestrator::new(
        Arc::new(store),
        manifest_for(server),
        InstallLayout::new("logon.example.com"),
        Arc::clone(&sink) as Arc<dyn ProgressSink>,
    )
    .unwrap()
    .with_retry_policy(RetryPolicy::new(
        3,
        Duration::from_millis(20),
        Duration::from_millis(100),
        2.0,
    ));

    Harness {
        dir,
        sink,
        orchestrator,
    }
}

#[tokio::test]
async fn scan_and_enqueue_is_idempotent() {
    let server = MockServer::start().await;
    mount_file(&server, "/patch-5.MPQ", "\"p5-v1\"", b"patch".to_vec()).await;

    let mut harness = build_harness(&server, &[]);
    let appended = harness.orchestrator.scan_outdated_files().await.unwrap();
    assert_eq!(appended, 1, "missing patch must be queued");

    let again = harness.orchestrator.scan_outdated_files().await.unwrap();
    assert_eq!(again, 0, "second scan must not duplicate the entry");
    assert_eq!(
        harness.orchestrator.config().download_queue,
        vec!["Data/patch-5.MPQ".to_string()]
    );
}

#[tokio::test]
async fn full_install_flow_runs_pipeline_before_next_item() {
    let server = MockServer::start().await;
    mount_file(&server, "/wow-client.zip", "\"zip-v1\"", client_archive_bytes()).await;
    mount_file(&server, "/patch-5.MPQ", "\"p5-v1\"", b"patch five data".to_vec()).await;

    let mut harness = build_harness(&server, &[]);
    harness.orchestrator.scan_outdated_files().await.unwrap();
    assert!(harness.orchestrator.ensure_client_queued().unwrap());
    assert_eq!(
        harness.orchestrator.config().download_queue,
        vec!["wow-client.zip".to_string(), "Data/patch-5.MPQ".to_string()]
    );

    let state = harness.orchestrator.run().await.unwrap();
    assert_eq!(state, LauncherState::UpToDate);

    let root = harness.game_root();
    // Install pipeline ran: extracted data relocated, realmlist patched,
    // stock executable dropped, archive removed.
    assert_eq!(
        std::fs::read(root.join("Data/common.MPQ")).unwrap(),
        b"base game data"
    );
    assert_eq!(
        std::fs::read_to_string(root.join("Data/enUS/realmlist.wtf")).unwrap(),
        "set realmlist logon.example.com\n"
    );
    assert!(!root.join("Wow.exe").exists());
    assert!(!root.join("wow-client.zip").exists());
    assert!(!root.join("WoW 3.3.5").exists());

    // The patch downloaded after the install.
    assert_eq!(
        std::fs::read(root.join("Data/patch-5.MPQ")).unwrap(),
        b"patch five data"
    );

    // Callback ordering: archive finished -> install -> patch finished.
    let events = harness.sink.recorded();
    let install_at = events
        .iter()
        .position(|event| event.contains("Installing"))
        .expect("install label reported");
    let patch_at = events
        .iter()
        .position(|event| event == "finished: patch-5.MPQ")
        .expect("patch completion reported");
    assert!(
        install_at < patch_at,
        "install must run before the next queue item: {events:?}"
    );

    // Durable state: fingerprints recorded, queue drained, flags cleared.
    let persisted = harness.store().load().unwrap();
    assert!(persisted.download_queue.is_empty());
    assert!(!persisted.install_in_progress);
    assert_eq!(persisted.paused_download_etag, None);
    assert_eq!(
        persisted.file_versions.get("wow-client.zip").map(String::as_str),
        Some("\"zip-v1\"")
    );
    assert_eq!(
        persisted.file_versions.get("patch-5.MPQ").map(String::as_str),
        Some("\"p5-v1\"")
    );
}

#[tokio::test]
async fn failed_install_stops_the_queue() {
    let server = MockServer::start().await;
    mount_file(
        &server,
        "/wow-client.zip",
        "\"zip-v1\"",
        b"this is not a zip archive".to_vec(),
    )
    .await;
    mount_file(&server, "/patch-5.MPQ", "\"p5-v1\"", b"patch".to_vec()).await;

    let mut harness = build_harness(&server, &["wow-client.zip", "Data/patch-5.MPQ"]);
    let result = harness.orchestrator.run().await;
    assert!(matches!(result, Err(LauncherError::Install(_))));
    assert_eq!(harness.orchestrator.state(), LauncherState::Failed);

    let root = harness.game_root();
    assert!(
        !root.join("Data").join("patch-5.MPQ").exists(),
        "the patch must never start when the install fails"
    );
    assert!(
        root.join("wow-client.zip").exists(),
        "a corrupt archive is kept for manual retry"
    );
    assert!(harness
        .sink
        .recorded()
        .iter()
        .any(|event| event == "failed"));

    // The remaining work is still queued for the next run.
    let persisted = harness.store().load().unwrap();
    assert_eq!(persisted.download_queue, vec!["Data/patch-5.MPQ".to_string()]);
}

#[tokio::test]
async fn transient_failure_retries_the_same_head() {
    let server = MockServer::start().await;
    // First GET blows up; every request after that succeeds.
    Mock::given(method("GET"))
        .and(path("/patch-5.MPQ"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_file(&server, "/patch-5.MPQ", "\"p5-v1\"", b"patch data".to_vec()).await;

    let mut harness = build_harness(&server, &["Data/patch-5.MPQ"]);
    let state = harness.orchestrator.run().await.unwrap();
    assert_eq!(state, LauncherState::UpToDate);

    assert_eq!(
        std::fs::read(harness.game_root().join("Data/patch-5.MPQ")).unwrap(),
        b"patch data"
    );
    let persisted = harness.store().load().unwrap();
    assert!(persisted.download_queue.is_empty());
}

#[tokio::test]
async fn exhausted_retries_surface_failure_and_keep_the_item() {
    let server = MockServer::start().await;
    Mock::given(path("/patch-5.MPQ"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let mut harness = build_harness(&server, &["Data/patch-5.MPQ"]);
    let result = harness.orchestrator.run().await;
    assert!(matches!(result, Err(LauncherError::Download(_))));
    assert_eq!(harness.orchestrator.state(), LauncherState::Failed);

    // The item is never silently dropped from the queue.
    let persisted = harness.store().load().unwrap();
    assert_eq!(persisted.download_queue, vec!["Data/patch-5.MPQ".to_string()]);
    assert!(harness
        .sink
        .recorded()
        .iter()
        .any(|event| event == "failed"));
}

#[tokio::test]
async fn cancel_persists_resumable_state() {
    let server = MockServer::start().await;
    mount_file(&server, "/patch-5.MPQ", "\"p5-v1\"", vec![5u8; 64 * 1024]).await;

    let dir = TempDir::new().unwrap();
    let store = JsonFileStore::new(dir.path().join("config.json"));
    let mut config = store.load().unwrap();
    config.installation_path = Some(dir.path().join("game"));
    config.enqueue("Data/patch-5.MPQ");
    // Throttle hard so the transfer is still running when cancel lands.
    config.bandwidth = 8;
    config.limit_bandwidth = true;
    store.save(&config).unwrap();

    let sink = Arc::new(RecordingSink::default());
    let orchestrator = Orchestrator::new(
        Arc::new(store),
        manifest_for(&server),
        InstallLayout::new("logon.example.com"),
        Arc::clone(&sink) as Arc<dyn ProgressSink>,
    )
    .unwrap();
    let control = orchestrator.control();

    let run = tokio::spawn(async move {
        let mut orchestrator = orchestrator;
        orchestrator.run().await
    });
    control.cancel();

    let state = run.await.unwrap().unwrap();
    assert_eq!(state, LauncherState::Idle);

    let persisted = JsonFileStore::new(dir.path().join("config.json"))
        .load()
        .unwrap();
    assert_eq!(
        persisted.paused_download_etag.as_deref(),
        Some("\"p5-v1\""),
        "the in-flight fingerprint must be persisted for drift detection"
    );
    assert_eq!(persisted.download_queue, vec!["Data/patch-5.MPQ".to_string()]);
}

#[tokio::test]
async fn interrupted_install_resumes_before_queue_processing() {
    let server = MockServer::start().await;
    mount_file(&server, "/patch-5.MPQ", "\"p5-v1\"", b"patch".to_vec()).await;

    let dir = TempDir::new().unwrap();
    let game_root = dir.path().join("game");
    std::fs::create_dir_all(&game_root).unwrap();
    // A previous run downloaded the archive and died before installing.
    std::fs::write(game_root.join("wow-client.zip"), client_archive_bytes()).unwrap();

    let store = JsonFileStore::new(dir.path().join("config.json"));
    let mut config = store.load().unwrap();
    config.installation_path = Some(game_root.clone());
    config.install_in_progress = true;
    config.enqueue("wow-client.zip");
    config.enqueue("Data/patch-5.MPQ");
    store.save(&config).unwrap();

    let sink = Arc::new(RecordingSink::default());
    let mut orchestrator = Orchestrator::new(
        Arc::new(store),
        manifest_for(&server),
        InstallLayout::new("logon.example.com"),
        Arc::clone(&sink) as Arc<dyn ProgressSink>,
    )
    .unwrap();

    let state = orchestrator.run().await.unwrap();
    assert_eq!(state, LauncherState::UpToDate);

    assert!(game_root.join("Data/common.MPQ").exists());
    assert!(!game_root.join("wow-client.zip").exists());
    assert!(game_root.join("Data/patch-5.MPQ").exists());

    let persisted = JsonFileStore::new(dir.path().join("config.json"))
        .load()
        .unwrap();
    assert!(persisted.download_queue.is_empty());
    assert!(!persisted.install_in_progress);
}
