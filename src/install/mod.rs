//! Client install pipeline: archive to playable game folder.
//!
//! Once the client archive is fully downloaded, [`install_client`] runs a
//! strictly ordered sequence of steps: extract the archive, relocate the
//! contents of its versioned top-level folder into the install root, drop
//! the stock executable and oversized cinematic assets, point the client
//! at the configured realm, and remove the archive.
//!
//! Every step checks its own precondition before acting, so the pipeline
//! can be safely re-entered after a crash at any point. There is no
//! rollback: a failure leaves the disk exactly as far as the completed
//! steps got, and "installation failed" is surfaced to the caller.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::manifest::join_relative;

/// Errors raised by the install pipeline.
#[derive(Debug, Error)]
pub enum InstallError {
    /// The client archive is corrupt or unreadable. The archive is left in
    /// place so a manual retry stays possible.
    #[error("archive error in {path}: {source}")]
    Archive {
        /// The archive that failed.
        path: PathBuf,
        /// The underlying archive error.
        #[source]
        source: zip::result::ZipError,
    },

    /// Filesystem error during one of the install steps.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path the step was working on.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The install task stopped before finishing (worker panic or abort).
    #[error("install aborted: {reason}")]
    Aborted {
        /// Human-readable description of what went wrong.
        reason: String,
    },
}

impl InstallError {
    fn archive(path: impl Into<PathBuf>, source: zip::result::ZipError) -> Self {
        Self::Archive {
            path: path.into(),
            source,
        }
    }

    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an aborted error.
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }
}

/// One data archive the client must carry to count as installed.
#[derive(Debug, Clone)]
pub struct ClientDataFile {
    /// File name under the `Data` directory.
    pub name: String,
    /// Expected SHA-256 digest (lowercase hex). `None` skips verification
    /// and only checks presence.
    pub sha256: Option<String>,
}

impl ClientDataFile {
    /// A data file checked for presence only.
    #[must_use]
    pub fn present(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sha256: None,
        }
    }

    /// A data file verified against a SHA-256 digest.
    #[must_use]
    pub fn verified(name: impl Into<String>, sha256: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sha256: Some(sha256.into()),
        }
    }
}

/// Version-specific constants driving the pipeline.
#[derive(Debug, Clone)]
pub struct InstallLayout {
    /// Top-level folder name the archive extracts into.
    pub nested_folder: String,
    /// Stock executable shipped inside the archive, replaced by a patched
    /// one downloaded separately.
    pub stock_executable: String,
    /// Expected SHA-256 of the stock executable. When set, removal is
    /// gated on a match so a user-customized binary is never deleted.
    pub stock_executable_sha256: Option<String>,
    /// Oversized cinematic assets removed to save disk space, as
    /// forward-slash paths relative to the install root.
    pub cinematics: Vec<String>,
    /// Realmlist file, relative to the install root.
    pub realmlist_path: String,
    /// Host the realmlist points the client at.
    pub realmlist_host: String,
    /// Data archives that must be present for the client to count as
    /// installed.
    pub data_files: Vec<ClientDataFile>,
}

impl InstallLayout {
    /// The standard Wrath-client layout pointing at the given realm host.
    #[must_use]
    pub fn new(realmlist_host: impl Into<String>) -> Self {
        Self {
            nested_folder: "WoW 3.3.5".to_string(),
            stock_executable: "Wow.exe".to_string(),
            stock_executable_sha256: None,
            cinematics: vec![
                "Data/enUS/Interface/Cinematics/wow_fotlk_1024.avi".to_string(),
                "Data/enUS/Interface/Cinematics/wow_wrathgate_1024.avi".to_string(),
            ],
            realmlist_path: "Data/enUS/realmlist.wtf".to_string(),
            realmlist_host: realmlist_host.into(),
            data_files: [
                "common.MPQ",
                "common-2.MPQ",
                "expansion.MPQ",
                "lichking.MPQ",
                "patch.MPQ",
                "patch-2.MPQ",
                "patch-3.MPQ",
            ]
            .into_iter()
            .map(ClientDataFile::present)
            .collect(),
        }
    }
}

/// Runs the install pipeline.
///
/// Safe to re-run: each step checks its precondition, so a pipeline
/// interrupted at any point picks up where it left off.
///
/// # Errors
///
/// Returns [`InstallError::Archive`] for a corrupt archive (the archive is
/// not deleted) and [`InstallError::Io`] for filesystem failures.
#[instrument(skip(layout), fields(root = %install_root.display(), archive = %archive_path.display()))]
pub fn install_client(
    install_root: &Path,
    archive_path: &Path,
    layout: &InstallLayout,
    delete_archive: bool,
) -> Result<(), InstallError> {
    if archive_path.exists() {
        info!("extracting client archive");
        extract_archive(archive_path, install_root)?;
    }

    relocate_nested_folder(install_root, &layout.nested_folder)?;
    remove_nested_folder(install_root, &layout.nested_folder)?;
    remove_stock_executable(install_root, layout)?;
    remove_cinematics(install_root, &layout.cinematics);
    write_realmlist(install_root, layout)?;

    if delete_archive && archive_path.exists() {
        info!("removing client archive");
        fs::remove_file(archive_path).map_err(|e| InstallError::io(archive_path, e))?;
    }

    info!("client install complete");
    Ok(())
}

/// Whether the required client data archives are present (and verified,
/// where digests are configured) under `{install_root}/Data`.
#[must_use]
pub fn client_files_present(install_root: &Path, data_files: &[ClientDataFile]) -> bool {
    if data_files.is_empty() {
        return false;
    }
    for data_file in data_files {
        let path = install_root.join("Data").join(&data_file.name);
        debug!(path = %path.display(), "checking client data file");
        if !path.exists() {
            debug!(path = %path.display(), "client data file missing");
            return false;
        }
        if let Some(expected) = &data_file.sha256 {
            match sha256_file(&path) {
                Ok(digest) if digest.eq_ignore_ascii_case(expected) => {}
                Ok(_) => {
                    debug!(path = %path.display(), "client data file digest mismatch");
                    return false;
                }
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "failed to hash client data file");
                    return false;
                }
            }
        }
    }
    true
}

/// SHA-256 digest of a file as lowercase hex.
///
/// # Errors
///
/// Returns [`InstallError::Io`] if the file cannot be read.
pub fn sha256_file(path: &Path) -> Result<String, InstallError> {
    let mut file = fs::File::open(path).map_err(|e| InstallError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|e| InstallError::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn extract_archive(archive_path: &Path, dest: &Path) -> Result<(), InstallError> {
    let file = fs::File::open(archive_path).map_err(|e| InstallError::io(archive_path, e))?;
    let mut archive =
        zip::ZipArchive::new(file).map_err(|e| InstallError::archive(archive_path, e))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| InstallError::archive(archive_path, e))?;
        // enclosed_name rejects entries that would escape the destination
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!(entry = entry.name(), "skipping archive entry with unsafe path");
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path).map_err(|e| InstallError::io(&out_path, e))?;
        } else {
            if let Some(parent) = out_path.parent() {
                fs::create_dir_all(parent).map_err(|e| InstallError::io(parent, e))?;
            }
            let mut out_file =
                fs::File::create(&out_path).map_err(|e| InstallError::io(&out_path, e))?;
            std::io::copy(&mut entry, &mut out_file)
                .map_err(|e| InstallError::io(&out_path, e))?;
        }
    }
    Ok(())
}

/// Moves everything out of `{install_root}/{nested}` up into the install
/// root, preserving relative sub-paths. A missing nested folder means the
/// step already ran; that is not an error.
fn relocate_nested_folder(install_root: &Path, nested: &str) -> Result<(), InstallError> {
    let source = install_root.join(nested);
    if !source.exists() {
        debug!(nested, "no nested folder to relocate");
        return Ok(());
    }
    info!(nested, "relocating extracted files into the install root");
    move_tree(&source, &source, install_root)
}

fn move_tree(dir: &Path, source_root: &Path, dest_root: &Path) -> Result<(), InstallError> {
    for entry in fs::read_dir(dir).map_err(|e| InstallError::io(dir, e))? {
        let entry = entry.map_err(|e| InstallError::io(dir, e))?;
        let path = entry.path();
        let relative = path.strip_prefix(source_root).unwrap_or(&path).to_path_buf();
        let dest = dest_root.join(&relative);
        let file_type = entry.file_type().map_err(|e| InstallError::io(&path, e))?;

        if file_type.is_dir() {
            fs::create_dir_all(&dest).map_err(|e| InstallError::io(&dest, e))?;
            move_tree(&path, source_root, dest_root)?;
        } else {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent).map_err(|e| InstallError::io(parent, e))?;
            }
            debug!(from = %path.display(), to = %dest.display(), "moving file");
            fs::rename(&path, &dest).map_err(|e| InstallError::io(&path, e))?;
        }
    }
    Ok(())
}

/// Removes the emptied nested folder. Leftover files keep it in place;
/// "already removed" is tolerated.
fn remove_nested_folder(install_root: &Path, nested: &str) -> Result<(), InstallError> {
    let source = install_root.join(nested);
    if !source.exists() {
        return Ok(());
    }
    if tree_has_files(&source)? {
        warn!(nested, "nested folder still has files, leaving it in place");
        return Ok(());
    }
    match fs::remove_dir_all(&source) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(InstallError::io(source, error)),
    }
}

fn tree_has_files(dir: &Path) -> Result<bool, InstallError> {
    for entry in fs::read_dir(dir).map_err(|e| InstallError::io(dir, e))? {
        let entry = entry.map_err(|e| InstallError::io(dir, e))?;
        let file_type = entry
            .file_type()
            .map_err(|e| InstallError::io(entry.path(), e))?;
        if file_type.is_dir() {
            if tree_has_files(&entry.path())? {
                return Ok(true);
            }
        } else {
            return Ok(true);
        }
    }
    Ok(false)
}

fn remove_stock_executable(
    install_root: &Path,
    layout: &InstallLayout,
) -> Result<(), InstallError> {
    let exe = install_root.join(&layout.stock_executable);
    if !exe.exists() {
        return Ok(());
    }
    if let Some(expected) = &layout.stock_executable_sha256 {
        let digest = sha256_file(&exe)?;
        if !digest.eq_ignore_ascii_case(expected) {
            info!(
                exe = %exe.display(),
                "stock executable does not match the shipped digest, keeping it"
            );
            return Ok(());
        }
    }
    info!(exe = %exe.display(), "removing stock executable");
    fs::remove_file(&exe).map_err(|e| InstallError::io(exe, e))
}

/// Best effort: a cinematic that is missing or fails to delete is logged
/// and skipped.
fn remove_cinematics(install_root: &Path, cinematics: &[String]) {
    for cinematic in cinematics {
        let path = join_relative(install_root, cinematic);
        if !path.exists() {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => info!(path = %path.display(), "removed cinematic asset"),
            Err(error) => warn!(path = %path.display(), error = %error, "failed to remove cinematic asset"),
        }
    }
}

/// Full-file overwrite, not a merge: whatever realm the archive shipped
/// with is replaced wholesale.
fn write_realmlist(install_root: &Path, layout: &InstallLayout) -> Result<(), InstallError> {
    let path = join_relative(install_root, &layout.realmlist_path);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| InstallError::io(parent, e))?;
    }
    info!(path = %path.display(), host = %layout.realmlist_host, "writing realmlist");
    fs::write(&path, format!("set realmlist {}\n", layout.realmlist_host))
        .map_err(|e| InstallError::io(path, e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::FileOptions;

    fn build_archive(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        for (name, contents) in entries {
            writer
                .start_file(*name, FileOptions::default())
                .unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap();
    }

    fn sample_layout() -> InstallLayout {
        InstallLayout {
            cinematics: vec!["Data/enUS/Interface/Cinematics/intro.avi".to_string()],
            ..InstallLayout::new("logon.example.com")
        }
    }

    #[test]
    fn full_pipeline_produces_playable_layout() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let archive = root.join("wow-client.zip");
        build_archive(
            &archive,
            &[
                ("WoW 3.3.5/Wow.exe", b"stock binary".as_slice()),
                ("WoW 3.3.5/Data/common.MPQ", b"data".as_slice()),
                (
                    "WoW 3.3.5/Data/enUS/Interface/Cinematics/intro.avi",
                    b"video".as_slice(),
                ),
                (
                    "WoW 3.3.5/Data/enUS/realmlist.wtf",
                    b"set realmlist shipped.example.com".as_slice(),
                ),
            ],
        );

        install_client(root, &archive, &sample_layout(), true).unwrap();

        assert!(root.join("Data/common.MPQ").exists());
        assert!(!root.join("WoW 3.3.5").exists(), "nested folder removed");
        assert!(!root.join("Wow.exe").exists(), "stock executable removed");
        assert!(
            !root
                .join("Data/enUS/Interface/Cinematics/intro.avi")
                .exists(),
            "cinematic removed"
        );
        assert!(!archive.exists(), "archive removed");

        let realmlist = fs::read_to_string(root.join("Data/enUS/realmlist.wtf")).unwrap();
        assert_eq!(realmlist, "set realmlist logon.example.com\n");
    }

    #[test]
    fn pipeline_keeps_archive_when_configured() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let archive = root.join("wow-client.zip");
        build_archive(&archive, &[("WoW 3.3.5/Data/common.MPQ", b"data".as_slice())]);

        install_client(root, &archive, &sample_layout(), false).unwrap();
        assert!(archive.exists());
    }

    #[test]
    fn pipeline_is_safe_to_rerun() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let archive = root.join("wow-client.zip");
        build_archive(&archive, &[("WoW 3.3.5/Data/common.MPQ", b"data".as_slice())]);

        install_client(root, &archive, &sample_layout(), true).unwrap();
        // Second run: archive gone, nested folder gone, realmlist present.
        install_client(root, &archive, &sample_layout(), true).unwrap();

        assert!(root.join("Data/common.MPQ").exists());
    }

    #[test]
    fn corrupt_archive_fails_and_is_kept() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let archive = root.join("wow-client.zip");
        fs::write(&archive, b"this is not a zip archive").unwrap();

        let result = install_client(root, &archive, &sample_layout(), true);
        assert!(matches!(result, Err(InstallError::Archive { .. })));
        assert!(archive.exists(), "corrupt archive kept for manual retry");
    }

    #[test]
    fn customized_stock_executable_survives() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("Wow.exe"), b"user patched binary").unwrap();

        let layout = InstallLayout {
            // digest of some other content, so the gate must refuse removal
            stock_executable_sha256: Some(
                "0000000000000000000000000000000000000000000000000000000000000000".to_string(),
            ),
            ..sample_layout()
        };
        let archive = root.join("wow-client.zip");
        install_client(root, &archive, &layout, true).unwrap();
        assert!(root.join("Wow.exe").exists());
    }

    #[test]
    fn matching_stock_executable_is_removed() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("Wow.exe"), b"stock binary").unwrap();
        let digest = sha256_file(&root.join("Wow.exe")).unwrap();

        let layout = InstallLayout {
            stock_executable_sha256: Some(digest),
            ..sample_layout()
        };
        let archive = root.join("wow-client.zip");
        install_client(root, &archive, &layout, true).unwrap();
        assert!(!root.join("Wow.exe").exists());
    }

    #[test]
    fn sha256_file_matches_known_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn client_presence_requires_all_data_files() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Data")).unwrap();
        fs::write(root.join("Data/common.MPQ"), b"data").unwrap();

        let both = vec![
            ClientDataFile::present("common.MPQ"),
            ClientDataFile::present("expansion.MPQ"),
        ];
        assert!(!client_files_present(root, &both));

        fs::write(root.join("Data/expansion.MPQ"), b"data").unwrap();
        assert!(client_files_present(root, &both));
    }

    #[test]
    fn client_presence_verifies_digests() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("Data")).unwrap();
        fs::write(root.join("Data/common.MPQ"), b"abc").unwrap();

        let good = vec![ClientDataFile::verified(
            "common.MPQ",
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad",
        )];
        assert!(client_files_present(root, &good));

        let bad = vec![ClientDataFile::verified("common.MPQ", "00")];
        assert!(!client_files_present(root, &bad));
    }

    #[test]
    fn empty_data_file_list_never_counts_as_installed() {
        let dir = TempDir::new().unwrap();
        assert!(!client_files_present(dir.path(), &[]));
    }
}
