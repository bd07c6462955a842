//! Scratch files, stale-recording cleanup and handoff to shared storage.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use broadcast_writer::CONTAINER_EXTENSION;

/// Returns true if the path has the container extension, in any case.
pub fn is_container_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(CONTAINER_EXTENSION))
}

/// Delete every container file left in `dir` by earlier sessions.
///
/// Failures are logged and skipped. Returns the number of files removed.
#[instrument(name = "purge_stale_recordings", skip_all, fields(dir = %dir.display()))]
pub fn purge_stale_recordings(dir: &Path) -> usize {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return 0,
        Err(e) => {
            warn!("Failed to list shared directory: {}", e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || !is_container_file(&path) {
            continue;
        }
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "Removed stale recording");
                removed += 1;
            }
            Err(e) => warn!(path = %path.display(), "Failed to remove stale recording: {}", e),
        }
    }

    if removed > 0 {
        info!(removed, "Purged stale recordings");
    }
    removed
}

/// Fresh scratch path `<dir>/<uuid>.mp4`; the directory is created and any
/// file already at the path is removed.
pub fn prepare_scratch_path(dir: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.{}", Uuid::new_v4(), CONTAINER_EXTENSION));
    match fs::remove_file(&path) {
        Ok(()) => debug!(path = %path.display(), "Removed file at scratch path"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    Ok(path)
}

/// Move a finished recording into `dest_dir`, keeping its file name.
///
/// Falls back to copy and delete when a rename is not possible, e.g. across
/// filesystems.
#[instrument(name = "relocate_recording", skip_all, fields(src = %src.display()))]
pub fn relocate_recording(src: &Path, dest_dir: &Path) -> io::Result<PathBuf> {
    let file_name = src.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "recording path has no file name")
    })?;

    fs::create_dir_all(dest_dir)?;
    let dest = dest_dir.join(file_name);

    if let Err(e) = fs::rename(src, &dest) {
        debug!("Rename failed ({}), copying instead", e);
        fs::copy(src, &dest)?;
        fs::remove_file(src)?;
    }

    info!(dest = %dest.display(), "Recording moved to shared storage");
    Ok(dest)
}
