//! Whole-file replacement for generated artifacts
//!
//! Readers (a reloading tunnel daemon) must never observe a half-written file,
//! so every write goes to a sibling temp file and is renamed into place.

use crate::Result;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;
use uuid::Uuid;

/// SHA-256 hex digest of text
pub fn digest(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

fn temp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "artifact".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
}

/// Atomically replace `path` with `contents`, applying `mode` on unix.
pub async fn write_atomic(path: &Path, contents: &str, mode: Option<u32>) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let tmp_path = temp_sibling(path);
    if let Err(e) = write_then_rename(&tmp_path, path, contents, mode).await {
        let _ = fs::remove_file(&tmp_path).await;
        return Err(e);
    }

    debug!("Wrote {} ({} bytes)", path.display(), contents.len());
    Ok(())
}

async fn write_then_rename(tmp_path: &Path, path: &Path, contents: &str, mode: Option<u32>) -> Result<()> {
    fs::write(tmp_path, contents).await?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(tmp_path, std::fs::Permissions::from_mode(mode)).await?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    fs::rename(tmp_path, path).await?;
    Ok(())
}

/// Write only when the on-disk digest differs. Returns whether the contents
/// changed; an unchanged file still gets `mode` reapplied.
pub async fn write_atomic_if_changed(path: &Path, contents: &str, mode: Option<u32>) -> Result<bool> {
    if let Ok(existing) = fs::read_to_string(path).await {
        if digest(&existing) == digest(contents) {
            debug!("{} unchanged, skipping write", path.display());
            ensure_mode(path, mode).await?;
            return Ok(false);
        }
    }
    write_atomic(path, contents, mode).await?;
    Ok(true)
}

#[cfg(unix)]
async fn ensure_mode(path: &Path, mode: Option<u32>) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let Some(mode) = mode else {
        return Ok(());
    };
    let current = fs::metadata(path).await?.permissions().mode() & 0o7777;
    if current != mode {
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        debug!("{} mode {:o} corrected to {:o}", path.display(), current, mode);
    }
    Ok(())
}

#[cfg(not(unix))]
async fn ensure_mode(_path: &Path, _mode: Option<u32>) -> Result<()> {
    Ok(())
}

/// Remove a file, treating "already gone" as success. Returns whether it existed.
pub async fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}
