//! Filesystem helpers shared by the state store and the fallback writer.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{debug, warn};

use certkeeper_config::with_suffix;

/// Write `contents` to a temporary sibling, then rename it over `path`.
///
/// `mode` is applied before the rename so the final file never exists with
/// looser permissions.
pub fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let tmp = stage(path, contents, mode)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

/// Write `<path>.tmp` with `mode`, synced and ready to rename over `path`
fn stage(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<PathBuf> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let tmp = with_suffix(path, "tmp");
    match write_synced(&tmp, contents, mode) {
        Ok(()) => Ok(tmp),
        Err(e) => {
            let _ = fs::remove_file(&tmp);
            Err(e)
        }
    }
}

fn write_synced(path: &Path, contents: &[u8], mode: u32) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    Ok(())
}

/// Replace a certificate/key pair so that the two files always match.
///
/// Both files are staged before either is renamed. The certificate goes in
/// first; if the key then fails to land, the previous certificate is put
/// back (or the new one removed when there was none). On error the pair on
/// disk is the one that was there before.
pub fn write_pair_atomic(
    cert_path: &Path,
    cert_pem: &[u8],
    key_path: &Path,
    key_pem: &[u8],
) -> std::io::Result<()> {
    let key_tmp = stage(key_path, key_pem, 0o600)?;
    let cert_tmp = match stage(cert_path, cert_pem, 0o644) {
        Ok(tmp) => tmp,
        Err(e) => {
            let _ = fs::remove_file(&key_tmp);
            return Err(e);
        }
    };

    let previous_cert = if cert_path.is_file() {
        Some(fs::read(cert_path)?)
    } else {
        None
    };

    if let Err(e) = fs::rename(&cert_tmp, cert_path) {
        let _ = fs::remove_file(&cert_tmp);
        let _ = fs::remove_file(&key_tmp);
        return Err(e);
    }

    if let Err(e) = fs::rename(&key_tmp, key_path) {
        let _ = fs::remove_file(&key_tmp);
        let restored = match &previous_cert {
            Some(old) => write_atomic(cert_path, old, 0o644),
            None => fs::remove_file(cert_path),
        };
        if let Err(restore_err) = restored {
            warn!(
                path = %cert_path.display(),
                error = %restore_err,
                "Failed to restore certificate after key write failed"
            );
        }
        return Err(e);
    }

    Ok(())
}

/// Copy `path` to `<path>.backup.<timestamp>` if it exists.
///
/// Returns the backup path, or `None` when there was nothing to back up.
pub fn backup_file(path: &Path) -> std::io::Result<Option<PathBuf>> {
    if !path.exists() {
        return Ok(None);
    }

    let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let backup = with_suffix(path, &format!("backup.{}", stamp));
    fs::copy(path, &backup)?;

    debug!(
        original = %path.display(),
        backup = %backup.display(),
        "Backed up file"
    );
    Ok(Some(backup))
}

/// Best-effort backup of a certificate pair; failures are only logged
pub fn backup_pair(cert_path: &Path, key_path: &Path) -> Vec<PathBuf> {
    let mut backups = Vec::new();
    for path in [cert_path, key_path] {
        match backup_file(path) {
            Ok(Some(backup)) => backups.push(backup),
            Ok(None) => {}
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "Failed to back up file, continuing"
                );
            }
        }
    }
    backups
}
