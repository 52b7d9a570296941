//! Key material generation and persistence helpers.

use crate::error::{CryptdriveError, CryptdriveResult};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fs::{self, DirBuilder};
use std::io::Write;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::Path;
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

/// Mode applied to key files at rest.
pub const KEY_FILE_MODE: u32 = 0o400;

/// Draw `size` bytes from the operating system CSPRNG.
pub fn generate_key(size: usize) -> CryptdriveResult<Zeroizing<Vec<u8>>> {
    if size == 0 {
        return Err(CryptdriveError::Configuration(
            "key size must be greater than 0".into(),
        ));
    }
    let mut key = Zeroizing::new(vec![0u8; size]);
    OsRng
        .try_fill_bytes(&mut key[..])
        .map_err(|err| CryptdriveError::Resource(format!("entropy source failed: {err}")))?;
    Ok(key)
}

/// Hex SHA-256 of `key`, safe to log.
pub fn key_fingerprint(key: &[u8]) -> String {
    hex::encode(Sha256::digest(key))
}

/// Write raw key material to `path` with owner-only permissions.
///
/// The bytes go to a temporary file created `0600` next to the destination,
/// which is then narrowed to `0400`, synced, and renamed into place.
pub fn write_key_file(path: &Path, key: &[u8]) -> CryptdriveResult<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .ok_or_else(|| {
            CryptdriveError::Configuration(format!(
                "key file {} has no parent directory",
                path.display()
            ))
        })?;
    if !parent.exists() {
        DirBuilder::new().recursive(true).mode(0o700).create(parent)?;
    }

    let mut temp = NamedTempFile::new_in(parent)?;
    temp.as_file_mut().write_all(key)?;
    temp.as_file_mut().flush()?;
    fs::set_permissions(temp.path(), fs::Permissions::from_mode(KEY_FILE_MODE))?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|err| CryptdriveError::Io(err.error))?;
    let _ = sync_dir(parent);
    Ok(())
}

/// Return whether `path` holds a regular, non-empty key file.
pub fn key_file_present(path: &Path) -> bool {
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.len() > 0)
        .unwrap_or(false)
}

/// Narrow an existing key file back to `0400` if someone widened it.
pub fn restrict_key_file(path: &Path) -> CryptdriveResult<bool> {
    let meta = fs::metadata(path)?;
    if meta.permissions().mode() & 0o777 == KEY_FILE_MODE {
        return Ok(false);
    }
    fs::set_permissions(path, fs::Permissions::from_mode(KEY_FILE_MODE))?;
    Ok(true)
}

fn sync_dir(dir: &Path) -> std::io::Result<()> {
    fs::File::open(dir).and_then(|file| file.sync_all())
}
