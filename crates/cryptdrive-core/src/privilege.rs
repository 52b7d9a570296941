use crate::error::{CryptdriveError, CryptdriveResult};

/// Loop devices, device-mapper and mount all require root.
pub fn ensure_root() -> CryptdriveResult<()> {
    if running_as_root() {
        Ok(())
    } else {
        Err(CryptdriveError::Privilege(
            "crypto-drive-manager must run as root to attach loop devices, open LUKS volumes, and mount filesystems".into(),
        ))
    }
}

#[cfg(unix)]
pub fn running_as_root() -> bool {
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
pub fn running_as_root() -> bool {
    false
}
