#![forbid(unsafe_code)]

//! Host providers for cryptdrive.
//!
//! Integrates with the host via:
//! - `cryptsetup` (isLuks/luksFormat/open/close/luksAddKey/status)
//! - `losetup`, `mount`, `umount`, `mkfs.<fs>`, `blkid`
//! - `/proc/mounts`, `/dev/disk/by-uuid`, and `/sys/class/block`

mod block;
mod command;
mod cryptsetup;
mod mounts;

pub use block::SystemBlockDevice;
pub use cryptsetup::SystemCryptsetup;
