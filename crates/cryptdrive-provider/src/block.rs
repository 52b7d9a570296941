//! Provider contract for loop devices, mounts, and device discovery.

use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};

/// Loop device bound to a regular file (e.g. `/dev/loop3`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopDevice {
    pub path: PathBuf,
}

impl LoopDevice {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Kernel name of the device (`loop3` for `/dev/loop3`).
    pub fn kernel_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }
}

impl fmt::Display for LoopDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

/// Abstraction over block-level host facilities.
pub trait BlockDevice {
    type Error: Error + Send + Sync + 'static;

    /// Bind `image` to the first free loop device.
    fn attach_loop(&self, image: &Path) -> Result<LoopDevice, Self::Error>;

    /// Release a loop device binding.
    fn detach_loop(&self, device: &LoopDevice) -> Result<(), Self::Error>;

    /// Return the loop device `image` is already bound to, if any.
    fn find_loop(&self, image: &Path) -> Result<Option<LoopDevice>, Self::Error>;

    /// Device-mapper names currently stacked on top of `device`.
    fn mapping_holders(&self, device: &LoopDevice) -> Result<Vec<String>, Self::Error>;

    /// Mount the filesystem on `device` at `mount_point`.
    fn mount(&self, device: &Path, mount_point: &Path) -> Result<(), Self::Error>;

    /// Unmount whatever is mounted at `mount_point`.
    fn unmount(&self, mount_point: &Path) -> Result<(), Self::Error>;

    /// Return whether `path` is currently a mount point.
    fn is_mount_point(&self, path: &Path) -> Result<bool, Self::Error>;

    /// Return whether `device` is mounted anywhere.
    fn is_device_mounted(&self, device: &Path) -> Result<bool, Self::Error>;

    /// Mount `device` using its fstab entry.
    fn mount_from_fstab(&self, device: &Path) -> Result<(), Self::Error>;

    /// Probe the filesystem/content type of `device` (e.g. `ext4`, `LVM2_member`).
    fn filesystem_type(&self, device: &Path) -> Result<Option<String>, Self::Error>;

    /// Create a filesystem of `fs_type` on `device`.
    fn make_filesystem(&self, device: &Path, fs_type: &str) -> Result<(), Self::Error>;

    /// Resolve a filesystem UUID to the device node currently carrying it.
    fn resolve_uuid(&self, uuid: &str) -> Result<Option<PathBuf>, Self::Error>;
}
