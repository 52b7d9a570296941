//! Host implementation of [`BlockDevice`] over `losetup`, `mount`, `umount`,
//! `mkfs.<fs>`, `blkid`, the mount table, `/dev/disk/by-uuid`, and sysfs.

use crate::command::HostCommand;
use crate::mounts::{read_mount_table, MountEntry};
use cryptdrive_core::config::CryptdriveConfig;
use cryptdrive_core::error::{CryptdriveError, CryptdriveResult};
use cryptdrive_provider::{BlockDevice, LoopDevice};
use log::debug;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

const DEFAULT_LOSETUP_PATHS: &[&str] = &["/sbin/losetup", "/usr/sbin/losetup", "/usr/bin/losetup"];
const DEFAULT_MOUNT_PATHS: &[&str] = &["/bin/mount", "/usr/bin/mount", "/sbin/mount"];
const DEFAULT_UMOUNT_PATHS: &[&str] = &["/bin/umount", "/usr/bin/umount", "/sbin/umount"];
const DEFAULT_BLKID_PATHS: &[&str] = &["/sbin/blkid", "/usr/sbin/blkid", "/usr/bin/blkid"];
const MKFS_DIRS: &[&str] = &["/sbin", "/usr/sbin", "/usr/bin"];

/// `blkid` exit status when the device carries nothing it can identify.
const BLKID_NOT_FOUND: i32 = 2;

#[derive(Debug, Clone)]
pub struct SystemBlockDevice {
    losetup: HostCommand,
    mount: HostCommand,
    umount: HostCommand,
    blkid: HostCommand,
    mkfs_path: Option<String>,
    by_uuid_dir: PathBuf,
    mounts_path: PathBuf,
    sys_block_dir: PathBuf,
}

impl SystemBlockDevice {
    pub fn from_config(config: &CryptdriveConfig) -> CryptdriveResult<Self> {
        let system = &config.system;
        Ok(Self {
            losetup: HostCommand::resolve("losetup", system.losetup_path.as_deref(), DEFAULT_LOSETUP_PATHS)?,
            mount: HostCommand::resolve("mount", system.mount_path.as_deref(), DEFAULT_MOUNT_PATHS)?,
            umount: HostCommand::resolve("umount", system.umount_path.as_deref(), DEFAULT_UMOUNT_PATHS)?,
            blkid: HostCommand::resolve("blkid", system.blkid_path.as_deref(), DEFAULT_BLKID_PATHS)?,
            mkfs_path: system.mkfs_path.clone(),
            by_uuid_dir: system.by_uuid_dir.clone(),
            mounts_path: system.mounts_path.clone(),
            sys_block_dir: system.sys_block_dir.clone(),
        })
    }

    fn mount_table(&self) -> CryptdriveResult<Vec<MountEntry>> {
        read_mount_table(&self.mounts_path)
    }

    fn mkfs(&self, fs_type: &str) -> CryptdriveResult<HostCommand> {
        let tool = format!("mkfs.{fs_type}");
        let defaults: Vec<String> = MKFS_DIRS
            .iter()
            .map(|dir| format!("{dir}/{tool}"))
            .collect();
        let defaults: Vec<&str> = defaults.iter().map(String::as_str).collect();
        HostCommand::resolve(&tool, self.mkfs_path.as_deref(), &defaults)
    }

    /// Device-mapper name of the kernel block device `holder` (e.g. `dm-0`).
    fn dm_name(&self, holder: &str) -> Option<String> {
        fs::read_to_string(self.sys_block_dir.join(holder).join("dm").join("name"))
            .ok()
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
    }
}

impl BlockDevice for SystemBlockDevice {
    type Error = CryptdriveError;

    fn attach_loop(&self, image: &Path) -> CryptdriveResult<LoopDevice> {
        let out = self
            .losetup
            .run([OsStr::new("--find"), OsStr::new("--show"), image.as_os_str()], None)?;
        if !out.success() {
            let diagnostic = out.describe();
            let lower = diagnostic.to_ascii_lowercase();
            if lower.contains("free loop") || lower.contains("no such device") {
                return Err(CryptdriveError::Resource(format!(
                    "no free loop device for {}: {diagnostic}",
                    image.display()
                )));
            }
            return Err(CryptdriveError::Provider(format!(
                "losetup could not attach {}: {diagnostic} (exit code {})",
                image.display(),
                out.status
            )));
        }

        let device = out.stdout.trim();
        if device.is_empty() {
            return Err(CryptdriveError::Provider(format!(
                "losetup attached {} but did not report the loop device",
                image.display()
            )));
        }
        Ok(LoopDevice::new(device))
    }

    fn detach_loop(&self, device: &LoopDevice) -> CryptdriveResult<()> {
        self.losetup
            .run_checked([OsStr::new("-d"), device.path.as_os_str()], &format!("losetup -d {device}"))
            .map(|_| ())
    }

    fn find_loop(&self, image: &Path) -> CryptdriveResult<Option<LoopDevice>> {
        let out = self.losetup.run_checked(
            [OsStr::new("-j"), image.as_os_str()],
            &format!("losetup -j {}", image.display()),
        )?;
        Ok(parse_losetup_associations(&out.stdout))
    }

    fn mapping_holders(&self, device: &LoopDevice) -> CryptdriveResult<Vec<String>> {
        let Some(kernel_name) = device.kernel_name() else {
            return Ok(Vec::new());
        };
        let holders_dir = self.sys_block_dir.join(kernel_name).join("holders");
        let entries = match fs::read_dir(&holders_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut names = Vec::new();
        for entry in entries {
            let holder = entry?.file_name();
            let holder = holder.to_string_lossy();
            match self.dm_name(&holder) {
                Some(name) => names.push(name),
                None => debug!("{kernel_name} is held by {holder}, which is not a dm device"),
            }
        }
        names.sort();
        Ok(names)
    }

    fn mount(&self, device: &Path, mount_point: &Path) -> CryptdriveResult<()> {
        self.mount
            .run_checked(
                [device.as_os_str(), mount_point.as_os_str()],
                &format!("mount {} {}", device.display(), mount_point.display()),
            )
            .map(|_| ())
    }

    fn unmount(&self, mount_point: &Path) -> CryptdriveResult<()> {
        self.umount
            .run_checked(
                [mount_point.as_os_str()],
                &format!("umount {}", mount_point.display()),
            )
            .map(|_| ())
    }

    fn is_mount_point(&self, path: &Path) -> CryptdriveResult<bool> {
        let wanted = canonical(path);
        Ok(self
            .mount_table()?
            .iter()
            .any(|entry| canonical(&entry.mount_point) == wanted))
    }

    fn is_device_mounted(&self, device: &Path) -> CryptdriveResult<bool> {
        let wanted = canonical(device);
        Ok(self
            .mount_table()?
            .iter()
            .any(|entry| entry.device == device || canonical(&entry.device) == wanted))
    }

    fn mount_from_fstab(&self, device: &Path) -> CryptdriveResult<()> {
        self.mount
            .run_checked([device.as_os_str()], &format!("mount {}", device.display()))
            .map(|_| ())
    }

    fn filesystem_type(&self, device: &Path) -> CryptdriveResult<Option<String>> {
        let args = [
            OsStr::new("-o"),
            OsStr::new("value"),
            OsStr::new("-s"),
            OsStr::new("TYPE"),
            device.as_os_str(),
        ];
        let out = self.blkid.run(args, None)?;
        match out.status {
            0 => Ok(Some(out.stdout.trim().to_string()).filter(|kind| !kind.is_empty())),
            BLKID_NOT_FOUND => Ok(None),
            status => Err(CryptdriveError::Provider(format!(
                "blkid {} failed: {} (exit code {status})",
                device.display(),
                out.describe()
            ))),
        }
    }

    fn make_filesystem(&self, device: &Path, fs_type: &str) -> CryptdriveResult<()> {
        let mkfs = self.mkfs(fs_type)?;
        mkfs.run_checked(
            [device.as_os_str()],
            &format!("{} {}", mkfs.binary().display(), device.display()),
        )
        .map(|_| ())
    }

    fn resolve_uuid(&self, uuid: &str) -> CryptdriveResult<Option<PathBuf>> {
        let direct = self.by_uuid_dir.join(uuid);
        if direct.exists() {
            return Ok(Some(canonical(&direct)));
        }

        // Some filesystems publish upper-case UUIDs under by-uuid.
        let entries = match fs::read_dir(&self.by_uuid_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry?;
            if entry.file_name().to_string_lossy().eq_ignore_ascii_case(uuid) {
                return Ok(Some(canonical(&entry.path())));
            }
        }
        Ok(None)
    }
}

/// First loop device listed by `losetup -j <image>`.
pub(crate) fn parse_losetup_associations(stdout: &str) -> Option<LoopDevice> {
    stdout
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(device, _)| device.trim())
        .find(|device| !device.is_empty())
        .map(LoopDevice::new)
}

fn canonical(path: &Path) -> PathBuf {
    fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}
