//! Key vault lifecycle.
//!
//! The vault is a small file-backed LUKS volume holding the key files of every
//! managed device. [`VaultManager`] walks it through
//! `Absent → Uninitialized → Attached → Unlocked → Mounted` and back, and
//! [`VaultSession`] ties the whole climb to a scope: once acquisition starts,
//! dropping the session unmounts, closes, and detaches whatever was reached.

use crate::config::{CryptdriveConfig, VaultCfg};
use crate::error::{CryptdriveError, CryptdriveResult};
use cryptdrive_provider::{BlockDevice, Credential, CryptoVolume, LoopDevice};
use log::{debug, info, warn};
use std::fs::{self, DirBuilder, OpenOptions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Where the vault currently sits in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VaultState {
    /// No container file.
    Absent,
    /// Container file exists and is not bound to a loop device. `crypto_ready`
    /// is set once the file is known to carry a LUKS header.
    Uninitialized { crypto_ready: bool },
    Attached {
        loop_device: LoopDevice,
    },
    Unlocked {
        loop_device: LoopDevice,
        mapped_device: PathBuf,
    },
    Mounted {
        loop_device: LoopDevice,
        mapped_device: PathBuf,
        mount_point: PathBuf,
    },
}

impl VaultState {
    fn loop_device(&self) -> Option<&LoopDevice> {
        match self {
            VaultState::Attached { loop_device }
            | VaultState::Unlocked { loop_device, .. }
            | VaultState::Mounted { loop_device, .. } => Some(loop_device),
            _ => None,
        }
    }

    /// True when no loop device, mapping, or mount is held.
    pub fn is_released(&self) -> bool {
        matches!(self, VaultState::Absent | VaultState::Uninitialized { .. })
    }
}

/// Outcome of a best-effort teardown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TeardownReport {
    pub unmounted: bool,
    pub closed: bool,
    pub detached: bool,
    pub image_removed: bool,
    pub warnings: Vec<String>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

/// Drives the single key vault through its lifecycle.
pub struct VaultManager<'a, B, C>
where
    B: BlockDevice<Error = CryptdriveError>,
    C: CryptoVolume<Error = CryptdriveError>,
{
    cfg: VaultCfg,
    mapper_dir: PathBuf,
    block: &'a B,
    crypto: &'a C,
    state: VaultState,
    created: bool,
    initialized: bool,
    needs_filesystem: bool,
    opened_at: Option<Instant>,
    interrupt: Option<Arc<AtomicBool>>,
}

impl<'a, B, C> VaultManager<'a, B, C>
where
    B: BlockDevice<Error = CryptdriveError>,
    C: CryptoVolume<Error = CryptdriveError>,
{
    pub fn new(config: &CryptdriveConfig, block: &'a B, crypto: &'a C) -> Self {
        let cfg = config.vault.clone();
        let state = if cfg.image_path.exists() {
            VaultState::Uninitialized {
                crypto_ready: false,
            }
        } else {
            VaultState::Absent
        };
        Self {
            cfg,
            mapper_dir: config.system.mapper_dir.clone(),
            block,
            crypto,
            state,
            created: false,
            initialized: false,
            needs_filesystem: false,
            opened_at: None,
            interrupt: None,
        }
    }

    /// Abort acquisition steps once `flag` is raised.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn state(&self) -> &VaultState {
        &self.state
    }

    pub fn mount_point(&self) -> &Path {
        &self.cfg.mount_point
    }

    /// Whether this manager created the container file.
    pub fn created_image(&self) -> bool {
        self.created
    }

    /// Acquire the vault as a scoped resource: create, format, attach, unlock,
    /// and mount, releasing everything again when the session is dropped.
    pub fn session(&mut self, passphrase: &[u8]) -> CryptdriveResult<VaultSession<'_, 'a, B, C>> {
        let mut session = VaultSession {
            manager: self,
            released: false,
        };
        session.manager.ensure_container_exists()?;
        session.manager.ensure_initialized(passphrase)?;
        session.manager.attach()?;
        session.manager.unlock(passphrase)?;
        session.manager.mount()?;
        Ok(session)
    }

    /// Create a sparse container of the configured size if none exists.
    /// Returns `true` when this call created the file.
    pub fn ensure_container_exists(&mut self) -> CryptdriveResult<bool> {
        self.check_interrupt()?;
        if !matches!(self.state, VaultState::Absent) {
            return Ok(false);
        }

        let path = self.cfg.image_path.clone();
        let file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
        {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if !path.is_file() {
                    return Err(CryptdriveError::State(format!(
                        "vault image {} exists but is not a regular file",
                        path.display()
                    )));
                }
                self.state = VaultState::Uninitialized {
                    crypto_ready: false,
                };
                return Ok(false);
            }
            Err(err) => return Err(storage_error(&path, err)),
        };

        info!("Creating virtual keys device {} ..", path.display());
        self.created = true;
        self.state = VaultState::Uninitialized {
            crypto_ready: false,
        };
        file.set_len(self.cfg.size_bytes)
            .and_then(|()| file.sync_all())
            .map_err(|err| storage_error(&path, err))?;
        Ok(true)
    }

    /// Make sure the container carries a LUKS header bound to `passphrase`.
    ///
    /// Only a container created by this manager is ever formatted; an existing
    /// file without a LUKS header is reported instead of being overwritten.
    pub fn ensure_initialized(&mut self, passphrase: &[u8]) -> CryptdriveResult<()> {
        self.check_interrupt()?;
        match self.state {
            VaultState::Absent => {
                return Err(CryptdriveError::State(format!(
                    "vault image {} does not exist",
                    self.cfg.image_path.display()
                )))
            }
            VaultState::Uninitialized {
                crypto_ready: false,
            } => {}
            _ => return Ok(()),
        }

        let image = self.cfg.image_path.clone();
        if self.crypto.is_luks(&image)? {
            debug!("{} already carries a LUKS header", image.display());
            self.state = VaultState::Uninitialized { crypto_ready: true };
            return Ok(());
        }

        if !self.created {
            return Err(CryptdriveError::State(format!(
                "{} exists but is not a LUKS volume; refusing to format an image this run did not create",
                image.display()
            )));
        }

        info!("Formatting virtual keys device {} ..", image.display());
        self.crypto.format(&image, passphrase)?;
        self.needs_filesystem = true;
        self.state = VaultState::Uninitialized { crypto_ready: true };
        Ok(())
    }

    /// Bind the container to a loop device, reusing an existing binding.
    pub fn attach(&mut self) -> CryptdriveResult<&LoopDevice> {
        self.check_interrupt()?;
        match self.state {
            VaultState::Uninitialized { crypto_ready: true } => {}
            VaultState::Attached { .. } | VaultState::Unlocked { .. } | VaultState::Mounted { .. } => {}
            _ => {
                return Err(CryptdriveError::State(
                    "vault must be a formatted LUKS container before it can be attached".into(),
                ))
            }
        }

        if self.state.loop_device().is_none() {
            let image = &self.cfg.image_path;
            let loop_device = match self.block.find_loop(image)? {
                Some(existing) => {
                    info!("Virtual keys device already attached to {existing}");
                    existing
                }
                None => {
                    let attached = self.block.attach_loop(image)?;
                    debug!("Attached {} to {attached}", image.display());
                    attached
                }
            };
            self.state = VaultState::Attached { loop_device };
        }

        self.state
            .loop_device()
            .ok_or_else(|| CryptdriveError::State("loop device missing after attach".into()))
    }

    /// Open the LUKS volume on the attached loop device under the configured mapper name.
    pub fn unlock(&mut self, passphrase: &[u8]) -> CryptdriveResult<()> {
        self.check_interrupt()?;
        let loop_device = match &self.state {
            VaultState::Attached { loop_device } => loop_device.clone(),
            VaultState::Unlocked { .. } | VaultState::Mounted { .. } => return Ok(()),
            _ => {
                return Err(CryptdriveError::State(
                    "vault must be attached before it can be unlocked".into(),
                ))
            }
        };
        let name = self.cfg.mapper_name.clone();

        let mapped_device = if self.crypto.mapping_state(&name)?.is_active() {
            match self.crypto.mapping_device(&name)? {
                Some(backing) if same_device(&backing, &loop_device.path) => {
                    info!("Virtual keys device already unlocked as {name}");
                    self.mapper_dir.join(&name)
                }
                Some(backing) => {
                    return Err(CryptdriveError::State(format!(
                        "mapping `{name}` is already active on {}, not on vault device {loop_device}",
                        backing.display()
                    )))
                }
                None => {
                    return Err(CryptdriveError::State(format!(
                        "mapping `{name}` is active but its backing device is unknown"
                    )))
                }
            }
        } else {
            let holders = self.block.mapping_holders(&loop_device)?;
            if let Some(other) = holders.iter().find(|holder| **holder != name) {
                return Err(CryptdriveError::State(format!(
                    "vault device {loop_device} is already unlocked as `{other}`"
                )));
            }
            info!("Unlocking virtual keys device {} ..", self.cfg.image_path.display());
            self.crypto
                .open(&loop_device.path, &name, Credential::Passphrase(passphrase))?
        };

        self.opened_at = Some(Instant::now());
        self.state = VaultState::Unlocked {
            loop_device,
            mapped_device,
        };
        Ok(())
    }

    /// Mount the vault filesystem, creating it first on a freshly formatted vault.
    pub fn mount(&mut self) -> CryptdriveResult<()> {
        self.check_interrupt()?;
        let (loop_device, mapped_device) = match &self.state {
            VaultState::Unlocked {
                loop_device,
                mapped_device,
            } => (loop_device.clone(), mapped_device.clone()),
            VaultState::Mounted { .. } => return Ok(()),
            _ => {
                return Err(CryptdriveError::State(
                    "vault must be unlocked before it can be mounted".into(),
                ))
            }
        };

        if self.needs_filesystem {
            info!("Creating file system on virtual keys device ..");
            self.block
                .make_filesystem(&mapped_device, &self.cfg.filesystem)?;
            self.needs_filesystem = false;
        }

        let mount_point = self.cfg.mount_point.clone();
        if !mount_point.is_dir() {
            DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(&mount_point)?;
        }

        if self.block.is_mount_point(&mount_point)? {
            if !self.block.is_device_mounted(&mapped_device)? {
                return Err(CryptdriveError::Io(io::Error::other(format!(
                    "mount point {} is busy with another filesystem",
                    mount_point.display()
                ))));
            }
            info!("Virtual keys device already mounted at {}", mount_point.display());
        } else {
            info!("Mounting virtual keys device ..");
            self.block.mount(&mapped_device, &mount_point)?;
        }
        self.state = VaultState::Mounted {
            loop_device,
            mapped_device,
            mount_point: mount_point.clone(),
        };

        fs::set_permissions(&mount_point, fs::Permissions::from_mode(0o700))?;
        self.initialized = true;
        Ok(())
    }

    /// Release everything held, lowest layer last. Failures are logged and
    /// recorded but never stop the next layer from being attempted.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        let state = std::mem::replace(&mut self.state, VaultState::Absent);
        let crypto_ready = !matches!(
            state,
            VaultState::Absent
                | VaultState::Uninitialized {
                    crypto_ready: false
                }
        );

        let mut remaining = VaultState::Uninitialized { crypto_ready };

        if let VaultState::Mounted {
            mount_point,
            loop_device,
            mapped_device,
        } = &state
        {
            match self.block.unmount(mount_point) {
                Ok(()) => {
                    debug!("Unmounted {}", mount_point.display());
                    report.unmounted = true;
                }
                Err(err) => {
                    record(&mut report, format!("failed to unmount {}: {err}", mount_point.display()));
                    remaining = VaultState::Mounted {
                        loop_device: loop_device.clone(),
                        mapped_device: mapped_device.clone(),
                        mount_point: mount_point.clone(),
                    };
                }
            }
        }

        if let VaultState::Unlocked {
            loop_device,
            mapped_device,
        }
        | VaultState::Mounted {
            loop_device,
            mapped_device,
            ..
        } = &state
        {
            match self.crypto.close(&self.cfg.mapper_name) {
                Ok(()) => {
                    debug!("Closed mapping {}", self.cfg.mapper_name);
                    report.closed = true;
                }
                Err(err) => {
                    record(
                        &mut report,
                        format!("failed to close mapping {}: {err}", self.cfg.mapper_name),
                    );
                    if remaining.is_released() {
                        remaining = VaultState::Unlocked {
                            loop_device: loop_device.clone(),
                            mapped_device: mapped_device.clone(),
                        };
                    }
                }
            }
        }

        if let Some(loop_device) = state.loop_device() {
            match self.block.detach_loop(loop_device) {
                Ok(()) => {
                    debug!("Detached {loop_device}");
                    report.detached = true;
                }
                Err(err) => {
                    record(&mut report, format!("failed to detach {loop_device}: {err}"));
                    if remaining.is_released() {
                        remaining = VaultState::Attached {
                            loop_device: loop_device.clone(),
                        };
                    }
                }
            }
        }

        if let Some(opened_at) = self.opened_at.take() {
            debug!(
                "Virtual keys device was accessible for {:.2?}.",
                opened_at.elapsed()
            );
        }

        if self.created && !self.initialized && remaining.is_released() {
            let image = &self.cfg.image_path;
            warn!(
                "Initialization procedure was interrupted, deleting {} ..",
                image.display()
            );
            match fs::remove_file(image) {
                Ok(()) => {
                    report.image_removed = true;
                    self.created = false;
                    remaining = VaultState::Absent;
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    self.created = false;
                    remaining = VaultState::Absent;
                }
                Err(err) => record(
                    &mut report,
                    format!("failed to delete {}: {err}", image.display()),
                ),
            }
        } else if matches!(state, VaultState::Absent) {
            remaining = VaultState::Absent;
        }

        self.state = remaining;
        report
    }

    fn check_interrupt(&self) -> CryptdriveResult<()> {
        match &self.interrupt {
            Some(flag) if flag.load(Ordering::SeqCst) => Err(CryptdriveError::Interrupted),
            _ => Ok(()),
        }
    }
}

impl<B, C> Drop for VaultManager<'_, B, C>
where
    B: BlockDevice<Error = CryptdriveError>,
    C: CryptoVolume<Error = CryptdriveError>,
{
    fn drop(&mut self) {
        if !self.state.is_released() {
            self.teardown();
        }
    }
}

/// Scoped handle on an acquired vault. Dropping it tears the vault down.
pub struct VaultSession<'s, 'a, B, C>
where
    B: BlockDevice<Error = CryptdriveError>,
    C: CryptoVolume<Error = CryptdriveError>,
{
    manager: &'s mut VaultManager<'a, B, C>,
    released: bool,
}

impl<B, C> VaultSession<'_, '_, B, C>
where
    B: BlockDevice<Error = CryptdriveError>,
    C: CryptoVolume<Error = CryptdriveError>,
{
    pub fn mount_point(&self) -> &Path {
        self.manager.mount_point()
    }

    pub fn state(&self) -> &VaultState {
        self.manager.state()
    }

    /// Whether the vault was created (and therefore is empty) during this session.
    pub fn first_run(&self) -> bool {
        self.manager.created_image()
    }

    /// Tear the vault down now and return what happened.
    pub fn close(mut self) -> TeardownReport {
        self.released = true;
        self.manager.teardown()
    }
}

impl<B, C> Drop for VaultSession<'_, '_, B, C>
where
    B: BlockDevice<Error = CryptdriveError>,
    C: CryptoVolume<Error = CryptdriveError>,
{
    fn drop(&mut self) {
        if !self.released {
            self.manager.teardown();
        }
    }
}

/// Compare two device paths, resolving symlinks when both exist.
pub(crate) fn same_device(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(left), Ok(right)) => left == right,
        _ => false,
    }
}

fn record(report: &mut TeardownReport, message: String) {
    warn!("{message}");
    report.warnings.push(message);
}

fn storage_error(path: &Path, err: io::Error) -> CryptdriveError {
    if err.raw_os_error() == Some(libc::ENOSPC) {
        CryptdriveError::Resource(format!(
            "no space left to create vault image {}",
            path.display()
        ))
    } else {
        CryptdriveError::Io(err)
    }
}
