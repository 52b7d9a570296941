//! In-memory host used by the core unit tests.
//!
//! One [`FakeHost`] implements both provider traits over a shared [`World`] so
//! tests can seed devices, inject failures, and inspect the operation log.

use crate::config::CryptdriveConfig;
use crate::error::{CryptdriveError, CryptdriveResult};
use cryptdrive_provider::{BlockDevice, Credential, CryptoVolume, LoopDevice, LuksState};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

pub const VAULT_PASSPHRASE: &[u8] = b"correct horse battery staple";

#[derive(Default)]
pub struct World {
    pub ops: Vec<String>,
    /// LUKS passphrase per formatted device (vault image or target device).
    pub passphrases: HashMap<PathBuf, Vec<u8>>,
    /// Enrolled key-file contents per device.
    pub keyslots: HashMap<PathBuf, Vec<Vec<u8>>>,
    /// Loop device path to backing image.
    pub loops: HashMap<PathBuf, PathBuf>,
    /// Mapper name to backing device.
    pub mappings: HashMap<String, PathBuf>,
    /// Mount point to mounted device.
    pub mounts: HashMap<PathBuf, PathBuf>,
    pub filesystems: HashMap<PathBuf, String>,
    pub uuids: HashMap<String, PathBuf>,
    pub fstab: HashSet<PathBuf>,
    pub vault_devices: HashSet<PathBuf>,
    pub fail_add_key: HashSet<PathBuf>,
    pub fail_open: HashSet<String>,
    pub fail_unmount: bool,
    pub fail_mkfs: bool,
    pub no_free_loops: bool,
    pub next_loop: usize,
}

#[derive(Clone, Default)]
pub struct FakeHost {
    world: Arc<Mutex<World>>,
}

impl FakeHost {
    fn lock(&self) -> MutexGuard<'_, World> {
        self.world.lock().unwrap()
    }

    pub fn with_world<R>(&self, f: impl FnOnce(&mut World) -> R) -> R {
        f(&mut self.lock())
    }

    pub fn ops(&self) -> Vec<String> {
        self.lock().ops.clone()
    }

    pub fn count_ops(&self, prefix: &str) -> usize {
        self.lock()
            .ops
            .iter()
            .filter(|op| op.split(' ').next() == Some(prefix))
            .count()
    }

    /// No loop device, vault mapping, or vault mount is left behind.
    pub fn is_quiescent(&self) -> bool {
        let world = self.lock();
        world.loops.is_empty()
            && !world.mappings.values().any(|b| b.starts_with("/dev/loop"))
            && !world.mounts.values().any(|d| world.vault_devices.contains(d))
    }

    /// Pretend an earlier run already created and formatted the vault.
    pub fn seed_vault(&self, config: &CryptdriveConfig) {
        let image = &config.vault.image_path;
        let file = fs::File::create(image).unwrap();
        file.set_len(config.vault.size_bytes).unwrap();
        let mut world = self.lock();
        world
            .passphrases
            .insert(image.clone(), VAULT_PASSPHRASE.to_vec());
        world.filesystems.insert(
            config.system.mapper_dir.join(&config.vault.mapper_name),
            config.vault.filesystem.clone(),
        );
    }

    /// Leave the vault attached and unlocked as if a previous run crashed.
    pub fn preattach_and_open(&self, config: &CryptdriveConfig) {
        let mut world = self.lock();
        let loop_path = PathBuf::from("/dev/loop7");
        world
            .loops
            .insert(loop_path.clone(), config.vault.image_path.clone());
        world
            .mappings
            .insert(config.vault.mapper_name.clone(), loop_path);
        world
            .vault_devices
            .insert(config.system.mapper_dir.join(&config.vault.mapper_name));
    }

    /// Register a present LUKS target device reachable through `uuid`.
    pub fn add_target(&self, uuid: &str, device: &str, passphrase: &[u8]) -> PathBuf {
        let device = PathBuf::from(device);
        let mut world = self.lock();
        world.uuids.insert(uuid.to_string(), device.clone());
        world.passphrases.insert(device.clone(), passphrase.to_vec());
        device
    }

    pub fn enrolled_keys(&self, device: &Path) -> Vec<Vec<u8>> {
        self.lock().keyslots.get(device).cloned().unwrap_or_default()
    }
}

impl World {
    fn backing(&self, device: &Path) -> PathBuf {
        self.loops
            .get(device)
            .cloned()
            .unwrap_or_else(|| device.to_path_buf())
    }

    fn key_matches(&self, device: &Path, key_file: &Path) -> CryptdriveResult<bool> {
        let contents = fs::read(key_file)?;
        Ok(self
            .keyslots
            .get(device)
            .map(|slots| slots.iter().any(|slot| *slot == contents))
            .unwrap_or(false))
    }
}

fn provider(msg: impl Into<String>) -> CryptdriveError {
    CryptdriveError::Provider(msg.into())
}

impl BlockDevice for FakeHost {
    type Error = CryptdriveError;

    fn attach_loop(&self, image: &Path) -> CryptdriveResult<LoopDevice> {
        let mut world = self.lock();
        world.ops.push(format!("attach {}", image.display()));
        if world.no_free_loops {
            return Err(CryptdriveError::Resource("no free loop device".into()));
        }
        let path = PathBuf::from(format!("/dev/loop{}", world.next_loop));
        world.next_loop += 1;
        world.loops.insert(path.clone(), image.to_path_buf());
        Ok(LoopDevice::new(path))
    }

    fn detach_loop(&self, device: &LoopDevice) -> CryptdriveResult<()> {
        let mut world = self.lock();
        world.ops.push(format!("detach {device}"));
        if world.mappings.values().any(|b| *b == device.path) {
            return Err(provider(format!("{device} is busy")));
        }
        world
            .loops
            .remove(&device.path)
            .map(|_| ())
            .ok_or_else(|| provider(format!("{device} is not attached")))
    }

    fn find_loop(&self, image: &Path) -> CryptdriveResult<Option<LoopDevice>> {
        Ok(self
            .lock()
            .loops
            .iter()
            .find(|(_, backing)| backing.as_path() == image)
            .map(|(path, _)| LoopDevice::new(path.clone())))
    }

    fn mapping_holders(&self, device: &LoopDevice) -> CryptdriveResult<Vec<String>> {
        Ok(self
            .lock()
            .mappings
            .iter()
            .filter(|(_, backing)| **backing == device.path)
            .map(|(name, _)| name.clone())
            .collect())
    }

    fn mount(&self, device: &Path, mount_point: &Path) -> CryptdriveResult<()> {
        let mut world = self.lock();
        world
            .ops
            .push(format!("mount {} {}", device.display(), mount_point.display()));
        if !world.filesystems.contains_key(device) {
            return Err(provider(format!("wrong fs type on {}", device.display())));
        }
        world
            .mounts
            .insert(mount_point.to_path_buf(), device.to_path_buf());
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> CryptdriveResult<()> {
        let mut world = self.lock();
        world.ops.push(format!("unmount {}", mount_point.display()));
        if world.fail_unmount {
            return Err(provider(format!("{} is busy", mount_point.display())));
        }
        world
            .mounts
            .remove(mount_point)
            .map(|_| ())
            .ok_or_else(|| provider(format!("{} is not mounted", mount_point.display())))
    }

    fn is_mount_point(&self, path: &Path) -> CryptdriveResult<bool> {
        Ok(self.lock().mounts.contains_key(path))
    }

    fn is_device_mounted(&self, device: &Path) -> CryptdriveResult<bool> {
        Ok(self.lock().mounts.values().any(|d| d == device))
    }

    fn mount_from_fstab(&self, device: &Path) -> CryptdriveResult<()> {
        let mut world = self.lock();
        world.ops.push(format!("fstab {}", device.display()));
        if !world.fstab.contains(device) {
            return Err(provider(format!("can't find {} in /etc/fstab", device.display())));
        }
        let name = device
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        world
            .mounts
            .insert(PathBuf::from("/srv").join(name), device.to_path_buf());
        Ok(())
    }

    fn filesystem_type(&self, device: &Path) -> CryptdriveResult<Option<String>> {
        Ok(self.lock().filesystems.get(device).cloned())
    }

    fn make_filesystem(&self, device: &Path, fs_type: &str) -> CryptdriveResult<()> {
        let mut world = self.lock();
        world.ops.push(format!("mkfs {}", device.display()));
        if world.fail_mkfs {
            return Err(provider("mkfs failed"));
        }
        world
            .filesystems
            .insert(device.to_path_buf(), fs_type.to_string());
        Ok(())
    }

    fn resolve_uuid(&self, uuid: &str) -> CryptdriveResult<Option<PathBuf>> {
        Ok(self.lock().uuids.get(uuid).cloned())
    }
}

impl CryptoVolume for FakeHost {
    type Error = CryptdriveError;

    fn is_luks(&self, device: &Path) -> CryptdriveResult<bool> {
        let world = self.lock();
        Ok(world.passphrases.contains_key(&world.backing(device)))
    }

    fn format(&self, device: &Path, passphrase: &[u8]) -> CryptdriveResult<()> {
        let mut world = self.lock();
        world.ops.push(format!("format {}", device.display()));
        let backing = world.backing(device);
        world.keyslots.remove(&backing);
        world.passphrases.insert(backing, passphrase.to_vec());
        Ok(())
    }

    fn open(&self, device: &Path, name: &str, credential: Credential<'_>) -> CryptdriveResult<PathBuf> {
        let mut world = self.lock();
        world
            .ops
            .push(format!("open {name} {} {}", device.display(), credential.describe()));
        if world.fail_open.contains(name) {
            return Err(provider(format!("device-mapper refused {name}")));
        }
        if world.mappings.contains_key(name) {
            return Err(provider(format!("device {name} already exists")));
        }
        let backing = world.backing(device);
        let accepted = match credential {
            Credential::Passphrase(secret) => world.passphrases.get(&backing).map(Vec::as_slice) == Some(secret),
            Credential::KeyFile(path) => world.key_matches(&backing, path)?,
        };
        if !accepted {
            return Err(CryptdriveError::Authentication(format!(
                "no key available for {}",
                device.display()
            )));
        }
        world.mappings.insert(name.to_string(), device.to_path_buf());
        let mapped = PathBuf::from("/dev/mapper").join(name);
        if world.loops.contains_key(device) {
            world.vault_devices.insert(mapped.clone());
        }
        Ok(mapped)
    }

    fn close(&self, name: &str) -> CryptdriveResult<()> {
        let mut world = self.lock();
        world.ops.push(format!("close {name}"));
        let mapped = PathBuf::from("/dev/mapper").join(name);
        if world.mounts.values().any(|d| *d == mapped) {
            return Err(provider(format!("{name} is still in use")));
        }
        world.mappings.remove(name);
        Ok(())
    }

    fn add_key(&self, device: &Path, existing_passphrase: &[u8], key_file: &Path) -> CryptdriveResult<()> {
        let mut world = self.lock();
        world.ops.push(format!("add_key {}", device.display()));
        if world.fail_add_key.contains(device) {
            return Err(provider(format!("keyslot area of {} is full", device.display())));
        }
        if world.passphrases.get(device).map(Vec::as_slice) != Some(existing_passphrase) {
            return Err(CryptdriveError::Authentication(format!(
                "no key available with this passphrase for {}",
                device.display()
            )));
        }
        let contents = fs::read(key_file)?;
        world
            .keyslots
            .entry(device.to_path_buf())
            .or_default()
            .push(contents);
        Ok(())
    }

    fn test_key(&self, device: &Path, key_file: &Path) -> CryptdriveResult<bool> {
        self.lock().key_matches(device, key_file)
    }

    fn mapping_state(&self, name: &str) -> CryptdriveResult<LuksState> {
        Ok(if self.lock().mappings.contains_key(name) {
            LuksState::Active
        } else {
            LuksState::Inactive
        })
    }

    fn mapping_device(&self, name: &str) -> CryptdriveResult<Option<PathBuf>> {
        Ok(self.lock().mappings.get(name).cloned())
    }
}
