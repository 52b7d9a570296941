//! Configuration model and helpers used by the cryptdrive orchestrator.

use crate::error::{CryptdriveError, CryptdriveResult};
use log::debug;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Component, Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/crypto-drive-manager.toml";
pub const DEFAULT_IMAGE_PATH: &str = "/root/encryption-keys.img";
pub const DEFAULT_MAPPER_NAME: &str = "encryption-keys";
pub const DEFAULT_MOUNT_POINT: &str = "/mnt/keys";
pub const DEFAULT_CRYPTTAB_PATH: &str = "/etc/crypttab";

/// Location and shape of the key vault container.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VaultCfg {
    #[serde(default = "default_image_path")]
    pub image_path: PathBuf,

    #[serde(default = "default_mapper_name")]
    pub mapper_name: String,

    #[serde(default = "default_mount_point")]
    pub mount_point: PathBuf,

    #[serde(default = "default_vault_size")]
    pub size_bytes: u64,

    #[serde(default = "default_filesystem")]
    pub filesystem: String,
}

fn default_image_path() -> PathBuf {
    PathBuf::from(DEFAULT_IMAGE_PATH)
}

fn default_mapper_name() -> String {
    DEFAULT_MAPPER_NAME.to_string()
}

fn default_mount_point() -> PathBuf {
    PathBuf::from(DEFAULT_MOUNT_POINT)
}

fn default_vault_size() -> u64 {
    10 * 1024 * 1024
}

fn default_filesystem() -> String {
    "ext4".to_string()
}

impl Default for VaultCfg {
    fn default() -> Self {
        Self {
            image_path: default_image_path(),
            mapper_name: default_mapper_name(),
            mount_point: default_mount_point(),
            size_bytes: default_vault_size(),
            filesystem: default_filesystem(),
        }
    }
}

/// Key file generation knobs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KeysCfg {
    #[serde(default = "default_key_size")]
    pub key_size: usize,
}

fn default_key_size() -> usize {
    4096
}

impl Default for KeysCfg {
    fn default() -> Self {
        Self {
            key_size: default_key_size(),
        }
    }
}

/// Where the encrypted-device registry lives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryCfg {
    #[serde(default = "default_crypttab_path")]
    pub crypttab_path: PathBuf,
}

fn default_crypttab_path() -> PathBuf {
    PathBuf::from(DEFAULT_CRYPTTAB_PATH)
}

impl Default for RegistryCfg {
    fn default() -> Self {
        Self {
            crypttab_path: default_crypttab_path(),
        }
    }
}

/// Behaviour after a target device has been unlocked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UnlockCfg {
    #[serde(default = "default_mount_unlocked")]
    pub mount_unlocked: bool,
}

fn default_mount_unlocked() -> bool {
    true
}

impl Default for UnlockCfg {
    fn default() -> Self {
        Self {
            mount_unlocked: default_mount_unlocked(),
        }
    }
}

/// Host tooling overrides and well-known lookup locations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SystemCfg {
    #[serde(default)]
    pub cryptsetup_path: Option<String>,

    #[serde(default)]
    pub losetup_path: Option<String>,

    #[serde(default)]
    pub mount_path: Option<String>,

    #[serde(default)]
    pub umount_path: Option<String>,

    #[serde(default)]
    pub blkid_path: Option<String>,

    #[serde(default)]
    pub mkfs_path: Option<String>,

    #[serde(default = "default_by_uuid_dir")]
    pub by_uuid_dir: PathBuf,

    #[serde(default = "default_mapper_dir")]
    pub mapper_dir: PathBuf,

    #[serde(default = "default_mounts_path")]
    pub mounts_path: PathBuf,

    #[serde(default = "default_sys_block_dir")]
    pub sys_block_dir: PathBuf,
}

fn default_by_uuid_dir() -> PathBuf {
    PathBuf::from("/dev/disk/by-uuid")
}

fn default_mapper_dir() -> PathBuf {
    PathBuf::from("/dev/mapper")
}

fn default_mounts_path() -> PathBuf {
    PathBuf::from("/proc/mounts")
}

fn default_sys_block_dir() -> PathBuf {
    PathBuf::from("/sys/class/block")
}

impl Default for SystemCfg {
    fn default() -> Self {
        Self {
            cryptsetup_path: None,
            losetup_path: None,
            mount_path: None,
            umount_path: None,
            blkid_path: None,
            mkfs_path: None,
            by_uuid_dir: default_by_uuid_dir(),
            mapper_dir: default_mapper_dir(),
            mounts_path: default_mounts_path(),
            sys_block_dir: default_sys_block_dir(),
        }
    }
}

/// Top-level configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CryptdriveConfig {
    #[serde(default)]
    pub vault: VaultCfg,

    #[serde(default)]
    pub keys: KeysCfg,

    #[serde(default)]
    pub registry: RegistryCfg,

    #[serde(default)]
    pub unlock: UnlockCfg,

    #[serde(default)]
    pub system: SystemCfg,

    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl CryptdriveConfig {
    /// Return the canonical system-wide configuration path.
    pub fn default_path() -> &'static Path {
        Path::new(DEFAULT_CONFIG_PATH)
    }

    /// Read a config file from disk, picking TOML or YAML by extension.
    pub fn load<P: AsRef<Path>>(path: P) -> CryptdriveResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let is_toml = matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some(ext) if ext.eq_ignore_ascii_case("toml")
        );
        let mut cfg = if is_toml {
            toml::from_str::<Self>(&contents)?
        } else {
            serde_yaml::from_str::<Self>(&contents)?
        };
        cfg.path = Some(path.to_path_buf());
        Ok(cfg)
    }

    /// Load `path` when it exists, otherwise fall back to built-in defaults.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> CryptdriveResult<Self> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        debug!(
            "no configuration at {}; using built-in defaults",
            path.display()
        );
        Ok(Self::default())
    }

    /// Perform a validation pass and return human-readable issues.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if !self.vault.image_path.is_absolute() {
            issues.push(format!(
                "vault.image_path must be absolute (got {})",
                self.vault.image_path.display()
            ));
        }
        if !self.vault.mount_point.is_absolute() {
            issues.push(format!(
                "vault.mount_point must be absolute (got {})",
                self.vault.mount_point.display()
            ));
        }
        if self
            .vault
            .mount_point
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            issues.push("vault.mount_point must not contain `..`".to_string());
        }
        if self.vault.mount_point == Path::new("/") {
            issues.push("vault.mount_point cannot be the filesystem root".to_string());
        }
        if !looks_like_mapping_name(&self.vault.mapper_name) {
            issues.push(format!(
                "vault.mapper_name contains invalid characters: {}",
                self.vault.mapper_name
            ));
        }
        if self.vault.size_bytes < 2 * 1024 * 1024 {
            issues.push("vault.size_bytes must be at least 2 MiB to hold a LUKS2 header".to_string());
        }
        if self.vault.filesystem.trim().is_empty() {
            issues.push("vault.filesystem must not be empty".to_string());
        }
        if self.keys.key_size == 0 {
            issues.push("keys.key_size must be greater than 0".to_string());
        }

        issues
    }

    /// Fail with `Configuration` when `validate` reports any issue.
    pub fn ensure_valid(&self) -> CryptdriveResult<()> {
        let issues = self.validate();
        if issues.is_empty() {
            Ok(())
        } else {
            Err(CryptdriveError::Configuration(issues.join("; ")))
        }
    }
}

/// Lightweight sanity check that a device-mapper name is usable.
pub fn looks_like_mapping_name(name: &str) -> bool {
    let trimmed = name.trim();
    !trimmed.is_empty()
        && trimmed == name
        && trimmed
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '.' | '+'))
}
