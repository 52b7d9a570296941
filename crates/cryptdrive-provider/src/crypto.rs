//! Provider contract for LUKS crypto volumes.
//!
//! Covers both the vault container (format/open/close with a passphrase) and
//! the target devices (key enrollment, key-file unlock, mapping inspection).

use std::error::Error;
use std::fmt;
use std::path::{Path, PathBuf};

/// Normalised state for a device-mapper mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LuksState {
    Active,
    Inactive,
    Unknown(String),
}

impl LuksState {
    pub fn is_active(&self) -> bool {
        matches!(self, LuksState::Active)
    }
}

/// Secret used to open a crypto volume.
#[derive(Clone, Copy)]
pub enum Credential<'a> {
    /// Passphrase bytes, fed to the crypto layer over stdin.
    Passphrase(&'a [u8]),
    /// Key file on disk.
    KeyFile(&'a Path),
}

impl fmt::Debug for Credential<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Passphrase(_) => f.write_str("Passphrase(<redacted>)"),
            Credential::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
        }
    }
}

impl Credential<'_> {
    /// Human readable description that never includes secret material.
    pub fn describe(&self) -> String {
        match self {
            Credential::Passphrase(_) => "passphrase".to_string(),
            Credential::KeyFile(path) => format!("keyfile {}", path.display()),
        }
    }
}

/// Abstraction over LUKS volume management commands.
pub trait CryptoVolume {
    type Error: Error + Send + Sync + 'static;

    /// Return whether `device` carries a LUKS header.
    fn is_luks(&self, device: &Path) -> Result<bool, Self::Error>;

    /// Write a fresh LUKS header to `device`, binding `passphrase` as its only credential.
    fn format(&self, device: &Path, passphrase: &[u8]) -> Result<(), Self::Error>;

    /// Open `device` as `/dev/mapper/<name>` and return the mapped device path.
    fn open(
        &self,
        device: &Path,
        name: &str,
        credential: Credential<'_>,
    ) -> Result<PathBuf, Self::Error>;

    /// Close the mapping called `name`. Closing an inactive mapping succeeds.
    fn close(&self, name: &str) -> Result<(), Self::Error>;

    /// Enroll the key contained in `key_file` into a free keyslot of `device`,
    /// authenticating with `existing_passphrase`.
    fn add_key(
        &self,
        device: &Path,
        existing_passphrase: &[u8],
        key_file: &Path,
    ) -> Result<(), Self::Error>;

    /// Return whether `key_file` opens a keyslot of `device` without activating it.
    fn test_key(&self, device: &Path, key_file: &Path) -> Result<bool, Self::Error>;

    /// Return the current state of the mapping called `name`.
    fn mapping_state(&self, name: &str) -> Result<LuksState, Self::Error>;

    /// Return the device backing an active mapping, if the mapping exists.
    fn mapping_device(&self, name: &str) -> Result<Option<PathBuf>, Self::Error>;
}
