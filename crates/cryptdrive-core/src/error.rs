//! Error taxonomy shared by every cryptdrive crate.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while reading configuration, driving the vault, or unlocking devices.
#[derive(Debug, Error)]
pub enum CryptdriveError {
    /// Malformed registry line; aborts the run before the vault is touched.
    #[error("{}:{line}: {reason}", path.display())]
    Parse {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    /// Invalid settings or arguments.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// A host resource (loop slot, disk space, entropy) is exhausted.
    #[error("resource unavailable: {0}")]
    Resource(String),

    /// The vault rejected the supplied passphrase.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The vault is in a state the requested transition cannot start from.
    #[error("unexpected vault state: {0}")]
    State(String),

    /// A single target device could not be provisioned or unlocked.
    #[error("device `{target}` failed: {reason}")]
    Device { target: String, reason: String },

    /// An external command failed.
    #[error("provider error: {0}")]
    Provider(String),

    /// The process lacks the privileges needed to manage block devices.
    #[error("insufficient privileges: {0}")]
    Privilege(String),

    /// The run was interrupted by a signal.
    #[error("interrupted")]
    Interrupted,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML configuration: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("failed to parse YAML configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CryptdriveError {
    /// Errors that must abort the whole run even inside a per-device boundary.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CryptdriveError::Interrupted)
    }
}

pub type CryptdriveResult<T> = Result<T, CryptdriveError>;
