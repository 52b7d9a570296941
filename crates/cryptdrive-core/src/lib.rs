//! Core building blocks shared by the cryptdrive binaries.
//!
//! Configuration, the device registry reader, key material handling, the vault
//! state machine, and the unlock orchestrator live here so the CLI only has to
//! deal with arguments, prompts, and output.

pub mod config;
pub mod crypttab;
pub mod error;
pub mod keyfile;
pub mod logging;
pub mod passphrase;
pub mod privilege;
pub mod vault;
pub mod workflow;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{CryptdriveConfig, KeysCfg, RegistryCfg, SystemCfg, UnlockCfg, VaultCfg};
pub use crypttab::{DeviceEntry, SourceRef};
pub use error::{CryptdriveError, CryptdriveResult};
pub use passphrase::{PassphrasePrompt, PassphraseProvider};
pub use vault::{TeardownReport, VaultManager, VaultSession, VaultState};
pub use workflow::{
    DeviceOutcome, DeviceReport, UnlockOrchestrator, UnlockReport, WorkflowEvent, WorkflowLevel,
};
