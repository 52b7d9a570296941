//! Passphrase acquisition contract.
//!
//! The orchestrator never reads from the terminal itself; it asks a
//! [`PassphraseProvider`] so the CLI can prompt interactively while tests hand
//! out fixed secrets.

use crate::error::{CryptdriveError, CryptdriveResult};
use std::path::Path;
use zeroize::Zeroizing;

/// What a passphrase is being requested for.
#[derive(Debug, Clone, Copy)]
pub enum PassphrasePrompt<'a> {
    /// The vault passphrase. `creating` is set when the vault image does not exist
    /// yet and the passphrase will become its only credential.
    Vault { image: &'a Path, creating: bool },
    /// An existing passphrase of a target device, used once to enroll its new key file.
    Device { target: &'a str, device: &'a Path },
}

impl PassphrasePrompt<'_> {
    /// Terminal prompt text for this request.
    pub fn message(&self) -> String {
        match self {
            PassphrasePrompt::Vault {
                image,
                creating: true,
            } => format!("New passphrase for key vault {}: ", image.display()),
            PassphrasePrompt::Vault { image, .. } => {
                format!("Passphrase for key vault {}: ", image.display())
            }
            PassphrasePrompt::Device { target, device } => format!(
                "Existing passphrase for {target} ({}): ",
                device.display()
            ),
        }
    }
}

/// Source of secret bytes.
pub trait PassphraseProvider {
    fn passphrase(&self, prompt: &PassphrasePrompt<'_>) -> CryptdriveResult<Zeroizing<Vec<u8>>>;
}

/// Request a passphrase and reject empty answers.
pub(crate) fn obtain(
    provider: &dyn PassphraseProvider,
    prompt: &PassphrasePrompt<'_>,
) -> CryptdriveResult<Zeroizing<Vec<u8>>> {
    let secret = provider.passphrase(prompt)?;
    if secret.is_empty() {
        return Err(match prompt {
            PassphrasePrompt::Vault { .. } => {
                CryptdriveError::Authentication("empty vault passphrase".into())
            }
            PassphrasePrompt::Device { target, .. } => CryptdriveError::Device {
                target: target.to_string(),
                reason: "empty device passphrase".into(),
            },
        });
    }
    Ok(secret)
}
