//! `cryptsetup`-backed implementation of [`CryptoVolume`].

use crate::command::{HostCommand, Output};
use cryptdrive_core::config::CryptdriveConfig;
use cryptdrive_core::error::{CryptdriveError, CryptdriveResult};
use cryptdrive_provider::{Credential, CryptoVolume, LuksState};
use log::debug;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};

const DEFAULT_CRYPTSETUP_PATHS: &[&str] = &[
    "/sbin/cryptsetup",
    "/usr/sbin/cryptsetup",
    "/usr/local/sbin/cryptsetup",
    "/bin/cryptsetup",
    "/usr/bin/cryptsetup",
];

/// Exit status `cryptsetup` uses for "no key available with this passphrase".
const EXIT_NO_KEY: i32 = 2;
/// Exit status of `cryptsetup status` for an inactive mapping.
const EXIT_INACTIVE: i32 = 4;

#[derive(Debug, Clone)]
pub struct SystemCryptsetup {
    command: HostCommand,
    mapper_dir: PathBuf,
}

impl SystemCryptsetup {
    pub fn from_config(config: &CryptdriveConfig) -> CryptdriveResult<Self> {
        let command = HostCommand::resolve(
            "cryptsetup",
            config.system.cryptsetup_path.as_deref(),
            DEFAULT_CRYPTSETUP_PATHS,
        )?;
        debug!("using cryptsetup at {}", command.binary().display());
        Ok(Self {
            command,
            mapper_dir: config.system.mapper_dir.clone(),
        })
    }

    fn mapper_node_exists(&self, name: &str) -> bool {
        self.mapper_dir.is_dir() && self.mapper_dir.join(name).exists()
    }

    fn open_with(
        &self,
        device: &Path,
        name: &str,
        key_arg: &OsStr,
        input: Option<&[u8]>,
        key_desc: &str,
    ) -> CryptdriveResult<()> {
        let primary: [&OsStr; 8] = [
            OsStr::new("open"),
            OsStr::new("--type"),
            OsStr::new("luks"),
            OsStr::new("--batch-mode"),
            OsStr::new("--key-file"),
            key_arg,
            device.as_os_str(),
            OsStr::new(name),
        ];
        let mut out = self.command.run(primary, input)?;

        if !out.success() && action_unsupported(&out) {
            let fallback: [&OsStr; 6] = [
                OsStr::new("luksOpen"),
                OsStr::new("--batch-mode"),
                OsStr::new("--key-file"),
                key_arg,
                device.as_os_str(),
                OsStr::new(name),
            ];
            out = self.command.run(fallback, input)?;
        }

        if out.success() {
            return Ok(());
        }

        let diagnostic = out.describe();
        if rejected_key(&out) {
            return Err(CryptdriveError::Authentication(format!(
                "cryptsetup rejected the {key_desc} for `{name}` on {}: {diagnostic}",
                device.display()
            )));
        }
        Err(CryptdriveError::Provider(format!(
            "{} (exit code {})",
            classify_open_failure(name, device, key_desc, &diagnostic, self.mapper_node_exists(name)),
            out.status
        )))
    }
}

impl CryptoVolume for SystemCryptsetup {
    type Error = CryptdriveError;

    fn is_luks(&self, device: &Path) -> CryptdriveResult<bool> {
        let out = self.command.run([OsStr::new("isLuks"), device.as_os_str()], None)?;
        if out.success() {
            return Ok(true);
        }
        let diagnostic = out.diagnostic().to_ascii_lowercase();
        if diagnostic.is_empty() || diagnostic.contains("not a valid luks device") {
            return Ok(false);
        }
        Err(CryptdriveError::Provider(format!(
            "cryptsetup isLuks {} failed: {} (exit code {})",
            device.display(),
            out.describe(),
            out.status
        )))
    }

    fn format(&self, device: &Path, passphrase: &[u8]) -> CryptdriveResult<()> {
        let args: [&OsStr; 7] = [
            OsStr::new("luksFormat"),
            OsStr::new("--type"),
            OsStr::new("luks2"),
            OsStr::new("--batch-mode"),
            OsStr::new("--key-file"),
            OsStr::new("-"),
            device.as_os_str(),
        ];
        let out = self.command.run(args, Some(passphrase))?;
        if out.success() {
            return Ok(());
        }
        Err(CryptdriveError::Provider(format!(
            "cryptsetup could not format {}: {} (exit code {})",
            device.display(),
            out.describe(),
            out.status
        )))
    }

    fn open(&self, device: &Path, name: &str, credential: Credential<'_>) -> CryptdriveResult<PathBuf> {
        let key_desc = credential.describe();
        match credential {
            Credential::Passphrase(secret) => {
                self.open_with(device, name, OsStr::new("-"), Some(secret), &key_desc)?
            }
            Credential::KeyFile(path) => {
                self.open_with(device, name, path.as_os_str(), None, &key_desc)?
            }
        }
        Ok(self.mapper_dir.join(name))
    }

    fn close(&self, name: &str) -> CryptdriveResult<()> {
        let mut out = self.command.run(["close", name], None)?;
        if !out.success() && action_unsupported(&out) {
            out = self.command.run(["luksClose", name], None)?;
        }
        if out.success() {
            return Ok(());
        }

        let diagnostic = out.describe();
        let lower = diagnostic.to_ascii_lowercase();
        if lower.contains("does not exist")
            || lower.contains("doesn't exist")
            || lower.contains("not active")
        {
            return Ok(());
        }
        Err(CryptdriveError::Provider(format!(
            "{} (exit code {})",
            classify_close_failure(name, &diagnostic),
            out.status
        )))
    }

    fn add_key(&self, device: &Path, existing_passphrase: &[u8], key_file: &Path) -> CryptdriveResult<()> {
        if existing_passphrase.is_empty() {
            return Err(CryptdriveError::Configuration(
                "existing LUKS passphrase cannot be empty".into(),
            ));
        }

        let args: [&OsStr; 6] = [
            OsStr::new("luksAddKey"),
            OsStr::new("--batch-mode"),
            OsStr::new("--key-file"),
            OsStr::new("-"),
            device.as_os_str(),
            key_file.as_os_str(),
        ];
        let out = self.command.run(args, Some(existing_passphrase))?;
        if out.success() {
            return Ok(());
        }

        let diagnostic = out.describe();
        if rejected_key(&out) {
            return Err(CryptdriveError::Authentication(format!(
                "cryptsetup rejected the existing passphrase of {}: {diagnostic}",
                device.display()
            )));
        }
        Err(CryptdriveError::Provider(format!(
            "{} (exit code {})",
            classify_addkey_failure(device, key_file, &diagnostic),
            out.status
        )))
    }

    fn test_key(&self, device: &Path, key_file: &Path) -> CryptdriveResult<bool> {
        let args: [&OsStr; 6] = [
            OsStr::new("open"),
            OsStr::new("--test-passphrase"),
            OsStr::new("--batch-mode"),
            OsStr::new("--key-file"),
            key_file.as_os_str(),
            device.as_os_str(),
        ];
        let out = self.command.run(args, None)?;
        if out.success() {
            return Ok(true);
        }
        if rejected_key(&out) {
            return Ok(false);
        }
        Err(CryptdriveError::Provider(format!(
            "cryptsetup could not test key file {} against {}: {} (exit code {})",
            key_file.display(),
            device.display(),
            out.describe(),
            out.status
        )))
    }

    fn mapping_state(&self, name: &str) -> CryptdriveResult<LuksState> {
        if self.mapper_node_exists(name) {
            return Ok(LuksState::Active);
        }
        let out = self.command.run(["status", name], None)?;
        Ok(classify_status(name, &out))
    }

    fn mapping_device(&self, name: &str) -> CryptdriveResult<Option<PathBuf>> {
        let out = self.command.run(["status", name], None)?;
        if !out.success() {
            return Ok(None);
        }
        Ok(parse_status_device(&out.stdout))
    }
}

/// Extract the backing device from `cryptsetup status` output.
pub(crate) fn parse_status_device(stdout: &str) -> Option<PathBuf> {
    stdout.lines().find_map(|line| {
        let (key, value) = line.trim().split_once(':')?;
        let value = value.trim();
        (key.trim() == "device" && !value.is_empty()).then(|| PathBuf::from(value))
    })
}

fn rejected_key(output: &Output) -> bool {
    let lower = output.diagnostic().to_ascii_lowercase();
    output.status == EXIT_NO_KEY
        || lower.contains("no key available")
        || lower.contains("wrong key")
        || lower.contains("passphrase is incorrect")
        || lower.contains("invalid passphrase")
}

fn action_unsupported(output: &Output) -> bool {
    let lower = output.diagnostic().to_ascii_lowercase();
    lower.contains("unknown action")
        || lower.contains("unknown command")
        || lower.contains("invalid action")
        || lower.contains("invalid command")
        || lower.contains("unknown option")
}

fn needs_privileges(lower: &str) -> bool {
    lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
}

fn device_unreachable(lower: &str) -> bool {
    lower.contains("no such file")
        || lower.contains("does not exist")
        || lower.contains("not found")
        || lower.contains("cannot open device")
}

fn classify_open_failure(
    name: &str,
    device: &Path,
    key_desc: &str,
    diagnostic: &str,
    mapper_node_exists: bool,
) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let device = device.display();

    if needs_privileges(&lower) {
        return format!(
            "cryptsetup could not open `{name}` from {device} using {key_desc}: {diagnostic}. Run as root"
        );
    }
    if device_unreachable(&lower) {
        return format!(
            "cryptsetup could not access {device} for `{name}`: {diagnostic}. Confirm the device is present and crypttab points at the correct UUID"
        );
    }
    if lower.contains("already exists") && mapper_node_exists {
        return format!("mapping `{name}` is already active: {diagnostic}");
    }
    format!("cryptsetup failed to open `{name}` from {device} using {key_desc}: {diagnostic}")
}

fn classify_addkey_failure(device: &Path, key_file: &Path, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    let device = device.display();
    let key_file = key_file.display();

    if lower.contains("not a valid luks device") || lower.contains("is not a luks device") {
        return format!("cannot install {key_file}: {device} is not a LUKS device ({diagnostic})");
    }
    if lower.contains("no remaining keyslot")
        || lower.contains("no free key slot")
        || lower.contains("no free keyslot")
        || lower.contains("all key slots full")
    {
        return format!(
            "cannot install {key_file}: {device} has no free keyslots ({diagnostic}). Remove an unused keyslot first"
        );
    }
    if needs_privileges(&lower) {
        return format!("cryptsetup could not install {key_file} on {device}: {diagnostic}. Run as root");
    }
    if device_unreachable(&lower) {
        return format!("cryptsetup could not access {device} while installing {key_file}: {diagnostic}");
    }
    format!("cryptsetup failed to install {key_file} on {device}: {diagnostic}")
}

fn classify_close_failure(name: &str, diagnostic: &str) -> String {
    let lower = diagnostic.to_ascii_lowercase();
    if needs_privileges(&lower) {
        return format!("cryptsetup could not close `{name}`: {diagnostic}. Run as root");
    }
    if lower.contains("busy") || lower.contains("in use") {
        return format!("mapping `{name}` is still in use: {diagnostic}");
    }
    format!("cryptsetup failed to close `{name}`: {diagnostic}")
}

fn classify_status(name: &str, output: &Output) -> LuksState {
    match output.status {
        0 => return LuksState::Active,
        EXIT_INACTIVE => return LuksState::Inactive,
        _ => {}
    }

    let diagnostic = output.diagnostic();
    let lower = diagnostic.to_ascii_lowercase();
    if lower.contains("is inactive")
        || lower.contains("not active")
        || lower.contains("does not exist")
        || lower.contains("doesn't exist")
    {
        return LuksState::Inactive;
    }

    LuksState::Unknown(if diagnostic.is_empty() {
        format!("cryptsetup status {name} exited with code {}", output.status)
    } else {
        format!(
            "cryptsetup status {name} exited with code {}: {diagnostic}",
            output.status
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(status: i32, stderr: &str) -> Output {
        Output {
            stdout: String::new(),
            stderr: stderr.to_string(),
            status,
        }
    }

    #[test]
    fn status_exit_codes_map_to_states() {
        assert_eq!(classify_status("data", &output(0, "")), LuksState::Active);
        assert_eq!(classify_status("data", &output(4, "")), LuksState::Inactive);
        assert_eq!(
            classify_status("data", &output(1, "Device data does not exist")),
            LuksState::Inactive
        );
        assert!(matches!(
            classify_status("data", &output(5, "weird")),
            LuksState::Unknown(msg) if msg.contains("code 5")
        ));
    }

    #[test]
    fn status_device_line_is_parsed() {
        let stdout = "/dev/mapper/encryption-keys is active.\n  type:    LUKS2\n  cipher:  aes-xts-plain64\n  device:  /dev/loop3\n  loop:    /root/encryption-keys.img\n  sector size:  512\n";
        assert_eq!(parse_status_device(stdout), Some(PathBuf::from("/dev/loop3")));
        assert_eq!(parse_status_device("/dev/mapper/x is inactive.\n"), None);
    }

    #[test]
    fn rejected_key_matches_exit_code_and_text() {
        assert!(rejected_key(&output(2, "")));
        assert!(rejected_key(&output(1, "No key available with this passphrase.")));
        assert!(!rejected_key(&output(5, "Device or resource busy")));
    }

    #[test]
    fn addkey_failure_explains_full_keyslots() {
        let message = classify_addkey_failure(
            Path::new("/dev/sdb1"),
            Path::new("/mnt/keys/data.key"),
            "All key slots full.",
        );
        assert!(message.contains("no free keyslots"), "{message}");
    }

    #[test]
    fn close_failure_mentions_busy_mapping() {
        let message = classify_close_failure("encryption-keys", "Device encryption-keys is still in use.");
        assert!(message.contains("still in use"), "{message}");
    }

    #[test]
    fn unsupported_action_is_detected() {
        assert!(action_unsupported(&output(1, "Unknown action.")));
        assert!(!action_unsupported(&output(1, "No key available")));
    }
}
