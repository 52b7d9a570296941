//! Unlock every managed device listed in the registry using keys from the vault.

use super::{event, DeviceOutcome, DeviceReport, UnlockReport, WorkflowLevel};
use crate::config::CryptdriveConfig;
use crate::crypttab::{self, DeviceEntry};
use crate::error::{CryptdriveError, CryptdriveResult};
use crate::keyfile;
use crate::passphrase::{self, PassphrasePrompt, PassphraseProvider};
use crate::vault::{same_device, VaultManager};
use cryptdrive_provider::{BlockDevice, Credential, CryptoVolume, LuksState};
use log::{debug, info};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const LVM_MEMBER: &str = "LVM2_member";

/// Inspection result for one managed entry before the vault is opened.
enum Inspection {
    Missing,
    AlreadyUnlocked,
    Locked(PathBuf),
}

/// Coordinates registry, vault, and target devices for a single run.
pub struct UnlockOrchestrator<B, C> {
    config: Arc<CryptdriveConfig>,
    block: B,
    crypto: C,
    interrupt: Arc<AtomicBool>,
}

impl<B, C> UnlockOrchestrator<B, C>
where
    B: BlockDevice<Error = CryptdriveError>,
    C: CryptoVolume<Error = CryptdriveError>,
{
    pub fn new(config: Arc<CryptdriveConfig>, block: B, crypto: C) -> Self {
        Self {
            config,
            block,
            crypto,
            interrupt: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share an interrupt flag; once raised the run stops at the next checkpoint.
    pub fn with_interrupt(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = flag;
        self
    }

    pub fn config(&self) -> &CryptdriveConfig {
        &self.config
    }

    /// Unlock the managed devices named in `selected` (all of them when empty).
    pub fn run(
        &self,
        selected: &[String],
        passphrases: &dyn PassphraseProvider,
    ) -> CryptdriveResult<UnlockReport> {
        let registry = &self.config.registry.crypttab_path;
        let mount_point = &self.config.vault.mount_point;
        let entries = crypttab::read_entries(registry)?;
        debug!("Read {} entries from {}", entries.len(), registry.display());

        let mut report = UnlockReport {
            title: format!("Unlock encrypted devices from {}", registry.display()),
            ..UnlockReport::default()
        };

        for name in selected {
            if !entries.iter().any(|entry| entry.target_name == *name) {
                report.events.push(event(
                    WorkflowLevel::Warn,
                    format!("Encrypted device `{name}` is not listed in {}", registry.display()),
                ));
            }
        }

        // The first managed entry naming a key file owns it, selected or not.
        let mut key_owners: HashMap<&Path, &str> = HashMap::new();
        for entry in entries.iter().filter(|entry| entry.is_managed(mount_point)) {
            if let Some(key_file) = entry.managed_key_file(mount_point) {
                key_owners
                    .entry(key_file)
                    .or_insert(entry.target_name.as_str());
            }
        }

        let mut managed = Vec::new();
        for entry in entries
            .iter()
            .filter(|entry| selected.is_empty() || selected.contains(&entry.target_name))
        {
            match entry.unmanaged_reason(mount_point) {
                None => match shared_key_owner(&key_owners, entry, mount_point) {
                    Some(owner) => record_failure(
                        &mut report,
                        entry,
                        device_error(
                            &entry.target_name,
                            format!("key file is already assigned to `{owner}`"),
                        ),
                    ),
                    None => managed.push(entry),
                },
                Some(reason) if !selected.is_empty() => report.events.push(event(
                    WorkflowLevel::Warn,
                    format!("`{}` requested but not managed: {reason}", entry.target_name),
                )),
                Some(reason) => debug!(
                    "Ignoring `{}` (line {}): {reason}",
                    entry.target_name, entry.line
                ),
            }
        }

        if managed.is_empty() && !report.has_failures() {
            report.events.push(event(
                WorkflowLevel::Info,
                "No managed encrypted devices selected; key vault left untouched.",
            ));
            return Ok(report);
        }

        let mut pending = Vec::new();
        for entry in managed {
            self.check_interrupt()?;
            match self.inspect(entry) {
                Ok(Inspection::Missing) => {
                    report.events.push(event(
                        WorkflowLevel::Info,
                        format!("Encrypted device `{}` is not present", entry.target_name),
                    ));
                    push_outcome(&mut report, entry, DeviceOutcome::Missing);
                }
                Ok(Inspection::AlreadyUnlocked) => {
                    report.events.push(event(
                        WorkflowLevel::Info,
                        format!("Encrypted device `{}` is already unlocked", entry.target_name),
                    ));
                    push_outcome(&mut report, entry, DeviceOutcome::AlreadyUnlocked);
                }
                Ok(Inspection::Locked(device)) => pending.push((entry, device)),
                Err(err) if err.is_fatal() => return Err(err),
                Err(err) => record_failure(&mut report, entry, err),
            }
        }

        if !pending.is_empty() {
            self.unlock_with_vault(&mut report, &pending, passphrases)?;
        }

        let unlocked = report.unlocked_count();
        let failed = report.failures().count();
        let summary = format!(
            "Unlocked {unlocked} encrypted device{}",
            if unlocked == 1 { "" } else { "s" }
        );
        if failed == 0 {
            report.events.push(event(WorkflowLevel::Success, summary));
        } else {
            report.events.push(event(
                WorkflowLevel::Error,
                format!("{summary}; {failed} failed"),
            ));
        }
        Ok(report)
    }

    fn unlock_with_vault(
        &self,
        report: &mut UnlockReport,
        pending: &[(&DeviceEntry, PathBuf)],
        passphrases: &dyn PassphraseProvider,
    ) -> CryptdriveResult<()> {
        self.check_interrupt()?;
        let image = &self.config.vault.image_path;
        let vault_passphrase = passphrase::obtain(
            passphrases,
            &PassphrasePrompt::Vault {
                image,
                creating: !image.exists(),
            },
        )?;

        let mut vault = VaultManager::new(&self.config, &self.block, &self.crypto)
            .with_interrupt(self.interrupt.clone());
        let session = vault.session(&vault_passphrase)?;
        report.vault_used = true;
        if session.first_run() {
            report.events.push(event(
                WorkflowLevel::Security,
                format!("Created new key vault {}", image.display()),
            ));
        }

        let mut outcome = Ok(());
        for (entry, device) in pending {
            if let Err(err) = self.check_interrupt() {
                outcome = Err(err);
                break;
            }
            match self.unlock_device(report, entry, device, passphrases) {
                Ok(result) => push_outcome(report, entry, result),
                Err(err) if err.is_fatal() => {
                    outcome = Err(err);
                    break;
                }
                Err(err) => record_failure(report, entry, err),
            }
        }

        let teardown = session.close();
        for warning in teardown.warnings {
            report.events.push(event(WorkflowLevel::Warn, warning));
        }
        outcome
    }

    fn inspect(&self, entry: &DeviceEntry) -> CryptdriveResult<Inspection> {
        let target = &entry.target_name;
        let Some(uuid) = entry.source.uuid() else {
            return Err(device_error(target, "source is not a UUID reference"));
        };
        let Some(device) = self.block.resolve_uuid(uuid)? else {
            debug!("No block device carries UUID {uuid}");
            return Ok(Inspection::Missing);
        };

        match self.crypto.mapping_state(target)? {
            LuksState::Active => match self.crypto.mapping_device(target)? {
                Some(backing) if same_device(&backing, &device) => Ok(Inspection::AlreadyUnlocked),
                Some(backing) => Err(device_error(
                    target,
                    format!(
                        "stale mapping: /dev/mapper/{target} is backed by {} instead of {}",
                        backing.display(),
                        device.display()
                    ),
                )),
                None => Err(device_error(
                    target,
                    "mapping is active but its backing device is unknown",
                )),
            },
            LuksState::Inactive => Ok(Inspection::Locked(device)),
            LuksState::Unknown(state) => {
                debug!("Mapping {target} reports `{state}`; treating it as locked");
                Ok(Inspection::Locked(device))
            }
        }
    }

    fn unlock_device(
        &self,
        report: &mut UnlockReport,
        entry: &DeviceEntry,
        device: &Path,
        passphrases: &dyn PassphraseProvider,
    ) -> CryptdriveResult<DeviceOutcome> {
        let target = entry.target_name.as_str();
        let key_file = entry
            .managed_key_file(&self.config.vault.mount_point)
            .ok_or_else(|| device_error(target, "key file is not inside the key vault"))?;
        if !entry.has_option("luks") {
            debug!("`{target}` does not carry the `luks` option; managing it anyway");
        }

        let mut key_created = false;
        if !keyfile::key_file_present(key_file) {
            info!("Generating key file {} ..", key_file.display());
            let key = keyfile::generate_key(self.config.keys.key_size)?;
            keyfile::write_key_file(key_file, &key)?;
            debug!(
                "Key file for {target} has sha256 {}",
                keyfile::key_fingerprint(&key)
            );
            key_created = true;
        } else if keyfile::restrict_key_file(key_file)? {
            report.events.push(event(
                WorkflowLevel::Security,
                format!("Restricted permissions of {} to 0400", key_file.display()),
            ));
        }

        let mut key_installed = false;
        if key_created || !self.crypto.test_key(device, key_file)? {
            let existing = passphrase::obtain(
                passphrases,
                &PassphrasePrompt::Device { target, device },
            )?;
            info!("Installing key file for {target} on {} ..", device.display());
            self.crypto.add_key(device, &existing, key_file)?;
            key_installed = true;
        }

        self.check_interrupt()?;
        info!("Unlocking encrypted device {target} ..");
        let mapped = self
            .crypto
            .open(device, target, Credential::KeyFile(key_file))?;

        let mounted = self.config.unlock.mount_unlocked && self.mount_unlocked(report, target, &mapped);
        Ok(DeviceOutcome::Unlocked {
            key_created,
            key_installed,
            mounted,
        })
    }

    /// Mount a freshly unlocked device through fstab. Failures are reported as
    /// warnings; the device itself stays unlocked.
    fn mount_unlocked(&self, report: &mut UnlockReport, target: &str, mapped: &Path) -> bool {
        match self.try_mount(mapped) {
            Ok(mounted) => mounted,
            Err(err) => {
                report.events.push(event(
                    WorkflowLevel::Warn,
                    format!("Unlocked `{target}` but could not mount {}: {err}", mapped.display()),
                ));
                false
            }
        }
    }

    fn try_mount(&self, mapped: &Path) -> CryptdriveResult<bool> {
        if self.block.is_device_mounted(mapped)? {
            debug!("{} is already mounted", mapped.display());
            return Ok(false);
        }
        match self.block.filesystem_type(mapped)? {
            None => {
                debug!("{} carries no recognisable filesystem", mapped.display());
                Ok(false)
            }
            Some(kind) if kind == LVM_MEMBER => {
                debug!("{} is an LVM physical volume; not mounting", mapped.display());
                Ok(false)
            }
            Some(_) => {
                info!("Mounting {} ..", mapped.display());
                self.block.mount_from_fstab(mapped)?;
                Ok(true)
            }
        }
    }

    fn check_interrupt(&self) -> CryptdriveResult<()> {
        if self.interrupt.load(Ordering::SeqCst) {
            Err(CryptdriveError::Interrupted)
        } else {
            Ok(())
        }
    }
}

/// Owner of `entry`'s key file when that is another registry entry.
fn shared_key_owner<'e>(
    key_owners: &HashMap<&Path, &'e str>,
    entry: &DeviceEntry,
    mount_point: &Path,
) -> Option<&'e str> {
    let key_file = entry.managed_key_file(mount_point)?;
    key_owners
        .get(key_file)
        .copied()
        .filter(|owner| *owner != entry.target_name)
}

fn device_error(target: &str, reason: impl Into<String>) -> CryptdriveError {
    CryptdriveError::Device {
        target: target.to_string(),
        reason: reason.into(),
    }
}

fn push_outcome(report: &mut UnlockReport, entry: &DeviceEntry, outcome: DeviceOutcome) {
    if let DeviceOutcome::Unlocked {
        key_created,
        key_installed,
        mounted,
    } = &outcome
    {
        let mut notes = Vec::new();
        if *key_created {
            notes.push("new key file");
        }
        if *key_installed {
            notes.push("key installed");
        }
        if *mounted {
            notes.push("mounted");
        }
        let suffix = if notes.is_empty() {
            String::new()
        } else {
            format!(" ({})", notes.join(", "))
        };
        report.events.push(event(
            WorkflowLevel::Success,
            format!("Unlocked encrypted device `{}`{suffix}", entry.target_name),
        ));
    }
    report.devices.push(DeviceReport {
        target: entry.target_name.clone(),
        outcome,
    });
}

fn record_failure(report: &mut UnlockReport, entry: &DeviceEntry, err: CryptdriveError) {
    let reason = match err {
        CryptdriveError::Device { reason, .. } => reason,
        other => other.to_string(),
    };
    debug!("Failed to unlock `{}`: {reason}", entry.target_name);
    report.events.push(event(
        WorkflowLevel::Error,
        format!("Failed to unlock `{}`: {reason}", entry.target_name),
    ));
    report.devices.push(DeviceReport {
        target: entry.target_name.clone(),
        outcome: DeviceOutcome::Failed { reason },
    });
}
