//! `crypto-drive-manager`: unlock every managed encrypted drive with one passphrase.

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use cryptdrive_core::{
    config::{CryptdriveConfig, DEFAULT_CONFIG_PATH},
    error::{CryptdriveError, CryptdriveResult},
    logging, privilege, PassphrasePrompt, PassphraseProvider, UnlockOrchestrator, UnlockReport,
    WorkflowLevel,
};
use cryptdrive_luks::{SystemBlockDevice, SystemCryptsetup};
use log::{debug, warn};
use rpassword::prompt_password;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use zeroize::Zeroizing;

const CONFIRM_ATTEMPTS: usize = 3;
const REPEAT_PROMPT: &str = "Repeat passphrase: ";

/// Unlock the encrypted drives listed in crypttab using key files kept in a
/// passphrase-protected vault image.
#[derive(Parser, Debug)]
#[command(name = "crypto-drive-manager", version)]
struct Cli {
    /// Only unlock these crypttab targets (default: every managed entry).
    targets: Vec<String>,

    /// Vault image holding the key files [default: /root/encryption-keys.img].
    #[arg(short = 'i', long = "image-file")]
    image_file: Option<PathBuf>,

    /// Device-mapper name for the opened vault [default: encryption-keys].
    #[arg(short = 'n', long = "mapper-name")]
    mapper_name: Option<String>,

    /// Where the vault is mounted while keys are read [default: /mnt/keys].
    #[arg(short = 'm', long = "mount-point")]
    mount_point: Option<PathBuf>,

    /// Configuration file; missing files fall back to built-in defaults.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Registry of encrypted devices [default: /etc/crypttab].
    #[arg(long)]
    crypttab: Option<PathBuf>,

    /// Do not mount unlocked devices that appear in /etc/fstab.
    #[arg(long)]
    no_mount: bool,

    /// More output (repeatable).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Less output (repeatable).
    #[arg(short, long, action = ArgAction::Count, conflicts_with = "verbose")]
    quiet: u8,
}

impl Cli {
    fn verbosity(&self) -> i8 {
        let up = i8::try_from(self.verbose).unwrap_or(i8::MAX);
        let down = i8::try_from(self.quiet).unwrap_or(i8::MAX);
        up.saturating_sub(down)
    }

    /// Apply command-line overrides on top of the loaded configuration.
    fn apply(&self, config: &mut CryptdriveConfig) {
        if let Some(image) = &self.image_file {
            config.vault.image_path = image.clone();
        }
        if let Some(name) = &self.mapper_name {
            config.vault.mapper_name = name.clone();
        }
        if let Some(mount_point) = &self.mount_point {
            config.vault.mount_point = mount_point.clone();
        }
        if let Some(crypttab) = &self.crypttab {
            config.registry.crypttab_path = crypttab.clone();
        }
        if self.no_mount {
            config.unlock.mount_unlocked = false;
        }
    }
}

/// Reads passphrases from the controlling terminal without echo.
struct TerminalPrompt;

impl TerminalPrompt {
    /// `text` is shown verbatim; prompt messages carry their own separator.
    fn ask(text: &str) -> CryptdriveResult<Zeroizing<String>> {
        Ok(Zeroizing::new(prompt_password(text)?))
    }
}

impl PassphraseProvider for TerminalPrompt {
    fn passphrase(&self, prompt: &PassphrasePrompt<'_>) -> CryptdriveResult<Zeroizing<Vec<u8>>> {
        let message = prompt.message();
        let confirm = matches!(prompt, PassphrasePrompt::Vault { creating: true, .. });

        if !confirm {
            let answer = Self::ask(&message)?;
            return Ok(Zeroizing::new(answer.as_bytes().to_vec()));
        }

        for _ in 0..CONFIRM_ATTEMPTS {
            let first = Self::ask(&message)?;
            let second = Self::ask(REPEAT_PROMPT)?;
            if *first == *second {
                return Ok(Zeroizing::new(first.as_bytes().to_vec()));
            }
            eprintln!("Passphrases do not match, try again.");
        }
        Err(CryptdriveError::Authentication(
            "vault passphrase was not confirmed".into(),
        ))
    }
}

/// Entry point: parse arguments and surface errors with an exit code.
fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            eprintln!("error: {err:#}");
            std::process::exit(1);
        }
    }
}

/// Returns `Ok(false)` when at least one device failed to unlock.
fn run() -> Result<bool> {
    let cli = Cli::parse();
    logging::init_with_verbosity(cli.verbosity());

    privilege::ensure_root()?;

    let mut config = CryptdriveConfig::load_or_default(&cli.config)
        .with_context(|| format!("failed to load configuration from {}", cli.config.display()))?;
    cli.apply(&mut config);
    config.ensure_valid().context("invalid configuration")?;
    if let Some(path) = &config.path {
        debug!("using configuration {}", path.display());
    }

    let interrupt = Arc::new(AtomicBool::new(false));
    {
        let flag = interrupt.clone();
        ctrlc::set_handler(move || {
            if flag.swap(true, Ordering::SeqCst) {
                warn!("still cleaning up; please wait");
            } else {
                warn!("interrupt received; finishing the current step and cleaning up");
            }
        })
        .context("failed to install signal handler")?;
    }

    let block = SystemBlockDevice::from_config(&config)?;
    let crypto = SystemCryptsetup::from_config(&config)?;
    let orchestrator =
        UnlockOrchestrator::new(Arc::new(config), block, crypto).with_interrupt(interrupt);

    let report = orchestrator.run(&cli.targets, &TerminalPrompt)?;
    let ok = !report.has_failures();
    print_report(report);
    Ok(ok)
}

/// Pretty-print a workflow report so humans can follow along.
fn print_report(report: UnlockReport) {
    println!("{}", report.title);
    for event in report.events {
        println!("  [{}] {}", level_tag(event.level), event.message);
    }
}

/// Short tag used when printing workflow severity levels.
fn level_tag(level: WorkflowLevel) -> &'static str {
    match level {
        WorkflowLevel::Info => "INFO",
        WorkflowLevel::Success => "OK",
        WorkflowLevel::Warn => "WARN",
        WorkflowLevel::Error => "ERR",
        WorkflowLevel::Security => "SEC",
    }
}
