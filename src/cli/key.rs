//! Key export and key recovery commands.

use super::{confirm, prompt_password, read_line};
use crate::cipher::XChaChaCipher;
use crate::config::BackupConfig;
use crate::run::{check_recovery_key, ensure_unlocked, export_key, load_credentials, recover_key};
use crate::status::{ConsoleStatus, MessageKey, Severity, StatusSink};
use anyhow::{bail, Result};
use clap::Args;
use std::io::{self, Write};
use std::path::PathBuf;
use zeroize::Zeroizing;

/// Longest password accepted for a vault account, in characters
pub const MAX_PASSWORD_LENGTH: usize = 255;

/// Arguments for the key-export command
#[derive(Args)]
pub struct KeyExportArgs {
    /// Vault whose key is exported
    pub vault: PathBuf,
}

/// Arguments for the key-recover command
#[derive(Args)]
pub struct KeyRecoverArgs {
    /// Vault whose root password is reset
    pub vault: PathBuf,
}

/// Check a new password and its repetition
pub fn validate_new_password(password: &str, repeated: &str) -> Result<()> {
    if password.is_empty() {
        bail!("Password cannot be blank.");
    }
    if password.chars().count() > MAX_PASSWORD_LENGTH {
        bail!("Password cannot be longer than {} characters.", MAX_PASSWORD_LENGTH);
    }
    if password != repeated {
        bail!("Passwords do not match.");
    }
    Ok(())
}

/// Run the key-export command
pub fn run_export(args: KeyExportArgs, config: &BackupConfig) -> Result<()> {
    let mut status = ConsoleStatus::new();
    status.message(Severity::Info, MessageKey::ModeKeyExport, &[]);

    let creds = load_credentials(&args.vault, config)?;
    let password = Zeroizing::new(prompt_password(&format!(
        "Enter root vault account ({}) password",
        creds.user
    ))?);
    let key = Zeroizing::new(export_key(&args.vault, &password, config, &XChaChaCipher)?);

    eprintln!("Below is the vault encryption key, in hexadecimal format.");
    eprintln!("Make sure to store it securely. Never reveal it!");
    eprintln!("After you are done, press enter to clear the key from view.");
    println!("{}", key.as_str());
    io::stdout().flush()?;

    read_line("")?;
    // move up over the key and the empty input line, then overwrite
    print!("\x1b[2A\x1b[2K[REDACTED]\n\x1b[2K");
    io::stdout().flush()?;
    Ok(())
}

/// Run the key-recover command
pub fn run_recover(args: KeyRecoverArgs, config: &BackupConfig) -> Result<()> {
    let mut status = ConsoleStatus::new();
    status.message(Severity::Info, MessageKey::ModeKeyRecover, &[]);

    ensure_unlocked(&args.vault, config)?;
    let creds = load_credentials(&args.vault, config)?;

    let key_hex = Zeroizing::new(read_line(
        "Input the vault key, in hexadecimal format, and press enter: ",
    )?);
    let (key, _report) = match check_recovery_key(&args.vault, &key_hex, config, &XChaChaCipher, &mut status) {
        Ok(checked) => checked,
        Err(e) => {
            eprintln!("This error means the provided vault key is not valid or the vault is corrupted");
            return Err(e.into());
        }
    };

    eprintln!("WARNING: This will clear all your vault accounts except the root one");
    if !confirm("Proceed with key recovery?")? {
        bail!("Key recovery cancelled");
    }

    let password = Zeroizing::new(prompt_password(&format!(
        "Enter new password for the root account of the vault ({})",
        creds.user
    ))?);
    let repeated = Zeroizing::new(prompt_password("Repeat Password")?);
    validate_new_password(&password, &repeated)?;

    recover_key(&args.vault, &key, &password, config, &XChaChaCipher, &mut status)?;
    Ok(())
}
