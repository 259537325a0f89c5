//! Backup command implementation.

use super::prompt_password;
use crate::cipher::XChaChaCipher;
use crate::config::BackupConfig;
use crate::run::{load_credentials, run_backup, BackupMode};
use crate::status::{format_bytes, ConsoleStatus};
use anyhow::Result;
use clap::Args;
use std::path::PathBuf;
use zeroize::Zeroizing;

/// Arguments for the backup command
#[derive(Args)]
pub struct BackupArgs {
    /// Vault to back up
    pub vault: PathBuf,

    /// Backup directory, created if missing
    pub backup: PathBuf,

    /// Re-encrypt every file under the backup's own key
    #[arg(long)]
    pub re_encrypt: bool,
}

/// Run the backup command
pub fn run(args: BackupArgs, config: &BackupConfig) -> Result<()> {
    let mut status = ConsoleStatus::new();

    let summary = if args.re_encrypt {
        let creds = load_credentials(&args.vault, config)?;
        let password = Zeroizing::new(prompt_password(&format!(
            "Enter root vault account ({}) password",
            creds.user
        ))?);
        run_backup(
            &args.vault,
            &args.backup,
            BackupMode::ReEncrypt {
                password: &password,
            },
            config,
            &XChaChaCipher,
            &mut status,
        )?
    } else {
        run_backup(
            &args.vault,
            &args.backup,
            BackupMode::Plain,
            config,
            &XChaChaCipher,
            &mut status,
        )?
    };

    tracing::debug!(
        "Planned {} files ({}), took {:?}",
        summary.files_planned,
        format_bytes(summary.bytes_planned),
        summary.elapsed
    );
    Ok(())
}
