//! Run orchestration: backups, key export and key recovery.
//!
//! A backup run is pre-flight checks, optional key preparation, discovery,
//! planning and copying, strictly in that order. Planning finishes before the
//! first byte is copied.

use crate::atomic::{probe, FileState};
use crate::cipher::VaultCipher;
use crate::config::BackupConfig;
use crate::credentials::{make_credentials, MasterKey, VaultCredentials};
use crate::error::IoContext;
use crate::pipeline::{CopyProgress, KeyPair, Mode, Pipeline};
use crate::planner::{find_entries, plan};
use crate::recovery::{check_key, RecordSample, RecoveryReport};
use crate::status::{format_bytes, MessageKey, Severity, StatusSink};
use crate::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{info, span, warn, Level};

/// How a backup treats encrypted vault files
#[derive(Debug, Clone, Copy)]
pub enum BackupMode<'p> {
    /// Byte-for-byte copies
    Plain,
    /// Re-encrypt everything under the destination key, unlocked with `password`
    ReEncrypt { password: &'p str },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub files_planned: usize,
    pub files_copied: usize,
    pub bytes_planned: u64,
    pub bytes_copied: u64,
    pub elapsed: Duration,
}

/// Decrypted keys of a re-encrypting run
#[derive(Debug)]
pub struct KeySet {
    pub source: MasterKey,
    pub destination: MasterKey,
}

/// Fail with `Locked` if `dir` holds the vault lock file
pub fn ensure_unlocked(dir: &Path, config: &BackupConfig) -> Result<()> {
    let lock = dir.join(&config.vault.lock_file);
    if probe(&lock)?.is_present() {
        return Err(Error::Locked { path: lock });
    }
    Ok(())
}

/// Credentials of the vault at `vault`, `VaultNotFound` if there are none
pub fn load_credentials(vault: &Path, config: &BackupConfig) -> Result<VaultCredentials> {
    VaultCredentials::load(&vault.join(&config.vault.credentials_file)).map_err(|e| {
        if e.is_not_found() {
            Error::VaultNotFound {
                path: vault.to_path_buf(),
            }
        } else {
            e
        }
    })
}

/// Check both ends of a backup and create the backup root and temp directory.
/// Returns the temp directory.
pub fn preflight(vault: &Path, backup: &Path, config: &BackupConfig) -> Result<PathBuf> {
    if !vault.is_dir() || !vault.join(&config.vault.credentials_file).is_file() {
        return Err(Error::VaultNotFound {
            path: vault.to_path_buf(),
        });
    }

    fs::create_dir_all(backup).at(backup)?;
    ensure_unlocked(backup, config)?;

    let temp_dir = backup.join(&config.transfer.temp_dir);
    fs::create_dir_all(&temp_dir).at(&temp_dir)?;
    Ok(temp_dir)
}

fn temp_file_in(temp_dir: &Path, name: &str) -> PathBuf {
    temp_dir.join(format!("{}_{}.tmp", name, std::process::id()))
}

/// Unlock the source key and the destination key for a re-encrypting run.
///
/// Destination credentials are created with the same user, password and
/// fingerprint but a fresh key when the backup has none yet.
pub fn prepare_keys(
    vault: &Path,
    backup: &Path,
    password: &str,
    config: &BackupConfig,
    cipher: &dyn VaultCipher,
    temp_dir: &Path,
) -> Result<KeySet> {
    let source_creds = load_credentials(vault, config)?;
    let source = source_creds.decrypt_key(password, cipher)?;

    let dest_path = backup.join(&config.vault.credentials_file);
    let destination = match probe(&dest_path)? {
        FileState::Present(_) => {
            let dest_creds = VaultCredentials::load(&dest_path)?;
            if !dest_creds.check_password(password) {
                warn!("Destination credentials exist with a different password");
                return Err(Error::InvalidCredentials);
            }
            dest_creds.decrypt_key(password, cipher)?
        }
        FileState::Absent => {
            let new_creds = make_credentials(&source_creds.user, password, &source_creds.fingerprint, cipher)?;
            let key = new_creds.decrypt_key(password, cipher)?;
            new_creds.save_atomically(&dest_path, &temp_file_in(temp_dir, "credentials"))?;
            info!("Created destination credentials at {}", dest_path.display());
            key
        }
    };

    Ok(KeySet { source, destination })
}

/// Bring `backup` up to date with `vault`
pub fn run_backup(
    vault: &Path,
    backup: &Path,
    mode: BackupMode<'_>,
    config: &BackupConfig,
    cipher: &dyn VaultCipher,
    sink: &mut dyn StatusSink,
) -> Result<RunSummary> {
    let started = Instant::now();
    let span = span!(Level::INFO, "run_backup", vault = %vault.display(), backup = %backup.display());
    let _enter = span.enter();

    let re_encrypt = matches!(mode, BackupMode::ReEncrypt { .. });
    sink.message(
        Severity::Info,
        if re_encrypt {
            MessageKey::ModeReEncryptedBackup
        } else {
            MessageKey::ModeRegularBackup
        },
        &[],
    );
    info!("Starting backup of {} into {}", vault.display(), backup.display());

    let temp_dir = preflight(vault, backup, config)?;

    let keys = match mode {
        BackupMode::Plain => None,
        BackupMode::ReEncrypt { password } => {
            sink.message(Severity::Info, MessageKey::LoadingCredentials, &[]);
            Some(prepare_keys(vault, backup, password, config, cipher, &temp_dir)?)
        }
    };

    sink.message(Severity::Info, MessageKey::FindingFiles, &[]);
    let entries = find_entries(vault, backup, &config.vault, re_encrypt, sink);

    sink.message(Severity::Info, MessageKey::InitializeNotice, &[]);
    let work = plan(entries, sink)?;

    let pipeline_mode = match &keys {
        None => Mode::Plain,
        Some(keys) => Mode::ReEncrypt(KeyPair {
            source: &keys.source,
            destination: &keys.destination,
            cipher,
        }),
    };
    let pipeline = Pipeline::new(
        pipeline_mode,
        temp_file_in(&temp_dir, "backup"),
        config.transfer.buffer_size,
    );

    sink.message(Severity::Info, MessageKey::MakeNotice, &[]);
    let stats = {
        let mut progress = CopyProgress::new(sink, work.total_size, work.entries.len());
        pipeline.copy_all(&work, &mut progress)
    };
    let stats = match stats {
        Ok(stats) => stats,
        Err(e) => {
            sink.message(Severity::Error, MessageKey::BackupFailed, &[]);
            return Err(e);
        }
    };

    remove_if_empty(&temp_dir);

    sink.message(
        Severity::Info,
        if re_encrypt {
            MessageKey::BackupDoneReEncrypt
        } else {
            MessageKey::BackupDone
        },
        &[
            ("FileCount", stats.files_copied.to_string()),
            ("Size", format_bytes(stats.bytes_copied)),
        ],
    );

    let summary = RunSummary {
        files_planned: work.entries.len(),
        files_copied: stats.files_copied,
        bytes_planned: work.total_size,
        bytes_copied: stats.bytes_copied,
        elapsed: started.elapsed(),
    };
    info!(
        "Backup finished: {} of {} planned files copied in {:?}",
        summary.files_copied, summary.files_planned, summary.elapsed
    );
    Ok(summary)
}

fn remove_if_empty(dir: &Path) {
    let empty = match fs::read_dir(dir) {
        Ok(mut items) => items.next().is_none(),
        Err(e) => {
            warn!("Could not read temp directory {}: {}", dir.display(), e);
            return;
        }
    };
    if empty {
        if let Err(e) = fs::remove_dir(dir) {
            warn!("Could not remove temp directory {}: {}", dir.display(), e);
        }
    }
}

/// The vault master key as uppercase hex, after checking the root password
pub fn export_key(
    vault: &Path,
    password: &str,
    config: &BackupConfig,
    cipher: &dyn VaultCipher,
) -> Result<String> {
    let creds = load_credentials(vault, config)?;
    let key = creds.decrypt_key(password, cipher)?;
    Ok(key.to_hex_upper())
}

fn report_sample(
    sink: &mut dyn StatusSink,
    sample: &Option<RecordSample>,
    empty: MessageKey,
    heading: MessageKey,
    count_param: &'static str,
) {
    match sample {
        Some(sample) if sample.total > 0 => {
            sink.message(Severity::Info, heading, &[(count_param, sample.total.to_string())]);
            for (id, name) in &sample.items {
                sink.message(
                    Severity::Info,
                    MessageKey::VaultListItem,
                    &[("Id", id.to_string()), ("Name", name.clone())],
                );
            }
            if sample.total > sample.items.len() {
                sink.message(Severity::Info, MessageKey::VaultListMore, &[]);
            }
        }
        _ => sink.message(Severity::Info, empty, &[]),
    }
}

/// Parse `key_hex` and prove it decrypts the vault's known records.
///
/// Nothing is written. The report is echoed through `sink`.
pub fn check_recovery_key(
    vault: &Path,
    key_hex: &str,
    config: &BackupConfig,
    cipher: &dyn VaultCipher,
    sink: &mut dyn StatusSink,
) -> Result<(MasterKey, RecoveryReport)> {
    ensure_unlocked(vault, config)?;
    let key = MasterKey::from_hex(key_hex)?;

    sink.message(Severity::Info, MessageKey::VaultCheckingKey, &[]);
    let report = check_key(vault, &key, cipher)?;

    report_sample(
        sink,
        &report.tags,
        MessageKey::VaultNoTags,
        MessageKey::VaultPrintTags,
        "TagCount",
    );
    report_sample(
        sink,
        &report.albums,
        MessageKey::VaultNoAlbums,
        MessageKey::VaultPrintAlbums,
        "AlbumCount",
    );
    match &report.first_media {
        Some((id, title)) => sink.message(
            Severity::Info,
            MessageKey::VaultMediaSample,
            &[("MediaId", id.to_string()), ("MediaTitle", title.clone())],
        ),
        None => sink.message(Severity::Info, MessageKey::VaultNoMedia, &[]),
    }

    Ok((key, report))
}

/// Rewrap a validated `key` under `new_password` and persist the credentials.
///
/// Every subordinate account is removed. Call [`check_recovery_key`] first.
pub fn recover_key(
    vault: &Path,
    key: &MasterKey,
    new_password: &str,
    config: &BackupConfig,
    cipher: &dyn VaultCipher,
    sink: &mut dyn StatusSink,
) -> Result<()> {
    ensure_unlocked(vault, config)?;

    let creds_path = vault.join(&config.vault.credentials_file);
    let mut creds = load_credentials(vault, config)?;
    let removed = creds.accounts.len();
    creds.recover_key(key, new_password, cipher)?;

    let temp_dir = vault.join(&config.transfer.temp_dir);
    fs::create_dir_all(&temp_dir).at(&temp_dir)?;
    creds.save_atomically(&creds_path, &temp_file_in(&temp_dir, "credentials"))?;
    remove_if_empty(&temp_dir);

    info!("Recovered vault key, removed {} subordinate accounts", removed);
    sink.message(Severity::Info, MessageKey::RecoverKeyDone, &[]);
    Ok(())
}
