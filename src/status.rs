//! Status reporting for long running operations.
//!
//! The core never prints. It calls a [`StatusSink`] handed in by the caller:
//! progress updates while scanning or copying, and catalog messages made of a
//! [`MessageKey`] plus named parameters. [`ConsoleStatus`] renders both to
//! stderr for the command-line tool.

use std::io::{self, Write};

/// Which phase a progress update belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Scanning,
    Copying,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressUpdate {
    pub phase: Phase,
    /// Overall percentage, 0..=100
    pub percent: u32,
    /// 1-based index of the item being processed
    pub current: usize,
    pub total: usize,
    /// Vault-relative name of the current file, empty while scanning
    pub file: String,
    /// Progress within the current file, 0..=100
    pub file_percent: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Identifiers of every user facing message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKey {
    ModeRegularBackup,
    ModeReEncryptedBackup,
    ModeKeyExport,
    ModeKeyRecover,
    LoadingCredentials,
    FindingFiles,
    InitializeNotice,
    MakeNotice,
    ErrorReadPath,
    BackupDone,
    BackupDoneReEncrypt,
    BackupFailed,
    VaultCheckingKey,
    VaultNoTags,
    VaultPrintTags,
    VaultNoAlbums,
    VaultPrintAlbums,
    VaultNoMedia,
    VaultMediaSample,
    VaultListItem,
    VaultListMore,
    RecoverKeyDone,
}

impl MessageKey {
    pub fn id(self) -> &'static str {
        match self {
            Self::ModeRegularBackup => "ModeRegularBackup",
            Self::ModeReEncryptedBackup => "ModeReEncryptedBackup",
            Self::ModeKeyExport => "ModeKeyExport",
            Self::ModeKeyRecover => "ModeKeyRecover",
            Self::LoadingCredentials => "LoadingCredentials",
            Self::FindingFiles => "FindingFiles",
            Self::InitializeNotice => "InitializeNotice",
            Self::MakeNotice => "MakeNotice",
            Self::ErrorReadPath => "ErrorReadPath",
            Self::BackupDone => "BackupDone",
            Self::BackupDoneReEncrypt => "BackupDoneReEncrypt",
            Self::BackupFailed => "BackupFailed",
            Self::VaultCheckingKey => "VaultCheckingKey",
            Self::VaultNoTags => "VaultNoTags",
            Self::VaultPrintTags => "VaultPrintTags",
            Self::VaultNoAlbums => "VaultNoAlbums",
            Self::VaultPrintAlbums => "VaultPrintAlbums",
            Self::VaultNoMedia => "VaultNoMedia",
            Self::VaultMediaSample => "VaultMediaSample",
            Self::VaultListItem => "VaultListItem",
            Self::VaultListMore => "VaultListMore",
            Self::RecoverKeyDone => "RecoverKeyDone",
        }
    }

    /// English template; `{Name}` is replaced by the parameter `Name`
    pub fn template(self) -> &'static str {
        match self {
            Self::ModeRegularBackup => "Mode: Regular backup",
            Self::ModeReEncryptedBackup => "Mode: Re-encrypted backup",
            Self::ModeKeyExport => "Mode: Export encryption key",
            Self::ModeKeyRecover => "Mode: Recover encryption key",
            Self::LoadingCredentials => "Loading credentials...",
            Self::FindingFiles => "Finding files...",
            Self::InitializeNotice => "Initializing backup...",
            Self::MakeNotice => "Making backup...",
            Self::ErrorReadPath => "Error reading path {Path} | Error: {Message}",
            Self::BackupDone => "Backup done. Total files copied: {FileCount} ({Size})",
            Self::BackupDoneReEncrypt => "Backup done. Total files re-encrypted: {FileCount} ({Size})",
            Self::BackupFailed => "Backup failed!",
            Self::VaultCheckingKey => "Checking provided vault key...",
            Self::VaultNoTags => "This vault does not have any tags.",
            Self::VaultPrintTags => "Vault tags (Total: {TagCount}):",
            Self::VaultNoAlbums => "This vault does not have any albums.",
            Self::VaultPrintAlbums => "Vault albums (Total: {AlbumCount}):",
            Self::VaultNoMedia => "This vault does not have any media asset.",
            Self::VaultMediaSample => "Sample media asset: [{MediaId}] {MediaTitle}",
            Self::VaultListItem => "  - [{Id}] {Name}",
            Self::VaultListMore => "  ...",
            Self::RecoverKeyDone => "Done! You may now login to the vault with your new password.",
        }
    }
}

/// Render a message from the catalog. Unknown placeholders are left as is.
pub fn render(key: MessageKey, params: &[(&str, String)]) -> String {
    let mut text = key.template().to_string();
    for (name, value) in params {
        text = text.replace(&format!("{{{}}}", name), value);
    }
    text
}

/// Receiver of progress and messages
pub trait StatusSink {
    fn progress(&mut self, update: &ProgressUpdate);

    fn message(&mut self, severity: Severity, key: MessageKey, params: &[(&str, String)]);
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullStatus;

impl StatusSink for NullStatus {
    fn progress(&mut self, _update: &ProgressUpdate) {}

    fn message(&mut self, _severity: Severity, _key: MessageKey, _params: &[(&str, String)]) {}
}

/// Renders to stderr, redrawing a single progress line in place
#[derive(Debug, Default)]
pub struct ConsoleStatus {
    line_open: bool,
}

impl ConsoleStatus {
    pub fn new() -> Self {
        Self::default()
    }

    fn progress_line(update: &ProgressUpdate) -> String {
        match update.phase {
            Phase::Scanning => format!(
                "Initializing backup... ({}%) ({} / {})",
                update.percent, update.current, update.total
            ),
            Phase::Copying => format!(
                "Making backup... ({}%) ({} / {}) - {} ({}%)",
                update.percent, update.current, update.total, update.file, update.file_percent
            ),
        }
    }
}

impl StatusSink for ConsoleStatus {
    fn progress(&mut self, update: &ProgressUpdate) {
        let mut stderr = io::stderr().lock();
        // \x1b[2K clears the previous line before the carriage return redraw
        let _ = write!(stderr, "\r\x1b[2K{}", Self::progress_line(update));
        let _ = stderr.flush();
        self.line_open = true;
    }

    fn message(&mut self, severity: Severity, key: MessageKey, params: &[(&str, String)]) {
        let mut stderr = io::stderr().lock();
        if self.line_open {
            let _ = writeln!(stderr);
            self.line_open = false;
        }
        let text = render(key, params);
        let _ = match severity {
            Severity::Info => writeln!(stderr, "{}", text),
            Severity::Warning => writeln!(stderr, "Warning: {}", text),
            Severity::Error => writeln!(stderr, "Error: {}", text),
        };
    }
}

/// Human readable size with 1024-based units
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }

    let mut div = UNIT;
    let mut exp = 0usize;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }

    let units = ['k', 'M', 'G', 'T', 'P', 'E'];
    format!("{:.1} {}B", bytes as f64 / div as f64, units[exp])
}

/// Integer percentage, 100 when `total` is zero
pub fn percent_of(done: u64, total: u64) -> u32 {
    if total == 0 {
        return 100;
    }
    ((u128::from(done.min(total)) * 100) / u128::from(total)) as u32
}
