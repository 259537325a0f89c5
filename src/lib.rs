//! # vault_backup
//!
//! Incremental backup and key rotation for encrypted media vaults.
//!
//! ## Features
//!
//! - **Incremental sync**: only files whose size or modification time changed are copied
//! - **Key rotation**: re-encrypt every record, pack container and chunked asset under a new key
//! - **Crash safety**: destination files are only ever replaced atomically
//! - **Key tooling**: export the master key, or recover a vault from an exported key
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use vault_backup::cipher::XChaChaCipher;
//! use vault_backup::config::BackupConfig;
//! use vault_backup::run::{run_backup, BackupMode};
//! use vault_backup::status::ConsoleStatus;
//! use std::path::Path;
//!
//! # fn main() -> vault_backup::Result<()> {
//! let config = BackupConfig::default();
//! let summary = run_backup(
//!     Path::new("./vault"),
//!     Path::new("./vault-backup"),
//!     BackupMode::Plain,
//!     &config,
//!     &XChaChaCipher,
//!     &mut ConsoleStatus::new(),
//! )?;
//! println!("Copied {} files", summary.files_copied);
//! # Ok(())
//! # }
//! ```

pub mod atomic;
pub mod cipher;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod logging;
pub mod pack;
pub mod pipeline;
pub mod planner;
pub mod recovery;
pub mod run;
pub mod status;

// Re-export commonly used types
pub use config::BackupConfig;
pub use credentials::{MasterKey, VaultCredentials};
pub use error::{Error, Result};
pub use run::{run_backup, BackupMode, RunSummary};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
