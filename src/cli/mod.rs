//! Command-line interface for vault-backup.
//!
//! Thin layer over [`crate::run`]: argument parsing with clap, password
//! prompts and confirmation questions. Everything else lives in the library.

use crate::config::BackupConfig;
use crate::logging::init_logging;
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

pub mod backup;
pub mod key;

/// vault-backup - incremental backup and key rotation for encrypted media vaults
#[derive(Parser)]
#[command(name = "vault-backup")]
#[command(about = "Backup tool for encrypted media vaults")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (defaults to the per-user config file)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Create or sync a backup of a vault
    Backup(backup::BackupArgs),
    /// Print the vault encryption key
    KeyExport(key::KeyExportArgs),
    /// Reset the root password from an exported encryption key
    KeyRecover(key::KeyRecoverArgs),
}

/// Load configuration, set up logging and dispatch the command
pub fn run(cli: Cli) -> Result<()> {
    let config = BackupConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;
    init_logging(cli.verbose || config.logging.verbose);

    match cli.command {
        Commands::Backup(args) => backup::run(args, &config),
        Commands::KeyExport(args) => key::run_export(args, &config),
        Commands::KeyRecover(args) => key::run_recover(args, &config),
    }
}

/// Read one line from stdin without the line terminator
pub(crate) fn read_line(prompt: &str) -> Result<String> {
    eprint!("{}", prompt);
    io::stderr().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line).context("Failed to read from stdin")?;
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Ask a y/n question until one of the two is given
pub(crate) fn confirm(question: &str) -> Result<bool> {
    loop {
        let answer = read_line(&format!("{} (y/n): ", question))?;
        match parse_yes_no(&answer) {
            Some(answer) => return Ok(answer),
            None => continue,
        }
    }
}

fn parse_yes_no(answer: &str) -> Option<bool> {
    match answer.trim().to_lowercase().as_str() {
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Prompt for a password without echo, surrounding whitespace removed
pub(crate) fn prompt_password(prompt: &str) -> Result<String> {
    let password = rpassword::prompt_password(format!("{}: ", prompt)).context("Failed to read password")?;
    Ok(password.trim().to_string())
}
