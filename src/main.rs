//! vault-backup - incremental backup and key rotation for encrypted media vaults
//!
//! Main binary entry point for the command-line interface.

use clap::Parser;
use vault_backup::cli::{self, Cli};

fn main() {
    let cli = Cli::parse();

    if let Err(e) = cli::run(cli) {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
