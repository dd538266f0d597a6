use clap::Parser;
use db_backup::backup::backup_config::BackupConfig;
use db_backup::backup::context::{Action, BackupContext};
use db_backup::backup::logging::init_logging;
use std::path::PathBuf;
use std::process::exit;
use tracing::{error, info};

/// Database backup system
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Location of config file
    #[arg(short, long)]
    config: PathBuf,

    #[command(subcommand)]
    action: Action,
}

fn main() {
    let args = Args::parse();

    let config = match BackupConfig::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };
    let log_handle = match init_logging(config.logging()) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("{e}");
            exit(1);
        }
    };

    let context = BackupContext::init(config, Some(&log_handle));
    match context.execute(args.action) {
        Ok(()) => {
            info!("{:?} completed successfully", args.action);
            exit(0)
        }
        Err(e) => {
            error!("{:?} failed: {e}", args.action);
            exit(1)
        }
    }
}
