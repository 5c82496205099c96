use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::{actions::Action, models::AssetId};

#[derive(Parser)]
#[command(name = "utxo-keeper")]
#[command(about = "UTXO selection, reservation and chained transaction builder", long_about = None)]
pub struct Cli {
    #[arg(
        short,
        long,
        global = true,
        help = "Path to the configuration file",
        default_value = "config/config.toml"
    )]
    pub config: PathBuf,
    #[arg(long, global = true, help = "Path to the log4rs configuration", default_value = "log4rs.yml")]
    pub log_config: PathBuf,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Import UTXOs from a JSON array into the store
    Import {
        #[arg(short, long, help = "Path to the JSON file with the UTXO records")]
        file: PathBuf,
        #[command(flatten)]
        db: DatabaseArgs,
    },
    /// Show free and reserved balance for an account and asset
    Balance {
        #[arg(short, long, help = "Account id")]
        account_id: String,
        #[arg(short = 's', long, help = "Asset id in hex format")]
        asset_id: AssetId,
        #[command(flatten)]
        db: DatabaseArgs,
    },
    /// Preview the unsigned transaction templates for a set of spend actions. Reservations
    /// end with the process; use `daemon` to hold them.
    Build {
        #[arg(
            short,
            long = "spend",
            required = true,
            help = "Spend action: 'account:asset:amount' or 'utxo:<output_id>'. Can be specified multiple times."
        )]
        spends: Vec<Action>,
        #[arg(
            short,
            long,
            help = "Path to the output file for the templates",
            default_value = "data/templates.json"
        )]
        output_file: PathBuf,
        #[command(flatten)]
        db: DatabaseArgs,
        #[command(flatten)]
        keeper: KeeperArgs,
    },
    /// Keep the pool in memory and serve JSON-line requests on stdin until Ctrl+C
    Daemon {
        #[command(flatten)]
        db: DatabaseArgs,
        #[command(flatten)]
        keeper: KeeperArgs,
    },
    /// Write the default configuration file
    InitConfig {
        #[arg(long, help = "Overwrite an existing file")]
        force: bool,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct DatabaseArgs {
    #[arg(short, long, help = "Path to the database file")]
    pub database_path: Option<PathBuf>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct KeeperArgs {
    #[arg(long, help = "Maximum inputs per transaction")]
    pub max_inputs_per_tx: Option<usize>,
    #[arg(long, help = "Seconds a reservation is held when no deadline is given")]
    pub reservation_ttl_secs: Option<u64>,
    #[arg(long, help = "Seconds between sweeps of expired reservations")]
    pub sweep_interval_secs: Option<u64>,
}

/// Overrides configuration values with the command line arguments that were given.
pub trait ApplyArgs {
    fn apply_database(&mut self, args: &DatabaseArgs);
    fn apply_keeper(&mut self, args: &KeeperArgs);
}
