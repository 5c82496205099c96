use std::{fs, path::Path, sync::Arc};

use anyhow::{Context, anyhow};
use clap::Parser;
use log::{info, warn};

use utxo_keeper::{
    actions::{Action, BuildContext, build_transaction},
    cli::{ApplyArgs, Cli, Commands, DatabaseArgs, KeeperArgs},
    config::{KeeperConfig, load_configuration, load_keeper_config, loader::write_config_to, loader::get_default_config},
    daemon::Daemon,
    db::{SqliteUtxoStore, UtxoStore, init_db},
    keeper::UtxoKeeper,
    log::init_logging,
    models::{AssetId, Utxo},
};

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_logging(&cli.log_config)?;

    if let Commands::InitConfig { force } = &cli.command {
        return init_config(&cli.config, *force);
    }

    let config = load_configuration(&cli.config)?;
    let mut keeper_config = load_keeper_config(&config)?;

    match cli.command {
        Commands::Import { file, db } => {
            keeper_config.apply_database(&db);
            import(&keeper_config, &file)
        },
        Commands::Balance { account_id, asset_id, db } => {
            keeper_config.apply_database(&db);
            balance(&keeper_config, &account_id, &asset_id)
        },
        Commands::Build {
            spends,
            output_file,
            db,
            keeper,
        } => {
            apply_build_args(&mut keeper_config, &db, &keeper)?;
            build(&keeper_config, &spends, &output_file)
        },
        Commands::Daemon { db, keeper } => {
            apply_build_args(&mut keeper_config, &db, &keeper)?;
            daemon(keeper_config).await
        },
        Commands::InitConfig { .. } => Ok(()),
    }
}

fn init_config(path: &Path, force: bool) -> Result<(), anyhow::Error> {
    if path.exists() && !force {
        return Err(anyhow!("{} already exists, pass --force to overwrite", path.display()));
    }
    write_config_to(path, get_default_config())?;
    println!("Configuration written to {}", path.display());
    Ok(())
}

fn apply_build_args(config: &mut KeeperConfig, db: &DatabaseArgs, keeper: &KeeperArgs) -> Result<(), anyhow::Error> {
    config.apply_database(db);
    config.apply_keeper(keeper);
    config.validate()
}

fn import(config: &KeeperConfig, file: &Path) -> Result<(), anyhow::Error> {
    let content = fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let utxos: Vec<Utxo> = serde_json::from_str(&content).context("Invalid UTXO records")?;

    let store = SqliteUtxoStore::new(init_db(&config.database_path)?);
    let mut imported = 0;
    for utxo in &utxos {
        if utxo.amount == 0 {
            warn!(output_id:% = utxo.output_id; "Skipping zero-amount UTXO");
            continue;
        }
        store.set(utxo)?;
        imported += 1;
    }

    info!(imported = imported, skipped = utxos.len() - imported; "UTXOs imported");
    println!("Imported {} UTXOs into {}", imported, config.database_path.display());
    Ok(())
}

fn open_keeper(config: &KeeperConfig) -> Result<UtxoKeeper, anyhow::Error> {
    let store = SqliteUtxoStore::new(init_db(&config.database_path)?);
    let keeper = UtxoKeeper::new();
    keeper.hydrate(&store, None)?;
    Ok(keeper)
}

async fn daemon(config: KeeperConfig) -> Result<(), anyhow::Error> {
    let store: Arc<dyn UtxoStore> = Arc::new(SqliteUtxoStore::new(init_db(&config.database_path)?));
    let keeper = Arc::new(UtxoKeeper::new());
    keeper.hydrate(store.as_ref(), None)?;
    Daemon::new(keeper, store, config).run().await
}

fn balance(config: &KeeperConfig, account_id: &str, asset_id: &AssetId) -> Result<(), anyhow::Error> {
    let keeper = open_keeper(config)?;
    let balance = keeper.balance(account_id, asset_id);
    println!("{}", serde_json::to_string_pretty(&balance)?);
    Ok(())
}

fn build(
    config: &KeeperConfig,
    spends: &[Action],
    output_file: &Path,
) -> Result<(), anyhow::Error> {
    let keeper = open_keeper(config)?;
    let ctx = BuildContext::new(&keeper, config);
    let built = build_transaction(&ctx, spends, Vec::new(), None)?;

    if let Some(parent) = output_file.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    fs::write(output_file, serde_json::to_string_pretty(&built)?)
        .with_context(|| format!("Failed to write {}", output_file.display()))?;

    info!(templates = built.templates.len(), path:% = output_file.display(); "Templates written");
    println!("Wrote {} templates to {}", built.templates.len(), output_file.display());
    Ok(())
}
