use std::{fs, fs::File, io::Write, path::Path};

use anyhow::{Context, Result};
use config::{Config, Environment};
use log::info;

use super::KeeperConfig;

pub fn get_default_config() -> &'static str {
    include_str!("../../config/config.toml")
}

/// Builds the layered configuration: the TOML file at `path` (written from the embedded
/// default when missing), then `UTXO_KEEPER__<SECTION>__<KEY>` environment variables.
pub fn load_configuration(path: &Path) -> Result<Config> {
    if !path.exists() {
        write_config_to(path, get_default_config()).context("Could not create default config")?;
        info!(path:% = path.display(); "Created new configuration file");
    }

    let filename = path.to_str().context("Invalid config file path")?;

    Config::builder()
        .add_source(config::File::with_name(filename))
        .add_source(
            Environment::with_prefix("UTXO_KEEPER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Could not build config")
}

/// Extracts and validates the `[keeper]` section, falling back to defaults when it is absent.
pub fn load_keeper_config(cfg: &Config) -> Result<KeeperConfig> {
    let keeper = match cfg.get::<KeeperConfig>(KeeperConfig::SECTION) {
        Ok(keeper) => keeper,
        Err(config::ConfigError::NotFound(_)) => KeeperConfig::default(),
        Err(e) => return Err(e).context("Invalid keeper configuration"),
    };
    keeper.validate()?;
    Ok(keeper)
}

pub fn write_config_to(path: &Path, source: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create parent directories")?;
    };

    let mut file = File::create(path).context("Failed to create config file")?;
    file.write_all(source.as_bytes())
        .context("Failed to write config content")?;
    file.write_all(b"\n").context("Failed to write newline")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config_is_written_and_loaded() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("conf").join("config.toml");

        let cfg = load_configuration(&path).unwrap();
        assert!(path.exists());

        let keeper = load_keeper_config(&cfg).unwrap();
        assert_eq!(keeper.max_inputs_per_tx, 10);
        assert_eq!(keeper.chain_merge_fee, 10_000_000);
        assert_eq!(keeper.reservation_ttl_secs, 300);
    }

    #[test]
    fn test_partial_section_uses_defaults() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        write_config_to(&path, "[keeper]\nmax_inputs_per_tx = 4\n").unwrap();

        let keeper = load_keeper_config(&load_configuration(&path).unwrap()).unwrap();
        assert_eq!(keeper.max_inputs_per_tx, 4);
        assert_eq!(keeper.sweep_interval_secs, 60);
    }

    #[test]
    fn test_invalid_cap_is_rejected() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("config.toml");
        write_config_to(&path, "[keeper]\nmax_inputs_per_tx = 1\n").unwrap();

        let cfg = load_configuration(&path).unwrap();
        assert!(load_keeper_config(&cfg).is_err());
    }
}
