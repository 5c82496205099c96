pub mod defaults;
pub mod loader;

pub use defaults::KeeperConfig;
pub use loader::{load_configuration, load_keeper_config};
