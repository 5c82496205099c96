pub mod actions;
pub mod chain;
pub mod cli;
pub mod config;
pub mod daemon;
pub mod db;
pub mod keeper;
pub mod log;
pub mod models;
pub mod tasks;

pub use crate::actions::{Action, BuildContext, build_transaction, merge_spend_actions};
pub use crate::chain::{ChainBuilder, ChainConfig};
pub use crate::db::init_db;
pub use crate::keeper::{KeeperError, UtxoKeeper};
