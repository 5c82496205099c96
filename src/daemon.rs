//! Long-running keeper process.
//!
//! The [`Daemon`] keeps one [`UtxoKeeper`] in memory for its whole lifetime so reservations
//! taken by a build survive until they are cancelled or expire. Requests arrive as one JSON
//! object per line and every request gets exactly one JSON response line:
//!
//! ```text
//! {"command":"build","actions":[{"type":"spend","account_id":"acc","asset_id":"..","amount":100}]}
//! {"command":"cancel","reservations":["6f1c..."]}
//! {"command":"balance","account_id":"acc","asset_id":".."}
//! {"command":"add_utxo","utxo":{...}}
//! {"command":"remove_utxo","output_id":".."}
//! ```
//!
//! A [`ReservationSweeper`] runs next to the request loop and both stop on Ctrl+C or when
//! the input closes.

use std::{future::Future, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    signal,
    sync::broadcast,
};

use crate::{
    actions::{Action, BuildContext, BuiltTransaction, build_transaction},
    config::KeeperConfig,
    db::UtxoStore,
    keeper::{Balance, KeeperError, ReservationId, UtxoKeeper},
    models::{AssetId, OutputId, TxOutput, Utxo},
    tasks::ReservationSweeper,
};

#[derive(Debug, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Request {
    Build {
        actions: Vec<Action>,
        #[serde(default)]
        outputs: Vec<TxOutput>,
        #[serde(default)]
        deadline: Option<DateTime<Utc>>,
    },
    Cancel {
        reservations: Vec<ReservationId>,
    },
    Balance {
        account_id: String,
        asset_id: AssetId,
    },
    AddUtxo {
        utxo: Utxo,
    },
    RemoveUtxo {
        output_id: OutputId,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Response {
    Built(BuiltTransaction),
    Cancelled { released: usize },
    Balance(Balance),
    Added { added: bool },
    Removed { found: bool },
    Error { kind: String, message: String, retryable: bool },
}

impl Response {
    fn invalid_request(message: impl ToString) -> Self {
        Response::Error {
            kind: "invalid_request".to_string(),
            message: message.to_string(),
            retryable: false,
        }
    }
}

impl From<KeeperError> for Response {
    fn from(err: KeeperError) -> Self {
        Response::Error {
            kind: err.kind().to_string(),
            retryable: err.is_retryable(),
            message: err.to_string(),
        }
    }
}

pub struct Daemon {
    keeper: Arc<UtxoKeeper>,
    store: Arc<dyn UtxoStore>,
    config: KeeperConfig,
}

impl Daemon {
    pub fn new(keeper: Arc<UtxoKeeper>, store: Arc<dyn UtxoStore>, config: KeeperConfig) -> Self {
        Self { keeper, store, config }
    }

    /// Serves requests from stdin until it closes or Ctrl+C is pressed.
    pub async fn run(&self) -> Result<(), anyhow::Error> {
        info!("Daemon started. Press Ctrl+C to stop.");
        let mut stdout = tokio::io::stdout();
        self.serve(BufReader::new(tokio::io::stdin()), &mut stdout, async {
            if let Err(e) = signal::ctrl_c().await {
                warn!(error:% = e; "Failed to listen for Ctrl+C");
            }
        })
        .await
    }

    /// Runs the sweeper and answers each request line on `writer` until `reader` reaches
    /// EOF or `shutdown` resolves. The sweeper is stopped before this returns.
    pub async fn serve<R, W>(
        &self,
        reader: R,
        writer: &mut W,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), anyhow::Error>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (shutdown_tx, _) = broadcast::channel(1);
        let sweeper = ReservationSweeper::new(
            self.keeper.clone(),
            Duration::from_secs(self.config.sweep_interval_secs),
        );
        let sweeper_handle = sweeper.run(shutdown_tx.subscribe());

        let result = self.request_loop(reader, writer, shutdown).await;

        let _ = shutdown_tx.send(());
        if let Err(e) = sweeper_handle.await {
            warn!(error:% = e; "Reservation sweeper task failed");
        }
        info!("Daemon has shut down");
        result
    }

    async fn request_loop<R, W>(
        &self,
        reader: R,
        writer: &mut W,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), anyhow::Error>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = reader.lines();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        info!("Daemon input closed");
                        return Ok(());
                    };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let response = self.handle_line(&line);
                    let mut encoded = serde_json::to_vec(&response)?;
                    encoded.push(b'\n');
                    writer.write_all(&encoded).await?;
                    writer.flush().await?;
                }
                _ = &mut shutdown => {
                    info!("Daemon received shutdown signal");
                    return Ok(());
                }
            }
        }
    }

    pub fn handle_line(&self, line: &str) -> Response {
        match serde_json::from_str::<Request>(line) {
            Ok(request) => self.handle(request),
            Err(e) => {
                warn!(error:% = e; "Daemon: Rejecting malformed request");
                Response::invalid_request(e)
            },
        }
    }

    pub fn handle(&self, request: Request) -> Response {
        match request {
            Request::Build {
                actions,
                outputs,
                deadline,
            } => {
                if actions.is_empty() {
                    return Response::invalid_request("build needs at least one action");
                }
                let ctx = BuildContext::new(&self.keeper, &self.config);
                match build_transaction(&ctx, &actions, outputs, deadline) {
                    Ok(built) => Response::Built(built),
                    Err(e) => e.into(),
                }
            },
            Request::Cancel { reservations } => {
                let mut released = 0;
                for id in &reservations {
                    if self.keeper.reservation(id).is_some() {
                        self.keeper.cancel(id);
                        released += 1;
                    }
                }
                Response::Cancelled { released }
            },
            Request::Balance { account_id, asset_id } => Response::Balance(self.keeper.balance(&account_id, &asset_id)),
            Request::AddUtxo { utxo } => {
                if let Err(e) = self.store.set(&utxo) {
                    return KeeperError::from(e).into();
                }
                Response::Added {
                    added: self.keeper.add_utxo(utxo),
                }
            },
            Request::RemoveUtxo { output_id } => {
                let known = self.keeper.remove_utxo(&output_id).is_some();
                match self.store.delete(&output_id) {
                    Ok(stored) => Response::Removed { found: known || stored },
                    Err(e) => KeeperError::from(e).into(),
                }
            },
        }
    }
}
