use std::{sync::Arc, time::Duration};

use chrono::Utc;
use log::{debug, info};
use tokio::{sync::broadcast, task::JoinHandle, time::interval};

use crate::keeper::UtxoKeeper;

/// Periodically releases expired reservations.
///
/// `reserve` already sweeps before selecting, so this only matters for keys that see no
/// new requests: their abandoned locks would otherwise show up as reserved balance.
pub struct ReservationSweeper {
    keeper: Arc<UtxoKeeper>,
    interval: Duration,
}

impl ReservationSweeper {
    pub fn new(keeper: Arc<UtxoKeeper>, interval: Duration) -> Self {
        Self { keeper, interval }
    }

    pub fn run(self, mut shutdown_rx: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(); "Reservation sweeper started");
            let mut interval = interval(self.interval);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let released = self.keeper.sweep_expired(Utc::now());
                        if released > 0 {
                            info!(released = released; "Reservation sweeper released expired reservations");
                        } else {
                            debug!("Reservation sweeper found nothing to release");
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Reservation sweeper received shutdown signal");
                        break;
                    }
                }
            }
            info!("Reservation sweeper has shut down");
        })
    }
}
