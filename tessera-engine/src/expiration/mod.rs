pub mod clock;

use std::{future::Future, pin::Pin, sync::Arc};

use tokio::sync::{mpsc, Notify, RwLock};
use tracing::{debug, error, info};

use crate::{error::Error, repos::AcquisitionRepo};

use self::clock::Clock;

/// Removes acquisition records whose `expires_at` has passed.
///
/// Deletes in batches, then sleeps until the next known expiry or until
/// the engine signals that a record was written.
pub struct ExpirationWorker {
    /// Acquisition storage
    acquisitions: AcquisitionRepo,
    /// Signalled by the engine after writes that change `expires_at`
    wake: Arc<Notify>,
    /// Shutdown listener
    shutdown_rx: Arc<RwLock<mpsc::Receiver<()>>>,
    /// Shutdown transmitter
    shutdown_tx: mpsc::Sender<()>,
    /// Number of records deleted per round
    batch_size: u32,
    /// Provides time information. Gives us deterministic time in tests.
    clock: Arc<dyn Clock>,
}

impl ExpirationWorker {
    pub fn new(acquisitions: AcquisitionRepo, clock: impl Clock, wake: Arc<Notify>) -> Self {
        let (tx, rx) = mpsc::channel(1);

        ExpirationWorker {
            acquisitions,
            wake,
            shutdown_rx: Arc::new(RwLock::new(rx)),
            shutdown_tx: tx,
            batch_size: 100,
            clock: Arc::new(clock),
        }
    }

    /// Start the purge loop.
    #[tracing::instrument(skip(self), name = "start_expiration_worker")]
    pub async fn start(&self) -> Result<(), Error> {
        let mut shutdown_rx = self.shutdown_rx.write().await;

        loop {
            let now = self.clock.now();
            let purged = match self.acquisitions.purge_expired(now, self.batch_size).await {
                Ok(purged) => purged,
                Err(error) => {
                    error!(?error, "Failed to purge expired acquisition records");
                    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                    continue;
                }
            };

            if purged > 0 {
                debug!("Purged {} expired acquisition records", purged);
                continue;
            }

            let next_expiry_fut = self
                .acquisitions
                .next_expiry()
                .await?
                .map(|expires_at| expires_at - self.clock.now())
                .and_then(|duration| duration.to_std().ok())
                .map_or_else::<Pin<Box<dyn Future<Output = ()> + Send + Sync + 'static>>, _, _>(
                    || Box::pin(std::future::pending()),
                    |duration| self.clock.sleep(duration),
                );

            tokio::select! {
                // A record with a possibly earlier expiry was written
                _ = self.wake.notified() => {
                    continue;
                }
                // Future that resolves when the next record is ready to
                // be purged
                _ = next_expiry_fut => {
                    continue;
                }
                // Break loop on shutdown signal
                _ = shutdown_rx.recv() => {
                    break;
                }
            }
        }

        info!("Expiration worker shutting down");
        Ok(())
    }

    /// Shutdown the expiration worker.
    #[tracing::instrument(skip(self), name = "stop_expiration_worker")]
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(()).await;
    }
}
