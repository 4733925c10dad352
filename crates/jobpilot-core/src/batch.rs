//! Inbound batch queue with one-batch-in-flight backpressure.
//!
//! The producer side ([`BatchSender`]) may not hand over batch `n + 1`
//! until the consumer has fired the [`DoneSignal`] of batch `n`.
//! [`BatchSender::submit`] waits for that; [`BatchSender::try_submit`]
//! reports the violation as [`AppError::BatchInFlight`].

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use crate::error::AppError;
use crate::models::CandidateJob;

/// Create a connected sender/receiver pair.
pub fn batch_channel() -> (BatchSender, BatchReceiver) {
    let (tx, rx) = mpsc::channel(1);
    let (done_tx, done_rx) = watch::channel(0u64);
    let sender = BatchSender {
        tx,
        done_tx: Arc::new(done_tx),
        done_rx,
        last_submitted: 0,
    };
    (sender, BatchReceiver { rx })
}

/// One scraped batch plus the signal the consumer fires when done with it.
#[derive(Debug)]
pub struct InboundBatch {
    pub id: u64,
    pub jobs: Vec<CandidateJob>,
    pub done: DoneSignal,
}

/// Fires exactly once: explicitly via [`DoneSignal::fire`], or on drop.
#[derive(Debug)]
pub struct DoneSignal {
    id: u64,
    tx: Arc<watch::Sender<u64>>,
    fired: bool,
}

impl DoneSignal {
    pub fn batch_id(&self) -> u64 {
        self.id
    }

    pub fn fire(mut self) {
        self.notify();
    }

    fn notify(&mut self) {
        if self.fired {
            return;
        }
        self.fired = true;
        let id = self.id;
        self.tx.send_modify(|done| *done = (*done).max(id));
        tracing::debug!(batch_id = id, "Batch done");
    }
}

impl Drop for DoneSignal {
    fn drop(&mut self) {
        self.notify();
    }
}

/// Producer half, held by the scraper.
#[derive(Debug)]
pub struct BatchSender {
    tx: mpsc::Sender<InboundBatch>,
    done_tx: Arc<watch::Sender<u64>>,
    done_rx: watch::Receiver<u64>,
    last_submitted: u64,
}

impl BatchSender {
    /// Id of the most recently completed batch (0 before any).
    pub fn completed(&self) -> u64 {
        *self.done_rx.borrow()
    }

    pub fn in_flight(&self) -> Option<u64> {
        (self.completed() < self.last_submitted).then_some(self.last_submitted)
    }

    /// Wait until the previously submitted batch has been signalled done.
    pub async fn wait_idle(&mut self) -> Result<(), AppError> {
        let target = self.last_submitted;
        self.done_rx
            .wait_for(|done| *done >= target)
            .await
            .map_err(|_| AppError::ChannelClosed("batch done signal".into()))?;
        Ok(())
    }

    /// Wait for the previous batch to finish, then submit. Returns the new
    /// batch id.
    pub async fn submit(&mut self, jobs: Vec<CandidateJob>) -> Result<u64, AppError> {
        self.wait_idle().await?;
        self.send(jobs).await
    }

    /// Submit only if no batch is in flight.
    pub async fn try_submit(&mut self, jobs: Vec<CandidateJob>) -> Result<u64, AppError> {
        if let Some(pending) = self.in_flight() {
            return Err(AppError::BatchInFlight { pending });
        }
        self.send(jobs).await
    }

    /// Stop producing; the consumer's `recv` returns `None` once drained.
    pub fn close(self) {}

    async fn send(&mut self, jobs: Vec<CandidateJob>) -> Result<u64, AppError> {
        let id = self.last_submitted + 1;
        let batch = InboundBatch {
            id,
            jobs,
            done: DoneSignal {
                id,
                tx: self.done_tx.clone(),
                fired: false,
            },
        };
        let size = batch.jobs.len();
        if let Err(mpsc::error::SendError(mut rejected)) = self.tx.send(batch).await {
            // Nobody will ever process it; don't let its drop fake a completion.
            rejected.done.fired = true;
            return Err(AppError::ChannelClosed("batch receiver".into()));
        }
        self.last_submitted = id;
        tracing::debug!(batch_id = id, size, "Batch submitted");
        Ok(id)
    }
}

/// Consumer half, held by the pipeline.
#[derive(Debug)]
pub struct BatchReceiver {
    rx: mpsc::Receiver<InboundBatch>,
}

impl BatchReceiver {
    pub async fn recv(&mut self) -> Option<InboundBatch> {
        self.rx.recv().await
    }
}
