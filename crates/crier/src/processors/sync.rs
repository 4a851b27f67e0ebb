use crate::message::{Message, ServerId, Transaction, Zxid};
use crate::persistence::Persistence;
use crate::processors::ack::AckInput;
use crate::transport::Transport;
use crate::Result;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Where a batch's acknowledgment goes: over the wire to the leader, or
/// looped straight into the leader's own ack processor.
pub enum AckSink {
    Peer {
        transport: Arc<dyn Transport>,
        to: ServerId,
    },
    Loop(mpsc::Sender<AckInput>),
}

/// Persists proposals in arrival order: batches appends, fsyncs once per
/// batch, then acknowledges the last zxid of the batch.
pub struct SyncProposalProcessor {
    tx: mpsc::Sender<Transaction>,
    handle: JoinHandle<Result<()>>,
}

impl SyncProposalProcessor {
    pub fn spawn(
        persistence: Arc<Mutex<Persistence>>,
        sink: AckSink,
        self_id: ServerId,
        max_batch: usize,
        depth: usize,
    ) -> SyncProposalProcessor {
        let (tx, rx) = mpsc::channel(depth);
        let handle = tokio::spawn(run(rx, persistence, sink, self_id, max_batch));
        SyncProposalProcessor { tx, handle }
    }

    pub fn sender(&self) -> mpsc::Sender<Transaction> {
        self.tx.clone()
    }

    /// Flushes everything still queued, then returns the task's outcome.
    pub async fn shutdown(self) -> Result<()> {
        let SyncProposalProcessor { tx, handle } = self;
        drop(tx);
        handle.await.expect("sync proposal processor panicked")
    }
}

async fn run(
    mut rx: mpsc::Receiver<Transaction>,
    persistence: Arc<Mutex<Persistence>>,
    sink: AckSink,
    self_id: ServerId,
    max_batch: usize,
) -> Result<()> {
    let mut batch = Vec::new();

    while let Some(first) = rx.recv().await {
        batch.clear();
        batch.push(first);
        while batch.len() < max_batch {
            match rx.try_recv() {
                Ok(txn) => batch.push(txn),
                Err(_) => break,
            }
        }

        let last: Zxid = batch.last().expect("batch is non-empty").zxid;
        {
            let mut persistence = persistence.lock().unwrap();
            for txn in &batch {
                persistence.log().append(txn)?;
            }
            persistence.log().sync()?;
        }
        tracing::trace!(count = batch.len(), last = %last, "persisted proposal batch");

        match &sink {
            AckSink::Peer { transport, to } => {
                transport.send(to, Message::Ack { zxid: last }).await;
            }
            AckSink::Loop(tx) => {
                let _ = tx
                    .send(AckInput::Ack {
                        from: self_id.clone(),
                        zxid: last,
                    })
                    .await;
            }
        }
    }
    Ok(())
}
