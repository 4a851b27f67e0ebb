use crate::message::{Transaction, Zxid};
use crate::state_machine::SharedStateMachine;
use std::collections::BTreeMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum CommitInput {
    /// A proposal which may not be delivered yet.
    Proposal(Transaction),
    /// Everything at or below this zxid is committed.
    Commit(Zxid),
}

/// Buffers proposals until their commit arrives, then delivers them to the
/// state machine in strictly increasing zxid order.
pub struct CommitProcessor {
    tx: mpsc::Sender<CommitInput>,
    delivered: watch::Receiver<Zxid>,
    handle: JoinHandle<Zxid>,
}

impl CommitProcessor {
    pub fn spawn(
        state_machine: SharedStateMachine,
        last_delivered: Zxid,
        depth: usize,
    ) -> CommitProcessor {
        let (tx, rx) = mpsc::channel(depth);
        let (delivered_tx, delivered) = watch::channel(last_delivered);
        let handle = tokio::spawn(run(rx, state_machine, last_delivered, delivered_tx));
        CommitProcessor {
            tx,
            delivered,
            handle,
        }
    }

    pub fn sender(&self) -> mpsc::Sender<CommitInput> {
        self.tx.clone()
    }

    /// Live view of the delivery watermark. Updated under the state
    /// machine's lock, so a reader holding that lock sees a watermark
    /// naming exactly what the state machine contains.
    pub fn delivered(&self) -> watch::Receiver<Zxid> {
        self.delivered.clone()
    }

    /// Drains in-flight work and returns the final delivery watermark.
    pub async fn shutdown(self) -> Zxid {
        let CommitProcessor { tx, handle, .. } = self;
        drop(tx);
        handle.await.expect("commit processor panicked")
    }
}

async fn run(
    mut rx: mpsc::Receiver<CommitInput>,
    state_machine: SharedStateMachine,
    last_delivered: Zxid,
    delivered_tx: watch::Sender<Zxid>,
) -> Zxid {
    let mut pending: BTreeMap<Zxid, Transaction> = BTreeMap::new();
    let mut committed = last_delivered;
    let mut delivered = last_delivered;

    while let Some(input) = rx.recv().await {
        match input {
            CommitInput::Proposal(txn) => {
                if txn.zxid > delivered {
                    pending.insert(txn.zxid, txn);
                } else {
                    tracing::trace!(zxid = %txn.zxid, "ignoring already-delivered proposal");
                }
            }
            CommitInput::Commit(zxid) => {
                committed = committed.max(zxid);
            }
        }

        while let Some(entry) = pending.first_entry() {
            if *entry.key() > committed {
                break;
            }
            let txn = entry.remove();
            tracing::trace!(zxid = %txn.zxid, "delivering transaction");
            {
                let mut state_machine = state_machine.lock().unwrap();
                state_machine.deliver(&txn);
                let _ = delivered_tx.send(txn.zxid);
            }
            delivered = txn.zxid;
        }
    }
    delivered
}
