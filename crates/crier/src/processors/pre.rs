use crate::message::{Transaction, Zxid};
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Transaction kind assigned to client requests. The engine is agnostic to
/// the body; richer applications multiplex on their own framing.
pub const KIND_REQUEST: u32 = 0;

/// Leader-side zxid assignment: turns accepted client requests into
/// proposals `(current epoch, next counter)` and hands them to the
/// broadcast fan-out.
pub struct PreProcessor {
    tx: mpsc::Sender<Bytes>,
    handle: JoinHandle<()>,
}

impl PreProcessor {
    pub fn spawn(epoch: u32, out: mpsc::Sender<Transaction>, depth: usize) -> PreProcessor {
        let (tx, rx) = mpsc::channel(depth);
        let handle = tokio::spawn(run(rx, epoch, out));
        PreProcessor { tx, handle }
    }

    pub fn sender(&self) -> mpsc::Sender<Bytes> {
        self.tx.clone()
    }

    pub async fn shutdown(self) {
        let PreProcessor { tx, handle } = self;
        drop(tx);
        handle.await.expect("pre processor panicked");
    }
}

async fn run(mut rx: mpsc::Receiver<Bytes>, epoch: u32, out: mpsc::Sender<Transaction>) {
    let mut counter: u64 = 0;

    while let Some(body) = rx.recv().await {
        counter += 1;
        let txn = Transaction::new(Zxid::new(epoch, counter), KIND_REQUEST, body);
        tracing::trace!(zxid = %txn.zxid, "assigned zxid to request");
        if out.send(txn).await.is_err() {
            return;
        }
    }
}
