use crate::message::{Message, ServerId, Zxid};
use crate::processors::commit::CommitInput;
use crate::transport::Transport;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub enum AckInput {
    Ack { from: ServerId, zxid: Zxid },
    /// A freshly synchronized follower now receives commits.
    AddFollower(ServerId),
    /// A follower dropped out of the broadcast set.
    RemoveFollower(ServerId),
    /// The membership (and so the majority size) changed.
    SetQuorum(usize),
}

/// Leader-side quorum accounting: counts per-zxid acknowledgments and
/// fires commits, in zxid order, once a majority has persisted an entry.
pub struct AckProcessor {
    tx: mpsc::Sender<AckInput>,
    handle: JoinHandle<()>,
}

impl AckProcessor {
    pub fn spawn(
        transport: Arc<dyn Transport>,
        commit_tx: mpsc::Sender<CommitInput>,
        followers: BTreeSet<ServerId>,
        quorum: usize,
        committed: Zxid,
        depth: usize,
    ) -> AckProcessor {
        let (tx, rx) = mpsc::channel(depth);
        let handle = tokio::spawn(run(rx, transport, commit_tx, followers, quorum, committed));
        AckProcessor { tx, handle }
    }

    pub fn sender(&self) -> mpsc::Sender<AckInput> {
        self.tx.clone()
    }

    pub async fn shutdown(self) {
        let AckProcessor { tx, handle } = self;
        drop(tx);
        handle.await.expect("ack processor panicked");
    }
}

async fn run(
    mut rx: mpsc::Receiver<AckInput>,
    transport: Arc<dyn Transport>,
    commit_tx: mpsc::Sender<CommitInput>,
    mut followers: BTreeSet<ServerId>,
    mut quorum: usize,
    mut committed: Zxid,
) {
    // Acks for entries whose predecessors haven't committed stay buffered
    // here, keyed by zxid, so commits always fire in zxid order.
    let mut counts: BTreeMap<Zxid, BTreeSet<ServerId>> = BTreeMap::new();

    while let Some(input) = rx.recv().await {
        match input {
            AckInput::Ack { from, zxid } => {
                if zxid <= committed {
                    tracing::trace!(%zxid, from = %from, "ack at or below the commit watermark");
                    continue;
                }
                counts.entry(zxid).or_default().insert(from);
            }
            AckInput::AddFollower(id) => {
                followers.insert(id);
            }
            AckInput::RemoveFollower(id) => {
                followers.remove(&id);
            }
            // A shrunken majority may already be satisfied by buffered
            // acks, so fall through to the commit sweep.
            AckInput::SetQuorum(n) => {
                quorum = n;
            }
        }

        while let Some(entry) = counts.first_entry() {
            if entry.get().len() < quorum {
                break;
            }
            let (zxid, _) = entry.remove_entry();
            committed = zxid;
            tracing::debug!(%zxid, "quorum reached; committing");

            for follower in &followers {
                transport
                    .send(follower, Message::Commit { zxid })
                    .await;
            }
            if commit_tx.send(CommitInput::Commit(zxid)).await.is_err() {
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Inbound;
    use crate::queue;
    use crate::transport::mem::Hub;

    struct Fixture {
        proc: AckProcessor,
        commit_rx: mpsc::Receiver<CommitInput>,
        follower_rx: mpsc::Receiver<Inbound>,
    }

    fn fixture(quorum: usize) -> Fixture {
        let hub = Hub::new();
        let (f_tx, follower_rx) = queue::bounded(32);
        hub.register("s2".to_string(), f_tx);
        let (commit_tx, commit_rx) = mpsc::channel(32);

        let proc = AckProcessor::spawn(
            Arc::new(hub.endpoint("s1".to_string())),
            commit_tx,
            ["s2".to_string()].into_iter().collect(),
            quorum,
            Zxid::NULL,
            32,
        );
        Fixture {
            proc,
            commit_rx,
            follower_rx,
        }
    }

    async fn ack(proc: &AckProcessor, from: &str, epoch: u32, counter: u64) {
        proc.sender()
            .send(AckInput::Ack {
                from: from.to_string(),
                zxid: Zxid::new(epoch, counter),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn commits_once_a_majority_acks() {
        let Fixture {
            proc,
            mut commit_rx,
            mut follower_rx,
        } = fixture(2);

        ack(&proc, "s1", 1, 1).await;
        tokio::task::yield_now().await;
        assert!(commit_rx.try_recv().is_err());

        ack(&proc, "s2", 1, 1).await;
        match commit_rx.recv().await.unwrap() {
            CommitInput::Commit(zxid) => assert_eq!(zxid, Zxid::new(1, 1)),
            other => panic!("unexpected {other:?}"),
        }
        match follower_rx.recv().await.unwrap() {
            Inbound::Message {
                message: Message::Commit { zxid },
                ..
            } => assert_eq!(zxid, Zxid::new(1, 1)),
            other => panic!("unexpected {other:?}"),
        }
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn buffered_acks_commit_in_zxid_order() {
        let Fixture {
            proc,
            mut commit_rx,
            ..
        } = fixture(2);

        // (1,2) reaches quorum before (1,1) does; it must wait its turn.
        ack(&proc, "s1", 1, 2).await;
        ack(&proc, "s2", 1, 2).await;
        tokio::task::yield_now().await;
        assert!(commit_rx.try_recv().is_err());

        ack(&proc, "s1", 1, 1).await;
        ack(&proc, "s2", 1, 1).await;

        let mut seen = Vec::new();
        for _ in 0..2 {
            match commit_rx.recv().await.unwrap() {
                CommitInput::Commit(zxid) => seen.push(zxid),
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(seen, vec![Zxid::new(1, 1), Zxid::new(1, 2)]);
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_acks_from_one_server_count_once() {
        let Fixture {
            proc,
            mut commit_rx,
            ..
        } = fixture(2);

        ack(&proc, "s1", 1, 1).await;
        ack(&proc, "s1", 1, 1).await;
        tokio::task::yield_now().await;
        assert!(commit_rx.try_recv().is_err());
        proc.shutdown().await;
    }

    #[tokio::test]
    async fn quorum_resize_takes_effect() {
        let Fixture {
            proc,
            mut commit_rx,
            ..
        } = fixture(3);

        ack(&proc, "s1", 1, 1).await;
        ack(&proc, "s2", 1, 1).await;
        tokio::task::yield_now().await;
        assert!(commit_rx.try_recv().is_err());

        // Relaxing the majority releases the buffered entry immediately.
        proc.sender().send(AckInput::SetQuorum(2)).await.unwrap();
        assert!(matches!(
            commit_rx.recv().await.unwrap(),
            CommitInput::Commit(z) if z == Zxid::new(1, 1)
        ));
        proc.shutdown().await;
    }
}
